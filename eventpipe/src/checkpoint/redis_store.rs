use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use time::OffsetDateTime;
use tracing::info;

use super::{CheckpointScope, CheckpointStore};
use crate::error::CheckpointError;

// Compare and set in one round trip, so a stale owner cannot move a
// position backwards. Returns the stored position.
const COMMIT_IF_HIGHER: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]))
local position = tonumber(ARGV[2])
if current and current >= position then
    return current
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return position
"#;

/// Stores positions in one redis hash per scope, keyed
/// `{container}:{consumer_group}:{destination}` with a field per partition.
/// The container itself is a marker key holding its creation time.
pub struct RedisCheckpointStore {
    connection: MultiplexedConnection,
    container: String,
}

impl RedisCheckpointStore {
    pub async fn new(url: &str, container: &str) -> Result<Self, CheckpointError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(container, "connected to redis checkpoint store");

        Ok(Self {
            connection,
            container: container.to_string(),
        })
    }

    fn scope_key(&self, scope: &CheckpointScope) -> String {
        scope_key(&self.container, scope)
    }
}

fn scope_key(container: &str, scope: &CheckpointScope) -> String {
    format!(
        "{}:{}:{}",
        container, scope.consumer_group, scope.destination
    )
}

fn parse_positions(raw: HashMap<String, String>) -> Result<HashMap<i32, i64>, CheckpointError> {
    raw.into_iter()
        .map(|(field, value)| {
            match (field.parse::<i32>(), value.parse::<i64>()) {
                (Ok(partition), Ok(position)) => Ok((partition, position)),
                _ => Err(CheckpointError::Corrupt { field, value }),
            }
        })
        .collect()
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn container_exists(&self) -> Result<bool, CheckpointError> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(&self.container).await?;
        Ok(exists)
    }

    async fn create_container(&self) -> Result<(), CheckpointError> {
        let mut conn = self.connection.clone();
        let created_at = OffsetDateTime::now_utc().unix_timestamp().to_string();
        conn.set_nx::<_, _, ()>(&self.container, created_at).await?;
        Ok(())
    }

    async fn load_positions(
        &self,
        scope: &CheckpointScope,
    ) -> Result<HashMap<i32, i64>, CheckpointError> {
        let mut conn = self.connection.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.scope_key(scope)).await?;
        parse_positions(raw)
    }

    async fn commit(
        &self,
        scope: &CheckpointScope,
        partition: i32,
        position: i64,
    ) -> Result<i64, CheckpointError> {
        let mut conn = self.connection.clone();
        let stored: i64 = Script::new(COMMIT_IF_HIGHER)
            .key(self.scope_key(scope))
            .arg(partition)
            .arg(position)
            .invoke_async(&mut conn)
            .await?;
        Ok(stored)
    }
}
