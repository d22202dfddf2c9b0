use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use common_kafka::config::KafkaConfig;
use envconfig::Envconfig;

use crate::error::ConfigError;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // Comma separated name=destination[@consumer_group] entries
    #[envconfig(default = "")]
    pub channels: ChannelDefinitions,

    // Checkpoint configuration
    #[envconfig(default = "memory://")]
    pub checkpoint_store_url: String, // memory:// or redis://host:port

    #[envconfig(default = "eventpipe-checkpoints")]
    pub checkpoint_container: String,

    #[envconfig(default = "30")]
    pub checkpoint_interval_secs: u64,

    #[envconfig(default = "32")]
    pub max_partitions: i32,

    // Restart thresholds, compared against the process-wide failure totals
    #[envconfig(default = "100")]
    pub consumer_error_threshold: u64,

    #[envconfig(default = "100")]
    pub producer_error_threshold: u64,

    #[envconfig(default = "5")]
    pub restart_poll_interval_secs: u64,

    // Batching producer
    #[envconfig(default = "500")]
    pub producer_batch_max_items: usize,

    #[envconfig(default = "1000")]
    pub producer_batch_period_ms: u64,

    #[envconfig(default = "10000")]
    pub producer_queue_capacity: usize,

    // 0 disables the periodic health probe on producer channels
    #[envconfig(default = "60")]
    pub health_probe_interval_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_hashmap(&Default::default())
    }

    pub fn settings(&self) -> StreamSettings {
        StreamSettings {
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval_secs),
            max_partitions: self.max_partitions,
            consumer_error_threshold: self.consumer_error_threshold,
            producer_error_threshold: self.producer_error_threshold,
            batch_max_items: self.producer_batch_max_items,
            batch_period: Duration::from_millis(self.producer_batch_period_ms),
            queue_capacity: self.producer_queue_capacity,
        }
    }
}

/// Tuning shared by every channel built from one registry.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub checkpoint_interval: Duration,
    pub max_partitions: i32,
    pub consumer_error_threshold: u64,
    pub producer_error_threshold: u64,
    pub batch_max_items: usize,
    pub batch_period: Duration,
    pub queue_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(30),
            max_partitions: 32,
            consumer_error_threshold: 100,
            producer_error_threshold: 100,
            batch_max_items: 500,
            batch_period: Duration::from_secs(1),
            queue_capacity: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDefinition {
    pub name: String,
    pub destination: String,
    pub consumer_group: Option<String>,
}

impl ChannelDefinition {
    pub fn producer(name: &str, destination: &str) -> Self {
        Self {
            name: name.to_string(),
            destination: destination.to_string(),
            consumer_group: None,
        }
    }

    pub fn consumer(name: &str, destination: &str, consumer_group: &str) -> Self {
        Self {
            name: name.to_string(),
            destination: destination.to_string(),
            consumer_group: Some(consumer_group.to_string()),
        }
    }
}

impl FromStr for ChannelDefinition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidChannel(s.to_string());

        let (name, target) = s.trim().split_once('=').ok_or_else(invalid)?;
        let (destination, consumer_group) = match target.split_once('@') {
            Some((destination, group)) => (destination, Some(group.trim())),
            None => (target, None),
        };

        let name = name.trim();
        let destination = destination.trim();
        if name.is_empty() || destination.is_empty() || consumer_group == Some("") {
            return Err(invalid());
        }

        Ok(ChannelDefinition {
            name: name.to_string(),
            destination: destination.to_string(),
            consumer_group: consumer_group.map(str::to_string),
        })
    }
}

/// Named channel configuration, keyed by the logical channel name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelDefinitions(BTreeMap<String, ChannelDefinition>);

impl ChannelDefinitions {
    pub fn new(
        definitions: impl IntoIterator<Item = ChannelDefinition>,
    ) -> Result<Self, ConfigError> {
        let mut channels = BTreeMap::new();
        for definition in definitions {
            if channels.contains_key(&definition.name) {
                return Err(ConfigError::DuplicateChannel(definition.name));
            }
            channels.insert(definition.name.clone(), definition);
        }
        Ok(Self(channels))
    }

    pub fn get(&self, name: &str) -> Option<&ChannelDefinition> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelDefinition> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for ChannelDefinitions {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let definitions = s
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(ChannelDefinition::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        ChannelDefinitions::new(definitions)
    }
}
