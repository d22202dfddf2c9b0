use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use health::HealthProbeListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{ensure_container, CheckpointScope, CheckpointStore};
use crate::config::{ChannelDefinition, StreamSettings};
use crate::counters::{exceeds_threshold, FailureCounter, PartitionCounters, NO_PARTITION};
use crate::error::{CheckpointError, ConsumerFault, HandlerError, RegistryError, TransportError};
use crate::event::{health_probe_id, ReceivedEvent};
use crate::handler::{ErrorListener, EventHandler, IgnoreErrors};
use crate::metrics_consts::{
    CONSUMER_CHECKPOINTS, CONSUMER_HEALTH_PROBES, CONSUMER_PARTITIONS_INITIALIZED,
    CONSUMER_SKIPPED,
};

pub mod classifier;
pub mod kafka;

pub use classifier::{ErrorClassifier, OwnershipLostClassifier};

/// Where a partition resumes reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPosition {
    Earliest,
    /// Sequence of the next event to process
    Offset(i64),
}

impl PartitionPosition {
    /// Positions only move forward.
    pub fn advanced_to(self, next: i64) -> Self {
        match self {
            PartitionPosition::Earliest => PartitionPosition::Offset(next),
            PartitionPosition::Offset(current) => PartitionPosition::Offset(current.max(next)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Already covered by a committed position, e.g. replayed after a rebalance
    Skipped,
    Processed,
    Checkpointed,
}

/// Drives one consumer channel: dispatches events to the handler, keeps the
/// per-partition counters, decides when to commit positions, and classifies
/// transport errors.
///
/// Events for one partition must be fed sequentially. Different partitions
/// may be processed concurrently.
pub struct ConsumerEngine {
    channel: String,
    scope: CheckpointScope,
    handler: Arc<dyn EventHandler>,
    store: Arc<dyn CheckpointStore>,
    checkpoint_interval: Duration,
    max_partitions: i32,
    error_threshold: u64,
    failures: Arc<FailureCounter>,
    classifier: Arc<dyn ErrorClassifier>,
    probe_listener: Arc<dyn HealthProbeListener>,
    error_listener: Arc<dyn ErrorListener>,
    positions: DashMap<i32, PartitionPosition>,
    last_checkpoints: DashMap<i32, Instant>,
    counters: DashMap<i32, Arc<PartitionCounters>>,
    revoked: DashSet<i32>,
}

impl ConsumerEngine {
    pub fn new(
        definition: &ChannelDefinition,
        handler: Arc<dyn EventHandler>,
        store: Arc<dyn CheckpointStore>,
        settings: &StreamSettings,
        failures: Arc<FailureCounter>,
    ) -> Result<Self, RegistryError> {
        let consumer_group = definition
            .consumer_group
            .as_deref()
            .ok_or_else(|| RegistryError::MissingConsumerGroup(definition.name.clone()))?;

        Ok(Self {
            channel: definition.name.clone(),
            scope: CheckpointScope::new(consumer_group, &definition.destination),
            handler,
            store,
            checkpoint_interval: settings.checkpoint_interval,
            max_partitions: settings.max_partitions,
            error_threshold: settings.consumer_error_threshold,
            failures,
            classifier: Arc::new(OwnershipLostClassifier),
            probe_listener: Arc::new(|_: &str, _: i32, _: &str| {}),
            error_listener: Arc::new(IgnoreErrors),
            positions: DashMap::new(),
            last_checkpoints: DashMap::new(),
            counters: DashMap::new(),
            revoked: DashSet::new(),
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_probe_listener(mut self, listener: Arc<dyn HealthProbeListener>) -> Self {
        self.probe_listener = listener;
        self
    }

    pub fn with_error_listener(mut self, listener: Arc<dyn ErrorListener>) -> Self {
        self.error_listener = listener;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn scope(&self) -> &CheckpointScope {
        &self.scope
    }

    /// Makes sure the checkpoint container exists, then seeds positions:
    /// every partition below the ceiling starts at earliest, and stored
    /// checkpoints override that.
    pub async fn start(&self) -> Result<(), CheckpointError> {
        ensure_container(self.store.as_ref()).await?;
        let stored = self.store.load_positions(&self.scope).await?;

        for partition in 0..self.max_partitions {
            self.positions
                .entry(partition)
                .or_insert(PartitionPosition::Earliest);
        }
        let restored = stored.len();
        for (partition, next) in stored {
            self.advance_position(partition, next);
        }

        info!(
            channel = self.channel,
            consumer_group = self.scope.consumer_group,
            destination = self.scope.destination,
            restored,
            "consumer engine started"
        );
        Ok(())
    }

    /// Ensures state for the partition exists. Safe to call any number of
    /// times, concurrently: existing counters and checkpoint times are kept.
    pub fn initialize_partition(&self, partition: i32) -> Arc<PartitionCounters> {
        self.positions
            .entry(partition)
            .or_insert(PartitionPosition::Earliest);
        self.last_checkpoints.entry(partition).or_insert_with(|| {
            let now = Instant::now();
            now.checked_sub(self.checkpoint_interval).unwrap_or(now)
        });
        self.counters_for(partition)
    }

    /// Takes ownership of a partition handed to this consumer. The stored
    /// position may have been moved on by another consumer since we last
    /// looked, so it is merged in before reading resumes. Returns where
    /// reading should resume.
    pub async fn assign_partition(&self, partition: i32) -> PartitionPosition {
        self.initialize_partition(partition);
        self.revoked.remove(&partition);

        match self.store.load_positions(&self.scope).await {
            Ok(stored) => {
                if let Some(next) = stored.get(&partition) {
                    self.advance_position(partition, *next);
                }
            }
            Err(error) => self.record_failure(Some(partition), ConsumerFault::Checkpoint(error)),
        }

        let position = self.position(partition);
        info!(
            channel = self.channel,
            partition,
            ?position,
            "partition assigned"
        );
        position
    }

    /// Stops committing for a partition now owned elsewhere. Events already
    /// queued for it are still handled, but never checkpointed.
    pub fn revoke_partition(&self, partition: i32) {
        self.revoked.insert(partition);
    }

    pub fn is_revoked(&self, partition: i32) -> bool {
        self.revoked.contains(&partition)
    }

    fn counters_for(&self, partition: i32) -> Arc<PartitionCounters> {
        self.counters
            .entry(partition)
            .or_insert_with(|| {
                metrics::counter!(
                    CONSUMER_PARTITIONS_INITIALIZED,
                    "channel" => self.channel.clone()
                )
                .increment(1);
                debug!(channel = self.channel, partition, "registered partition counters");
                Arc::new(PartitionCounters::new(&self.channel, partition))
            })
            .clone()
    }

    pub fn position(&self, partition: i32) -> PartitionPosition {
        self.positions
            .get(&partition)
            .map(|position| *position)
            .unwrap_or(PartitionPosition::Earliest)
    }

    pub fn positions(&self) -> HashMap<i32, PartitionPosition> {
        self.positions
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn partition_counters(&self, partition: i32) -> Option<Arc<PartitionCounters>> {
        self.counters.get(&partition).map(|counters| counters.clone())
    }

    pub fn registered_partitions(&self) -> usize {
        self.counters.len()
    }

    fn advance_position(&self, partition: i32, next: i64) {
        self.positions
            .entry(partition)
            .and_modify(|position| *position = position.advanced_to(next))
            .or_insert(PartitionPosition::Offset(next));
    }

    /// Handles one event end to end. Payload failures are reported and
    /// consumption continues with the next event.
    pub async fn process_event(&self, event: ReceivedEvent) -> EventOutcome {
        let partition = event.partition;
        let counters = self.initialize_partition(partition);

        if let PartitionPosition::Offset(next) = self.position(partition) {
            if event.sequence < next {
                debug!(
                    channel = self.channel,
                    partition,
                    sequence = event.sequence,
                    next,
                    "skipping event below committed position"
                );
                metrics::counter!(CONSUMER_SKIPPED, "channel" => self.channel.clone())
                    .increment(1);
                return EventOutcome::Skipped;
            }
        }

        let lag = event.lag();
        self.dispatch(&event);
        counters.record_received(lag.and_then(|lag| u64::try_from(lag).ok()).unwrap_or(0));

        let now = Instant::now();
        if self.is_revoked(partition) || !self.should_checkpoint(partition, lag, now) {
            return EventOutcome::Processed;
        }

        let next = event.sequence + 1;
        match self.store.commit(&self.scope, partition, next).await {
            Ok(stored) => {
                self.last_checkpoints
                    .entry(partition)
                    .and_modify(|last| *last = (*last).max(now))
                    .or_insert(now);
                if stored > next {
                    debug!(
                        channel = self.channel,
                        partition,
                        next,
                        stored,
                        "stored position is ahead of this consumer"
                    );
                }
                self.advance_position(partition, stored);
                metrics::counter!(CONSUMER_CHECKPOINTS, "channel" => self.channel.clone())
                    .increment(1);
                EventOutcome::Checkpointed
            }
            Err(error) => {
                self.record_failure(Some(partition), ConsumerFault::Checkpoint(error));
                EventOutcome::Processed
            }
        }
    }

    fn dispatch(&self, event: &ReceivedEvent) {
        let partition = event.partition;
        let Some(payload) = event.payload.as_deref().filter(|payload| !payload.is_empty())
        else {
            self.record_failure(Some(partition), HandlerError::EmptyPayload.into());
            return;
        };

        if let Some(probe_id) = health_probe_id(payload) {
            metrics::counter!(CONSUMER_HEALTH_PROBES, "channel" => self.channel.clone())
                .increment(1);
            self.probe_listener
                .on_health_probe(&self.channel, partition, &probe_id);
            return;
        }

        if let Err(error) = self.handler.handle(payload) {
            self.record_failure(Some(partition), error.into());
        }
    }

    /// Commit when caught up, otherwise at most once per interval.
    pub fn should_checkpoint(&self, partition: i32, lag: Option<i64>, now: Instant) -> bool {
        if lag == Some(0) {
            return true;
        }
        match self.last_checkpoints.get(&partition) {
            Some(last) => now.saturating_duration_since(*last) >= self.checkpoint_interval,
            None => true,
        }
    }

    /// Entry point for transport faults, with or without a partition.
    pub fn handle_error(&self, partition: Option<i32>, error: TransportError) {
        if self.classifier.is_rebalancing(partition, &error) {
            let partition = partition.unwrap_or(NO_PARTITION);
            info!(
                channel = self.channel,
                partition,
                error = %error,
                "partition ownership moved to another consumer"
            );
            self.counters_for(partition).record_rebalancing();
            return;
        }
        self.record_failure(partition, error.into());
    }

    fn record_failure(&self, partition: Option<i32>, fault: ConsumerFault) {
        let bucket = partition.unwrap_or(NO_PARTITION);
        let total = self.failures.increment();
        self.counters_for(bucket).record_error();

        match &fault {
            ConsumerFault::Handler(error) => warn!(
                channel = self.channel,
                partition = bucket,
                error = %error,
                "failed to handle event"
            ),
            _ => error!(
                channel = self.channel,
                partition = bucket,
                kind = fault.label(),
                error = %fault,
                failures = total,
                "consumer error"
            ),
        }

        self.error_listener.on_error(&self.channel, partition, &fault);
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.count()
    }

    pub fn require_restart(&self) -> bool {
        exceeds_threshold(self.failures.count(), self.error_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::error::TransportErrorKind;
    use crate::handler::TypedHandler;

    fn engine(settings: &StreamSettings) -> ConsumerEngine {
        let handler = Arc::new(TypedHandler::new(|_: serde_json::Value| Ok(())));
        ConsumerEngine::new(
            &ChannelDefinition::consumer("orders", "orders-topic", "billing"),
            handler,
            Arc::new(MemoryCheckpointStore::default()),
            settings,
            Arc::new(FailureCounter::default()),
        )
        .unwrap()
    }

    #[test]
    fn positions_only_advance() {
        assert_eq!(
            PartitionPosition::Earliest.advanced_to(5),
            PartitionPosition::Offset(5)
        );
        assert_eq!(
            PartitionPosition::Offset(9).advanced_to(5),
            PartitionPosition::Offset(9)
        );
        assert_eq!(
            PartitionPosition::Offset(9).advanced_to(12),
            PartitionPosition::Offset(12)
        );
    }

    #[test]
    fn requires_consumer_group() {
        let result = ConsumerEngine::new(
            &ChannelDefinition::producer("audit", "audit-topic"),
            Arc::new(TypedHandler::new(|_: serde_json::Value| Ok(()))),
            Arc::new(MemoryCheckpointStore::default()),
            &StreamSettings::default(),
            Arc::new(FailureCounter::default()),
        );
        assert!(matches!(
            result,
            Err(RegistryError::MissingConsumerGroup(name)) if name == "audit"
        ));
    }

    #[tokio::test]
    async fn initialization_is_idempotent() {
        let engine = engine(&StreamSettings::default());
        let first = engine.initialize_partition(4);
        first.record_received(2);

        let second = engine.initialize_partition(4);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.snapshot().received, 1);
        assert_eq!(engine.registered_partitions(), 1);
    }

    #[tokio::test]
    async fn connection_errors_without_partition_use_synthetic_bucket() {
        let engine = engine(&StreamSettings::default());
        engine.handle_error(
            None,
            TransportError::new(TransportErrorKind::Connection, "all brokers down"),
        );

        let bucket = engine.partition_counters(NO_PARTITION).unwrap();
        assert_eq!(bucket.snapshot().errors, 1);
        assert_eq!(engine.failure_count(), 1);
    }

    #[tokio::test]
    async fn ownership_loss_without_partition_is_a_real_error() {
        let engine = engine(&StreamSettings::default());
        engine.handle_error(None, TransportError::ownership_lost("generation fenced"));

        assert_eq!(engine.failure_count(), 1);
        let bucket = engine.partition_counters(NO_PARTITION).unwrap().snapshot();
        assert_eq!(bucket.rebalancing, 0);
        assert_eq!(bucket.errors, 1);
    }
}
