use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common_kafka::config::KafkaConfig;
use common_kafka::kafka_consumer::consumer_client_config;
use dashmap::{DashMap, DashSet};
use health::HealthHandle;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::{ClientContext, Message, Offset, Statistics};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{ConsumerEngine, PartitionPosition};
use crate::error::{TransportError, TransportErrorKind};
use crate::event::ReceivedEvent;

const PARTITION_BUFFER: usize = 1000;

/// Maps librdkafka failures onto the transport taxonomy the engine classifies.
pub fn transport_error(error: &KafkaError, context: &str) -> TransportError {
    let kind = match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::UnknownMemberId,
        ) => TransportErrorKind::OwnershipLost,
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::NetworkException,
        ) => TransportErrorKind::Connection,
        _ => TransportErrorKind::Broker,
    };
    TransportError::new(kind, format!("{context}: {error}"))
}

/// Newest high watermark known for a partition. librdkafka reports -1
/// until it has fetched from the partition.
pub fn freshest_high_watermark(cached: Option<i64>, reported: Option<i64>) -> Option<i64> {
    cached.into_iter().chain(reported).filter(|high| *high >= 0).max()
}

/// Sequence of the newest event in the partition, or `None` if the
/// watermark was taken before this event was written.
pub fn last_enqueued_sequence(high_watermark: Option<i64>, sequence: i64) -> Option<i64> {
    high_watermark
        .map(|high| high - 1)
        .filter(|last| *last >= sequence)
}

/// Consumer callbacks: liveness and high watermarks from statistics, and
/// partition ownership from rebalances. Assignments are only recorded here,
/// the pump completes them since that needs the checkpoint store.
pub struct PumpContext {
    topic: String,
    engine: Arc<ConsumerEngine>,
    watermarks: DashMap<i32, i64>,
    pending_assignments: DashSet<i32>,
    liveness: HealthHandle,
}

impl PumpContext {
    pub fn new(topic: &str, engine: Arc<ConsumerEngine>, liveness: HealthHandle) -> Self {
        Self {
            topic: topic.to_string(),
            engine,
            watermarks: DashMap::new(),
            pending_assignments: DashSet::new(),
            liveness,
        }
    }

    pub fn record_watermark(&self, partition: i32, high: i64) {
        // librdkafka reports an internal -1 partition for unassigned messages
        if partition >= 0 && high >= 0 {
            self.watermarks.insert(partition, high);
        }
    }

    pub fn watermark(&self, partition: i32) -> Option<i64> {
        self.watermarks.get(&partition).map(|high| *high)
    }

    pub fn on_revoke(&self, partitions: &[i32]) {
        for &partition in partitions {
            self.watermarks.remove(&partition);
            self.pending_assignments.remove(&partition);
            self.engine.revoke_partition(partition);
            self.engine.handle_error(
                Some(partition),
                TransportError::ownership_lost(format!(
                    "partition {partition} of {} revoked",
                    self.topic
                )),
            );
        }
    }

    pub fn on_assign(&self, partitions: &[i32]) {
        for &partition in partitions {
            self.engine.initialize_partition(partition);
            self.pending_assignments.insert(partition);
        }
    }

    /// Assignments not yet completed, sorted. Each is returned once.
    pub fn take_pending_assignments(&self) -> Vec<i32> {
        let mut pending: Vec<i32> = self.pending_assignments.iter().map(|p| *p).collect();
        pending.retain(|partition| self.pending_assignments.remove(partition).is_some());
        pending.sort_unstable();
        pending
    }

    fn partitions(&self, list: &TopicPartitionList) -> Vec<i32> {
        list.elements_for_topic(&self.topic)
            .iter()
            .map(|elem| elem.partition())
            .collect()
    }
}

impl ClientContext for PumpContext {
    fn stats(&self, stats: Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        let Some(topic) = stats.topics.get(&self.topic) else {
            return;
        };
        for partition in topic.partitions.values() {
            self.record_watermark(partition.partition, partition.hi_offset);
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        self.engine
            .handle_error(None, transport_error(&error, reason));
    }
}

impl ConsumerContext for PumpContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.on_revoke(&self.partitions(partitions)),
            Rebalance::Assign(partitions) => {
                info!(
                    channel = self.engine.channel(),
                    count = partitions.count(),
                    "assigning partitions"
                );
            }
            Rebalance::Error(e) => {
                self.engine
                    .handle_error(None, transport_error(e, "rebalance failed"));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            self.on_assign(&self.partitions(partitions));
        }
    }
}

/// Fans events out to one task per partition, so partitions progress
/// independently while each stays in order.
pub struct PartitionRouter {
    engine: Arc<ConsumerEngine>,
    workers: HashMap<i32, mpsc::Sender<ReceivedEvent>>,
    tasks: JoinSet<()>,
}

impl PartitionRouter {
    pub fn new(engine: Arc<ConsumerEngine>) -> Self {
        Self {
            engine,
            workers: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    pub async fn route(&mut self, event: ReceivedEvent) {
        let engine = &self.engine;
        let tasks = &mut self.tasks;
        let sender = self.workers.entry(event.partition).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(PARTITION_BUFFER);
            tasks.spawn(partition_worker(engine.clone(), rx));
            tx
        });
        if let Err(e) = sender.send(event).await {
            error!(channel = self.engine.channel(), "partition worker stopped: {}", e);
        }
    }

    /// Lets every worker drain what it already holds, then waits for them.
    pub async fn close(mut self) {
        self.workers.clear();
        while self.tasks.join_next().await.is_some() {}
    }
}

async fn partition_worker(engine: Arc<ConsumerEngine>, mut events: mpsc::Receiver<ReceivedEvent>) {
    while let Some(event) = events.recv().await {
        engine.process_event(event).await;
    }
}

/// Reads one destination and hands its events to a `PartitionRouter`.
pub struct KafkaPartitionPump {
    consumer: StreamConsumer<PumpContext>,
    topic: String,
    engine: Arc<ConsumerEngine>,
}

impl KafkaPartitionPump {
    pub fn new(
        config: &KafkaConfig,
        destination: &str,
        engine: Arc<ConsumerEngine>,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let context = PumpContext::new(destination, engine.clone(), liveness);

        let client_config = consumer_client_config(config, &engine.scope().consumer_group);
        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer<PumpContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[destination])?;

        Ok(Self {
            consumer,
            topic: destination.to_string(),
            engine,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(channel = self.engine.channel(), "starting partition pump");
        let mut router = PartitionRouter::new(self.engine.clone());

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(
                        channel = self.engine.channel(),
                        "shutdown signal received, stopping pump"
                    );
                    break;
                }
                received = self.recv_event() => {
                    self.complete_assignments().await;

                    let Some(event) = received else {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    };
                    router.route(event).await;
                }
            }
        }

        router.close().await;
        info!(channel = self.engine.channel(), "partition pump stopped");
    }

    /// Merges the stored position of newly assigned partitions and seeks
    /// there. Events fetched before the seek are skipped by the engine.
    async fn complete_assignments(&self) {
        for partition in self.consumer.context().take_pending_assignments() {
            let PartitionPosition::Offset(next) = self.engine.assign_partition(partition).await
            else {
                continue;
            };
            if let Err(e) = self.consumer.seek(
                &self.topic,
                partition,
                Offset::Offset(next),
                Duration::from_secs(0),
            ) {
                warn!(
                    channel = self.engine.channel(),
                    partition,
                    next,
                    "failed to seek to checkpoint: {}",
                    e
                );
            }
        }
    }

    /// Converts the borrowed message right away, it must not be held across an await.
    async fn recv_event(&self) -> Option<ReceivedEvent> {
        let received = self.consumer.recv().await;
        self.next_event(received)
    }

    fn next_event(&self, received: KafkaResult<BorrowedMessage<'_>>) -> Option<ReceivedEvent> {
        match received {
            Ok(message) => {
                let partition = message.partition();
                let sequence = message.offset();

                // Updated by librdkafka on every fetch response
                let cached = self
                    .consumer
                    .get_watermark_offsets(&self.topic, partition)
                    .ok()
                    .map(|(_, high)| high);
                let reported = self.consumer.context().watermark(partition);
                let high = freshest_high_watermark(cached, reported);

                Some(ReceivedEvent {
                    partition,
                    sequence,
                    last_enqueued_sequence: last_enqueued_sequence(high, sequence),
                    payload: message.payload().map(Bytes::copy_from_slice),
                })
            }
            Err(e) => {
                self.engine
                    .handle_error(None, transport_error(&e, "failed to receive message"));
                None
            }
        }
    }
}
