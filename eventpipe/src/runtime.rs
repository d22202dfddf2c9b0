use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ChannelDefinition;
use crate::consumer::ConsumerEngine;
use crate::counters::{FailureCounter, ProducerSnapshot};
use crate::error::{EnqueueError, TransportError};
use crate::producer::{BatchingProducer, DeliveryReceipt, DirectProducer, ProducerConnector};

/// The messaging system behind the channels.
pub trait Transport: Send + Sync {
    fn producer_connector(&self) -> Arc<dyn ProducerConnector>;

    /// Starts pumping the channel's destination into the engine until the
    /// shutdown signal fires.
    fn start_consumer(
        &self,
        definition: &ChannelDefinition,
        engine: Arc<ConsumerEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, TransportError>;
}

pub enum ChannelProducer {
    Direct(DirectProducer),
    Batching(BatchingProducer),
}

impl ChannelProducer {
    /// Mode-independent send. For a batching channel this only reports
    /// whether the event was accepted into the queue.
    pub fn send<T: Serialize>(&self, event: &T) -> bool {
        match self {
            ChannelProducer::Direct(producer) => producer.send(event),
            ChannelProducer::Batching(producer) => producer.enqueue(event).is_ok(),
        }
    }

    /// Batching channels hand back a receipt that resolves on delivery.
    pub fn enqueue<T: Serialize>(
        &self,
        event: &T,
    ) -> Option<Result<DeliveryReceipt, EnqueueError>> {
        match self {
            ChannelProducer::Direct(_) => None,
            ChannelProducer::Batching(producer) => Some(producer.enqueue(event)),
        }
    }

    pub fn counters(&self) -> ProducerSnapshot {
        match self {
            ChannelProducer::Direct(producer) => producer.counters(),
            ChannelProducer::Batching(producer) => producer.counters(),
        }
    }

    pub fn require_restart(&self) -> bool {
        match self {
            ChannelProducer::Direct(producer) => producer.require_restart(),
            ChannelProducer::Batching(producer) => producer.require_restart(),
        }
    }

    pub fn close(&self) {
        match self {
            ChannelProducer::Direct(producer) => producer.close(),
            ChannelProducer::Batching(producer) => producer.close(),
        }
    }
}

/// Everything built from a registry: running consumers, started producers
/// and the background tasks behind them.
pub struct StreamRuntime {
    consumers: HashMap<String, Arc<ConsumerEngine>>,
    producers: HashMap<String, Arc<ChannelProducer>>,
    consumer_failures: Arc<FailureCounter>,
    producer_failures: Arc<FailureCounter>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl StreamRuntime {
    pub(crate) fn new(
        consumer_failures: Arc<FailureCounter>,
        producer_failures: Arc<FailureCounter>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            consumers: HashMap::new(),
            producers: HashMap::new(),
            consumer_failures,
            producer_failures,
            tasks: Vec::new(),
            shutdown,
        }
    }

    pub(crate) fn add_consumer(&mut self, engine: Arc<ConsumerEngine>, task: JoinHandle<()>) {
        self.consumers.insert(engine.channel().to_string(), engine);
        self.tasks.push(task);
    }

    pub(crate) fn add_producer(&mut self, channel: &str, producer: ChannelProducer) {
        self.producers.insert(channel.to_string(), Arc::new(producer));
    }

    pub(crate) fn add_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub(crate) fn consumer_failure_counter(&self) -> Arc<FailureCounter> {
        self.consumer_failures.clone()
    }

    pub(crate) fn producer_failure_counter(&self) -> Arc<FailureCounter> {
        self.producer_failures.clone()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn consumer(&self, channel: &str) -> Option<Arc<ConsumerEngine>> {
        self.consumers.get(channel).cloned()
    }

    pub fn producer(&self, channel: &str) -> Option<Arc<ChannelProducer>> {
        self.producers.get(channel).cloned()
    }

    pub fn producer_channels(&self) -> impl Iterator<Item = &str> {
        self.producers.keys().map(String::as_str)
    }

    pub fn consumer_failures(&self) -> u64 {
        self.consumer_failures.count()
    }

    pub fn producer_failures(&self) -> u64 {
        self.producer_failures.count()
    }

    /// True once any consumer or producer has seen more failures than its
    /// threshold allows.
    pub fn require_restart(&self) -> bool {
        self.consumers.values().any(|engine| engine.require_restart())
            || self
                .producers
                .values()
                .any(|producer| producer.require_restart())
    }

    /// Stops the consumer pumps, closes every producer and waits for the
    /// background tasks to finish.
    pub async fn shutdown(self) {
        info!(
            consumers = self.consumers.len(),
            producers = self.producers.len(),
            "shutting down stream runtime"
        );
        // Receivers may already be gone if a pump failed to start
        let _ = self.shutdown.send(true);
        // Closing a direct producer flushes, which blocks
        for (channel, producer) in self.producers {
            if let Err(e) = tokio::task::spawn_blocking(move || producer.close()).await {
                warn!(channel, "failed to close producer: {}", e);
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("background task ended abnormally: {}", e);
            }
        }
    }
}
