use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use health::HealthHandle;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use super::{DeliveryReceipt, EventBatch, PendingSend, ProducerClient, ProducerConnector};
use crate::config::StreamSettings;
use crate::counters::{exceeds_threshold, FailureCounter, ProducerCounters, ProducerSnapshot};
use crate::error::{EnqueueError, ProduceError};
use crate::metrics_consts::{
    PRODUCER_BATCH_SIZE, PRODUCER_ITEMS_RECYCLED, PRODUCER_RETRY_BUFFER_SIZE,
};

const MAX_LOGGED_PAYLOAD_BYTES: usize = 256;

/// Caller side of a batching channel. Enqueueing never blocks: a full queue
/// is reported back and the caller decides what to do with the event.
#[derive(Clone)]
pub struct BatchingProducer {
    channel: String,
    queue: mpsc::Sender<PendingSend>,
    closed: Arc<AtomicBool>,
    counters: Arc<ProducerCounters>,
    failures: Arc<FailureCounter>,
    error_threshold: u64,
}

impl BatchingProducer {
    pub fn enqueue<T: Serialize>(&self, event: &T) -> Result<DeliveryReceipt, EnqueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EnqueueError::Closed);
        }

        let payload = Bytes::from(serde_json::to_vec(event)?);
        let (pending, receipt) = PendingSend::new(payload);
        match self.queue.try_send(pending) {
            Ok(()) => Ok(receipt),
            Err(TrySendError::Full(_)) => {
                debug!(channel = self.channel, "producer queue full, rejecting event");
                Err(EnqueueError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Stops the worker after its current cycle. Items still queued are not sent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(channel = self.channel, "closing batching producer");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> ProducerSnapshot {
        self.counters.snapshot()
    }

    pub fn require_restart(&self) -> bool {
        exceeds_threshold(self.failures.count(), self.error_threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Idle,
    Sent(usize),
    ConnectFailed,
    SendFailed(RecycleOutcome),
}

/// Where the items of a failed batch ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecycleOutcome {
    pub requeued: usize,
    pub retained: usize,
}

pub struct BatchingWorker {
    channel: String,
    destination: String,
    connector: Arc<dyn ProducerConnector>,
    client: Option<Arc<dyn ProducerClient>>,
    queue_tx: mpsc::Sender<PendingSend>,
    queue_rx: mpsc::Receiver<PendingSend>,
    retry_buffer: VecDeque<PendingSend>,
    scratch: Vec<PendingSend>,
    max_items: usize,
    period: Duration,
    closed: Arc<AtomicBool>,
    counters: Arc<ProducerCounters>,
    failures: Arc<FailureCounter>,
    liveness: Option<HealthHandle>,
}

/// Creates the caller handle and the worker that drains its queue.
pub fn batching_producer(
    channel: &str,
    destination: &str,
    connector: Arc<dyn ProducerConnector>,
    settings: &StreamSettings,
    failures: Arc<FailureCounter>,
) -> (BatchingProducer, BatchingWorker) {
    let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(ProducerCounters::new(channel));

    let producer = BatchingProducer {
        channel: channel.to_string(),
        queue: queue_tx.clone(),
        closed: closed.clone(),
        counters: counters.clone(),
        failures: failures.clone(),
        error_threshold: settings.producer_error_threshold,
    };

    let worker = BatchingWorker {
        channel: channel.to_string(),
        destination: destination.to_string(),
        connector,
        client: None,
        queue_tx,
        queue_rx,
        retry_buffer: VecDeque::new(),
        scratch: Vec::new(),
        max_items: settings.batch_max_items.max(1),
        period: settings.batch_period,
        closed,
        counters,
        failures,
        liveness: None,
    };

    (producer, worker)
}

impl BatchingWorker {
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub async fn run(mut self) {
        info!(channel = self.channel, "starting batching worker");
        while !self.closed.load(Ordering::SeqCst) {
            self.run_once().await;
        }

        if let Some(client) = self.client.take() {
            self.close_client(client).await;
        }
        info!(
            channel = self.channel,
            retained = self.retry_buffer.len(),
            "batching worker stopped"
        );
    }

    /// One cycle: connect if needed, fill a batch, send it or idle.
    pub async fn run_once(&mut self) -> CycleOutcome {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }

        let client = match self.client().await {
            Some(client) => client,
            None => {
                tokio::time::sleep(self.period).await;
                return CycleOutcome::ConnectFailed;
            }
        };

        let mut batch = EventBatch::new(client.max_batch_bytes());
        self.fill(&mut batch);
        metrics::gauge!(PRODUCER_RETRY_BUFFER_SIZE, "channel" => self.channel.clone())
            .set(self.retry_buffer.len() as f64);

        if batch.is_empty() {
            tokio::time::sleep(self.period).await;
            return CycleOutcome::Idle;
        }

        metrics::histogram!(PRODUCER_BATCH_SIZE, "channel" => self.channel.clone())
            .record(batch.len() as f64);

        match client.send_batch(&batch).await {
            Ok(()) => {
                let sent = self.scratch.len();
                for item in self.scratch.drain(..) {
                    item.complete();
                }
                self.counters.record_sent(sent as u64);
                CycleOutcome::Sent(sent)
            }
            Err(e) => {
                let total = self.failures.increment();
                self.counters.record_send_error();
                error!(
                    channel = self.channel,
                    items = batch.len(),
                    bytes = batch.size_bytes(),
                    failures = total,
                    contents = ?describe_batch(&batch),
                    "failed to send batch: {}",
                    e
                );

                self.client = None;
                self.close_client(client).await;
                CycleOutcome::SendFailed(self.recycle())
            }
        }
    }

    /// Connecting may block on broker metadata, so it runs on the blocking pool.
    async fn client(&mut self) -> Option<Arc<dyn ProducerClient>> {
        if let Some(client) = &self.client {
            return Some(client.clone());
        }

        let connector = self.connector.clone();
        let destination = self.destination.clone();
        let connected = tokio::task::spawn_blocking(move || connector.connect(&destination))
            .await
            .unwrap_or_else(|e| {
                Err(ProduceError::Transport(format!("connect task failed: {e}")))
            });

        match connected {
            Ok(client) => {
                debug!(channel = self.channel, "created producer client");
                self.client = Some(client.clone());
                Some(client)
            }
            Err(e) => {
                let total = self.failures.increment();
                self.counters.record_send_error();
                error!(
                    channel = self.channel,
                    failures = total,
                    "failed to create producer client: {}",
                    e
                );
                None
            }
        }
    }

    /// Closing flushes in-flight sends, which blocks.
    async fn close_client(&self, client: Arc<dyn ProducerClient>) {
        if let Err(e) = tokio::task::spawn_blocking(move || client.close()).await {
            warn!(channel = self.channel, "failed to close producer client: {}", e);
        }
    }

    /// Retry buffer first, then the queue. Items that do not fit wait in the
    /// retry buffer for the next cycle.
    fn fill(&mut self, batch: &mut EventBatch) {
        let mut retry = std::mem::take(&mut self.retry_buffer);

        while self.scratch.len() < self.max_items {
            let Some(item) = retry.pop_front().or_else(|| self.queue_rx.try_recv().ok()) else {
                break;
            };

            if batch.try_add(&item.payload) {
                self.scratch.push(item);
            } else if batch.is_empty() {
                // Would not fit even an empty batch, so it can never be sent
                self.counters.record_dropped();
                warn!(
                    channel = self.channel,
                    bytes = item.payload.len(),
                    max_bytes = batch.max_bytes(),
                    "dropping event larger than the batch size limit"
                );
            } else {
                self.retry_buffer.push_back(item);
            }
        }

        // Anything not considered this cycle keeps its place behind the deferred items
        self.retry_buffer.extend(retry);
    }

    /// Puts every item of a failed batch, plus the retry buffer, back on the
    /// queue. Whatever the queue cannot take stays in the retry buffer.
    pub fn recycle(&mut self) -> RecycleOutcome {
        let mut items: Vec<PendingSend> = self.scratch.drain(..).collect();
        items.extend(self.retry_buffer.drain(..));

        let mut requeued = 0;
        for item in items {
            match self.queue_tx.try_send(item) {
                Ok(()) => requeued += 1,
                Err(TrySendError::Full(item) | TrySendError::Closed(item)) => {
                    self.retry_buffer.push_back(item)
                }
            }
        }

        metrics::counter!(PRODUCER_ITEMS_RECYCLED, "channel" => self.channel.clone())
            .increment(requeued as u64);
        RecycleOutcome {
            requeued,
            retained: self.retry_buffer.len(),
        }
    }

    pub fn retry_len(&self) -> usize {
        self.retry_buffer.len()
    }

    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }
}

fn describe_batch(batch: &EventBatch) -> Vec<String> {
    batch
        .payloads()
        .iter()
        .map(|payload| {
            let end = payload.len().min(MAX_LOGGED_PAYLOAD_BYTES);
            String::from_utf8_lossy(&payload[..end]).into_owned()
        })
        .collect()
}
