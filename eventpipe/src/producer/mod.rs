use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::ProduceError;

pub mod batching;
pub mod direct;
pub mod kafka;

pub use batching::{batching_producer, BatchingProducer, BatchingWorker};
pub use direct::DirectProducer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// Fire and forget, one transport submission per event
    Direct,
    /// Bounded queue drained into size-limited batches by a worker
    Batching,
}

/// An open connection to one destination.
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Byte ceiling for one batch sent through this client.
    fn max_batch_bytes(&self) -> usize;

    /// Hands one payload to the transport. An `Err` means it was rejected
    /// outright; otherwise the returned future resolves on acknowledgement.
    fn submit(
        &self,
        payload: Bytes,
    ) -> Result<BoxFuture<'static, Result<(), ProduceError>>, ProduceError>;

    /// Sends every payload in the batch, failing if any of them fails.
    async fn send_batch(&self, batch: &EventBatch) -> Result<(), ProduceError>;

    fn close(&self);
}

pub trait ProducerConnector: Send + Sync {
    fn connect(&self, destination: &str) -> Result<Arc<dyn ProducerClient>, ProduceError>;
}

/// Size-bounded container the batching worker fills before each send.
#[derive(Debug, Clone)]
pub struct EventBatch {
    max_bytes: usize,
    size_bytes: usize,
    payloads: Vec<Bytes>,
}

impl EventBatch {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            size_bytes: 0,
            payloads: Vec::new(),
        }
    }

    /// Adds the payload if it still fits under the byte ceiling.
    pub fn try_add(&mut self, payload: &Bytes) -> bool {
        if self.size_bytes + payload.len() > self.max_bytes {
            return false;
        }
        self.size_bytes += payload.len();
        self.payloads.push(payload.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn payloads(&self) -> &[Bytes] {
        &self.payloads
    }
}

/// A serialized event waiting in the batching queue.
#[derive(Debug)]
pub struct PendingSend {
    pub payload: Bytes,
    completion: Option<oneshot::Sender<()>>,
}

impl PendingSend {
    pub fn new(payload: Bytes) -> (Self, DeliveryReceipt) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            payload,
            completion: Some(tx),
        };
        (pending, DeliveryReceipt(rx))
    }

    pub fn complete(mut self) {
        if let Some(completion) = self.completion.take() {
            // The caller may have dropped its receipt
            let _ = completion.send(());
        }
    }
}

/// Resolves once the event's batch has been acknowledged.
#[derive(Debug)]
pub struct DeliveryReceipt(oneshot::Receiver<()>);

impl DeliveryReceipt {
    /// False if the producer shut down before the event was delivered.
    pub async fn delivered(self) -> bool {
        self.0.await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_respects_byte_ceiling() {
        let mut batch = EventBatch::new(250);
        let item = Bytes::from(vec![b'x'; 100]);

        assert!(batch.try_add(&item));
        assert!(batch.try_add(&item));
        assert!(!batch.try_add(&item));
        assert!(batch.try_add(&Bytes::from_static(b"small")));

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.size_bytes(), 205);
    }

    #[tokio::test]
    async fn receipts_follow_completion() {
        let (pending, receipt) = PendingSend::new(Bytes::from_static(b"{}"));
        pending.complete();
        assert!(receipt.delivered().await);

        let (pending, receipt) = PendingSend::new(Bytes::from_static(b"{}"));
        drop(pending);
        assert!(!receipt.delivered().await);
    }
}
