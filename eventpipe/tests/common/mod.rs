#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use eventpipe::config::ChannelDefinition;
use eventpipe::consumer::ConsumerEngine;
use eventpipe::error::{ProduceError, TransportError};
use eventpipe::producer::{EventBatch, ProducerClient, ProducerConnector};
use eventpipe::runtime::Transport;

/// Behaviour shared by every client a `TestConnector` hands out.
#[derive(Default)]
pub struct TestBroker {
    pub max_batch_bytes: AtomicUsize,
    pub fail_sends: AtomicBool,
    pub reject_submits: AtomicBool,
    pub fail_connects: AtomicBool,
    /// Every connect call, successful or not
    pub attempts: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub batches: Mutex<Vec<Vec<Bytes>>>,
    pub delivered: Mutex<Vec<Bytes>>,
}

impl TestBroker {
    pub fn new(max_batch_bytes: usize) -> Arc<Self> {
        let broker = Self::default();
        broker.max_batch_bytes.store(max_batch_bytes, Ordering::SeqCst);
        Arc::new(broker)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

pub struct TestConnector {
    pub broker: Arc<TestBroker>,
}

impl TestConnector {
    pub fn new(broker: Arc<TestBroker>) -> Arc<Self> {
        Arc::new(Self { broker })
    }
}

impl ProducerConnector for TestConnector {
    fn connect(&self, _destination: &str) -> Result<Arc<dyn ProducerClient>, ProduceError> {
        self.broker.attempts.fetch_add(1, Ordering::SeqCst);
        if self.broker.fail_connects.load(Ordering::SeqCst) {
            return Err(ProduceError::Transport("connection refused".to_string()));
        }
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestClient {
            broker: self.broker.clone(),
        }))
    }
}

pub struct TestClient {
    broker: Arc<TestBroker>,
}

#[async_trait]
impl ProducerClient for TestClient {
    fn max_batch_bytes(&self) -> usize {
        self.broker.max_batch_bytes.load(Ordering::SeqCst)
    }

    fn submit(
        &self,
        payload: Bytes,
    ) -> Result<BoxFuture<'static, Result<(), ProduceError>>, ProduceError> {
        if self.broker.reject_submits.load(Ordering::SeqCst) {
            return Err(ProduceError::Transport("queue full".to_string()));
        }
        if self.broker.fail_sends.load(Ordering::SeqCst) {
            let error = ProduceError::Transport("broker unavailable".to_string());
            return Ok(future::ready(Err(error)).boxed());
        }
        self.broker.delivered.lock().unwrap().push(payload);
        Ok(future::ready(Ok(())).boxed())
    }

    async fn send_batch(&self, batch: &EventBatch) -> Result<(), ProduceError> {
        if self.broker.fail_sends.load(Ordering::SeqCst) {
            return Err(ProduceError::Transport("broker unavailable".to_string()));
        }
        self.broker
            .batches
            .lock()
            .unwrap()
            .push(batch.payloads().to_vec());
        Ok(())
    }

    fn close(&self) {
        self.broker.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport whose consumers never receive anything; tests feed the engines directly.
pub struct TestTransport {
    pub broker: Arc<TestBroker>,
    pub started: Mutex<Vec<String>>,
}

impl TestTransport {
    pub fn new(broker: Arc<TestBroker>) -> Self {
        Self {
            broker,
            started: Mutex::new(Vec::new()),
        }
    }
}

impl Transport for TestTransport {
    fn producer_connector(&self) -> Arc<dyn ProducerConnector> {
        TestConnector::new(self.broker.clone())
    }

    fn start_consumer(
        &self,
        definition: &ChannelDefinition,
        _engine: Arc<ConsumerEngine>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, TransportError> {
        self.started.lock().unwrap().push(definition.name.clone());
        Ok(tokio::spawn(async move {
            let _ = shutdown.changed().await;
        }))
    }
}

/// A JSON string payload that serializes to exactly `bytes` bytes.
pub fn payload_of(bytes: usize) -> String {
    "x".repeat(bytes - 2)
}
