use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use super::{ProducerClient, ProducerConnector};
use crate::counters::{exceeds_threshold, FailureCounter, ProducerCounters, ProducerSnapshot};
use crate::error::ProduceError;

struct Connection {
    client: Arc<dyn ProducerClient>,
    runtime: Handle,
}

/// One submission per event, no batching and no retry. A failed delivery is
/// counted and the event is lost.
pub struct DirectProducer {
    channel: String,
    destination: String,
    connector: Arc<dyn ProducerConnector>,
    connection: OnceLock<Connection>,
    counters: Arc<ProducerCounters>,
    failures: Arc<FailureCounter>,
    error_threshold: u64,
}

impl DirectProducer {
    pub fn new(
        channel: &str,
        destination: &str,
        connector: Arc<dyn ProducerConnector>,
        failures: Arc<FailureCounter>,
        error_threshold: u64,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            destination: destination.to_string(),
            connector,
            connection: OnceLock::new(),
            counters: Arc::new(ProducerCounters::new(channel)),
            failures,
            error_threshold,
        }
    }

    /// Opens the connection. Must run inside a tokio runtime, which is where
    /// delivery acknowledgements are awaited.
    pub fn start(&self) -> Result<(), ProduceError> {
        if self.connection.get().is_some() {
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|_| ProduceError::NoRuntime)?;
        let client = self.connector.connect(&self.destination)?;
        if self.connection.set(Connection { client, runtime }).is_err() {
            warn!(channel = self.channel, "direct producer already started");
        } else {
            info!(
                channel = self.channel,
                destination = self.destination,
                "direct producer started"
            );
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.connection.get().is_some()
    }

    /// Returns false without sending if the producer is not started or the
    /// event cannot be serialized, and when the transport rejects it outright.
    pub fn send<T: Serialize>(&self, event: &T) -> bool {
        let Some(connection) = self.connection.get() else {
            return false;
        };

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(channel = self.channel, "failed to serialize event: {}", e);
                return false;
            }
        };

        match connection.client.submit(payload) {
            Ok(delivery) => {
                let channel = self.channel.clone();
                let counters = self.counters.clone();
                let failures = self.failures.clone();
                connection.runtime.spawn(async move {
                    match delivery.await {
                        Ok(()) => counters.record_sent(1),
                        Err(e) => {
                            counters.record_send_error();
                            let total = failures.increment();
                            error!(channel, failures = total, "failed to deliver event: {}", e);
                        }
                    }
                });
                true
            }
            Err(e) => {
                self.counters.record_send_error();
                let total = self.failures.increment();
                error!(
                    channel = self.channel,
                    failures = total,
                    "failed to submit event: {}",
                    e
                );
                false
            }
        }
    }

    pub fn counters(&self) -> ProducerSnapshot {
        self.counters.snapshot()
    }

    pub fn require_restart(&self) -> bool {
        exceeds_threshold(self.failures.count(), self.error_threshold)
    }

    pub fn close(&self) {
        if let Some(connection) = self.connection.get() {
            connection.client.close();
        }
    }
}
