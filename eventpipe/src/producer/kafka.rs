use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common_kafka::config::KafkaConfig;
use common_kafka::kafka_producer::{create_kafka_producer, KafkaContext};
use futures::future::BoxFuture;
use futures::FutureExt;
use health::HealthRegistry;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use tracing::{error, info, instrument};

use super::{EventBatch, ProducerClient, ProducerConnector};
use crate::error::ProduceError;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaProducerConnector {
    config: KafkaConfig,
    liveness: HealthRegistry,
}

impl KafkaProducerConnector {
    pub fn new(config: KafkaConfig, liveness: HealthRegistry) -> Self {
        Self { config, liveness }
    }
}

impl ProducerConnector for KafkaProducerConnector {
    fn connect(&self, destination: &str) -> Result<Arc<dyn ProducerClient>, ProduceError> {
        let handle = self
            .liveness
            .register(format!("producer-{destination}"), Duration::from_secs(30));
        let producer = create_kafka_producer(&self.config, handle)?;
        info!(destination, "connected kafka producer");

        Ok(Arc::new(KafkaProducerClient {
            producer,
            topic: destination.to_string(),
            max_batch_bytes: self.config.kafka_producer_message_max_bytes as usize,
        }))
    }
}

pub struct KafkaProducerClient {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    max_batch_bytes: usize,
}

impl KafkaProducerClient {
    fn enqueue(&self, payload: &[u8]) -> Result<DeliveryFuture, ProduceError> {
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(&self.topic).payload(payload);
        self.producer
            .send_result(record)
            .map_err(|(e, _)| ProduceError::Kafka(e))
    }
}

async fn process_ack(delivery: DeliveryFuture) -> Result<(), ProduceError> {
    match delivery.await {
        // Cancelled due to timeout while retrying
        Err(_) => Err(ProduceError::Canceled),
        Ok(Err((e, _))) => Err(ProduceError::Kafka(e)),
        Ok(Ok(_)) => Ok(()),
    }
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    #[instrument(skip_all)]
    fn submit(
        &self,
        payload: Bytes,
    ) -> Result<BoxFuture<'static, Result<(), ProduceError>>, ProduceError> {
        let delivery = self.enqueue(&payload)?;
        Ok(process_ack(delivery).boxed())
    }

    #[instrument(skip_all)]
    async fn send_batch(&self, batch: &EventBatch) -> Result<(), ProduceError> {
        // Enqueue sequentially to keep ordering, then wait for every ack
        let mut deliveries = Vec::with_capacity(batch.len());
        for payload in batch.payloads() {
            deliveries.push(self.enqueue(payload)?);
        }

        for delivery in deliveries {
            process_ack(delivery).await?;
        }
        Ok(())
    }

    fn close(&self) {
        if let Err(e) = self.producer.flush(CLOSE_FLUSH_TIMEOUT) {
            error!(topic = self.topic, "failed to flush producer on close: {}", e);
        }
    }
}
