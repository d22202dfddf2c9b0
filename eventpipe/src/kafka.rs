use std::sync::Arc;
use std::time::Duration;

use common_kafka::config::KafkaConfig;
use health::HealthRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ChannelDefinition;
use crate::consumer::kafka::{transport_error, KafkaPartitionPump};
use crate::consumer::ConsumerEngine;
use crate::error::TransportError;
use crate::producer::kafka::KafkaProducerConnector;
use crate::producer::ProducerConnector;
use crate::runtime::Transport;

/// Liveness deadline for consumer components, reported from rdkafka statistics.
const CONSUMER_LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

pub struct KafkaTransport {
    config: KafkaConfig,
    liveness: HealthRegistry,
}

impl KafkaTransport {
    pub fn new(config: KafkaConfig, liveness: HealthRegistry) -> Self {
        Self { config, liveness }
    }
}

impl Transport for KafkaTransport {
    fn producer_connector(&self) -> Arc<dyn ProducerConnector> {
        Arc::new(KafkaProducerConnector::new(
            self.config.clone(),
            self.liveness.clone(),
        ))
    }

    fn start_consumer(
        &self,
        definition: &ChannelDefinition,
        engine: Arc<ConsumerEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, TransportError> {
        let liveness = self.liveness.register(
            format!("consumer-{}", definition.name),
            CONSUMER_LIVENESS_DEADLINE,
        );
        let pump = KafkaPartitionPump::new(&self.config, &definition.destination, engine, liveness)
            .map_err(|e| transport_error(&e, "failed to create consumer"))?;
        Ok(tokio::spawn(pump.run(shutdown)))
    }
}
