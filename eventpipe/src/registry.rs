use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use health::{HealthProbeListener, HealthRegistry};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{error, info};

use crate::checkpoint::CheckpointStore;
use crate::config::{ChannelDefinition, ChannelDefinitions, StreamSettings};
use crate::consumer::{ConsumerEngine, ErrorClassifier, OwnershipLostClassifier};
use crate::counters::FailureCounter;
use crate::error::{HandlerError, RegistryError};
use crate::handler::{ErrorListener, EventHandler, IgnoreErrors, TypedHandler};
use crate::producer::{batching_producer, DirectProducer, ProducerMode};
use crate::runtime::{ChannelProducer, StreamRuntime, Transport};

/// Liveness deadline for batching workers, which report once per cycle.
const WORKER_LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

/// Collaborators shared by every channel the registry builds.
pub struct RuntimeServices {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub classifier: Arc<dyn ErrorClassifier>,
    pub probe_listener: Arc<dyn HealthProbeListener>,
    pub error_listener: Arc<dyn ErrorListener>,
    pub liveness: Option<HealthRegistry>,
}

impl RuntimeServices {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            checkpoints,
            classifier: Arc::new(OwnershipLostClassifier),
            probe_listener: Arc::new(|_: &str, _: i32, _: &str| {}),
            error_listener: Arc::new(IgnoreErrors),
            liveness: None,
        }
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

    pub fn with_liveness(mut self, liveness: HealthRegistry) -> Self {
        self.liveness = Some(liveness);
        self
    }
}

/// Declares which channels this process consumes and produces. Building
/// consumes the registry, so channels cannot change once started.
#[derive(Default)]
pub struct ChannelRegistry {
    consumers: BTreeMap<String, Arc<dyn EventHandler>>,
    producers: BTreeMap<String, ProducerMode>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a channel's events, deserialized from JSON into `T`.
    pub fn register_consumer<T, F>(
        &mut self,
        channel: &str,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if self.consumers.contains_key(channel) {
            return Err(RegistryError::AlreadyRegistered(channel.to_string()));
        }
        self.consumers
            .insert(channel.to_string(), Arc::new(TypedHandler::new(handler)));
        Ok(())
    }

    pub fn register_producer(
        &mut self,
        channel: &str,
        mode: ProducerMode,
    ) -> Result<(), RegistryError> {
        if self.producers.contains_key(channel) {
            return Err(RegistryError::AlreadyRegistered(channel.to_string()));
        }
        self.producers.insert(channel.to_string(), mode);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty() && self.producers.is_empty()
    }

    fn definition<'a>(
        definitions: &'a ChannelDefinitions,
        channel: &str,
    ) -> Result<&'a ChannelDefinition, RegistryError> {
        definitions
            .get(channel)
            .ok_or_else(|| RegistryError::UnknownChannel(channel.to_string()))
    }

    /// Validates every registration against the channel definitions, then
    /// starts consumers and producers. Nothing is started if validation fails,
    /// and whatever did start is shut down again if a later channel fails.
    pub async fn build_all<T: Transport>(
        self,
        definitions: &ChannelDefinitions,
        settings: &StreamSettings,
        transport: &T,
        services: RuntimeServices,
    ) -> Result<StreamRuntime, RegistryError> {
        for channel in self.consumers.keys() {
            let definition = Self::definition(definitions, channel)?;
            if definition.consumer_group.is_none() {
                return Err(RegistryError::MissingConsumerGroup(channel.clone()));
            }
        }
        for channel in self.producers.keys() {
            Self::definition(definitions, channel)?;
        }

        let (shutdown, _) = watch::channel(false);
        let mut runtime = StreamRuntime::new(
            Arc::new(FailureCounter::default()),
            Arc::new(FailureCounter::default()),
            shutdown,
        );

        if let Err(e) = self
            .start_channels(definitions, settings, transport, &services, &mut runtime)
            .await
        {
            error!("failed to start channels, stopping those already running: {}", e);
            runtime.shutdown().await;
            return Err(e);
        }

        Ok(runtime)
    }

    async fn start_channels<T: Transport>(
        self,
        definitions: &ChannelDefinitions,
        settings: &StreamSettings,
        transport: &T,
        services: &RuntimeServices,
        runtime: &mut StreamRuntime,
    ) -> Result<(), RegistryError> {
        for (channel, handler) in self.consumers {
            let definition = Self::definition(definitions, &channel)?;
            let engine = ConsumerEngine::new(
                definition,
                handler,
                services.checkpoints.clone(),
                settings,
                runtime.consumer_failure_counter(),
            )?
            .with_classifier(services.classifier.clone())
            .with_probe_listener(services.probe_listener.clone())
            .with_error_listener(services.error_listener.clone());

            let engine = Arc::new(engine);
            engine.start().await?;
            let shutdown = runtime.shutdown_signal();
            let task = transport.start_consumer(definition, engine.clone(), shutdown)?;
            runtime.add_consumer(engine, task);
        }

        if !self.producers.is_empty() {
            let connector = transport.producer_connector();
            for (channel, mode) in self.producers {
                let definition = Self::definition(definitions, &channel)?;
                let producer = match mode {
                    ProducerMode::Direct => {
                        let producer = DirectProducer::new(
                            &channel,
                            &definition.destination,
                            connector.clone(),
                            runtime.producer_failure_counter(),
                            settings.producer_error_threshold,
                        );
                        producer.start()?;
                        ChannelProducer::Direct(producer)
                    }
                    ProducerMode::Batching => {
                        let (producer, mut worker) = batching_producer(
                            &channel,
                            &definition.destination,
                            connector.clone(),
                            settings,
                            runtime.producer_failure_counter(),
                        );
                        if let Some(liveness) = &services.liveness {
                            worker = worker.with_liveness(liveness.register(
                                format!("batching-worker-{channel}"),
                                WORKER_LIVENESS_DEADLINE.max(settings.batch_period * 2),
                            ));
                        }
                        runtime.add_task(tokio::spawn(worker.run()));
                        ChannelProducer::Batching(producer)
                    }
                };
                info!(channel, mode = ?mode, "producer ready");
                runtime.add_producer(&channel, producer);
            }
        }

        Ok(())
    }
}
