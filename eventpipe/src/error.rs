use std::fmt;

use rdkafka::error::KafkaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid channel definition '{0}', expected name=destination[@consumer_group]")]
    InvalidChannel(String),
    #[error("channel '{0}' is defined more than once")]
    DuplicateChannel(String),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("unsupported checkpoint store url: {0}")]
    UnsupportedUrl(String),
    #[error("corrupt checkpoint entry {field}={value}")]
    Corrupt { field: String, value: String },
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("failed to deserialize payload: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("received empty payload")]
    EmptyPayload,
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        HandlerError::Failed(reason.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The partition was taken over by another member of the consumer group
    OwnershipLost,
    /// Brokers unreachable or the connection dropped
    Connection,
    /// Any other broker or client side failure
    Broker,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::OwnershipLost => "ownership_lost",
            TransportErrorKind::Connection => "connection",
            TransportErrorKind::Broker => "broker",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} transport error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn ownership_lost(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::OwnershipLost, message)
    }
}

/// Everything the consumer forwards to its error listener.
#[derive(Error, Debug)]
pub enum ConsumerFault {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("checkpoint commit failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl ConsumerFault {
    pub fn label(&self) -> &'static str {
        match self {
            ConsumerFault::Transport(_) => "transport",
            ConsumerFault::Handler(_) => "handler",
            ConsumerFault::Checkpoint(_) => "checkpoint",
        }
    }
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("delivery canceled before the broker acknowledged it")]
    Canceled,
    #[error("no tokio runtime available to track deliveries")]
    NoRuntime,
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("producer queue is full")]
    QueueFull,
    #[error("producer is closed")]
    Closed,
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("channel '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("channel '{0}' is not configured")]
    UnknownChannel(String),
    #[error("channel '{0}' has no consumer group configured")]
    MissingConsumerGroup(String),
    #[error("checkpoint store failure: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("failed to start consumer: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to start producer: {0}")]
    Produce(#[from] ProduceError),
}
