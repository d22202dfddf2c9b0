use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::error::{ConsumerFault, HandlerError};

/// Type-erased entry point for a channel's application handler.
pub trait EventHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Deserializes the JSON payload into `T` before calling the wrapped function.
pub struct TypedHandler<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> TypedHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _payload: PhantomData,
        }
    }
}

impl<T, F> EventHandler for TypedHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let event: T = serde_json::from_slice(payload)?;
        (self.handler)(event)
    }
}

/// Receives every real error a consumer sees. Rebalancing errors are only counted.
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, channel: &str, partition: Option<i32>, fault: &ConsumerFault);
}

impl<F> ErrorListener for F
where
    F: Fn(&str, Option<i32>, &ConsumerFault) + Send + Sync,
{
    fn on_error(&self, channel: &str, partition: Option<i32>, fault: &ConsumerFault) {
        self(channel, partition, fault)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreErrors;

impl ErrorListener for IgnoreErrors {
    fn on_error(&self, _channel: &str, _partition: Option<i32>, _fault: &ConsumerFault) {}
}
