pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod counters;
pub mod error;
pub mod event;
pub mod handler;
pub mod kafka;
pub mod metrics_consts;
pub mod producer;
pub mod registry;
pub mod runtime;
