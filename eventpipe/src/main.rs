use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::{routing::get, Json, Router};
use envconfig::Envconfig;
use futures::future::ready;
use health::{HealthRegistry, ProbeTracker};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use time::OffsetDateTime;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use eventpipe::checkpoint::connect_checkpoint_store;
use eventpipe::config::Config;
use eventpipe::error::{ConsumerFault, HandlerError};
use eventpipe::kafka::KafkaTransport;
use eventpipe::producer::ProducerMode;
use eventpipe::registry::{ChannelRegistry, RuntimeServices};
use eventpipe::runtime::StreamRuntime;

async fn index() -> &'static str {
    "eventpipe"
}

fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    const BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

    let handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()?;
    Ok(handle)
}

/// Last health probe seen on every consumed partition.
fn observed_probes(probes: &ProbeTracker) -> Json<serde_json::Value> {
    let observed: Vec<_> = probes
        .observed()
        .into_iter()
        .map(|(channel, partition, probe)| {
            json!({
                "channel": channel,
                "partition": partition,
                "probe_id": probe.probe_id,
                "observed_at": probe.observed_at.unix_timestamp(),
            })
        })
        .collect();
    Json(json!(observed))
}

fn start_server(
    config: &Config,
    liveness: HealthRegistry,
    probes: Arc<ProbeTracker>,
    metrics: PrometheusHandle,
) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/_probes", get(move || ready(observed_probes(&probes))))
        .route("/metrics", get(move || ready(metrics.render())));

    let bind = format!("{}:{}", config.host, config.port);
    tokio::task::spawn(async move {
        match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => {
                info!("listening on {}", bind);
                if let Err(e) = axum::serve(listener, router).await {
                    error!("http server failed: {}", e);
                }
            }
            Err(e) => error!("failed to bind {}: {}", bind, e),
        }
    })
}

async fn shutdown_signal() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };
    Ok(())
}

async fn wait_for_restart(runtime: &StreamRuntime, poll_interval: Duration) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;
        if runtime.require_restart() {
            return;
        }
    }
}

/// Sends a probe through every producer channel so consumers of those
/// destinations can report end to end health.
async fn emit_health_probes(runtime: &StreamRuntime, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let probe_id = format!(
            "{}-{}",
            std::process::id(),
            OffsetDateTime::now_utc().unix_timestamp_nanos()
        );
        for channel in runtime.producer_channels() {
            let Some(producer) = runtime.producer(channel) else {
                continue;
            };
            if !producer.send(&json!({ "health_probe_id": probe_id.as_str() })) {
                warn!(channel, "failed to queue health probe");
            }
        }
    }
}

fn log_event(event: serde_json::Value) -> Result<(), HandlerError> {
    debug!(%event, "received event");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env()
        .context("failed to load configuration from environment variables")?;
    info!("configuration loaded: {:?}", config);

    if config.channels.is_empty() {
        bail!("no channels configured, set CHANNELS to name=destination[@consumer_group],...");
    }

    let liveness = HealthRegistry::new("liveness");
    let metrics = setup_metrics_recorder()?;
    let probes = Arc::new(ProbeTracker::new());
    let server = start_server(&config, liveness.clone(), probes.clone(), metrics);

    let checkpoints =
        connect_checkpoint_store(&config.checkpoint_store_url, &config.checkpoint_container)
            .await
            .context("failed to connect to checkpoint store")?;

    let mut registry = ChannelRegistry::new();
    for definition in config.channels.iter() {
        if definition.consumer_group.is_some() {
            registry.register_consumer(&definition.name, log_event)?;
        } else {
            registry.register_producer(&definition.name, ProducerMode::Batching)?;
        }
    }

    let services = RuntimeServices::new(checkpoints)
        .with_probe_listener(probes)
        .with_error_listener(Arc::new(
            |channel: &str, partition: Option<i32>, fault: &ConsumerFault| {
                debug!(channel, ?partition, kind = fault.label(), "consumer fault reported");
            },
        ))
        .with_liveness(liveness.clone());

    let transport = KafkaTransport::new(config.kafka.clone(), liveness);
    let runtime = registry
        .build_all(&config.channels, &config.settings(), &transport, services)
        .await
        .context("failed to start channels")?;

    let probe_period = Duration::from_secs(config.health_probe_interval_secs);
    let emit_probes = async {
        if probe_period.is_zero() {
            std::future::pending::<()>().await
        } else {
            emit_health_probes(&runtime, probe_period).await
        }
    };

    let poll_interval = Duration::from_secs(config.restart_poll_interval_secs.max(1));
    let outcome = tokio::select! {
        result = shutdown_signal() => result,
        _ = wait_for_restart(&runtime, poll_interval) => {
            error!(
                consumer_failures = runtime.consumer_failures(),
                producer_failures = runtime.producer_failures(),
                "failure threshold exceeded, restarting"
            );
            Err(anyhow::anyhow!("failure threshold exceeded"))
        }
        _ = emit_probes => Ok(()),
    };

    runtime.shutdown().await;
    server.abort();
    outcome
}
