use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tracing::{info, warn};

/// Liveness reporting for the long-running loops of the service.
///
/// Every partition pump, producer connection and batching worker registers
/// itself as a component and must report healthy more often than its
/// deadline. The process is live only while all registered components are.
/// A component that misses its deadline is reported as `Stalled`.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

type ComponentMap = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: ComponentMap,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    /// Safe to call from rdkafka callback threads.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // The probe will fail and the process restart
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: ComponentMap,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a new component in `Starting` state. The returned handle is
    /// moved into the component so it can report on its own schedule.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Unhealthy if nothing registered yet. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

/// Receives the health-probe events observed by consumers. This is the only
/// inbound signal the stream client emits to the wider monitoring system.
pub trait HealthProbeListener: Send + Sync {
    fn on_health_probe(&self, channel: &str, partition: i32, probe_id: &str);
}

impl<F> HealthProbeListener for F
where
    F: Fn(&str, i32, &str) + Send + Sync,
{
    fn on_health_probe(&self, channel: &str, partition: i32, probe_id: &str) {
        self(channel, partition, probe_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedProbe {
    pub probe_id: String,
    pub observed_at: OffsetDateTime,
}

/// Remembers the last probe seen on every (channel, partition), so a
/// round-trip checker can compare what it sent against what came back.
#[derive(Default)]
pub struct ProbeTracker {
    probes: RwLock<HashMap<(String, i32), ObservedProbe>>,
}

impl ProbeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_probe(&self, channel: &str, partition: i32) -> Option<ObservedProbe> {
        let probes = self.probes.read().ok()?;
        probes.get(&(channel.to_owned(), partition)).cloned()
    }

    pub fn observed_count(&self) -> usize {
        self.probes.read().map(|p| p.len()).unwrap_or_default()
    }

    /// Last probe of every (channel, partition), ordered by channel then partition.
    pub fn observed(&self) -> Vec<(String, i32, ObservedProbe)> {
        let Ok(probes) = self.probes.read() else {
            return Vec::new();
        };
        let mut observed: Vec<_> = probes
            .iter()
            .map(|((channel, partition), probe)| (channel.clone(), *partition, probe.clone()))
            .collect();
        observed.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        observed
    }
}

impl HealthProbeListener for ProbeTracker {
    fn on_health_probe(&self, channel: &str, partition: i32, probe_id: &str) {
        info!(channel, partition, probe_id, "health probe received");
        if let Ok(mut probes) = self.probes.write() {
            probes.insert(
                (channel.to_owned(), partition),
                ObservedProbe {
                    probe_id: probe_id.to_owned(),
                    observed_at: OffsetDateTime::now_utc(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn one_component() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("pump-orders-0", Duration::from_secs(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("pump-orders-0"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("pump-orders-0"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("batcher-audit", Duration::from_secs(30));

        handle.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
        ));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("batcher-audit"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn every_component_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("one", Duration::from_secs(30));
        let two = registry.register("two", Duration::from_secs(30));

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);

        one.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[test]
    fn probe_tracker_keeps_latest_probe_per_partition() {
        let tracker = ProbeTracker::new();
        tracker.on_health_probe("orders", 0, "probe-1");
        tracker.on_health_probe("orders", 0, "probe-2");
        tracker.on_health_probe("orders", 3, "probe-3");

        assert_eq!(tracker.observed_count(), 2);
        assert_eq!(
            tracker.last_probe("orders", 0).map(|p| p.probe_id),
            Some("probe-2".to_string())
        );
        assert!(tracker.last_probe("audit", 0).is_none());
    }

    #[test]
    fn lists_last_probe_per_partition() {
        let tracker = ProbeTracker::new();
        tracker.on_health_probe("orders", 3, "probe-1");
        tracker.on_health_probe("alerts", 0, "probe-2");
        tracker.on_health_probe("orders", 0, "probe-3");
        tracker.on_health_probe("orders", 3, "probe-4");

        let observed: Vec<_> = tracker
            .observed()
            .into_iter()
            .map(|(channel, partition, probe)| format!("{channel}/{partition}/{}", probe.probe_id))
            .collect();
        assert_eq!(
            observed,
            vec!["alerts/0/probe-2", "orders/0/probe-3", "orders/3/probe-4"]
        );
    }

    #[test]
    fn closures_are_listeners() {
        let seen = std::sync::Mutex::new(Vec::new());
        let listener = |channel: &str, partition: i32, probe_id: &str| {
            seen.lock()
                .unwrap()
                .push(format!("{channel}/{partition}/{probe_id}"));
        };
        listener.on_health_probe("alerts", 1, "p");
        assert_eq!(*seen.lock().unwrap(), vec!["alerts/1/p".to_string()]);
    }
}
