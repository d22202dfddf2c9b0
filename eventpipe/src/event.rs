use bytes::Bytes;
use serde::Deserialize;

pub const HEALTH_PROBE_FIELD: &str = "health_probe_id";

/// One event as handed to the consumer engine by a transport.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub partition: i32,
    pub sequence: i64,
    /// Sequence of the newest event the broker holds for this partition, when known
    pub last_enqueued_sequence: Option<i64>,
    pub payload: Option<Bytes>,
}

impl ReceivedEvent {
    pub fn new(partition: i32, sequence: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            partition,
            sequence,
            last_enqueued_sequence: None,
            payload: Some(payload.into()),
        }
    }

    pub fn with_last_enqueued(mut self, last_enqueued_sequence: i64) -> Self {
        self.last_enqueued_sequence = Some(last_enqueued_sequence);
        self
    }

    /// Distance to the newest event in the partition, `None` when the broker
    /// position is unknown.
    pub fn lag(&self) -> Option<i64> {
        self.last_enqueued_sequence
            .map(|last| (last - self.sequence).max(0))
    }
}

#[derive(Deserialize)]
struct ProbeEnvelope {
    health_probe_id: Option<String>,
}

/// Returns the probe id if the payload is a JSON object carrying the
/// health probe field.
pub fn health_probe_id(payload: &[u8]) -> Option<String> {
    let marker = HEALTH_PROBE_FIELD.as_bytes();
    if !payload.windows(marker.len()).any(|window| window == marker) {
        return None;
    }

    serde_json::from_slice::<ProbeEnvelope>(payload)
        .ok()
        .and_then(|envelope| envelope.health_probe_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lag_is_unknown_without_broker_position() {
        let event = ReceivedEvent::new(0, 10, "{}");
        assert_eq!(event.lag(), None);
        assert_eq!(event.with_last_enqueued(14).lag(), Some(4));
    }

    #[test]
    fn lag_never_goes_negative() {
        let event = ReceivedEvent::new(0, 10, "{}").with_last_enqueued(7);
        assert_eq!(event.lag(), Some(0));
    }

    #[test]
    fn detects_health_probes() {
        assert_eq!(
            health_probe_id(br#"{"health_probe_id":"abc-1","other":3}"#),
            Some("abc-1".to_string())
        );
        assert_eq!(health_probe_id(br#"{"id":"abc-1"}"#), None);
        assert_eq!(health_probe_id(br#"["health_probe_id"]"#), None);
        assert_eq!(health_probe_id(br#"{"health_probe_id":null}"#), None);
        assert_eq!(health_probe_id(b"not json health_probe_id"), None);
    }
}
