use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics_consts::{
    CONSUMER_ERRORS, CONSUMER_EVENTS_RECEIVED, CONSUMER_LAG_TOTAL, CONSUMER_REBALANCING,
    PRODUCER_EVENTS_DROPPED, PRODUCER_EVENTS_SENT, PRODUCER_SEND_ERRORS,
};

/// Bucket for errors that cannot be attributed to a partition.
pub const NO_PARTITION: i32 = -1;

/// Strictly greater: a threshold of 3 tolerates 3 errors and trips on the 4th.
pub fn exceeds_threshold(count: u64, threshold: u64) -> bool {
    count > threshold
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionSnapshot {
    pub received: u64,
    pub lag: u64,
    pub errors: u64,
    pub rebalancing: u64,
}

/// Per-partition consumer counters. Each increment is mirrored to the
/// metrics recorder under the channel and partition labels.
#[derive(Debug)]
pub struct PartitionCounters {
    channel: String,
    partition: String,
    received: AtomicU64,
    lag: AtomicU64,
    errors: AtomicU64,
    rebalancing: AtomicU64,
}

impl PartitionCounters {
    pub fn new(channel: &str, partition: i32) -> Self {
        let partition = if partition == NO_PARTITION {
            "none".to_string()
        } else {
            partition.to_string()
        };

        Self {
            channel: channel.to_string(),
            partition,
            received: AtomicU64::new(0),
            lag: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            rebalancing: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self, lag: u64) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.lag.fetch_add(lag, Ordering::Relaxed);
        metrics::counter!(
            CONSUMER_EVENTS_RECEIVED,
            "channel" => self.channel.clone(),
            "partition" => self.partition.clone()
        )
        .increment(1);
        metrics::counter!(
            CONSUMER_LAG_TOTAL,
            "channel" => self.channel.clone(),
            "partition" => self.partition.clone()
        )
        .increment(lag);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            CONSUMER_ERRORS,
            "channel" => self.channel.clone(),
            "partition" => self.partition.clone()
        )
        .increment(1);
    }

    pub fn record_rebalancing(&self) {
        self.rebalancing.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            CONSUMER_REBALANCING,
            "channel" => self.channel.clone(),
            "partition" => self.partition.clone()
        )
        .increment(1);
    }

    pub fn snapshot(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            received: self.received.load(Ordering::Relaxed),
            lag: self.lag.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rebalancing: self.rebalancing.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSnapshot {
    pub sent: u64,
    pub send_errors: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct ProducerCounters {
    channel: String,
    sent: AtomicU64,
    send_errors: AtomicU64,
    dropped: AtomicU64,
}

impl ProducerCounters {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(PRODUCER_EVENTS_SENT, "channel" => self.channel.clone()).increment(count);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(PRODUCER_SEND_ERRORS, "channel" => self.channel.clone()).increment(1);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(PRODUCER_EVENTS_DROPPED, "channel" => self.channel.clone()).increment(1);
    }

    pub fn snapshot(&self) -> ProducerSnapshot {
        ProducerSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide failure total shared by every component of one kind. Any
/// component whose view of it exceeds its own threshold asks for a restart.
#[derive(Debug, Default)]
pub struct FailureCounter {
    count: AtomicU64,
}

impl FailureCounter {
    pub fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_strictly_greater() {
        assert!(!exceeds_threshold(0, 0));
        assert!(exceeds_threshold(1, 0));
        assert!(!exceeds_threshold(3, 3));
        assert!(exceeds_threshold(4, 3));
    }

    #[test]
    fn partition_counters_accumulate() {
        let counters = PartitionCounters::new("orders", 2);
        counters.record_received(4);
        counters.record_received(0);
        counters.record_error();
        counters.record_rebalancing();
        counters.record_rebalancing();

        assert_eq!(
            counters.snapshot(),
            PartitionSnapshot {
                received: 2,
                lag: 4,
                errors: 1,
                rebalancing: 2,
            }
        );
    }

    #[test]
    fn failure_counter_is_shared_total() {
        let failures = FailureCounter::default();
        assert_eq!(failures.increment(), 1);
        assert_eq!(failures.increment(), 2);
        assert_eq!(failures.count(), 2);
    }
}
