use crate::error::{TransportError, TransportErrorKind};

/// Decides whether a transport error is a consequence of partition ownership
/// moving to another consumer. Those are counted separately and never push
/// the consumer toward a restart.
pub trait ErrorClassifier: Send + Sync {
    fn is_rebalancing(&self, partition: Option<i32>, error: &TransportError) -> bool;
}

impl<F> ErrorClassifier for F
where
    F: Fn(Option<i32>, &TransportError) -> bool + Send + Sync,
{
    fn is_rebalancing(&self, partition: Option<i32>, error: &TransportError) -> bool {
        self(partition, error)
    }
}

/// Only an ownership loss tied to a concrete partition counts as rebalancing.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnershipLostClassifier;

impl ErrorClassifier for OwnershipLostClassifier {
    fn is_rebalancing(&self, partition: Option<i32>, error: &TransportError) -> bool {
        partition.is_some() && error.kind == TransportErrorKind::OwnershipLost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_loss_needs_a_partition() {
        let classifier = OwnershipLostClassifier;
        let lost = TransportError::ownership_lost("partition 3 revoked");
        let dropped = TransportError::new(TransportErrorKind::Connection, "broker down");

        assert!(classifier.is_rebalancing(Some(3), &lost));
        assert!(!classifier.is_rebalancing(None, &lost));
        assert!(!classifier.is_rebalancing(Some(3), &dropped));
    }

    #[test]
    fn closures_can_classify() {
        let everything = |_: Option<i32>, _: &TransportError| true;
        let error = TransportError::new(TransportErrorKind::Broker, "boom");
        assert!(everything.is_rebalancing(None, &error));
    }
}
