use tokio::sync::mpsc;
use tracing::warn;

use crate::kafka::types::PartitionKey;

/// A partition ownership change reported by the group coordinator.
///
/// The connection forwards these to the consumption loop, which applies them
/// to its state machine between polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// Partitions taken away from this member
    Revoke(Vec<PartitionKey>),
    /// Partitions handed to this member
    Assign(Vec<PartitionKey>),
}

impl RebalanceEvent {
    pub fn partitions(&self) -> &[PartitionKey] {
        match self {
            RebalanceEvent::Revoke(partitions) | RebalanceEvent::Assign(partitions) => partitions,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            RebalanceEvent::Revoke(_) => "revoke",
            RebalanceEvent::Assign(_) => "assign",
        }
    }
}

/// Sender for rebalance events - held by the connection
pub type RebalanceEventSender = mpsc::UnboundedSender<RebalanceEvent>;
/// Receiver for rebalance events - held by the consumption loop
pub type RebalanceEventReceiver = mpsc::UnboundedReceiver<RebalanceEvent>;

pub fn rebalance_channel() -> (RebalanceEventSender, RebalanceEventReceiver) {
    mpsc::unbounded_channel()
}

/// Observer for partition ownership changes.
///
/// Called by the consumption loop after it has applied the event to its own
/// offset table, so implementations only observe. Both methods must be fast;
/// they run on the loop's task.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_revoked(&self, _partitions: &[PartitionKey]) {}

    fn on_partitions_assigned(&self, _partitions: &[PartitionKey]) {}
}

/// Logs every ownership change at warning level, so rebalances stand out in
/// the logs next to the duplicate deliveries they can cause.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRebalanceListener;

impl RebalanceListener for LoggingRebalanceListener {
    fn on_partitions_revoked(&self, partitions: &[PartitionKey]) {
        warn!(
            count = partitions.len(),
            "Partitions revoked from this member during rebalancing"
        );
        for partition in partitions {
            warn!(
                topic = partition.topic(),
                partition = partition.partition(),
                "Revoked from this member"
            );
        }
    }

    fn on_partitions_assigned(&self, partitions: &[PartitionKey]) {
        warn!(
            count = partitions.len(),
            "Partitions assigned to this member during rebalancing"
        );
        for partition in partitions {
            warn!(
                topic = partition.topic(),
                partition = partition.partition(),
                "Rebalanced to this member"
            );
        }
    }
}
