//! Offset Store - the highest processed offset per partition
//!
//! The consumption loop writes here after every successful delivery and reads
//! a snapshot of it both to commit and to rewind read cursors when a commit
//! is rejected by the group coordinator. Entries are removed when the
//! coordinator revokes their partition, so a partition that moves away and
//! later comes back never rewinds to an offset recorded by a previous owner.

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::kafka::types::PartitionKey;

/// Thread-safe map of partition to the offset of the last record processed on it.
///
/// Writes for a key are last-writer-wins, but a write never moves an offset
/// backwards. A loop owns one of these by default; wrap it in an `Arc` to
/// share it between loops.
#[derive(Debug, Default)]
pub struct OffsetStore {
    offsets: DashMap<PartitionKey, i64>,
}

impl OffsetStore {
    pub fn new() -> Self {
        Self {
            offsets: DashMap::new(),
        }
    }

    /// Record that `offset` was processed on `partition`.
    ///
    /// Returns false and leaves the entry untouched when the offset is negative
    /// or lower than the one already stored.
    pub fn mark_processed(&self, partition: &PartitionKey, offset: i64) -> bool {
        if offset < 0 {
            warn!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset = offset,
                "Ignoring negative offset"
            );
            return false;
        }

        let mut advanced = true;
        self.offsets
            .entry(partition.clone())
            .and_modify(|current| {
                if offset < *current {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        stored = *current,
                        offset = offset,
                        "Refusing to move processed offset backwards"
                    );
                    advanced = false;
                } else {
                    *current = offset;
                }
            })
            .or_insert(offset);
        advanced
    }

    /// The last processed offset for a partition, or None if nothing was processed yet.
    pub fn get(&self, partition: &PartitionKey) -> Option<i64> {
        self.offsets.get(partition).map(|r| *r.value())
    }

    /// Whether a record at `offset` on `partition` has already been processed.
    pub fn is_processed(&self, partition: &PartitionKey, offset: i64) -> bool {
        self.get(partition).is_some_and(|stored| offset <= stored)
    }

    /// Point-in-time copy of every entry, ordered by partition.
    pub fn snapshot(&self) -> Vec<(PartitionKey, i64)> {
        let mut entries: Vec<(PartitionKey, i64)> = self
            .offsets
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort();
        entries
    }

    /// Forget a partition, returning the offset it held.
    pub fn clear_partition(&self, partition: &PartitionKey) -> Option<i64> {
        let removed = self.offsets.remove(partition).map(|(_, offset)| offset);
        if let Some(offset) = removed {
            debug!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset = offset,
                "Cleared offset for revoked partition"
            );
        }
        removed
    }
}
