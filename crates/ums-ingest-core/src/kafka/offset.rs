//! Offset tracking for Kafka partitions.

use dashmap::DashMap;

/// Offsets of one partition, as seen by the poll loop.
#[derive(Debug, Default, Clone, Copy)]
struct PartitionOffsets {
    /// First offset fetched since the last delivery
    pending_first: Option<i64>,
    /// Last offset fetched since the last delivery
    pending_last: Option<i64>,
    /// Last offset accepted by the sink
    delivered: Option<i64>,
    /// Last offset durably committed
    committed: Option<i64>,
}

/// Tracks fetched, delivered and committed offsets per (topic, partition).
///
/// All offsets are message offsets; callers add one when talking to Kafka,
/// whose committed offset is the next offset to read.
pub struct OffsetTracker {
    partitions: DashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    /// Create a new offset tracker.
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
        }
    }

    /// Record that a message was handed to the poll loop.
    pub fn record_fetched(&self, topic: &str, partition: i32, offset: i64) {
        let mut entry = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        if entry.pending_first.is_none() {
            entry.pending_first = Some(offset);
        }
        entry.pending_last = Some(offset);
    }

    /// Promote every pending offset to delivered.
    ///
    /// Returns the newly delivered (topic, partition, offset) triples.
    pub fn mark_delivered(&self) -> Vec<(String, i32, i64)> {
        let mut delivered = Vec::new();
        for mut entry in self.partitions.iter_mut() {
            if let Some(last) = entry.pending_last.take() {
                entry.pending_first = None;
                entry.delivered = Some(last);
                delivered.push((entry.key().0.clone(), entry.key().1, last));
            }
        }
        delivered
    }

    /// Take the first pending offset of every partition and forget the
    /// pending window.
    pub fn take_rewind_points(&self) -> Vec<(String, i32, i64)> {
        let mut points = Vec::new();
        for mut entry in self.partitions.iter_mut() {
            entry.pending_last = None;
            if let Some(first) = entry.pending_first.take() {
                points.push((entry.key().0.clone(), entry.key().1, first));
            }
        }
        points
    }

    /// Delivered offsets that are ahead of the committed ones.
    pub fn uncommitted(&self) -> Vec<(String, i32, i64)> {
        self.partitions
            .iter()
            .filter_map(|entry| {
                let offsets = entry.value();
                match (offsets.delivered, offsets.committed) {
                    (Some(d), Some(c)) if d <= c => None,
                    (Some(d), _) => Some((entry.key().0.clone(), entry.key().1, d)),
                    (None, _) => None,
                }
            })
            .collect()
    }

    /// Mark offsets as committed.
    pub fn mark_committed(&self, offsets: &[(String, i32, i64)]) {
        for (topic, partition, offset) in offsets {
            let mut entry = self
                .partitions
                .entry((topic.clone(), *partition))
                .or_default();
            entry.committed = Some(entry.committed.map_or(*offset, |c| c.max(*offset)));
        }
    }
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl OffsetTracker {
    fn has_pending(&self) -> bool {
        self.partitions
            .iter()
            .any(|entry| entry.value().pending_last.is_some())
    }

    fn get_committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(|entry| entry.committed)
    }

    fn get_delivered(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(|entry| entry.delivered)
    }
}
