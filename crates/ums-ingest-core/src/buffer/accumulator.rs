//! Size-bounded accumulation of delivery records.

use crate::transform::DeliveryRecord;
use std::collections::VecDeque;

/// Records handed to the sink in one call, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    records: Vec<DeliveryRecord>,
}

impl Batch {
    /// Wrap records into a batch.
    pub fn new(records: Vec<DeliveryRecord>) -> Self {
        Self { records }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in arrival order.
    pub fn records(&self) -> &[DeliveryRecord] {
        &self.records
    }

    /// Iterate over the records.
    pub fn iter(&self) -> std::slice::Iter<'_, DeliveryRecord> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a DeliveryRecord;
    type IntoIter = std::slice::Iter<'a, DeliveryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Buffers delivery records for one poll cycle.
///
/// The accumulator is owned by the poll loop and only touched under the
/// source's lifecycle lock, so `accept` and `drain` never interleave.
/// A single raw record may expand past the remaining room; the excess is
/// kept and `drain` hands it out in later batches, so no batch is ever
/// larger than `max_batch_size`.
#[derive(Debug)]
pub struct BatchAccumulator {
    records: VecDeque<DeliveryRecord>,
    max_batch_size: usize,
}

impl BatchAccumulator {
    /// Create an accumulator. `max_batch_size` must be non-zero.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(max_batch_size.min(4096)),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Append one record.
    pub fn accept(&mut self, record: DeliveryRecord) {
        self.records.push_back(record);
    }

    /// Append every record of an expansion.
    pub fn accept_all(&mut self, records: impl IntoIterator<Item = DeliveryRecord>) {
        self.records.extend(records);
    }

    /// Whether the size bound has been reached.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_batch_size
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Configured size bound.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Remove and return up to `max_batch_size` records, oldest first.
    pub fn drain(&mut self) -> Batch {
        let take = self.records.len().min(self.max_batch_size);
        Batch::new(self.records.drain(..take).collect())
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
