//! Broker client: record stream abstraction and its Kafka binding.
//!
//! The poll loop only talks to [`Broker`] and [`RecordStream`]; the
//! rdkafka-backed implementation lives in `consumer`.

mod consumer;
mod offset;

pub use consumer::{KafkaBroker, KafkaRecordStream, RawRecord};
pub use offset::OffsetTracker;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Connects to the broker and opens a record stream for one topic.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to `topic` with a single reader.
    ///
    /// Fails with a connection error when the broker cannot be reached.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn RecordStream>>;
}

/// Iterator over the records of a subscribed topic.
///
/// Offsets move through three stages: fetched (returned by
/// `next_with_timeout`), delivered (`mark_delivered`), committed
/// (`commit_offsets`). `rewind` drops everything fetched but not yet
/// delivered so that the broker hands it out again.
#[async_trait]
pub trait RecordStream: Send {
    /// Wait up to `timeout` for the next record. `None` means no data.
    async fn next_with_timeout(&mut self, timeout: Duration) -> Result<Option<RawRecord>>;

    /// Every record fetched so far has been accepted by the sink.
    fn mark_delivered(&mut self) -> Result<()>;

    /// Durably commit delivered offsets.
    async fn commit_offsets(&mut self) -> Result<()>;

    /// Reposition to the first record fetched since the last delivery.
    async fn rewind(&mut self) -> Result<()>;

    /// Commit outstanding delivered offsets and close the stream.
    async fn shutdown(&mut self) -> Result<()>;
}
