//! Downstream delivery of batches.

mod file;

pub use file::FileSink;

use crate::buffer::Batch;
use crate::DeliveryError;
use async_trait::async_trait;

/// Accepts batches atomically: either every record is delivered or none is.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Deliver a non-empty batch.
    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError>;
}
