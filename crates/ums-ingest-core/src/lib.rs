//! UMS Ingest Core - bounded-batch Kafka consumer for UMS logs
//!
//! This library pulls records from one Kafka topic, transforms them per
//! topic schema and hands each batch to a delivery sink, with:
//!
//! - Size and time bounds per poll cycle
//! - Geo enrichment of client data that never fails the batch
//! - At-least-once delivery: offsets are committed only after the sink
//!   accepts the batch, and failed cycles are fetched again

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod sink;
pub mod transform;

// Re-export commonly used types
pub use config::Config;
pub use engine::{KafkaSource, PollRunner, Status};
pub use error::{DecodeError, DeliveryError, ErrorKind, GeoError, KafkaError};
pub use error::{Error, Result};
