//! Error types for the ingestion source.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Each per-cycle failure maps onto an [`ErrorKind`] so that the poll loop can
//! log and count decode, delivery, fetch and commit failures separately.

use thiserror::Error;

/// Result type alias for source operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Payload decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Delivery sink error
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The source has not been started or was stopped
    #[error("Source is not running")]
    NotRunning,
}

impl Error {
    /// Classify the error for logging and per-kind counters.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Decode(_) => ErrorKind::Decode,
            Error::Delivery(_) => ErrorKind::Delivery,
            Error::Kafka(KafkaError::OffsetCommit(_)) => ErrorKind::Commit,
            Error::Kafka(_) => ErrorKind::Fetch,
            _ => ErrorKind::Other,
        }
    }
}

/// Coarse classification of per-cycle failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed payload on a recognized topic
    Decode,
    /// Sink rejected the batch
    Delivery,
    /// Broker fetch or seek failure
    Fetch,
    /// Offset commit failure
    Commit,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Label value used in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::Decode => "decode",
            ErrorKind::Delivery => "delivery",
            ErrorKind::Fetch => "fetch",
            ErrorKind::Commit => "commit",
            ErrorKind::Other => "other",
        }
    }
}

/// Kafka-specific errors.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Subscription to the topic failed
    #[error("Subscribe to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },

    /// Error while receiving a message
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Offset commit failed
    #[error("Offset commit failed: {0}")]
    OffsetCommit(String),

    /// Seeking back to undelivered offsets failed
    #[error("Seek failed: {0}")]
    Seek(String),
}

/// Payload decode errors for recognized topics.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload is not valid UTF-8
    #[error("Payload on {topic} is not valid UTF-8")]
    InvalidUtf8 { topic: String },

    /// Payload is not a JSON envelope with a `data` list
    #[error("Malformed payload on {topic}: {message}")]
    MalformedPayload { topic: String, message: String },
}

/// Delivery sink errors.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Sink refused the batch
    #[error("Batch rejected: {0}")]
    Rejected(String),

    /// Sink failed while writing
    #[error("Sink IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Geo lookup errors. Never escape the enrichment adapter.
#[derive(Error, Debug)]
pub enum GeoError {
    /// Address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No entry covers the address
    #[error("No location for {0}")]
    NotFound(String),

    /// Lookup backend unavailable
    #[error("Geo lookup unavailable: {0}")]
    Unavailable(String),

    /// Lookup exceeded its time budget
    #[error("Geo lookup timed out after {0}ms")]
    Timeout(u64),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
