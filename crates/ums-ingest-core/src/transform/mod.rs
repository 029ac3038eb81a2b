//! Per-topic record transformation.
//!
//! Every recognized topic carries a JSON envelope `{"data": [...]}` whose
//! entries each become one [`DeliveryRecord`]. Client data entries are
//! additionally enriched with the location of the sending address, taken
//! from the record key.

mod geo;

pub use geo::{
    GeoEnricher, GeoLocation, GeoResolver, MaxMindResolver, UnavailableResolver, UNKNOWN,
};

use crate::kafka::RawRecord;
use crate::DecodeError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::trace;

/// Header holding the fetch wall clock in milliseconds.
pub const TIMESTAMP_HEADER: &str = "timestamp";
/// Header holding the source topic.
pub const TOPIC_HEADER: &str = "topic";
/// Header holding the record key, when present.
pub const KEY_HEADER: &str = "key";

/// Schema of a topic's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicSchema {
    /// `topic_eventlog`
    EventLog,
    /// `topic_errorlog`
    ErrorLog,
    /// `topic_clientdata`, enriched with geo data
    ClientData,
    /// `topic_usinglog`
    UsingLog,
    /// Any other topic. Records are skipped.
    Unrecognized,
}

impl TopicSchema {
    /// Schema for a topic name.
    pub fn from_topic(topic: &str) -> Self {
        match topic {
            "topic_eventlog" => TopicSchema::EventLog,
            "topic_errorlog" => TopicSchema::ErrorLog,
            "topic_clientdata" => TopicSchema::ClientData,
            "topic_usinglog" => TopicSchema::UsingLog,
            _ => TopicSchema::Unrecognized,
        }
    }

    /// Topic name of a recognized schema.
    pub fn topic_name(&self) -> Option<&'static str> {
        match self {
            TopicSchema::EventLog => Some("topic_eventlog"),
            TopicSchema::ErrorLog => Some("topic_errorlog"),
            TopicSchema::ClientData => Some("topic_clientdata"),
            TopicSchema::UsingLog => Some("topic_usinglog"),
            TopicSchema::Unrecognized => None,
        }
    }
}

/// A record ready for the delivery sink.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    /// Serialized entry
    pub body: Vec<u8>,
    /// timestamp, topic and (if present) key
    pub headers: BTreeMap<String, String>,
}

impl DeliveryRecord {
    /// Create a record.
    pub fn new(body: Vec<u8>, headers: BTreeMap<String, String>) -> Self {
        Self { body, headers }
    }

    /// Get a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Body as UTF-8, if it is.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

#[derive(Deserialize)]
struct Envelope {
    data: Vec<Map<String, Value>>,
}

/// Maps raw records to delivery records.
pub struct RecordTransformer {
    geo: GeoEnricher,
}

impl RecordTransformer {
    /// Create a transformer using `geo` for client data.
    pub fn new(geo: GeoEnricher) -> Self {
        Self { geo }
    }

    /// The geo adapter.
    pub fn geo(&self) -> &GeoEnricher {
        &self.geo
    }

    /// Transform one raw record.
    ///
    /// Records of unrecognized topics produce nothing. A payload that is not
    /// a JSON envelope with a `data` list is an error.
    pub async fn transform(&self, record: &RawRecord) -> Result<Vec<DeliveryRecord>, DecodeError> {
        let schema = TopicSchema::from_topic(&record.topic);
        if schema == TopicSchema::Unrecognized {
            trace!(topic = %record.topic, "Skipping record of unrecognized topic");
            return Ok(Vec::new());
        }

        let entries = decode_entries(&record.topic, &record.payload)?;
        let headers = headers_for(record);

        if schema != TopicSchema::ClientData {
            return Ok(entries
                .into_iter()
                .map(|entry| DeliveryRecord::new(entry_body(entry), headers.clone()))
                .collect());
        }

        // A missing key resolves like any other unusable address
        let address = record.key_lossy().unwrap_or_default();
        let mut records = Vec::with_capacity(entries.len());
        for mut entry in entries {
            let location = self.geo.lookup(&address).await;
            entry.insert("address".into(), Value::String(address.clone()));
            entry.insert("country".into(), Value::String(location.country));
            entry.insert("region".into(), Value::String(location.region));
            entry.insert("city".into(), Value::String(location.city));
            records.push(DeliveryRecord::new(entry_body(entry), headers.clone()));
        }
        Ok(records)
    }
}

fn decode_entries(topic: &str, payload: &[u8]) -> Result<Vec<Map<String, Value>>, DecodeError> {
    let content = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8 {
        topic: topic.to_string(),
    })?;
    let envelope: Envelope =
        serde_json::from_str(content).map_err(|e| DecodeError::MalformedPayload {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
    Ok(envelope.data)
}

fn headers_for(record: &RawRecord) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(
        TIMESTAMP_HEADER.to_string(),
        record.received_at_millis.to_string(),
    );
    headers.insert(TOPIC_HEADER.to_string(), record.topic.clone());
    if let Some(key) = record.key_lossy() {
        headers.insert(KEY_HEADER.to_string(), key);
    }
    headers
}

fn entry_body(entry: Map<String, Value>) -> Vec<u8> {
    Value::Object(entry).to_string().into_bytes()
}
