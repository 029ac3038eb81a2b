//! Kafka binding of the record stream.
//!
//! Offsets are never stored automatically: the stream records what it
//! handed out, and only offsets the sink accepted are stored (auto-commit
//! mode) or committed (manual mode). A failed cycle seeks back so the
//! same records are fetched again.

use crate::config::KafkaConfig;
use crate::kafka::{Broker, OffsetTracker, RecordStream};
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// A record fetched from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Message key (optional)
    pub key: Option<Vec<u8>>,

    /// Message payload, empty for tombstones
    pub payload: Vec<u8>,

    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Wall clock at fetch time (milliseconds since epoch)
    pub received_at_millis: i64,
}

impl RawRecord {
    /// Build a record received now. Partition and offset default to zero.
    pub fn new(topic: impl Into<String>, key: Option<Vec<u8>>, payload: Vec<u8>) -> Self {
        Self {
            key,
            payload,
            topic: topic.into(),
            partition: 0,
            offset: 0,
            received_at_millis: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Get the message key as a string, replacing invalid UTF-8.
    pub fn key_lossy(&self) -> Option<String> {
        self.key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }

    /// Convert a borrowed message to an owned record.
    fn from_message(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|v| v.to_vec()).unwrap_or_default(),
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            received_at_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Broker client backed by librdkafka.
pub struct KafkaBroker {
    config: KafkaConfig,
}

impl KafkaBroker {
    /// Create a broker client for the given configuration.
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    /// librdkafka configuration for the consumer.
    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        // Pass-through properties first so the settings below win
        for (key, value) in &self.config.properties {
            client_config.set(key, value);
        }

        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers.join(","))
            .set("group.id", &self.config.consumer_group)
            .set(
                "enable.auto.commit",
                if self.config.auto_commit {
                    "true"
                } else {
                    "false"
                },
            )
            // Only offsets accepted by the sink are ever stored
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", self.config.auto_offset_reset.as_str())
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            );

        if let Some(ref protocol) = self.config.security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = self.config.security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = self.config.security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = self.config.security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = self.config.security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
        }

        client_config
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn RecordStream>> {
        let brokers = self.config.bootstrap_servers.join(",");
        let connection_failed = |message: String| {
            Error::Kafka(KafkaError::ConnectionFailed {
                broker: brokers.clone(),
                message,
            })
        };

        let consumer: StreamConsumer = self
            .client_config()
            .create()
            .map_err(|e| connection_failed(e.to_string()))?;
        let consumer = Arc::new(consumer);

        // Creating the client does not touch the network; a metadata round
        // trip does. The topic itself does not have to exist yet.
        let probe = Arc::clone(&consumer);
        let probe_topic = topic.to_string();
        let timeout = self.config.connect_timeout();
        tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(Some(probe_topic.as_str()), timeout)
                .map(|_| ())
        })
        .await
        .map_err(|e| connection_failed(e.to_string()))?
        .map_err(|e| connection_failed(e.to_string()))?;

        consumer.subscribe(&[topic]).map_err(|e| {
            Error::Kafka(KafkaError::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            })
        })?;

        info!(
            topic = %topic,
            group = %self.config.consumer_group,
            servers = %brokers,
            auto_commit = self.config.auto_commit,
            "Kafka consumer subscribed"
        );

        Ok(Box::new(KafkaRecordStream {
            consumer,
            topic: topic.to_string(),
            auto_commit: self.config.auto_commit,
            offsets: OffsetTracker::new(),
        }))
    }
}

/// Record stream over a subscribed [`StreamConsumer`].
pub struct KafkaRecordStream {
    consumer: Arc<StreamConsumer>,
    topic: String,
    auto_commit: bool,
    offsets: OffsetTracker,
}

impl KafkaRecordStream {
    /// Build a partition list of next-to-read offsets.
    fn partition_list(offsets: &[(String, i32, i64)]) -> Result<TopicPartitionList> {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, offset) in offsets {
            // Kafka convention: the committed offset is the next offset to read
            tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
                .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;
        }
        Ok(tpl)
    }

}

#[async_trait]
impl RecordStream for KafkaRecordStream {
    async fn next_with_timeout(&mut self, timeout: Duration) -> Result<Option<RawRecord>> {
        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(Error::Kafka(KafkaError::Fetch(e.to_string()))),
            Ok(Ok(msg)) => RawRecord::from_message(&msg),
        };

        self.offsets
            .record_fetched(&received.topic, received.partition, received.offset);
        Ok(Some(received))
    }

    fn mark_delivered(&mut self) -> Result<()> {
        let delivered = self.offsets.mark_delivered();
        if self.auto_commit && !delivered.is_empty() {
            let tpl = Self::partition_list(&delivered)?;
            self.consumer
                .store_offsets(&tpl)
                .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;
        }
        Ok(())
    }

    async fn commit_offsets(&mut self) -> Result<()> {
        let offsets = self.offsets.uncommitted();
        if offsets.is_empty() {
            return Ok(());
        }

        let tpl = Self::partition_list(&offsets)?;
        // A synchronous commit waits on the group coordinator
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?
            .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;
        self.offsets.mark_committed(&offsets);

        debug!(offsets = ?offsets, "Offsets committed");
        Ok(())
    }

    async fn rewind(&mut self) -> Result<()> {
        let points = self.offsets.take_rewind_points();
        if points.is_empty() {
            return Ok(());
        }

        // Each seek may block for up to SEEK_TIMEOUT
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            for (topic, partition, offset) in points {
                consumer
                    .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
                    .map_err(|e| Error::Kafka(KafkaError::Seek(e.to_string())))?;
                debug!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    "Rewound to first undelivered offset"
                );
            }
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Kafka(KafkaError::Seek(e.to_string())))?
    }

    async fn shutdown(&mut self) -> Result<()> {
        // Undelivered records are dropped; the group resumes from the
        // last commit and fetches them again.
        self.offsets.take_rewind_points();

        let result = self.commit_offsets().await;
        if let Err(ref e) = result {
            warn!(error = %e, "Final offset commit failed");
        }

        self.consumer.unsubscribe();
        info!(topic = %self.topic, "Kafka consumer closed");
        result
    }
}
