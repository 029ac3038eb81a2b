//! Integration tests for ums-ingest-core.
//!
//! The pipeline tests drive a full source against an in-memory broker and
//! sink. The Kafka tests require Docker to be running and are marked with
//! #[ignore] to avoid running them in normal test runs.
//!
//! Run with: cargo test --test integration_tests -- --ignored

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ums_ingest_core::buffer::Batch;
use ums_ingest_core::engine::{BackoffPolicy, KafkaSource, PollRunner, Status};
use ums_ingest_core::kafka::{Broker, RawRecord, RecordStream};
use ums_ingest_core::sink::DeliverySink;
use ums_ingest_core::transform::{DeliveryRecord, GeoLocation, GeoResolver, UNKNOWN};
use ums_ingest_core::{Config, DeliveryError, Error, ErrorKind, GeoError, KafkaError, Result};

/// Broker-side view of one partition, shared by the broker and its stream.
#[derive(Default)]
struct PartitionLog {
    records: Vec<RawRecord>,
    position: usize,
    delivered: usize,
    committed: usize,
    commits: usize,
    rewinds: usize,
    shutdowns: usize,
    fail_fetch: bool,
    fail_commit: bool,
    fetch_delay: Option<Duration>,
}

#[derive(Clone, Default)]
struct MemoryBroker {
    log: Arc<Mutex<PartitionLog>>,
    unreachable: bool,
}

impl MemoryBroker {
    fn with_records(records: Vec<RawRecord>) -> Self {
        let broker = Self::default();
        broker.log.lock().records = records;
        broker
    }

    fn push(&self, record: RawRecord) {
        self.log.lock().records.push(record);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn RecordStream>> {
        if self.unreachable {
            return Err(Error::Kafka(KafkaError::ConnectionFailed {
                broker: "memory".into(),
                message: format!("cannot reach broker for {}", topic),
            }));
        }
        Ok(Box::new(MemoryStream {
            log: Arc::clone(&self.log),
        }))
    }
}

struct MemoryStream {
    log: Arc<Mutex<PartitionLog>>,
}

#[async_trait]
impl RecordStream for MemoryStream {
    async fn next_with_timeout(&mut self, _timeout: Duration) -> Result<Option<RawRecord>> {
        let delay = self.log.lock().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut log = self.log.lock();
        if log.fail_fetch {
            return Err(Error::Kafka(KafkaError::Fetch("broker went away".into())));
        }
        let next = log.records.get(log.position).cloned();
        if next.is_some() {
            log.position += 1;
        }
        Ok(next)
    }

    fn mark_delivered(&mut self) -> Result<()> {
        let mut log = self.log.lock();
        log.delivered = log.position;
        Ok(())
    }

    async fn commit_offsets(&mut self) -> Result<()> {
        let mut log = self.log.lock();
        if log.fail_commit {
            return Err(Error::Kafka(KafkaError::OffsetCommit("not coordinator".into())));
        }
        log.commits += 1;
        log.committed = log.delivered;
        Ok(())
    }

    async fn rewind(&mut self) -> Result<()> {
        let mut log = self.log.lock();
        log.rewinds += 1;
        log.position = log.delivered;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let mut log = self.log.lock();
        log.shutdowns += 1;
        log.committed = log.delivered;
        Ok(())
    }
}

/// Sink that keeps every accepted batch and can be told to fail.
#[derive(Clone, Default)]
struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<DeliveryRecord>>>>,
    attempts: Arc<Mutex<usize>>,
    fail: Arc<AtomicBool>,
    /// Reject every call once this many batches were accepted
    accept_limit: Arc<Mutex<Option<usize>>>,
}

impl RecordingSink {
    fn batches(&self) -> Vec<Vec<DeliveryRecord>> {
        self.batches.lock().clone()
    }

    fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, batch: &Batch) -> std::result::Result<(), DeliveryError> {
        *self.attempts.lock() += 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("channel full".into()));
        }
        let mut batches = self.batches.lock();
        if matches!(*self.accept_limit.lock(), Some(limit) if batches.len() >= limit) {
            return Err(DeliveryError::Rejected("channel full".into()));
        }
        batches.push(batch.records().to_vec());
        Ok(())
    }
}

struct FixedResolver;

#[async_trait]
impl GeoResolver for FixedResolver {
    async fn resolve(&self, address: &str) -> std::result::Result<GeoLocation, GeoError> {
        match address {
            "10.0.0.1" => Ok(GeoLocation::new("CN", "Zhejiang", "Hangzhou")),
            _ => Err(GeoError::InvalidAddress(address.to_string())),
        }
    }
}

fn config(max_batch_size: usize, max_batch_duration_ms: u64) -> Config {
    let mut config: Config = toml::from_str(
        r#"
        [kafka]
        bootstrap_servers = ["localhost:9092"]
        topic = "topic_eventlog"
        consumer_group = "ums-storage"
        "#,
    )
    .unwrap();
    config.batch.max_batch_size = max_batch_size;
    config.batch.max_batch_duration_ms = max_batch_duration_ms;
    config
}

fn record(topic: &str, key: Option<&str>, payload: &str) -> RawRecord {
    RawRecord::new(
        topic,
        key.map(|k| k.as_bytes().to_vec()),
        payload.as_bytes().to_vec(),
    )
}

async fn started_source(config: Config, broker: &MemoryBroker, sink: &RecordingSink) -> KafkaSource {
    let source = KafkaSource::builder(config)
        .broker(Arc::new(broker.clone()))
        .sink(Arc::new(sink.clone()))
        .geo_resolver(Arc::new(FixedResolver))
        .build()
        .expect("Failed to build source");
    source.start().await.expect("Failed to start source");
    source
}

mod pipeline {
    use super::*;

    /// Two entries of one event log record fill a batch of two.
    #[tokio::test]
    async fn test_event_log_batch_is_delivered_and_committed() {
        let broker = MemoryBroker::with_records(vec![record(
            "topic_eventlog",
            None,
            r#"{"data":[{"event":"open"},{"event":"close"}]}"#,
        )]);
        let sink = RecordingSink::default();
        let source = started_source(config(2, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Ready);

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        for delivered in &batches[0] {
            assert_eq!(delivered.header("topic"), Some("topic_eventlog"));
            assert!(delivered.header("timestamp").is_some());
            assert_eq!(delivered.header("key"), None);
        }

        assert_eq!(broker.log.lock().commits, 1);
        assert_eq!(broker.log.lock().committed, 1);

        let counter = source.counter();
        assert_eq!(counter.records_polled(), 1);
        assert_eq!(counter.events_received(), 2);
        assert_eq!(counter.events_accepted(), 2);
        assert_eq!(counter.commits(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_cycle_delivers_then_backs_off() {
        let broker = MemoryBroker::with_records(vec![
            record("topic_errorlog", Some("10.0.0.1"), r#"{"data":[{"code":1}]}"#),
            record("topic_usinglog", None, r#"{"data":[{"page":"a"},{"page":"b"}]}"#),
        ]);
        let sink = RecordingSink::default();
        let source = started_source(config(1000, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Backoff);

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0][0].header("key"), Some("10.0.0.1"));
        assert_eq!(batches[0][1].header("topic"), Some("topic_usinglog"));
        assert_eq!(broker.log.lock().commits, 1);
        assert_eq!(source.counter().empty_polls(), 1);
    }

    #[tokio::test]
    async fn test_client_data_geo_failure_uses_unknown() {
        let broker = MemoryBroker::with_records(vec![record(
            "topic_clientdata",
            Some("not-an-address"),
            r#"{"data":[{"device":"phone"}]}"#,
        )]);
        let sink = RecordingSink::default();
        let source = started_source(config(1, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Ready);

        let batches = sink.batches();
        let body: serde_json::Value =
            serde_json::from_slice(&batches[0][0].body).expect("body is JSON");
        assert_eq!(body["device"], "phone");
        assert_eq!(body["address"], "not-an-address");
        assert_eq!(body["country"], UNKNOWN);
        assert_eq!(body["region"], UNKNOWN);
        assert_eq!(body["city"], UNKNOWN);
        assert_eq!(source.geo_failures(), 1);
        assert_eq!(broker.log.lock().commits, 1);
    }

    #[tokio::test]
    async fn test_client_data_geo_enrichment() {
        let broker = MemoryBroker::with_records(vec![record(
            "topic_clientdata",
            Some("10.0.0.1"),
            r#"{"data":[{"device":"phone"},{"device":"pad"}]}"#,
        )]);
        let sink = RecordingSink::default();
        let source = started_source(config(2, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Ready);

        for delivered in &sink.batches()[0] {
            let body: serde_json::Value = serde_json::from_slice(&delivered.body).unwrap();
            assert_eq!(body["country"], "CN");
            assert_eq!(body["region"], "Zhejiang");
            assert_eq!(body["city"], "Hangzhou");
        }
        assert_eq!(source.geo_failures(), 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_backs_off_without_commit() {
        let broker = MemoryBroker::with_records(vec![record(
            "topic_eventlog",
            None,
            r#"{"data":[{"event":"open"}]}"#,
        )]);
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::SeqCst);
        let source = started_source(config(1, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(sink.attempts(), 1);
        {
            let log = broker.log.lock();
            assert_eq!(log.commits, 0);
            assert_eq!(log.rewinds, 1);
            assert_eq!(log.position, 0);
        }
        assert_eq!(source.counter().events_accepted(), 0);
        assert_eq!(source.counter().errors(ErrorKind::Delivery), 1);

        // The broker hands the same record out again once the sink recovers
        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(source.process().await.unwrap(), Status::Ready);
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(broker.log.lock().commits, 1);
        assert_eq!(source.counter().records_polled(), 2);
    }

    #[tokio::test]
    async fn test_no_data_backs_off() {
        let broker = MemoryBroker::default();
        let sink = RecordingSink::default();
        let source = started_source(config(1000, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(source.counter().empty_polls(), 1);
        assert_eq!(source.counter().events_accepted(), 0);
        assert_eq!(sink.attempts(), 0);
        assert_eq!(broker.log.lock().commits, 0);

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(source.counter().empty_polls(), 2);
    }

    #[tokio::test]
    async fn test_size_bound_never_exceeded() {
        let records = (0..7)
            .map(|i| {
                record(
                    "topic_eventlog",
                    None,
                    &format!(r#"{{"data":[{{"seq":{}}}]}}"#, i),
                )
            })
            .collect();
        let broker = MemoryBroker::with_records(records);
        let sink = RecordingSink::default();
        let source = started_source(config(3, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Ready);
        assert_eq!(source.process().await.unwrap(), Status::Ready);
        assert_eq!(source.process().await.unwrap(), Status::Backoff);

        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(broker.log.lock().commits, 3);
        assert_eq!(broker.log.lock().committed, 7);
    }

    #[tokio::test]
    async fn test_expansion_past_bound_is_split_and_committed_once() {
        let broker = MemoryBroker::with_records(vec![record(
            "topic_eventlog",
            None,
            r#"{"data":[{"n":1},{"n":2},{"n":3},{"n":4},{"n":5}]}"#,
        )]);
        let sink = RecordingSink::default();
        let source = started_source(config(3, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Ready);

        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 2]);
        assert_eq!(broker.log.lock().commits, 1);
        assert_eq!(source.counter().events_accepted(), 5);
    }

    #[tokio::test]
    async fn test_split_delivery_failure_rewinds_whole_record() {
        let broker = MemoryBroker::with_records(vec![record(
            "topic_eventlog",
            None,
            r#"{"data":[{"n":1},{"n":2},{"n":3},{"n":4},{"n":5}]}"#,
        )]);
        let sink = RecordingSink::default();
        *sink.accept_limit.lock() = Some(1);
        let source = started_source(config(3, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.batches().len(), 1);
        {
            let log = broker.log.lock();
            assert_eq!(log.commits, 0);
            assert_eq!(log.rewinds, 1);
            assert_eq!(log.position, 0);
        }
        // The first piece did reach the sink
        assert_eq!(source.counter().events_accepted(), 3);
        assert_eq!(source.counter().errors(ErrorKind::Delivery), 1);

        // Redelivered in full once the sink recovers
        *sink.accept_limit.lock() = None;
        assert_eq!(source.process().await.unwrap(), Status::Ready);
        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 2]);
        assert_eq!(broker.log.lock().commits, 1);
        assert_eq!(broker.log.lock().committed, 1);
        assert_eq!(source.counter().events_accepted(), 8);
    }

    #[tokio::test]
    async fn test_time_bound_ends_cycle() {
        let records = (0..1000)
            .map(|_| record("topic_eventlog", None, r#"{"data":[{"event":"tick"}]}"#))
            .collect();
        let broker = MemoryBroker::with_records(records);
        broker.log.lock().fetch_delay = Some(Duration::from_millis(5));
        let sink = RecordingSink::default();
        let source = started_source(config(1000, 50), &broker, &sink).await;

        let started = std::time::Instant::now();
        assert_eq!(source.process().await.unwrap(), Status::Ready);
        assert!(started.elapsed() < Duration::from_secs(2));

        let delivered = sink.batches()[0].len();
        assert!(delivered > 0);
        assert!(delivered < 1000);
        assert_eq!(broker.log.lock().commits, 1);
    }

    #[tokio::test]
    async fn test_auto_commit_never_commits() {
        let broker = MemoryBroker::with_records(vec![record(
            "topic_eventlog",
            None,
            r#"{"data":[{"event":"open"}]}"#,
        )]);
        let sink = RecordingSink::default();
        let mut config = config(1, 1000);
        config.kafka.auto_commit = true;
        let source = started_source(config, &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Ready);
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(broker.log.lock().commits, 0);
        // Delivered offsets are still handed to the consumer for auto-commit
        assert_eq!(broker.log.lock().delivered, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_retried() {
        let broker = MemoryBroker::with_records(vec![
            record("topic_eventlog", None, r#"{"data":[{"event":"open"}]}"#),
            record("topic_eventlog", None, "not json"),
        ]);
        let sink = RecordingSink::default();
        let source = started_source(config(1000, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(source.counter().errors(ErrorKind::Decode), 1);
        // The valid record fetched in the same cycle is not delivered either
        assert_eq!(sink.attempts(), 0);
        assert_eq!(broker.log.lock().position, 0);

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(source.counter().errors(ErrorKind::Decode), 2);
        assert_eq!(broker.log.lock().commits, 0);
    }

    #[tokio::test]
    async fn test_unrecognized_topic_is_skipped() {
        let broker = MemoryBroker::with_records(vec![record("topic_other", None, "anything")]);
        let sink = RecordingSink::default();
        let source = started_source(config(1000, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(sink.attempts(), 0);
        assert_eq!(source.counter().records_polled(), 1);
        assert_eq!(source.counter().events_received(), 0);
        assert_eq!(source.counter().errors_total(), 0);
        assert_eq!(broker.log.lock().delivered, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_backs_off() {
        let broker = MemoryBroker::default();
        broker.log.lock().fail_fetch = true;
        let sink = RecordingSink::default();
        let source = started_source(config(1000, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(source.counter().errors(ErrorKind::Fetch), 1);
        assert_eq!(source.counter().empty_polls(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_delivered_offsets() {
        let broker = MemoryBroker::with_records(vec![record(
            "topic_eventlog",
            None,
            r#"{"data":[{"event":"open"}]}"#,
        )]);
        broker.log.lock().fail_commit = true;
        let sink = RecordingSink::default();
        let source = started_source(config(1, 1000), &broker, &sink).await;

        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(source.counter().errors(ErrorKind::Commit), 1);
        assert_eq!(source.counter().events_accepted(), 1);

        // Delivered records are not fetched again, and stop commits them
        broker.log.lock().fail_commit = false;
        assert_eq!(source.process().await.unwrap(), Status::Backoff);
        assert_eq!(sink.batches().len(), 1);

        source.stop().await.unwrap();
        assert_eq!(broker.log.lock().committed, 1);
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_unreachable() {
        let broker = MemoryBroker {
            unreachable: true,
            ..Default::default()
        };
        let sink = RecordingSink::default();
        let source = KafkaSource::builder(config(1000, 1000))
            .broker(Arc::new(broker))
            .sink(Arc::new(sink))
            .build()
            .unwrap();

        let err = source.start().await.unwrap_err();
        assert!(matches!(err, Error::Kafka(KafkaError::ConnectionFailed { .. })));
        assert!(!source.is_running());
        assert!(matches!(source.process().await, Err(Error::NotRunning)));
    }

    #[tokio::test]
    async fn test_stop_shuts_stream_down() {
        let broker = MemoryBroker::default();
        let sink = RecordingSink::default();
        let source = started_source(config(1000, 1000), &broker, &sink).await;

        source.stop().await.unwrap();
        assert_eq!(broker.log.lock().shutdowns, 1);
        assert!(matches!(source.process().await, Err(Error::NotRunning)));

        // Stopping twice is harmless
        source.stop().await.unwrap();
        assert_eq!(broker.log.lock().shutdowns, 1);
        assert!(source.counter().snapshot().stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_during_cycle_discards_buffer() {
        let broker = MemoryBroker::with_records(vec![
            record("topic_eventlog", None, r#"{"data":[{"n":1},{"n":2}]}"#),
            record("topic_eventlog", None, r#"{"data":[{"n":3}]}"#),
            record("topic_eventlog", None, r#"{"data":[{"n":4}]}"#),
        ]);
        let sink = RecordingSink::default();
        let source = Arc::new(started_source(config(2, 5000), &broker, &sink).await);

        // First record fills the batch and is committed
        assert_eq!(source.process().await.unwrap(), Status::Ready);
        assert_eq!(broker.log.lock().committed, 1);

        broker.log.lock().fetch_delay = Some(Duration::from_millis(100));
        let cycle = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.process().await })
        };
        // Let the cycle take the lock and block in its first fetch
        tokio::time::sleep(Duration::from_millis(30)).await;
        source.stop().await.unwrap();

        assert_eq!(cycle.await.unwrap().unwrap(), Status::Backoff);
        assert_eq!(sink.attempts(), 1);
        {
            let log = broker.log.lock();
            assert_eq!(log.rewinds, 1);
            assert_eq!(log.position, 1);
            assert_eq!(log.committed, 1);
            assert_eq!(log.shutdowns, 1);
        }
        assert_eq!(source.counter().events_accepted(), 2);
        assert!(!source.is_running());
        assert!(matches!(source.process().await, Err(Error::NotRunning)));
    }

    #[tokio::test]
    async fn test_missing_topic_prevents_build() {
        let mut config = config(1000, 1000);
        config.kafka.topic = "  ".into();

        let result = KafkaSource::builder(config)
            .broker(Arc::new(MemoryBroker::default()))
            .sink(Arc::new(RecordingSink::default()))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

mod runner_integration {
    use super::*;

    #[tokio::test]
    async fn test_runner_drains_topic_until_shutdown() {
        let broker = MemoryBroker::default();
        let sink = RecordingSink::default();
        let source = Arc::new(started_source(config(2, 1000), &broker, &sink).await);

        let runner = Arc::new(PollRunner::new(
            Arc::clone(&source),
            BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        ));
        let shutdown = runner.shutdown_signal();
        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run().await })
        };

        for i in 0..5 {
            broker.push(record(
                "topic_eventlog",
                None,
                &format!(r#"{{"data":[{{"seq":{}}}]}}"#, i),
            ));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while source.counter().events_accepted() < 5 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.counter().events_accepted(), 5);

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();

        source.stop().await.unwrap();
        assert_eq!(broker.log.lock().committed, 5);
        assert!(source.counter().empty_polls() > 0);
    }

    #[tokio::test]
    async fn test_runner_exits_when_source_stopped() {
        let broker = MemoryBroker::default();
        let sink = RecordingSink::default();
        let source = Arc::new(started_source(config(1000, 1000), &broker, &sink).await);
        let runner = PollRunner::new(
            Arc::clone(&source),
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
        );

        source.stop().await.unwrap();
        assert!(matches!(runner.run().await, Err(Error::NotRunning)));
    }
}

mod sink_integration {
    use super::*;
    use ums_ingest_core::config::SinkFormat;
    use ums_ingest_core::sink::FileSink;

    #[tokio::test]
    async fn test_file_sink_receives_pipeline_output() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("out").join("events.log");

        let broker = MemoryBroker::with_records(vec![record(
            "topic_eventlog",
            Some("10.0.0.1"),
            r#"{"data":[{"event":"open"},{"event":"close"}]}"#,
        )]);
        let source = KafkaSource::builder(config(2, 1000))
            .broker(Arc::new(broker.clone()))
            .sink(Arc::new(FileSink::new(&path, SinkFormat::Json)))
            .build()
            .unwrap();
        source.start().await.unwrap();

        assert_eq!(source.process().await.unwrap(), Status::Ready);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["headers"]["topic"], "topic_eventlog");
        assert_eq!(first["headers"]["key"], "10.0.0.1");
        assert_eq!(broker.log.lock().commits, 1);
    }
}

mod kafka_integration {
    use super::*;
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::client::DefaultClientContext;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::kafka::Kafka;
    use ums_ingest_core::kafka::KafkaBroker;

    /// Start fails with a connection error when nothing listens.
    #[tokio::test]
    async fn test_kafka_connection_refused() {
        let mut config = config(1000, 1000);
        config.kafka.bootstrap_servers = vec!["127.0.0.1:1".into()];
        config.kafka.connect_timeout_ms = 500;

        let source = KafkaSource::builder(config.clone())
            .broker(Arc::new(KafkaBroker::new(config.kafka)))
            .sink(Arc::new(RecordingSink::default()))
            .build()
            .unwrap();

        let err = source.start().await.unwrap_err();
        assert!(matches!(err, Error::Kafka(KafkaError::ConnectionFailed { .. })));
    }

    /// Produce client logs and consume them through the source.
    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_produce_consume_commit() {
        let kafka = Kafka::default()
            .start()
            .await
            .expect("Failed to start Kafka container");
        let bootstrap_servers = format!(
            "127.0.0.1:{}",
            kafka
                .get_host_port_ipv4(9093)
                .await
                .expect("Failed to get Kafka port")
        );

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .create()
            .expect("Failed to create admin client");
        let topic = NewTopic::new("topic_eventlog", 1, TopicReplication::Fixed(1));
        admin
            .create_topics(&[topic], &AdminOptions::new())
            .await
            .expect("Failed to create topic");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");
        for i in 0..10 {
            let key = format!("10.0.0.{}", i);
            let payload = format!(r#"{{"data":[{{"seq":{}}},{{"seq":{}}}]}}"#, i, i);
            producer
                .send(
                    FutureRecord::to("topic_eventlog").key(&key).payload(&payload),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to produce message");
        }

        let mut config = config(1000, 2000);
        config.kafka.bootstrap_servers = vec![bootstrap_servers];
        config.kafka.consumer_timeout_ms = 1000;
        let sink = RecordingSink::default();
        let source = KafkaSource::builder(config.clone())
            .broker(Arc::new(KafkaBroker::new(config.kafka)))
            .sink(Arc::new(sink.clone()))
            .build()
            .unwrap();
        source.start().await.expect("Failed to start source");

        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while source.counter().events_accepted() < 20 && std::time::Instant::now() < deadline {
            source.process().await.unwrap();
        }
        assert_eq!(source.counter().events_accepted(), 20);
        assert!(source.counter().commits() >= 1);

        source.stop().await.unwrap();
    }
}
