//! Kafka source: bounded poll cycles with commit-after-delivery.
//!
//! Each call to [`KafkaSource::process`] runs one cycle:
//! - fetch records until the batch is full, the cycle deadline passes or
//!   a fetch comes back empty
//! - transform every record and buffer the result
//! - hand the buffer to the sink, then commit offsets (manual mode)
//!
//! Failures inside a cycle never escape: they are logged with their kind,
//! counted, and turned into [`Status::Backoff`] after the stream is rewound
//! to the first undelivered record. A record that can never be decoded is
//! therefore fetched again on every cycle.

use crate::buffer::BatchAccumulator;
use crate::config::Config;
use crate::kafka::{Broker, RecordStream};
use crate::metrics::SourceCounter;
use crate::sink::DeliverySink;
use crate::transform::{GeoEnricher, GeoResolver, RecordTransformer, UnavailableResolver};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Records were delivered; call again immediately.
    Ready,
    /// No data or a recoverable failure; wait before calling again.
    Backoff,
}

/// Builder for [`KafkaSource`].
pub struct KafkaSourceBuilder {
    config: Config,
    broker: Option<Arc<dyn Broker>>,
    sink: Option<Arc<dyn DeliverySink>>,
    geo_resolver: Option<Arc<dyn GeoResolver>>,
    counter: Option<Arc<SourceCounter>>,
}

impl KafkaSourceBuilder {
    /// Create a builder for the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            broker: None,
            sink: None,
            geo_resolver: None,
            counter: None,
        }
    }

    /// Broker to subscribe through (required).
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Sink receiving delivered batches (required).
    pub fn sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Geo resolver for client data. Without one every lookup is unknown.
    pub fn geo_resolver(mut self, resolver: Arc<dyn GeoResolver>) -> Self {
        self.geo_resolver = Some(resolver);
        self
    }

    /// Share an existing counter instead of creating one.
    pub fn counter(mut self, counter: Arc<SourceCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Validate the configuration and build the source.
    pub fn build(self) -> Result<KafkaSource> {
        self.config.validate()?;

        let broker = self
            .broker
            .ok_or_else(|| Error::Config("Broker is required".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| Error::Config("Delivery sink is required".into()))?;
        let geo_resolver = self
            .geo_resolver
            .unwrap_or_else(|| Arc::new(UnavailableResolver));
        let counter = self
            .counter
            .unwrap_or_else(|| Arc::new(SourceCounter::new(self.config.kafka.topic.clone())));

        let geo = GeoEnricher::new(geo_resolver, self.config.geo.lookup_timeout());

        Ok(KafkaSource {
            topic: self.config.kafka.topic.clone(),
            auto_commit: self.config.kafka.auto_commit,
            fetch_timeout: self.config.kafka.consumer_timeout(),
            max_batch_duration: self.config.batch.max_batch_duration(),
            broker,
            sink,
            transformer: RecordTransformer::new(geo),
            counter,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            state: Mutex::new(SourceState {
                stream: None,
                accumulator: BatchAccumulator::new(self.config.batch.max_batch_size),
            }),
        })
    }
}

/// State touched by start, stop and poll cycles. Guarded by one lock so
/// they never interleave.
struct SourceState {
    stream: Option<Box<dyn RecordStream>>,
    accumulator: BatchAccumulator,
}

/// Bounded-batch consumer of one topic.
pub struct KafkaSource {
    topic: String,
    auto_commit: bool,
    fetch_timeout: Duration,
    max_batch_duration: Duration,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn DeliverySink>,
    transformer: RecordTransformer,
    counter: Arc<SourceCounter>,
    running: AtomicBool,
    /// Raised by `stop` before it waits for the lock
    stopping: AtomicBool,
    state: Mutex<SourceState>,
}

impl KafkaSource {
    /// Start building a source from `config`.
    pub fn builder(config: Config) -> KafkaSourceBuilder {
        KafkaSourceBuilder::new(config)
    }

    /// Connect to the broker and subscribe to the configured topic.
    ///
    /// A connection or subscription failure leaves the source stopped.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.stream.is_some() {
            warn!(topic = %self.topic, "Source already started");
            return Ok(());
        }

        let stream = self.broker.subscribe(&self.topic).await?;
        state.stream = Some(stream);
        state.accumulator.clear();

        self.stopping.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        self.counter.start();

        info!(
            topic = %self.topic,
            auto_commit = self.auto_commit,
            max_batch_size = state.accumulator.max_batch_size(),
            max_batch_duration_ms = self.max_batch_duration.as_millis() as u64,
            "Kafka source started"
        );
        Ok(())
    }

    /// Run one poll cycle.
    ///
    /// Returns [`Error::NotRunning`] when the source is not started or is
    /// stopping; every other failure becomes [`Status::Backoff`].
    pub async fn process(&self) -> Result<Status> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }

        let mut guard = self.state.lock().await;
        let SourceState {
            stream,
            accumulator,
        } = &mut *guard;
        let stream = stream.as_mut().ok_or(Error::NotRunning)?;

        self.counter.increment_cycles();

        match self.run_cycle(&mut **stream, accumulator).await {
            Ok(status) => Ok(status),
            Err(e) => {
                let kind = e.kind();
                self.counter.record_error(kind);
                error!(
                    topic = %self.topic,
                    kind = kind.as_label(),
                    error = %e,
                    "Poll cycle failed"
                );

                // Undelivered records are dropped here and fetched again
                accumulator.clear();
                if let Err(rewind_err) = stream.rewind().await {
                    self.counter.record_error(rewind_err.kind());
                    warn!(
                        topic = %self.topic,
                        error = %rewind_err,
                        "Rewind after failed cycle did not complete"
                    );
                }
                Ok(Status::Backoff)
            }
        }
    }

    async fn run_cycle(
        &self,
        stream: &mut dyn RecordStream,
        accumulator: &mut BatchAccumulator,
    ) -> Result<Status> {
        let started = Instant::now();
        let deadline = started + self.max_batch_duration;
        let mut fetched = 0usize;
        let mut exhausted = false;

        loop {
            if self.stopping.load(Ordering::Acquire) {
                debug!(topic = %self.topic, buffered = accumulator.len(), "Stop requested mid-cycle");
                accumulator.clear();
                stream.rewind().await?;
                return Ok(Status::Backoff);
            }

            let Some(record) = stream.next_with_timeout(self.fetch_timeout).await? else {
                exhausted = true;
                break;
            };
            fetched += 1;
            self.counter.record_polled();

            let events = match self.transformer.transform(&record).await {
                Ok(events) => events,
                Err(e) => {
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Undecodable record, it will be fetched again"
                    );
                    return Err(e.into());
                }
            };
            self.counter.add_events_received(events.len() as u64);
            accumulator.accept_all(events);

            if accumulator.is_full() || Instant::now() >= deadline {
                break;
            }
        }

        self.counter.add_event_get_time(started.elapsed());
        debug!(
            topic = %self.topic,
            wait_ms = started.elapsed().as_millis() as u64,
            fetched = fetched,
            buffered = accumulator.len(),
            exhausted = exhausted,
            "Accumulation finished"
        );

        if !accumulator.is_empty() {
            self.deliver(stream, accumulator).await?;
        } else if fetched > 0 {
            // Nothing to deliver, but the records were handled
            stream.mark_delivered()?;
        }

        if exhausted {
            self.counter.increment_empty_polls();
            Ok(Status::Backoff)
        } else {
            Ok(Status::Ready)
        }
    }

    /// Deliver everything buffered, then acknowledge it upstream.
    async fn deliver(
        &self,
        stream: &mut dyn RecordStream,
        accumulator: &mut BatchAccumulator,
    ) -> Result<()> {
        let mut accepted = 0u64;
        while !accumulator.is_empty() {
            let batch = accumulator.drain();
            let delivery_started = Instant::now();
            self.sink.deliver(&batch).await?;
            // Counted per batch: a later failure does not undo what the sink took
            self.counter.record_delivery(delivery_started.elapsed());
            self.counter.add_events_accepted(batch.len() as u64);
            accepted += batch.len() as u64;
        }
        stream.mark_delivered()?;

        if !self.auto_commit {
            let commit_started = Instant::now();
            stream.commit_offsets().await?;
            self.counter.record_commit(commit_started.elapsed());
        }

        debug!(topic = %self.topic, accepted = accepted, "Batch delivered");
        Ok(())
    }

    /// Stop the source: end any in-flight cycle, commit delivered offsets
    /// and close the stream.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::Release);

        let mut state = self.state.lock().await;
        state.accumulator.clear();
        let result = match state.stream.take() {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        };

        if self.running.swap(false, Ordering::AcqRel) {
            self.counter.stop();
            info!(topic = %self.topic, counters = %self.counter, "Kafka source stopped");
        }
        result
    }

    /// Whether the source is started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Topic consumed by this source.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Counters of this source.
    pub fn counter(&self) -> &Arc<SourceCounter> {
        &self.counter
    }

    /// Geo lookups that fell back to the unknown location.
    pub fn geo_failures(&self) -> u64 {
        self.transformer.geo().failures()
    }
}
