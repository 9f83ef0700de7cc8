use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use futures::{future::OptionFuture, StreamExt};
use grid_client::{
    domain::Reading,
    store::{ReadingStore, StoreError},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use super::dead_letter::{DeadLetter, DeadLetterSink};
use crate::{
    config::ConsumerConfig,
    pipeline::{Envelope, PipelineError, Sink},
    retry::Backoff,
};

#[derive(Debug, Clone)]
pub struct StoreSinkSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_pending: usize,
    /// Unacked messages that force every shard to flush; 0 disables.
    pub max_inflight: usize,
    pub channel_capacity: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl From<&ConsumerConfig> for StoreSinkSettings {
    fn from(cfg: &ConsumerConfig) -> Self {
        Self {
            workers: cfg.workers,
            batch_size: cfg.batch_size,
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            max_pending: cfg.max_pending,
            max_inflight: cfg.max_inflight,
            channel_capacity: cfg.channel_capacity,
            max_retries: cfg.max_retries,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            retry_backoff_max: Duration::from_millis(cfg.retry_backoff_max_ms),
        }
    }
}

fn shard_index(key: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};

    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

/// Writes readings to the store through `workers` shards keyed by `meter_id`.
///
/// Each shard batches by size and flush interval and keeps one write in flight
/// while it continues to buffer up to `max_pending` messages. A message is
/// acknowledged only once its batch is stored or dead-lettered.
///
/// A broker stops delivering once its inflight window is full of unacked
/// messages, so batches could never fill. When `max_inflight` messages are
/// awaiting acknowledgement across all shards, every shard flushes at once.
pub struct StoreSink {
    store: Arc<dyn ReadingStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    settings: StoreSinkSettings,
}

impl StoreSink {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        mut settings: StoreSinkSettings,
    ) -> Self {
        settings.workers = settings.workers.max(1);
        settings.batch_size = settings.batch_size.max(1);
        settings.max_pending = settings.max_pending.max(settings.batch_size);
        settings.channel_capacity = settings.channel_capacity.max(1);
        Self {
            store,
            dead_letters,
            settings,
        }
    }
}

#[async_trait::async_trait]
impl Sink<Reading> for StoreSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send + Unpin + 'static,
    {
        let workers = self.settings.workers;
        let mut txs = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);
        let unacked = Arc::new(AtomicUsize::new(0));
        let (flush_tx, flush_rx) = watch::channel(0u64);

        for shard in 0..workers {
            let (tx, rx) = mpsc::channel::<Envelope<Reading>>(self.settings.channel_capacity);
            txs.push(tx);

            let writer = Arc::new(ShardWriter {
                shard,
                store: self.store.clone(),
                dead_letters: self.dead_letters.clone(),
                settings: self.settings.clone(),
                unacked: unacked.clone(),
            });
            joins.push(tokio::spawn(writer.run(rx, flush_rx.clone())));
        }
        drop(flush_rx);

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for StoreSink");
                    continue;
                }
            };

            let idx = shard_index(&env.payload.meter_id, workers);
            let outstanding = unacked.fetch_add(1, Ordering::AcqRel) + 1;
            if txs[idx].send(env).await.is_err() {
                return Err(PipelineError::Sink("store worker channel closed".to_string()));
            }

            let limit = self.settings.max_inflight;
            if limit > 0 && outstanding >= limit {
                metrics::counter!("store_sink_inflight_flushes_total").increment(1);
                flush_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
            }
        }

        drop(txs);

        for j in joins {
            if let Err(e) = j.await {
                return Err(PipelineError::Sink(format!("store worker join error: {e}")));
            }
        }

        tracing::info!("store sink drained");
        Ok(())
    }
}

struct ShardWriter {
    shard: usize,
    store: Arc<dyn ReadingStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    settings: StoreSinkSettings,
    /// Messages handed to any shard and not yet settled, shared by all shards.
    unacked: Arc<AtomicUsize>,
}

impl ShardWriter {
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope<Reading>>, mut flush_rx: watch::Receiver<u64>) {
        let mut buffer: Vec<Envelope<Reading>> = Vec::with_capacity(self.settings.batch_size);
        let mut in_flight: Option<JoinHandle<()>> = None;
        let mut closed = false;
        let mut flush_due = false;
        let mut signal_open = true;

        let period = self.settings.flush_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let pending = metrics::gauge!("store_sink_pending", "shard" => self.shard.to_string());

        loop {
            if in_flight.is_none() && !buffer.is_empty() {
                if closed || flush_due || buffer.len() >= self.settings.batch_size {
                    let n = buffer.len().min(self.settings.batch_size);
                    let batch: Vec<_> = buffer.drain(..n).collect();
                    in_flight = Some(tokio::spawn(self.clone().flush(batch)));
                    flush_due &= !buffer.is_empty();
                }
            } else if closed && buffer.is_empty() && in_flight.is_none() {
                break;
            }

            pending.set(buffer.len() as f64);

            tokio::select! {
                msg = rx.recv(), if !closed && buffer.len() < self.settings.max_pending => match msg {
                    Some(env) => buffer.push(env),
                    None => closed = true,
                },
                Some(res) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                    in_flight = None;
                    if let Err(e) = res {
                        tracing::error!(shard = self.shard, error = %e, "store flush task failed");
                    }
                }
                _ = ticker.tick() => {
                    flush_due = !buffer.is_empty();
                }
                changed = flush_rx.changed(), if signal_open => match changed {
                    Ok(()) => {
                        // Everything dispatched before the signal is already queued here.
                        while buffer.len() < self.settings.max_pending {
                            match rx.try_recv() {
                                Ok(env) => buffer.push(env),
                                Err(_) => break,
                            }
                        }
                        flush_due = !buffer.is_empty();
                    }
                    Err(_) => signal_open = false,
                },
            }
        }
    }

    async fn flush(self: Arc<Self>, batch: Vec<Envelope<Reading>>) {
        let settled = batch.len();
        self.settle(batch).await;
        self.unacked.fetch_sub(settled, Ordering::AcqRel);
    }

    async fn settle(&self, batch: Vec<Envelope<Reading>>) {
        let readings: Vec<Reading> = batch.iter().map(|e| e.payload.clone()).collect();

        match self.write_with_retry(&readings).await {
            Ok(written) => {
                metrics::counter!("store_written_records_total").increment(readings.len() as u64);
                tracing::debug!(shard = self.shard, records = readings.len(), distinct = written, "batch stored");

                if let Some(min_received) = batch.iter().map(|e| e.received_at).min() {
                    if let Ok(dur) = SystemTime::now().duration_since(min_received) {
                        metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
                    }
                }

                ack_all(batch).await;
            }
            Err((e, attempts)) => {
                metrics::counter!("store_sink_errors_total").increment(1);
                let letters: Vec<DeadLetter> = batch
                    .iter()
                    .map(|env| DeadLetter::new(env.payload.clone(), env.origin.clone(), e.to_string(), attempts))
                    .collect();

                match self.dead_letters.record(&letters).await {
                    Ok(()) => {
                        metrics::counter!("dead_letter_records_total").increment(letters.len() as u64);
                        tracing::error!(
                            shard = self.shard,
                            error = %e,
                            attempts,
                            records = letters.len(),
                            "store write failed, batch dead-lettered"
                        );
                        ack_all(batch).await;
                    }
                    Err(dl_err) => {
                        metrics::counter!("dead_letter_failures_total").increment(1);
                        tracing::error!(
                            shard = self.shard,
                            error = %e,
                            dead_letter_error = %dl_err,
                            records = letters.len(),
                            "dead-letter write failed, leaving batch unacknowledged for redelivery"
                        );
                    }
                }
            }
        }
    }

    /// Returns the error and the number of attempts made once retries are exhausted.
    async fn write_with_retry(&self, readings: &[Reading]) -> Result<usize, (StoreError, u32)> {
        let mut backoff = Backoff::new(self.settings.retry_backoff, self.settings.retry_backoff_max);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.store.upsert_batch(readings).await {
                Ok(written) => return Ok(written),
                Err(e) if e.is_transient() && attempt <= self.settings.max_retries => {
                    let sleep_for = backoff.next_delay();
                    tracing::warn!(
                        shard = self.shard,
                        error = %e,
                        attempt,
                        "store write failed, retrying with backoff"
                    );
                    metrics::counter!("store_write_retry_total").increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}

async fn ack_all(batch: Vec<Envelope<Reading>>) {
    for env in batch {
        if let Err(e) = env.delivery.ack().await {
            metrics::counter!("ack_errors_total").increment(1);
            tracing::warn!(error = %e, origin = %env.origin, "failed to acknowledge message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::{Acknowledge, Delivery},
        sinks::dead_letter::MemoryDeadLetterSink,
    };
    use grid_client::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use time::{macros::datetime, OffsetDateTime};

    struct CountingAck(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Acknowledge for CountingAck {
        async fn ack(&self) -> Result<(), PipelineError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails the first `failures` writes with the given error, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        transient: bool,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                inner: MemoryStore::default(),
                failures: AtomicU32::new(failures),
                transient,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ReadingStore for FlakyStore {
        async fn upsert_batch(&self, batch: &[Reading]) -> Result<usize, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(if self.transient {
                    StoreError::Unavailable("connection reset".to_string())
                } else {
                    StoreError::Query("value too long".to_string())
                });
            }
            self.inner.upsert_batch(batch).await
        }

        async fn get(&self, meter_id: &str, timestamp: OffsetDateTime) -> Result<Option<Reading>, StoreError> {
            self.inner.get(meter_id, timestamp).await
        }
    }

    fn settings() -> StoreSinkSettings {
        StoreSinkSettings {
            workers: 3,
            batch_size: 4,
            flush_interval: Duration::from_secs(60),
            max_pending: 16,
            max_inflight: 0,
            channel_capacity: 8,
            max_retries: 3,
            retry_backoff: Duration::from_millis(1),
            retry_backoff_max: Duration::from_millis(4),
        }
    }

    fn envelopes(n: usize, acks: &Arc<AtomicUsize>) -> Vec<Result<Envelope<Reading>, PipelineError>> {
        (0..n)
            .map(|i| {
                let reading = Reading {
                    meter_id: format!("10000000{:02}", i % 5),
                    timestamp: datetime!(2025-01-01 00:00 UTC) + time::Duration::minutes(5 * i as i64),
                    power: 100.0 + i as f64,
                    voltage: 230.0,
                    current: 1.0,
                    frequency: 50.0,
                    energy: 8.33,
                };
                let origin = reading.topic();
                Ok(Envelope::new(reading, origin, Delivery::new(CountingAck(acks.clone()))))
            })
            .collect()
    }

    /// Returns its permit to the source's inflight window when acked or dropped.
    struct WindowAck {
        _permit: tokio::sync::OwnedSemaphorePermit,
    }

    #[async_trait::async_trait]
    impl Acknowledge for WindowAck {
        async fn ack(&self) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    /// Yields `n` envelopes but, like a QoS 1 broker, never more than `window` unacked at once.
    fn windowed_source(
        n: usize,
        window: usize,
    ) -> impl futures::Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send + Unpin + 'static {
        let permits = Arc::new(tokio::sync::Semaphore::new(window));
        let items = envelopes(n, &Arc::new(AtomicUsize::new(0)));
        Box::pin(futures::stream::iter(items).then(move |item| {
            let permits = permits.clone();
            async move {
                let permit = permits.acquire_owned().await.map_err(|e| PipelineError::Source(e.to_string()))?;
                let env = item?;
                let reading = env.payload;
                let origin = env.origin;
                Ok(Envelope::new(reading, origin, Delivery::new(WindowAck { _permit: permit })))
            }
        }))
    }

    #[test]
    fn shard_index_is_stable_and_bounded() {
        let a = shard_index("1000000001", 4);
        assert_eq!(a, shard_index("1000000001", 4));
        assert!(a < 4);
        assert_eq!(shard_index("x", 0), 0);
    }

    #[tokio::test]
    async fn stores_and_acks_everything_on_drain() {
        let acks = Arc::new(AtomicUsize::new(0));
        let store = MemoryStore::default();
        let sink = StoreSink::new(Arc::new(store.clone()), Arc::new(MemoryDeadLetterSink::new()), settings());

        sink.run(futures::stream::iter(envelopes(25, &acks))).await.unwrap();

        assert_eq!(store.len().await, 25);
        assert_eq!(acks.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let acks = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(FlakyStore::new(2, true));
        let dead = Arc::new(MemoryDeadLetterSink::new());
        let sink = StoreSink::new(store.clone(), dead.clone(), StoreSinkSettings { workers: 1, ..settings() });

        sink.run(futures::stream::iter(envelopes(3, &acks))).await.unwrap();

        assert_eq!(store.inner.len().await, 3);
        assert!(dead.letters().await.is_empty());
        assert_eq!(acks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_then_ack() {
        let acks = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(FlakyStore::new(u32::MAX, true));
        let dead = Arc::new(MemoryDeadLetterSink::new());
        let sink = StoreSink::new(store.clone(), dead.clone(), StoreSinkSettings { workers: 1, ..settings() });

        sink.run(futures::stream::iter(envelopes(2, &acks))).await.unwrap();

        let letters = dead.letters().await;
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].attempts, 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let acks = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(FlakyStore::new(1, false));
        let dead = Arc::new(MemoryDeadLetterSink::new());
        let sink = StoreSink::new(store.clone(), dead.clone(), StoreSinkSettings { workers: 1, ..settings() });

        sink.run(futures::stream::iter(envelopes(1, &acks))).await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dead.letters().await[0].attempts, 1);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_dead_letter_leaves_messages_unacked() {
        let acks = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(FlakyStore::new(u32::MAX, false));
        let sink = StoreSink::new(store, Arc::new(MemoryDeadLetterSink::failing()), settings());

        sink.run(futures::stream::iter(envelopes(5, &acks))).await.unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn full_inflight_window_forces_flush() {
        let store = MemoryStore::default();
        let sink = StoreSink::new(
            Arc::new(store.clone()),
            Arc::new(MemoryDeadLetterSink::new()),
            StoreSinkSettings {
                batch_size: 500,
                max_pending: 2_000,
                max_inflight: 20,
                ..settings()
            },
        );

        // The 60s flush interval would stall after the first 20 messages.
        let run = tokio::time::timeout(Duration::from_secs(5), sink.run(windowed_source(200, 20))).await;
        assert!(run.is_ok(), "sink stalled behind the inflight window");
        run.unwrap().unwrap();
        assert_eq!(store.len().await, 200);
    }

    #[tokio::test]
    async fn inflight_limit_disabled_waits_for_interval() {
        let store = MemoryStore::default();
        let sink = StoreSink::new(
            Arc::new(store.clone()),
            Arc::new(MemoryDeadLetterSink::new()),
            StoreSinkSettings {
                batch_size: 500,
                max_pending: 2_000,
                ..settings()
            },
        );

        let run = tokio::time::timeout(Duration::from_millis(300), sink.run(windowed_source(40, 20))).await;
        assert!(run.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn partial_batch_flushes_on_interval() {
        let acks = Arc::new(AtomicUsize::new(0));
        let store = MemoryStore::default();
        let sink = StoreSink::new(
            Arc::new(store.clone()),
            Arc::new(MemoryDeadLetterSink::new()),
            StoreSinkSettings {
                batch_size: 100,
                max_pending: 100,
                flush_interval: Duration::from_millis(20),
                ..settings()
            },
        );

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move { sink.run(tokio_stream::wrappers::ReceiverStream::new(rx)).await });

        for env in envelopes(1, &acks) {
            tx.send(env).await.unwrap();
        }

        let stored = tokio::time::timeout(Duration::from_secs(2), async {
            while store.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(stored.is_ok(), "partial batch was not flushed by the interval");

        drop(tx);
        handle.await.unwrap().unwrap();
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }
}
