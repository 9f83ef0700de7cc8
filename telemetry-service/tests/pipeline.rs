use std::{sync::Arc, time::Duration};

use grid_client::{
    domain::Reading,
    store::{MemoryStore, ReadingStore, StoreError},
};
use rand::{rngs::StdRng, SeedableRng};
use telemetry_service::{
    channel::{InboundMessage, MemoryBroker, Publisher},
    config::{SimulationConfig, ValidationConfig},
    pipeline::{Decode, Pipeline, PipelineError, Transform},
    simulation::{run_simulation, GeneratorSettings, LoadProfile, ReadingGenerator},
    sinks::{DeadLetterSink, MemoryDeadLetterSink, StoreSink, StoreSinkSettings},
    transform::{ReadingDecoder, ReadingValidation},
};
use time::{macros::datetime, OffsetDateTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn settings() -> StoreSinkSettings {
    StoreSinkSettings {
        workers: 2,
        batch_size: 8,
        flush_interval: Duration::from_millis(10),
        max_pending: 64,
        max_inflight: 0,
        channel_capacity: 16,
        max_retries: 1,
        retry_backoff: Duration::from_millis(1),
        retry_backoff_max: Duration::from_millis(2),
    }
}

struct Harness {
    broker: MemoryBroker,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), PipelineError>>,
}

impl Harness {
    fn start(store: Arc<dyn ReadingStore>, dead_letters: Arc<dyn DeadLetterSink>, settings: StoreSinkSettings) -> Self {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();

        let pipeline: Pipeline<_, InboundMessage, Reading, _> = Pipeline {
            source: broker.subscribe("energy/meters/#", cancel.clone()),
            decoder: Arc::new(ReadingDecoder) as Arc<dyn Decode<InboundMessage, Reading>>,
            transforms: vec![
                Arc::new(ReadingValidation::new(ValidationConfig::default())) as Arc<dyn Transform<Reading, Reading>>
            ],
            sink: StoreSink::new(store, dead_letters, settings),
        };

        Self {
            broker,
            cancel,
            handle: tokio::spawn(pipeline.run()),
        }
    }

    async fn publish(&self, reading: &Reading) {
        let payload = serde_json::to_vec(reading).unwrap();
        self.broker.publish(&reading.topic(), payload).await.unwrap();
    }

    async fn publish_raw(&self, topic: &str, payload: &str) {
        self.broker.publish(topic, payload.as_bytes().to_vec()).await.unwrap();
    }

    async fn wait_for_acks(&self, n: u64) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while self.broker.acked() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "only {} of {n} messages acked", self.broker.acked());
    }

    async fn stop(self) -> MemoryBroker {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
        self.broker
    }
}

fn reading(meter: &str, ts: OffsetDateTime, power: f64) -> Reading {
    Reading {
        meter_id: meter.to_string(),
        timestamp: ts,
        power,
        voltage: 229.87,
        current: 1.21,
        frequency: 50.01,
        energy: (power * 5.0 / 60.0 * 100.0).round() / 100.0,
    }
}

#[tokio::test]
async fn simulated_readings_round_trip_through_the_store() {
    let store = MemoryStore::default();
    let harness = Harness::start(Arc::new(store.clone()), Arc::new(MemoryDeadLetterSink::new()), settings());

    let cfg = SimulationConfig {
        fleet_size: 4,
        ..SimulationConfig::default()
    };
    let generator = || {
        let settings = GeneratorSettings {
            fleet_size: cfg.fleet_size,
            meter_id_base: cfg.meter_id_base,
            start: datetime!(2025-01-06 05:30 UTC),
            interval: cfg.interval(),
            buckets: 12,
        };
        ReadingGenerator::new(settings, LoadProfile::from_config(&cfg).unwrap(), StdRng::seed_from_u64(42))
    };

    let report = run_simulation(&harness.broker, generator(), Duration::ZERO, &CancellationToken::new()).await;
    assert_eq!(report.published, 48);
    harness.wait_for_acks(48).await;

    for expected in generator() {
        let stored = store.get(&expected.meter_id, expected.timestamp).await.unwrap();
        assert_eq!(stored.as_ref(), Some(&expected));
    }

    let broker = harness.stop().await;
    assert_eq!(broker.acked(), 48);
}

#[tokio::test]
async fn duplicate_delivery_keeps_a_single_row() {
    let store = MemoryStore::default();
    let harness = Harness::start(Arc::new(store.clone()), Arc::new(MemoryDeadLetterSink::new()), settings());

    let r = reading("1000000007", datetime!(2025-01-06 10:15 UTC), 321.5);
    for _ in 0..3 {
        harness.publish(&r).await;
    }
    harness.wait_for_acks(3).await;
    harness.stop().await;

    assert_eq!(store.len().await, 1);
    let rollups = store.rollups().await;
    assert_eq!(rollups.len(), 1);
    assert_eq!(rollups[0].reading_count, 1);
    assert_eq!(rollups[0].total_energy, r.energy);
}

#[tokio::test]
async fn malformed_message_is_discarded_and_consumption_continues() {
    let store = MemoryStore::default();
    let harness = Harness::start(Arc::new(store.clone()), Arc::new(MemoryDeadLetterSink::new()), settings());

    let first = reading("1000000001", datetime!(2025-01-06 10:00 UTC), 120.0);
    let second = reading("1000000002", datetime!(2025-01-06 10:00 UTC), 130.0);

    harness.publish(&first).await;
    harness.publish_raw("energy/meters/1000000003", "{\"meter_id\": 12").await;
    harness.publish(&second).await;
    harness.wait_for_acks(3).await;

    assert_eq!(store.len().await, 2);
    assert_eq!(harness.broker.subscriber_count(), 1);

    // Out-of-range and mismatched-topic readings are rejected the same way.
    let mut hot = reading("1000000004", datetime!(2025-01-06 10:00 UTC), 130.0);
    hot.voltage = 400.0;
    harness.publish(&hot).await;
    let payload = serde_json::to_string(&first).unwrap();
    harness.publish_raw("energy/meters/1000000009", &payload).await;
    harness.wait_for_acks(5).await;

    let broker = harness.stop().await;
    assert_eq!(store.len().await, 2);
    assert_eq!(broker.acked(), 5);
}

/// Every write fails with a transient error.
struct DownStore;

#[async_trait::async_trait]
impl ReadingStore for DownStore {
    async fn upsert_batch(&self, _batch: &[Reading]) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _meter_id: &str, _timestamp: OffsetDateTime) -> Result<Option<Reading>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn exhausted_writes_are_dead_lettered_and_acked() {
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let harness = Harness::start(Arc::new(DownStore), dead.clone(), settings());

    for minute in [0, 5, 10] {
        let ts = datetime!(2025-01-06 10:00 UTC) + time::Duration::minutes(minute);
        harness.publish(&reading("1000000001", ts, 200.0)).await;
    }
    harness.wait_for_acks(3).await;
    harness.stop().await;

    let letters = dead.letters().await;
    assert_eq!(letters.len(), 3);
    assert!(letters.iter().all(|l| l.attempts == 2 && l.origin == "energy/meters/1000000001"));
    assert!(letters[0].error.contains("connection refused"));
}

#[tokio::test]
async fn dead_letter_failure_leaves_messages_for_redelivery() {
    let harness = Harness::start(Arc::new(DownStore), Arc::new(MemoryDeadLetterSink::failing()), settings());

    harness.publish(&reading("1000000001", datetime!(2025-01-06 10:00 UTC), 200.0)).await;
    let broker = harness.stop().await;

    assert_eq!(broker.acked(), 0);
}

#[tokio::test]
async fn shutdown_drains_buffered_messages_before_returning() {
    let store = MemoryStore::default();
    let slow_flush = StoreSinkSettings {
        batch_size: 1_000,
        max_pending: 1_000,
        flush_interval: Duration::from_secs(60),
        ..settings()
    };
    let harness = Harness::start(Arc::new(store.clone()), Arc::new(MemoryDeadLetterSink::new()), slow_flush);

    for i in 0..50 {
        let meter = format!("{}", 1_000_000_000 + i % 10);
        let ts = datetime!(2025-01-06 00:00 UTC) + time::Duration::minutes(5 * (i / 10));
        harness.publish(&reading(&meter, ts, 100.0 + i as f64)).await;
    }

    let broker = harness.stop().await;

    assert_eq!(store.len().await, 50);
    assert_eq!(broker.acked(), 50);
    assert_eq!(broker.subscriber_count(), 0);
}
