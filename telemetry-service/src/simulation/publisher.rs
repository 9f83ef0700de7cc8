use std::time::Duration;

use grid_client::domain::Reading;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::channel::Publisher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationReport {
    pub published: u64,
    pub failed: u64,
    pub buckets: u64,
}

/// Publish every reading to its meter topic, pausing `throttle` between buckets.
///
/// Publish failures are logged and counted; the run continues. Cancellation stops
/// the run at the next reading.
pub async fn run_simulation<P, I>(
    publisher: &P,
    readings: I,
    throttle: Duration,
    cancel: &CancellationToken,
) -> SimulationReport
where
    P: Publisher + ?Sized,
    I: IntoIterator<Item = Reading>,
{
    let mut report = SimulationReport::default();
    let mut bucket: Option<OffsetDateTime> = None;

    for reading in readings {
        if cancel.is_cancelled() {
            break;
        }

        if bucket != Some(reading.timestamp) {
            if let Some(done) = bucket {
                report.buckets += 1;
                tracing::debug!(bucket = %done, published = report.published, "bucket published");
                if !throttle.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(throttle) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
            bucket = Some(reading.timestamp);
        }

        let payload = match serde_json::to_vec(&reading) {
            Ok(p) => p,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(error = %e, meter_id = %reading.meter_id, "failed to encode reading");
                continue;
            }
        };

        match publisher.publish(&reading.topic(), payload).await {
            Ok(()) => {
                report.published += 1;
                metrics::counter!("simulation_published_total").increment(1);
            }
            Err(e) => {
                report.failed += 1;
                metrics::counter!("simulation_publish_failed_total").increment(1);
                tracing::warn!(error = %e, meter_id = %reading.meter_id, "publish failed, continuing");
            }
        }
    }

    if bucket.is_some() && !cancel.is_cancelled() {
        report.buckets += 1;
    }

    tracing::info!(
        published = report.published,
        failed = report.failed,
        buckets = report.buckets,
        "simulation finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MemoryBroker,
        pipeline::{PipelineError, Source},
    };
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use time::macros::datetime;

    fn readings(buckets: i64, meters: u64) -> Vec<Reading> {
        let mut out = Vec::new();
        for b in 0..buckets {
            for m in 0..meters {
                out.push(Reading {
                    meter_id: (1_000_000_000 + m).to_string(),
                    timestamp: datetime!(2025-01-01 00:00 UTC) + time::Duration::minutes(5 * b),
                    power: 100.0,
                    voltage: 230.0,
                    current: 1.0,
                    frequency: 50.0,
                    energy: 8.33,
                });
            }
        }
        out
    }

    /// Rejects every other publish.
    #[derive(Default)]
    struct HalfBroken(AtomicU64);

    #[async_trait::async_trait]
    impl Publisher for HalfBroken {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), PipelineError> {
            if self.0.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(PipelineError::Publish("broker busy".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_each_reading_to_its_meter_topic() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let sub = broker.subscribe("energy/meters/1000000001", cancel.clone());
        let mut stream = sub.stream().await.unwrap();

        let report = run_simulation(&broker, readings(3, 2), Duration::ZERO, &CancellationToken::new()).await;
        cancel.cancel();

        assert_eq!(report, SimulationReport { published: 6, failed: 0, buckets: 3 });

        let mut received = Vec::new();
        while let Some(item) = stream.next().await {
            let msg = item.unwrap().payload;
            let r: Reading = serde_json::from_slice(&msg.payload).unwrap();
            received.push(r);
        }
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|r| r.meter_id == "1000000001"));
    }

    #[tokio::test]
    async fn publish_failures_do_not_stop_the_run() {
        let publisher = HalfBroken::default();
        let report = run_simulation(&publisher, readings(2, 2), Duration::ZERO, &CancellationToken::new()).await;
        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn cancelled_run_publishes_nothing() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run_simulation(&broker, readings(2, 2), Duration::from_secs(5), &cancel).await;
        assert_eq!(report.published, 0);
        assert_eq!(broker.published(), 0);
    }
}
