//! Storage contract shared by the Postgres store and the in-memory store.
//!
//! Writers go through [`ReadingStore`], readers through [`AggregateQueries`].
//! Both implementations resolve duplicates by upsert on `(meter_id, timestamp)`
//! and maintain a per-meter daily rollup inside the same write.

use std::collections::BTreeMap;

use time::{Duration, OffsetDateTime};

use crate::domain::{AveragePower, Bucket, EnergyTotal, MeterEnergy, Reading, ReadingKey, RegionEnergy};

pub mod memory;
pub mod window;

pub use memory::MemoryStore;
pub use window::{TimeWindow, WindowPlan};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Connectivity or contention problem that may clear on retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                // 08xxx connection exceptions, serialization failure, deadlock, admin shutdown.
                if code.starts_with("08") || matches!(code.as_str(), "40001" | "40P01" | "57P01" | "57P03") {
                    StoreError::Unavailable(e.to_string())
                } else {
                    StoreError::Query(e.to_string())
                }
            }
            _ => StoreError::Query(e.to_string()),
        }
    }
}

/// How aggregate queries choose between raw scans and the daily rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationOptions {
    /// Windows at least this long read whole days from the rollup.
    pub rollup_threshold: Duration,
    /// Number of leading meter-id characters forming the region key.
    pub region_prefix_len: usize,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            rollup_threshold: Duration::hours(24),
            region_prefix_len: 8,
        }
    }
}

/// Write side of the time-series store.
#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync {
    /// Insert or replace every reading in `batch`, keyed by `(meter_id, timestamp)`.
    ///
    /// Returns the number of distinct keys written. Re-delivering identical content is a no-op.
    async fn upsert_batch(&self, batch: &[Reading]) -> Result<usize, StoreError>;

    async fn get(&self, meter_id: &str, timestamp: OffsetDateTime) -> Result<Option<Reading>, StoreError>;
}

/// The fixed read-only query set served to the presentation layer.
///
/// Every query returns the complete result for its window; none of them paginate.
#[async_trait::async_trait]
pub trait AggregateQueries: Send + Sync {
    /// Newest readings in the window, newest first, ties by `meter_id` ascending.
    async fn recent_readings(&self, window: TimeWindow, limit: usize) -> Result<Vec<Reading>, StoreError>;

    /// Total energy per calendar bucket, oldest bucket first.
    async fn energy_by_bucket(&self, window: TimeWindow, bucket: Bucket) -> Result<Vec<EnergyTotal>, StoreError>;

    async fn daily_energy(&self, window: TimeWindow) -> Result<Vec<EnergyTotal>, StoreError> {
        self.energy_by_bucket(window, Bucket::Day).await
    }

    /// Top `k` meters by summed energy, ties broken by `meter_id` ascending.
    async fn top_meters(&self, window: TimeWindow, k: usize) -> Result<Vec<MeterEnergy>, StoreError>;

    async fn daily_average_power(&self, window: TimeWindow) -> Result<Vec<AveragePower>, StoreError>;

    /// Total energy grouped by region and month, ordered by region then month.
    async fn region_monthly_energy(&self, window: TimeWindow) -> Result<Vec<RegionEnergy>, StoreError>;
}

/// Collapse repeated keys inside one batch, last occurrence wins.
///
/// Postgres rejects an `ON CONFLICT DO UPDATE` statement that touches the same row twice,
/// so this runs before every batched upsert.
pub fn dedupe_batch(batch: &[Reading]) -> Vec<&Reading> {
    let mut latest: BTreeMap<ReadingKey, &Reading> = BTreeMap::new();
    for r in batch {
        latest.insert(r.key(), r);
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(meter: &str, power: f64) -> Reading {
        Reading {
            meter_id: meter.to_string(),
            timestamp: datetime!(2025-01-01 00:05:00 UTC),
            power,
            voltage: 230.0,
            current: 1.0,
            frequency: 50.0,
            energy: power / 12.0,
        }
    }

    #[test]
    fn dedupe_keeps_last_occurrence_per_key() {
        let batch = vec![reading("a", 100.0), reading("b", 60.0), reading("a", 120.0)];
        let out = dedupe_batch(&batch);
        assert_eq!(out.len(), 2);
        let a = out.iter().find(|r| r.meter_id == "a").unwrap();
        assert_eq!(a.power, 120.0);
    }

    #[test]
    fn only_unavailable_errors_are_transient() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::Query("syntax".into()).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }
}
