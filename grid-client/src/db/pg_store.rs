use sqlx::PgPool;
use time::OffsetDateTime;

use super::reading_queries;
use crate::{
    domain::{AveragePower, Bucket, EnergyTotal, MeterEnergy, Reading, RegionEnergy},
    store::{AggregateQueries, AggregationOptions, ReadingStore, StoreError, TimeWindow, WindowPlan},
};

/// Postgres/TimescaleDB-backed store.
///
/// Cheap to clone; every clone checks connections out of the same pool, one per
/// transaction, so concurrent writers never share a session.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    options: AggregationOptions,
}

impl PgStore {
    pub fn new(pool: PgPool, options: AggregationOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn plan(&self, window: TimeWindow) -> WindowPlan {
        let plan = WindowPlan::new(window, self.options.rollup_threshold);
        tracing::debug!(rollup = plan.body.is_some(), ?window, "planned aggregate query");
        plan
    }
}

#[async_trait::async_trait]
impl ReadingStore for PgStore {
    async fn upsert_batch(&self, batch: &[Reading]) -> Result<usize, StoreError> {
        reading_queries::upsert_readings(&self.pool, batch).await
    }

    async fn get(&self, meter_id: &str, timestamp: OffsetDateTime) -> Result<Option<Reading>, StoreError> {
        reading_queries::get_reading(&self.pool, meter_id, timestamp).await
    }
}

#[async_trait::async_trait]
impl AggregateQueries for PgStore {
    async fn recent_readings(&self, window: TimeWindow, limit: usize) -> Result<Vec<Reading>, StoreError> {
        reading_queries::recent_readings(&self.pool, window, limit).await
    }

    async fn energy_by_bucket(&self, window: TimeWindow, bucket: Bucket) -> Result<Vec<EnergyTotal>, StoreError> {
        reading_queries::energy_by_bucket(&self.pool, &self.plan(window), bucket).await
    }

    async fn top_meters(&self, window: TimeWindow, k: usize) -> Result<Vec<MeterEnergy>, StoreError> {
        reading_queries::top_meters(&self.pool, &self.plan(window), k).await
    }

    async fn daily_average_power(&self, window: TimeWindow) -> Result<Vec<AveragePower>, StoreError> {
        reading_queries::daily_average_power(&self.pool, &self.plan(window)).await
    }

    async fn region_monthly_energy(&self, window: TimeWindow) -> Result<Vec<RegionEnergy>, StoreError> {
        reading_queries::region_monthly_energy(&self.pool, &self.plan(window), self.options.region_prefix_len).await
    }
}
