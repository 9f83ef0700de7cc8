use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use super::{dedupe_batch, AggregateQueries, AggregationOptions, ReadingStore, StoreError, TimeWindow, WindowPlan};
use crate::domain::{
    day_start, region_key, AveragePower, Bucket, DailyRollup, EnergyTotal, MeterEnergy, Reading, ReadingKey,
    RegionEnergy,
};

#[derive(Default)]
struct MemoryState {
    readings: BTreeMap<ReadingKey, Reading>,
    /// Keyed `(meter_id, day)` so a meter's buckets are contiguous.
    rollups: BTreeMap<(String, OffsetDateTime), DailyRollup>,
}

impl MemoryState {
    fn refresh_rollup(&mut self, meter_id: &str, day: OffsetDateTime) {
        let from = (meter_id.to_string(), day);
        let to = (meter_id.to_string(), day + Duration::DAY);
        let rollup = sum_readings(day, meter_id, self.readings.range(from..to).map(|(_, r)| r));
        match rollup {
            Some(r) => {
                self.rollups.insert((meter_id.to_string(), day), r);
            }
            None => {
                self.rollups.remove(&(meter_id.to_string(), day));
            }
        }
    }

    /// Per `(meter, day)` partial aggregates covering exactly `plan`'s window.
    fn day_partials(&self, plan: &WindowPlan) -> Vec<DailyRollup> {
        let mut raw: BTreeMap<(String, OffsetDateTime), DailyRollup> = BTreeMap::new();
        for range in plan.raw_ranges() {
            if range.is_empty() {
                continue;
            }
            for r in self.readings.values().filter(|r| range.contains(r.timestamp)) {
                let entry = raw.entry((r.meter_id.clone(), r.day())).or_insert_with(|| DailyRollup {
                    day: r.day(),
                    meter_id: r.meter_id.clone(),
                    total_energy: 0.0,
                    power_sum: 0.0,
                    reading_count: 0,
                });
                entry.total_energy += r.energy;
                entry.power_sum += r.power;
                entry.reading_count += 1;
            }
        }

        let mut out: Vec<DailyRollup> = raw.into_values().collect();
        if let Some(body) = plan.body {
            out.extend(
                self.rollups
                    .values()
                    .filter(|r| body.contains(r.day))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| (&a.meter_id, a.day).cmp(&(&b.meter_id, b.day)));
        out
    }
}

fn sum_readings<'a>(
    day: OffsetDateTime,
    meter_id: &str,
    readings: impl Iterator<Item = &'a Reading>,
) -> Option<DailyRollup> {
    let mut rollup = DailyRollup {
        day,
        meter_id: meter_id.to_string(),
        total_energy: 0.0,
        power_sum: 0.0,
        reading_count: 0,
    };
    for r in readings {
        rollup.total_energy += r.energy;
        rollup.power_sum += r.power;
        rollup.reading_count += 1;
    }
    (rollup.reading_count > 0).then_some(rollup)
}

/// Process-local store with the same upsert and rollup semantics as the Postgres store.
///
/// Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    options: AggregationOptions,
}

impl MemoryStore {
    pub fn new(options: AggregationOptions) -> Self {
        Self {
            state: Arc::default(),
            options,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.readings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the materialised rollup, ordered by meter then day.
    pub async fn rollups(&self) -> Vec<DailyRollup> {
        self.state.read().await.rollups.values().cloned().collect()
    }

    async fn partials(&self, window: TimeWindow) -> Vec<DailyRollup> {
        let plan = WindowPlan::new(window, self.options.rollup_threshold);
        self.state.read().await.day_partials(&plan)
    }
}

#[async_trait::async_trait]
impl ReadingStore for MemoryStore {
    async fn upsert_batch(&self, batch: &[Reading]) -> Result<usize, StoreError> {
        let unique = dedupe_batch(batch);
        let mut touched: BTreeSet<(String, OffsetDateTime)> = BTreeSet::new();

        let mut state = self.state.write().await;
        for r in &unique {
            let normalised = Reading {
                timestamp: r.timestamp.to_offset(time::UtcOffset::UTC),
                ..(*r).clone()
            };
            touched.insert((normalised.meter_id.clone(), day_start(normalised.timestamp)));
            state.readings.insert(normalised.key(), normalised);
        }
        for (meter_id, day) in touched {
            state.refresh_rollup(&meter_id, day);
        }

        Ok(unique.len())
    }

    async fn get(&self, meter_id: &str, timestamp: OffsetDateTime) -> Result<Option<Reading>, StoreError> {
        let key = (meter_id.to_string(), timestamp.to_offset(time::UtcOffset::UTC));
        Ok(self.state.read().await.readings.get(&key).cloned())
    }
}

#[async_trait::async_trait]
impl AggregateQueries for MemoryStore {
    async fn recent_readings(&self, window: TimeWindow, limit: usize) -> Result<Vec<Reading>, StoreError> {
        let state = self.state.read().await;
        let mut rows: Vec<Reading> = state
            .readings
            .values()
            .filter(|r| window.contains(r.timestamp))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.meter_id.cmp(&b.meter_id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn energy_by_bucket(&self, window: TimeWindow, bucket: Bucket) -> Result<Vec<EnergyTotal>, StoreError> {
        let mut totals: BTreeMap<OffsetDateTime, f64> = BTreeMap::new();
        for p in self.partials(window).await {
            *totals.entry(bucket.truncate(p.day)).or_default() += p.total_energy;
        }
        Ok(totals
            .into_iter()
            .map(|(bucket, total_energy)| EnergyTotal { bucket, total_energy })
            .collect())
    }

    async fn top_meters(&self, window: TimeWindow, k: usize) -> Result<Vec<MeterEnergy>, StoreError> {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for p in self.partials(window).await {
            *totals.entry(p.meter_id).or_default() += p.total_energy;
        }
        let mut ranked: Vec<MeterEnergy> = totals
            .into_iter()
            .map(|(meter_id, total_energy)| MeterEnergy { meter_id, total_energy })
            .collect();
        ranked.sort_by(|a, b| {
            b.total_energy
                .total_cmp(&a.total_energy)
                .then_with(|| a.meter_id.cmp(&b.meter_id))
        });
        ranked.truncate(k);
        Ok(ranked)
    }

    async fn daily_average_power(&self, window: TimeWindow) -> Result<Vec<AveragePower>, StoreError> {
        let mut sums: BTreeMap<OffsetDateTime, (f64, i64)> = BTreeMap::new();
        for p in self.partials(window).await {
            let entry = sums.entry(p.day).or_default();
            entry.0 += p.power_sum;
            entry.1 += p.reading_count;
        }
        Ok(sums
            .into_iter()
            .map(|(day, (power_sum, reading_count))| AveragePower {
                day,
                average_power: power_sum / reading_count as f64,
                reading_count,
            })
            .collect())
    }

    async fn region_monthly_energy(&self, window: TimeWindow) -> Result<Vec<RegionEnergy>, StoreError> {
        let mut totals: BTreeMap<(String, OffsetDateTime), f64> = BTreeMap::new();
        for p in self.partials(window).await {
            let region = region_key(&p.meter_id, self.options.region_prefix_len).to_string();
            *totals.entry((region, Bucket::Month.truncate(p.day))).or_default() += p.total_energy;
        }
        Ok(totals
            .into_iter()
            .map(|((region, month), total_energy)| RegionEnergy {
                region,
                month,
                total_energy,
            })
            .collect())
    }
}
