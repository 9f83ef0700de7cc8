use serde::Serialize;
use time::OffsetDateTime;

/// Materialised per-meter, per-day aggregate (`energy_daily_rollup` row).
///
/// Sums rather than averages are kept so that partial days combine exactly.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DailyRollup {
    #[serde(with = "time::serde::rfc3339")]
    pub day: OffsetDateTime,
    pub meter_id: String,
    pub total_energy: f64,
    pub power_sum: f64,
    pub reading_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct EnergyTotal {
    #[serde(with = "time::serde::rfc3339")]
    pub bucket: OffsetDateTime,
    pub total_energy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct MeterEnergy {
    pub meter_id: String,
    pub total_energy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct AveragePower {
    #[serde(with = "time::serde::rfc3339")]
    pub day: OffsetDateTime,
    pub average_power: f64,
    pub reading_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RegionEnergy {
    pub region: String,
    #[serde(with = "time::serde::rfc3339")]
    pub month: OffsetDateTime,
    pub total_energy: f64,
}
