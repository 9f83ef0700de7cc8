pub mod bucket;
pub mod reading;
pub mod rollup;

pub use bucket::{day_ceil, day_start, Bucket};
pub use reading::{meter_topic, meter_wildcard, region_key, Reading, ReadingKey, METER_TOPIC_PREFIX};
pub use rollup::{AveragePower, DailyRollup, EnergyTotal, MeterEnergy, RegionEnergy};
