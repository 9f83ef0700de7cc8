//! Synthetic fleet telemetry with a time-of-day load profile.

pub mod publisher;

pub use publisher::{run_simulation, SimulationReport};

use grid_client::domain::Reading;
use rand::Rng;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::config::{PeakWindow, Range, SimulationConfig};

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn sample<R: Rng>(rng: &mut R, range: &Range) -> f64 {
    if range.min >= range.max {
        return range.min;
    }
    rng.gen_range(range.min..range.max)
}

/// Value distributions for generated readings.
#[derive(Debug, Clone)]
pub struct LoadProfile {
    pub peak_windows: Vec<PeakWindow>,
    pub peak_power: Range,
    pub offpeak_power: Range,
    pub voltage: Range,
    pub current: Range,
    pub frequency: Range,
    /// Offset used to derive the local hour tested against `peak_windows`.
    pub local_offset: UtcOffset,
}

impl LoadProfile {
    pub fn from_config(cfg: &SimulationConfig) -> anyhow::Result<Self> {
        let local_offset = UtcOffset::from_whole_seconds(cfg.utc_offset_minutes.saturating_mul(60))
            .map_err(|e| anyhow::anyhow!("invalid simulation.utc_offset_minutes: {e}"))?;
        Ok(Self {
            peak_windows: cfg.peak_windows.clone(),
            peak_power: cfg.peak_power,
            offpeak_power: cfg.offpeak_power,
            voltage: cfg.voltage,
            current: cfg.current,
            frequency: cfg.frequency,
            local_offset,
        })
    }

    pub fn is_peak(&self, ts: OffsetDateTime) -> bool {
        let hour = ts.to_offset(self.local_offset).hour();
        self.peak_windows.iter().any(|w| w.contains(hour))
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub fleet_size: usize,
    pub meter_id_base: u64,
    pub start: OffsetDateTime,
    pub interval: Duration,
    pub buckets: u64,
}

impl GeneratorSettings {
    /// `start` defaults to `now - horizon`; the first bucket is aligned down to the interval.
    pub fn from_config(cfg: &SimulationConfig, now: OffsetDateTime) -> Self {
        let interval = cfg.interval();
        let horizon = Duration::minutes(i64::try_from(cfg.horizon_minutes).unwrap_or(i64::MAX / 60));
        let start = cfg.start.or_else(|| now.checked_sub(horizon)).unwrap_or(now);
        Self {
            fleet_size: cfg.fleet_size,
            meter_id_base: cfg.meter_id_base,
            start: align_down(start.to_offset(UtcOffset::UTC), interval),
            interval,
            buckets: cfg.bucket_count(),
        }
    }
}

fn align_down(ts: OffsetDateTime, interval: Duration) -> OffsetDateTime {
    let step = interval.whole_seconds().max(1);
    let secs = ts.unix_timestamp();
    OffsetDateTime::from_unix_timestamp(secs - secs.rem_euclid(step)).unwrap_or(ts)
}

/// Lazily yields one reading per (bucket, meter), ordered by bucket then meter.
pub struct ReadingGenerator<R> {
    settings: GeneratorSettings,
    profile: LoadProfile,
    rng: R,
    bucket: u64,
    meter: usize,
}

impl<R: Rng> ReadingGenerator<R> {
    pub fn new(settings: GeneratorSettings, profile: LoadProfile, rng: R) -> Self {
        Self {
            settings,
            profile,
            rng,
            bucket: 0,
            meter: 0,
        }
    }

    pub fn total_buckets(&self) -> u64 {
        self.settings.buckets
    }

    fn remaining(&self) -> u64 {
        let fleet = self.settings.fleet_size as u64;
        self.settings
            .buckets
            .saturating_sub(self.bucket)
            .saturating_mul(fleet)
            .saturating_sub(self.meter as u64)
    }

    fn bucket_start(&self) -> Option<OffsetDateTime> {
        let offset = i32::try_from(self.bucket).ok()?;
        let step = self.settings.interval.checked_mul(offset)?;
        self.settings.start.checked_add(step)
    }

    fn make(&mut self, timestamp: OffsetDateTime, meter_id: String) -> Reading {
        let power_range = if self.profile.is_peak(timestamp) {
            self.profile.peak_power
        } else {
            self.profile.offpeak_power
        };

        let power = round2(sample(&mut self.rng, &power_range));
        let minutes = self.settings.interval.whole_seconds() as f64 / 60.0;

        Reading {
            meter_id,
            timestamp,
            power,
            voltage: round2(sample(&mut self.rng, &self.profile.voltage)),
            current: round2(sample(&mut self.rng, &self.profile.current)),
            frequency: round2(sample(&mut self.rng, &self.profile.frequency)),
            energy: round2(power * minutes / 60.0),
        }
    }
}

impl<R: Rng> Iterator for ReadingGenerator<R> {
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        if self.settings.fleet_size == 0 || self.bucket >= self.settings.buckets {
            return None;
        }

        let Some(timestamp) = self.bucket_start() else {
            // Later buckets lie past the representable time range.
            self.bucket = self.settings.buckets;
            return None;
        };
        let meter_id = (self.settings.meter_id_base + self.meter as u64).to_string();
        let reading = self.make(timestamp, meter_id);

        self.meter += 1;
        if self.meter == self.settings.fleet_size {
            self.meter = 0;
            self.bucket += 1;
        }

        Some(reading)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}
