use std::{fs, path::PathBuf, time::Duration};

use grid_client::{db::TimescaleOptions, domain::meter_wildcard, store::AggregationOptions};
use serde::Deserialize;
use time::OffsetDateTime;

/// Inclusive numeric range, written in TOML as `{ min = .., max = .. }`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }

    fn check(&self, name: &str) -> anyhow::Result<()> {
        if !(self.min.is_finite() && self.max.is_finite()) || self.min > self.max {
            anyhow::bail!("invalid range for {name}: [{}, {}]", self.min, self.max);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Keep the broker-side session so unacknowledged messages survive a reconnect.
    pub clean_session: bool,
    /// MQTT QoS level 0, 1 or 2 for both subscribe and publish.
    pub qos: u8,
    pub request_capacity: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "telemetry-consumer".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            clean_session: false,
            qos: 1,
            request_capacity: 1024,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Postgres,
    /// Process-local store; contents are lost on exit.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub uri: String,
    pub max_connections: u32,
    pub rollup_threshold_hours: i64,
    pub region_prefix_len: usize,
    pub timescale: bool,
    pub compress_after_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Postgres,
            uri: "postgres://localhost/smart_grid".to_string(),
            max_connections: 8,
            rollup_threshold_hours: 24,
            region_prefix_len: 8,
            timescale: false,
            compress_after_days: 7,
        }
    }
}

impl StoreConfig {
    pub fn aggregation(&self) -> AggregationOptions {
        AggregationOptions {
            rollup_threshold: time::Duration::hours(self.rollup_threshold_hours),
            region_prefix_len: self.region_prefix_len,
        }
    }

    pub fn timescale_options(&self) -> Option<TimescaleOptions> {
        self.timescale.then_some(TimescaleOptions {
            compress_after_days: self.compress_after_days,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub topic_filter: String,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Messages buffered per worker while a flush is in flight.
    pub max_pending: usize,
    /// The broker's per-client inflight window (Mosquitto 20, EMQX 32) or lower.
    /// Once this many messages await acknowledgement every shard flushes; 0 disables.
    pub max_inflight: usize,
    pub channel_capacity: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub dead_letter_path: PathBuf,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic_filter: meter_wildcard(),
            workers: 4,
            batch_size: 500,
            flush_interval_ms: 1_000,
            max_pending: 2_000,
            max_inflight: 20,
            channel_capacity: 1_024,
            max_retries: 5,
            retry_backoff_ms: 200,
            retry_backoff_max_ms: 5_000,
            dead_letter_path: PathBuf::from("dead-letter.ndjson"),
        }
    }
}

/// Accepted value ranges for inbound readings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub power: Range,
    pub voltage: Range,
    pub current: Range,
    pub frequency: Range,
    pub max_meter_id_len: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            power: Range::new(50.0, 500.0),
            voltage: Range::new(210.0, 250.0),
            current: Range::new(0.5, 2.5),
            frequency: Range::new(49.5, 50.5),
            max_meter_id_len: 20,
        }
    }
}

/// Half-open local-hour window `[start_hour, end_hour)`; wraps past midnight when `start_hour > end_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PeakWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl PeakWindow {
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub fleet_size: usize,
    pub meter_id_base: u64,
    pub interval_minutes: u32,
    pub horizon_minutes: u64,
    /// First bucket; defaults to `now - horizon` (historical backfill).
    #[serde(with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    pub throttle_ms: u64,
    /// Offset applied before testing peak windows.
    pub utc_offset_minutes: i32,
    pub seed: Option<u64>,
    pub peak_windows: Vec<PeakWindow>,
    pub peak_power: Range,
    pub offpeak_power: Range,
    pub voltage: Range,
    pub current: Range,
    pub frequency: Range,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fleet_size: 500,
            meter_id_base: 1_000_000_000,
            interval_minutes: 5,
            horizon_minutes: 14 * 24 * 60,
            start: None,
            throttle_ms: 300,
            utc_offset_minutes: 0,
            seed: None,
            peak_windows: vec![
                PeakWindow { start_hour: 6, end_hour: 10 },
                PeakWindow { start_hour: 18, end_hour: 23 },
            ],
            peak_power: Range::new(200.0, 500.0),
            offpeak_power: Range::new(50.0, 150.0),
            voltage: Range::new(210.0, 250.0),
            current: Range::new(0.5, 2.5),
            frequency: Range::new(49.5, 50.5),
        }
    }
}

impl SimulationConfig {
    pub fn interval(&self) -> time::Duration {
        time::Duration::minutes(i64::from(self.interval_minutes))
    }

    pub fn bucket_count(&self) -> u64 {
        self.horizon_minutes / u64::from(self.interval_minutes.max(1))
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub consumer: ConsumerConfig,
    pub validation: ValidationConfig,
    pub simulation: SimulationConfig,
    pub query_api: Option<QueryApiConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("TELEMETRY_CONFIG").unwrap_or_else(|_| "telemetry-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config '{path}': {e}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.check()?;
        Ok(cfg)
    }

    fn check(&self) -> anyhow::Result<()> {
        let v = &self.validation;
        v.power.check("validation.power")?;
        v.voltage.check("validation.voltage")?;
        v.current.check("validation.current")?;
        v.frequency.check("validation.frequency")?;

        let s = &self.simulation;
        s.peak_power.check("simulation.peak_power")?;
        s.offpeak_power.check("simulation.offpeak_power")?;
        s.voltage.check("simulation.voltage")?;
        s.current.check("simulation.current")?;
        s.frequency.check("simulation.frequency")?;
        if s.interval_minutes == 0 {
            anyhow::bail!("simulation.interval_minutes must be positive");
        }
        if let Some(w) = s.peak_windows.iter().find(|w| w.start_hour > 24 || w.end_hour > 24) {
            anyhow::bail!("peak window hours must be within 0..=24: {w:?}");
        }

        if self.consumer.workers == 0 || self.consumer.batch_size == 0 {
            anyhow::bail!("consumer.workers and consumer.batch_size must be positive");
        }
        if self.broker.qos > 2 {
            anyhow::bail!("broker.qos must be 0, 1 or 2");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_documented_defaults() {
        let cfg = AppConfig::from_toml("").unwrap();
        assert_eq!(cfg.simulation.fleet_size, 500);
        assert_eq!(cfg.simulation.bucket_count(), 14 * 288);
        assert_eq!(cfg.consumer.topic_filter, "energy/meters/#");
        assert_eq!(cfg.consumer.max_inflight, 20);
        assert_eq!(cfg.store.kind, StoreKind::Postgres);
        assert!(cfg.query_api.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [broker]
            host = "emqx"
            username = "auca"
            password = "1234"

            [store]
            kind = "memory"
            timescale = true

            [simulation]
            fleet_size = 3
            start = "2025-01-01T00:00:00Z"
            peak_windows = [{ start_hour = 22, end_hour = 2 }]
            peak_power = { min = 300.0, max = 400.0 }
            "#,
        )
        .unwrap();

        assert_eq!(cfg.broker.host, "emqx");
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.store.kind, StoreKind::Memory);
        assert!(cfg.store.timescale_options().is_some());
        assert_eq!(cfg.simulation.fleet_size, 3);
        assert!(cfg.simulation.start.is_some());
        assert_eq!(cfg.simulation.peak_power, Range::new(300.0, 400.0));
    }

    #[test]
    fn rejects_inverted_range() {
        let res = AppConfig::from_toml(
            r#"
            [validation]
            voltage = { min = 250.0, max = 210.0 }
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn peak_window_wraps_midnight() {
        let late = PeakWindow { start_hour: 22, end_hour: 2 };
        assert!(late.contains(23));
        assert!(late.contains(1));
        assert!(!late.contains(2));
        let morning = PeakWindow { start_hour: 6, end_hour: 10 };
        assert!(morning.contains(9));
        assert!(!morning.contains(10));
    }
}
