use anyhow::Result;
use rand::{rngs::StdRng, SeedableRng};
use telemetry_service::{
    channel::MqttPublisher,
    config::AppConfig,
    observability,
    simulation::{run_simulation, GeneratorSettings, LoadProfile, ReadingGenerator},
};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let sim = &cfg.simulation;

    let settings = GeneratorSettings::from_config(sim, OffsetDateTime::now_utc());
    let profile = LoadProfile::from_config(sim)?;
    let rng = match sim.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    tracing::info!(
        fleet_size = settings.fleet_size,
        start = %settings.start,
        buckets = settings.buckets,
        "starting fleet simulation"
    );
    let readings = ReadingGenerator::new(settings, profile, rng);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let publisher = MqttPublisher::connect(&cfg.broker, &format!("{}-simulator", cfg.broker.client_id));
    let report = run_simulation(&publisher, readings, sim.throttle(), &cancel).await;
    publisher.disconnect().await;

    if report.failed > 0 {
        tracing::warn!(failed = report.failed, "some readings were not published");
    }
    Ok(())
}
