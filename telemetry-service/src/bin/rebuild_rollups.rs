use anyhow::Result;
use grid_client::{db::reading_queries, store::TimeWindow};
use sqlx::postgres::PgPoolOptions;
use telemetry_service::{config::AppConfig, observability};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Usage: `rebuild_rollups [FROM] [TO]` with RFC 3339 bounds; no arguments rebuilds all history.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let parse = |s: &str| {
        OffsetDateTime::parse(s, &Rfc3339).map_err(|e| anyhow::anyhow!("invalid RFC 3339 instant '{s}': {e}"))
    };
    let window = match args.as_slice() {
        [] => None,
        [from] => Some(TimeWindow::new(parse(from)?, OffsetDateTime::now_utc())?),
        [from, to] => Some(TimeWindow::new(parse(from)?, parse(to)?)?),
        _ => anyhow::bail!("usage: rebuild_rollups [FROM] [TO]"),
    };

    let pool = PgPoolOptions::new()
        .max_connections(cfg.store.max_connections)
        .connect(&cfg.store.uri)
        .await?;

    let rows = reading_queries::rebuild_rollups(&pool, window).await?;
    tracing::info!(rows, ?window, "daily rollups rebuilt");

    Ok(())
}
