//! Store schema bootstrap.
//!
//! Idempotent: safe to run on every service start. Creates the readings table keyed by
//! `(meter_id, timestamp)` and the daily rollup table. With [`TimescaleOptions`] the
//! readings table is additionally converted into a hypertable with columnar
//! compression for cold chunks.

use sqlx::PgPool;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimescaleOptions {
    /// Chunks older than this many days are compressed.
    pub compress_after_days: u32,
}

pub async fn create_schema(pool: &PgPool, timescale: Option<TimescaleOptions>) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS energy_readings (
            meter_id  VARCHAR(20)      NOT NULL,
            timestamp TIMESTAMPTZ      NOT NULL,
            power     DOUBLE PRECISION NOT NULL,
            voltage   DOUBLE PRECISION NOT NULL,
            current   DOUBLE PRECISION NOT NULL,
            frequency DOUBLE PRECISION NOT NULL,
            energy    DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (meter_id, timestamp)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Trailing-window scans filter on time across all meters.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_energy_readings_timestamp
            ON energy_readings (timestamp DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS energy_daily_rollup (
            day           TIMESTAMPTZ      NOT NULL,
            meter_id      VARCHAR(20)      NOT NULL,
            total_energy  DOUBLE PRECISION NOT NULL,
            power_sum     DOUBLE PRECISION NOT NULL,
            reading_count BIGINT           NOT NULL,
            PRIMARY KEY (day, meter_id)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    if let Some(opts) = timescale {
        enable_timescale(pool, opts).await?;
    }

    tracing::info!(timescale = timescale.is_some(), "store schema ready");
    Ok(())
}

async fn enable_timescale(pool: &PgPool, opts: TimescaleOptions) -> Result<(), StoreError> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb;")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        SELECT create_hypertable(
            'energy_readings', 'timestamp',
            if_not_exists => TRUE,
            migrate_data  => TRUE
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Changing compression settings fails once chunks are compressed, so only set them once.
    let compression_enabled: Option<bool> = sqlx::query_scalar(
        r#"
        SELECT compression_enabled
        FROM timescaledb_information.hypertables
        WHERE hypertable_name = 'energy_readings'
        "#,
    )
    .fetch_optional(pool)
    .await?;

    if compression_enabled != Some(true) {
        sqlx::query(
            r#"
            ALTER TABLE energy_readings SET (
                timescaledb.compress,
                timescaledb.compress_segmentby = 'meter_id',
                timescaledb.compress_orderby   = 'timestamp DESC'
            );
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("SELECT add_compression_policy('energy_readings', $1::interval, if_not_exists => TRUE);")
        .bind(format!("{} days", opts.compress_after_days))
        .execute(pool)
        .await?;

    tracing::info!(
        compress_after_days = opts.compress_after_days,
        "timescale hypertable and compression policy configured"
    );
    Ok(())
}
