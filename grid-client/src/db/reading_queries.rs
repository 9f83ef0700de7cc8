use std::collections::BTreeSet;

use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::{
    domain::{AveragePower, Bucket, EnergyTotal, MeterEnergy, Reading, RegionEnergy},
    store::{dedupe_batch, StoreError, TimeWindow, WindowPlan},
};

/// Postgres caps bind parameters at 65535 per statement; 7 per row.
const MAX_ROWS_PER_STATEMENT: usize = 4096;

/// Per `(meter, day)` partial sums covering a planned window.
///
/// Binds: `$1..$4` head and tail raw ranges, `$5..$6` the rollup body.
/// Callers append a final `SELECT ... FROM partials` and bind further parameters from `$7`.
const DAY_PARTIALS: &str = r#"
    WITH partials AS (
        SELECT day, meter_id, total_energy, power_sum, reading_count
        FROM energy_daily_rollup
        WHERE day >= $5 AND day < $6
        UNION ALL
        SELECT
            date_trunc('day', timestamp AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS day,
            meter_id,
            SUM(energy) AS total_energy,
            SUM(power)  AS power_sum,
            COUNT(*)    AS reading_count
        FROM energy_readings
        WHERE (timestamp >= $1 AND timestamp < $2)
           OR (timestamp >= $3 AND timestamp < $4)
        GROUP BY 1, 2
    )
"#;

fn partials_query<'q, O>(
    select: &'q str,
    plan: &WindowPlan,
) -> sqlx::query::QueryAs<'q, Postgres, O, sqlx::postgres::PgArguments>
where
    O: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
{
    let body = plan.body_or_empty();
    sqlx::query_as::<_, O>(select)
        .bind(plan.head.start)
        .bind(plan.head.end)
        .bind(plan.tail.start)
        .bind(plan.tail.end)
        .bind(body.start)
        .bind(body.end)
}

/// Upsert a batch of readings and refresh the rollup buckets it touched, atomically.
///
/// Returns the number of distinct keys in the batch.
pub async fn upsert_readings(pool: &PgPool, batch: &[Reading]) -> Result<usize, StoreError> {
    let unique = dedupe_batch(batch);
    if unique.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    for chunk in unique.chunks(MAX_ROWS_PER_STATEMENT) {
        insert_chunk(&mut *tx, chunk).await?;
    }

    let touched: BTreeSet<(String, OffsetDateTime)> = unique.iter().map(|r| (r.meter_id.clone(), r.day())).collect();
    let (meter_ids, days): (Vec<String>, Vec<OffsetDateTime>) = touched.into_iter().unzip();
    refresh_rollups(&mut *tx, &meter_ids, &days).await?;

    tx.commit().await?;
    Ok(unique.len())
}

async fn insert_chunk(conn: &mut PgConnection, chunk: &[&Reading]) -> Result<(), sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO energy_readings (meter_id, timestamp, power, voltage, current, frequency, energy) ",
    );

    builder.push_values(chunk, |mut b, r| {
        b.push_bind(&r.meter_id)
            .push_bind(r.timestamp)
            .push_bind(r.power)
            .push_bind(r.voltage)
            .push_bind(r.current)
            .push_bind(r.frequency)
            .push_bind(r.energy);
    });

    // Identical redelivery leaves the row untouched; changed content is last-write-wins.
    builder.push(
        r#"
        ON CONFLICT (meter_id, timestamp) DO UPDATE SET
            power     = EXCLUDED.power,
            voltage   = EXCLUDED.voltage,
            current   = EXCLUDED.current,
            frequency = EXCLUDED.frequency,
            energy    = EXCLUDED.energy
        WHERE (energy_readings.power, energy_readings.voltage, energy_readings.current,
               energy_readings.frequency, energy_readings.energy)
              IS DISTINCT FROM
              (EXCLUDED.power, EXCLUDED.voltage, EXCLUDED.current, EXCLUDED.frequency, EXCLUDED.energy)
        "#,
    );

    builder.build().execute(conn).await.map(|_| ())
}

/// Recompute the rollup rows for the given `(meter_id, day)` pairs from raw readings.
async fn refresh_rollups(conn: &mut PgConnection, meter_ids: &[String], days: &[OffsetDateTime]) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO energy_daily_rollup (day, meter_id, total_energy, power_sum, reading_count)
        SELECT k.day, r.meter_id, SUM(r.energy), SUM(r.power), COUNT(*)
        FROM UNNEST($1::text[], $2::timestamptz[]) AS k(meter_id, day)
        JOIN energy_readings r
          ON r.meter_id   = k.meter_id
         AND r.timestamp >= k.day
         AND r.timestamp <  k.day + INTERVAL '1 day'
        GROUP BY k.day, r.meter_id
        ON CONFLICT (day, meter_id) DO UPDATE SET
            total_energy  = EXCLUDED.total_energy,
            power_sum     = EXCLUDED.power_sum,
            reading_count = EXCLUDED.reading_count
        "#,
    )
    .bind(meter_ids)
    .bind(days)
    .execute(conn)
    .await
    .map(|_| ())
}

/// Rebuild `energy_daily_rollup` from `energy_readings`.
///
/// With a window, only days fully or partially inside it are rebuilt; without one, all history.
pub async fn rebuild_rollups(pool: &PgPool, window: Option<TimeWindow>) -> Result<u64, StoreError> {
    let (from, to) = match window {
        Some(w) => (Some(crate::domain::day_start(w.start)), Some(crate::domain::day_ceil(w.end))),
        None => (None, None),
    };

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        DELETE FROM energy_daily_rollup
        WHERE ($1::timestamptz IS NULL OR day >= $1)
          AND ($2::timestamptz IS NULL OR day <  $2)
        "#,
    )
    .bind(from)
    .bind(to)
    .execute(&mut *tx)
    .await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO energy_daily_rollup (day, meter_id, total_energy, power_sum, reading_count)
        SELECT
            date_trunc('day', timestamp AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS day,
            meter_id,
            SUM(energy),
            SUM(power),
            COUNT(*)
        FROM energy_readings
        WHERE ($1::timestamptz IS NULL OR timestamp >= $1)
          AND ($2::timestamptz IS NULL OR timestamp <  $2)
        GROUP BY 1, 2
        "#,
    )
    .bind(from)
    .bind(to)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;
    Ok(inserted)
}

pub async fn get_reading(pool: &PgPool, meter_id: &str, timestamp: OffsetDateTime) -> Result<Option<Reading>, StoreError> {
    let row = sqlx::query_as::<_, Reading>(
        r#"
        SELECT meter_id, timestamp, power, voltage, current, frequency, energy
        FROM energy_readings
        WHERE meter_id = $1
          AND timestamp = $2
        "#,
    )
    .bind(meter_id)
    .bind(timestamp)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// (a) Most recent readings inside the window.
pub async fn recent_readings(pool: &PgPool, window: TimeWindow, limit: usize) -> Result<Vec<Reading>, StoreError> {
    let limit = i64::try_from(limit).map_err(|_| StoreError::InvalidRequest("limit too large".to_string()))?;
    let rows = sqlx::query_as::<_, Reading>(
        r#"
        SELECT meter_id, timestamp, power, voltage, current, frequency, energy
        FROM energy_readings
        WHERE timestamp >= $1
          AND timestamp <  $2
        ORDER BY timestamp DESC, meter_id ASC
        LIMIT $3
        "#,
    )
    .bind(window.start)
    .bind(window.end)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// (b) Total energy per day, week or month.
pub async fn energy_by_bucket(pool: &PgPool, plan: &WindowPlan, bucket: Bucket) -> Result<Vec<EnergyTotal>, StoreError> {
    let sql = format!(
        r#"{DAY_PARTIALS}
        SELECT
            date_trunc($7, day AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS bucket,
            SUM(total_energy) AS total_energy
        FROM partials
        GROUP BY 1
        ORDER BY 1
        "#
    );

    let rows = partials_query::<EnergyTotal>(&sql, plan)
        .bind(bucket.as_sql())
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// (c) Top `k` meters by total energy.
pub async fn top_meters(pool: &PgPool, plan: &WindowPlan, k: usize) -> Result<Vec<MeterEnergy>, StoreError> {
    let k = i64::try_from(k).map_err(|_| StoreError::InvalidRequest("k too large".to_string()))?;
    let sql = format!(
        r#"{DAY_PARTIALS}
        SELECT meter_id::text AS meter_id, SUM(total_energy) AS total_energy
        FROM partials
        GROUP BY meter_id
        ORDER BY total_energy DESC, meter_id ASC
        LIMIT $7
        "#
    );

    let rows = partials_query::<MeterEnergy>(&sql, plan)
        .bind(k)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// (d) Average power per day.
pub async fn daily_average_power(pool: &PgPool, plan: &WindowPlan) -> Result<Vec<AveragePower>, StoreError> {
    let sql = format!(
        r#"{DAY_PARTIALS}
        SELECT
            day,
            SUM(power_sum) / SUM(reading_count)::float8 AS average_power,
            SUM(reading_count)::bigint                  AS reading_count
        FROM partials
        GROUP BY day
        ORDER BY day
        "#
    );

    let rows = partials_query::<AveragePower>(&sql, plan).fetch_all(pool).await?;

    Ok(rows)
}

/// (e) Total energy by region (meter-id prefix) and month.
pub async fn region_monthly_energy(
    pool: &PgPool,
    plan: &WindowPlan,
    region_prefix_len: usize,
) -> Result<Vec<RegionEnergy>, StoreError> {
    let prefix = i32::try_from(region_prefix_len)
        .map_err(|_| StoreError::InvalidRequest("region prefix too long".to_string()))?;
    let sql = format!(
        r#"{DAY_PARTIALS}
        SELECT
            LEFT(meter_id, $7) AS region,
            date_trunc('month', day AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS month,
            SUM(total_energy) AS total_energy
        FROM partials
        GROUP BY 1, 2
        ORDER BY 1, 2
        "#
    );

    let rows = partials_query::<RegionEnergy>(&sql, plan)
        .bind(prefix)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}
