//! JSON-over-HTTP surface for the presentation layer.
//!
//! Every route maps onto one [`AggregateQueries`] method. Windows are either
//! trailing (`hours`, `days`) or explicit RFC 3339 `from`/`to` bounds; an
//! omitted `from` means all history and an omitted `to` means now.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use grid_client::{
    domain::{AveragePower, Bucket, EnergyTotal, MeterEnergy, Reading, RegionEnergy},
    store::{AggregateQueries, StoreError, TimeWindow},
};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_LIMIT: usize = 10_000;

#[derive(Clone)]
struct ApiState {
    queries: Arc<dyn AggregateQueries>,
}

pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            StoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StoreError::Unavailable(_) | StoreError::Query(_) => {
                tracing::error!(error = %self.0, "aggregate query failed");
                metrics::counter!("query_api_errors_total").increment(1);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn invalid(msg: &str) -> ApiError {
    ApiError(StoreError::InvalidRequest(msg.to_string()))
}

fn trailing(unit: Duration, count: i64) -> Result<TimeWindow, ApiError> {
    if count <= 0 {
        return Err(invalid("window length must be positive"));
    }
    let span = unit
        .checked_mul(i32::try_from(count).map_err(|_| invalid("window too long"))?)
        .ok_or_else(|| invalid("window too long"))?;
    Ok(TimeWindow::trailing(OffsetDateTime::now_utc(), span))
}

fn default_hours() -> i64 {
    1
}

fn default_days() -> i64 {
    30
}

fn default_limit() -> usize {
    100
}

fn default_k() -> usize {
    10
}

fn default_bucket() -> Bucket {
    Bucket::Day
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    #[serde(default = "default_hours")]
    hours: i64,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    #[serde(default, with = "time::serde::rfc3339::option")]
    from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    to: Option<OffsetDateTime>,
}

impl RangeParams {
    fn window(&self) -> Result<TimeWindow, ApiError> {
        let from = self.from.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let to = self.to.unwrap_or_else(OffsetDateTime::now_utc);
        Ok(TimeWindow::new(from, to)?)
    }
}

#[derive(Debug, Deserialize)]
struct TotalsParams {
    #[serde(default = "default_bucket")]
    bucket: Bucket,
    #[serde(default, with = "time::serde::rfc3339::option")]
    from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    to: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct TopParams {
    #[serde(default = "default_days")]
    days: i64,
    #[serde(default = "default_k")]
    k: usize,
}

#[derive(Debug, Deserialize)]
struct DaysParams {
    #[serde(default = "default_days")]
    days: i64,
}

async fn recent_readings(
    State(state): State<ApiState>,
    Query(p): Query<RecentParams>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let window = trailing(Duration::HOUR, p.hours)?;
    let rows = state.queries.recent_readings(window, p.limit.min(MAX_LIMIT)).await?;
    Ok(Json(rows))
}

async fn daily_energy(
    State(state): State<ApiState>,
    Query(p): Query<RangeParams>,
) -> Result<Json<Vec<EnergyTotal>>, ApiError> {
    Ok(Json(state.queries.daily_energy(p.window()?).await?))
}

async fn energy_totals(
    State(state): State<ApiState>,
    Query(p): Query<TotalsParams>,
) -> Result<Json<Vec<EnergyTotal>>, ApiError> {
    let window = RangeParams { from: p.from, to: p.to }.window()?;
    Ok(Json(state.queries.energy_by_bucket(window, p.bucket).await?))
}

async fn top_meters(
    State(state): State<ApiState>,
    Query(p): Query<TopParams>,
) -> Result<Json<Vec<MeterEnergy>>, ApiError> {
    let window = trailing(Duration::DAY, p.days)?;
    Ok(Json(state.queries.top_meters(window, p.k.min(MAX_LIMIT)).await?))
}

async fn daily_average_power(
    State(state): State<ApiState>,
    Query(p): Query<DaysParams>,
) -> Result<Json<Vec<AveragePower>>, ApiError> {
    let window = trailing(Duration::DAY, p.days)?;
    Ok(Json(state.queries.daily_average_power(window).await?))
}

async fn region_monthly_energy(
    State(state): State<ApiState>,
    Query(p): Query<RangeParams>,
) -> Result<Json<Vec<RegionEnergy>>, ApiError> {
    Ok(Json(state.queries.region_monthly_energy(p.window()?).await?))
}

pub fn router(queries: Arc<dyn AggregateQueries>) -> Router {
    Router::new()
        .route("/readings/recent", get(recent_readings))
        .route("/energy/daily", get(daily_energy))
        .route("/energy/totals", get(energy_totals))
        .route("/meters/top", get(top_meters))
        .route("/power/daily-average", get(daily_average_power))
        .route("/energy/region-monthly", get(region_monthly_energy))
        .with_state(ApiState { queries })
}

/// Serve the query API until `cancel` fires.
pub fn serve(
    bind_addr: &str,
    queries: Arc<dyn AggregateQueries>,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid query_api.bind_addr '{bind_addr}': {e}"))?;
    let app = router(queries);

    Ok(tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "query API listening");
                let shutdown = async move { cancel.cancelled().await };
                if let Err(e) = axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(error = %e, "query API server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind query API listener");
            }
        }
    }))
}
