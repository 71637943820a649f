use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::api::latency::{Percentiles, TaskDurations};
use crate::config::API_DEFAULT_LIMIT;
use crate::db::models::PartitionStatsRow;
use crate::db::RecordStore;
use crate::error::AppError;
use crate::state::task_board::TaskSnapshot;
use crate::state::TaskBoard;
use crate::types::{AddressRecord, Partition};

#[derive(Clone)]
pub struct ApiState {
    pub store: RecordStore,
    pub board: Arc<TaskBoard>,
    pub durations: Arc<TaskDurations>,
    pub health: Arc<HealthState>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/records", get(get_records))
        .route("/tasks", get(get_tasks))
        .route("/stats/summary", get(get_stats_summary))
        .route("/stats/latency", get(get_stats_latency))
        .route("/health", get(get_health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
pub struct RecordsQuery {
    pub partition: Option<Partition>,
    pub limit: Option<i64>,
    pub min_percentage: Option<f64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct SummaryResponse {
    pub regular: PartitionStatsRow,
    pub coinbase: PartitionStatsRow,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ticks: u64,
    pub last_tick_at: Option<u64>,
    pub chain_tip: Option<u64>,
    pub cursor_height: Option<u64>,
    /// Blocks seen by the last check but not yet committed.
    pub lag_blocks: Option<u64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_records(
    State(state): State<ApiState>,
    Query(params): Query<RecordsQuery>,
) -> Result<Json<Vec<AddressRecord>>, AppError> {
    let partition = params.partition.unwrap_or(Partition::Regular);
    let limit = params.limit.unwrap_or(API_DEFAULT_LIMIT).clamp(1, 10_000);
    let min_percentage = params.min_percentage.unwrap_or(0.0);

    let rows = state.store.recent(partition, limit, min_percentage).await?;
    Ok(Json(rows))
}

async fn get_tasks(State(state): State<ApiState>) -> Json<Vec<TaskSnapshot>> {
    Json(state.board.snapshot())
}

async fn get_stats_summary(
    State(state): State<ApiState>,
) -> Result<Json<SummaryResponse>, AppError> {
    Ok(Json(SummaryResponse {
        regular: state.store.stats(Partition::Regular).await?,
        coinbase: state.store.stats(Partition::Coinbase).await?,
    }))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<BTreeMap<String, Percentiles>> {
    Json(state.durations.all())
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let h = &state.health;
    let nonzero = |v: u64| (v > 0).then_some(v);
    let (tip, cursor) = (nonzero(h.chain_tip()), nonzero(h.cursor_height()));

    let status = if h.ticks() == 0 {
        "starting"
    } else if h.last_tick_ok() {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        ticks: h.ticks(),
        last_tick_at: nonzero(h.last_tick_at()),
        chain_tip: tip,
        cursor_height: cursor,
        lag_blocks: tip.zip(cursor).map(|(t, c)| t.saturating_sub(c)),
    })
}
