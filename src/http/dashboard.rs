//! Dashboard read API: stats, poll config, and the uptime chart.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::model::MachineStatus;
use crate::uptime::{build_series, Period, SeriesMode, Window};

use super::auth::CurrentUser;
use super::{ApiError, AppState};

/// GET /dashboard/config — what cadence the UI should poll at.
pub async fn config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "metrics_poll_interval_seconds": state.snapshot_interval.as_secs(),
    }))
}

/// GET /dashboard/stats — machine counts for the caller.
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let machines = state.store.machines_for_user(&user.id).await?;

    let alive = machines
        .iter()
        .filter(|m| m.status == MachineStatus::Alive)
        .count();
    let dead = machines
        .iter()
        .filter(|m| m.status == MachineStatus::Dead)
        .count();

    Ok(Json(json!({
        "total": machines.len(),
        "alive": alive,
        "dead": dead,
        "connected": state.registry.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct UptimeQuery {
    period: Option<String>,
    machine_id: Option<String>,
}

/// GET /dashboard/uptime — bucket-aligned chart series, aggregated across
/// the caller's machines or for one of them.
pub async fn uptime(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<UptimeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let period = match query.period.as_deref() {
        None => Period::Week,
        Some(raw) => {
            Period::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("bad period: {raw}")))?
        }
    };

    let (machine_ids, mode) = match &query.machine_id {
        Some(machine_id) => {
            // Foreign machines read as missing; no existence oracle.
            let machine = state.store.machine(machine_id).await?;
            if machine.user_id != user.id {
                return Err(ApiError::NotFound);
            }
            (vec![machine.id], SeriesMode::PerMachine)
        }
        None => {
            let machines = state.store.machines_for_user(&user.id).await?;
            let ids = machines.into_iter().map(|m| m.id).collect();
            (ids, SeriesMode::Aggregate)
        }
    };

    state
        .health
        .uptime_queries_total
        .with_label_values(&[period.as_str()])
        .inc();

    let window = Window::compute(
        Utc::now().timestamp_millis(),
        period,
        state.snapshot_interval,
    );

    let start = DateTime::<Utc>::from_timestamp_millis(window.period_start)
        .ok_or_else(|| ApiError::BadRequest("window out of range".to_string()))?;
    let end = DateTime::<Utc>::from_timestamp_millis(window.period_end)
        .ok_or_else(|| ApiError::BadRequest("window out of range".to_string()))?;

    let snapshots = state
        .store
        .snapshots_in_range(&machine_ids, start, end)
        .await?;

    let series = build_series(window, &snapshots, mode);

    // Charts must always reflect live data.
    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(json!({
            "points": series.points,
            "period_start": series.period_start,
            "period_end": series.period_end,
            "disk_domain": [0.0, series.disk_max],
        })),
    ))
}
