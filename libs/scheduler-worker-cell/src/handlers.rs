// libs/scheduler-worker-cell/src/handlers.rs
use std::sync::Arc;

use axum::{extract::{Extension, State}, Json};
use serde_json::{json, Value};

use shared_models::auth::{can_schedule_sessions, is_tenant_superseding, User};
use shared_models::error::AppError;

use crate::services::worker::PlanSchedulerWorker;

/// Manually run one scheduler tick. The same single-flight guard applies as
/// for timer-driven ticks, so a trigger racing the timer is skipped.
#[axum::debug_handler]
pub async fn trigger_tick(
    State(worker): State<Arc<PlanSchedulerWorker>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if !is_tenant_superseding(&user) {
        return Err(AppError::Forbidden(
            "Platform administrator privilege required".to_string(),
        ));
    }

    let report = worker
        .run_tick()
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "report": report,
    })))
}

#[axum::debug_handler]
pub async fn scheduler_status(
    State(worker): State<Arc<PlanSchedulerWorker>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if !can_schedule_sessions(&user) {
        return Err(AppError::Forbidden(
            "Scheduling privilege required".to_string(),
        ));
    }

    Ok(Json(json!({
        "last_report": worker.last_report().await,
    })))
}
