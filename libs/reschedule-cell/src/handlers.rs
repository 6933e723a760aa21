// libs/reschedule-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::{can_manage_reschedule, is_tenant_superseding, User};
use shared_models::error::AppError;

use crate::models::{
    CreateRescheduleRequest, RescheduleDecision, RescheduleError, RescheduleListQuery,
};
use crate::services::requests::RescheduleRequestService;

fn map_reschedule_error(e: RescheduleError) -> AppError {
    match e {
        RescheduleError::NotFound | RescheduleError::SessionNotFound => {
            AppError::NotFound(e.to_string())
        }
        RescheduleError::Unauthorized(msg) => AppError::Forbidden(msg),
        RescheduleError::Validation(msg) => AppError::BadRequest(msg),
        RescheduleError::AlreadyPending | RescheduleError::InvalidState(_) => AppError::Conflict {
            code: e.code(),
            message: e.to_string(),
        },
        RescheduleError::RateLimited(_) => AppError::PolicyViolation {
            code: e.code(),
            message: e.to_string(),
        },
        RescheduleError::Database(msg) => AppError::Database(msg),
        RescheduleError::Session(inner) => scheduling_cell::handlers::map_session_error(inner),
    }
}

fn tenant_of(user: &User) -> Result<Uuid, AppError> {
    user.hospital_id
        .ok_or_else(|| AppError::Forbidden("No hospital scope on this account".to_string()))
}

#[axum::debug_handler]
pub async fn create_reschedule_request(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CreateRescheduleRequest>,
) -> Result<Json<Value>, AppError> {
    let service = RescheduleRequestService::new(&state);
    let created = service
        .create_request(session_id, request, &user, auth.token())
        .await
        .map_err(map_reschedule_error)?;

    Ok(Json(json!({
        "success": true,
        "request": created,
    })))
}

#[axum::debug_handler]
pub async fn list_reschedule_requests(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Query(query): Query<RescheduleListQuery>,
) -> Result<Json<Value>, AppError> {
    let hospital_id = tenant_of(&user)?;

    let service = RescheduleRequestService::new(&state);
    let requests = service
        .list_requests(hospital_id, query, &user, auth.token())
        .await
        .map_err(map_reschedule_error)?;

    Ok(Json(json!({
        "requests": requests,
        "count": requests.len(),
    })))
}

#[axum::debug_handler]
pub async fn act_on_reschedule_request(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(request_id): Path<Uuid>,
    Json(decision): Json<RescheduleDecision>,
) -> Result<Json<Value>, AppError> {
    let service = RescheduleRequestService::new(&state);
    let updated = service
        .act(request_id, decision.decision, &user, auth.token())
        .await
        .map_err(map_reschedule_error)?;

    Ok(Json(json!({
        "success": true,
        "request": updated,
    })))
}

/// Manual trigger for the stale-request sweep; the background scheduler
/// runs the same sweep on every tick.
#[axum::debug_handler]
pub async fn cleanup_stale_requests(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if !can_manage_reschedule(&user) && !is_tenant_superseding(&user) {
        return Err(AppError::Forbidden(
            "Reschedule management privilege required".to_string(),
        ));
    }
    let hospital_id = tenant_of(&user)?;

    let service = RescheduleRequestService::new(&state);
    let cleaned = service
        .cleanup_stale(hospital_id, auth.token())
        .await
        .map_err(map_reschedule_error)?;

    Ok(Json(json!({
        "success": true,
        "cancelled": cleaned,
    })))
}
