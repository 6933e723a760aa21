// libs/scheduling-cell/src/handlers.rs
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
use shared_models::auth::{can_schedule_sessions, is_tenant_superseding, User};
use shared_models::error::AppError;

use crate::models::{
    CreateSessionRequest, RoomAvailabilityQuery, SessionError, SessionSearchQuery,
    TransitionStatusRequest, UpdateSessionRequest,
};
use crate::services::booking::SessionBookingService;

/// Map a cell error onto the HTTP surface, preserving its stable code.
pub fn map_session_error(e: SessionError) -> AppError {
    match e {
        SessionError::NotFound | SessionError::HospitalNotFound => {
            AppError::NotFound(e.to_string())
        }
        SessionError::Unauthorized(msg) => AppError::Forbidden(msg),
        SessionError::Validation(msg) => AppError::BadRequest(msg),
        SessionError::RoomNotFound
        | SessionError::TherapyUnsupported(_)
        | SessionError::OutsideBusinessHours
        | SessionError::BlackoutDate(_)
        | SessionError::TherapyHoursRestricted(_)
        | SessionError::LeadTime(_)
        | SessionError::PatientDailyCap
        | SessionError::StaffDailyCap => AppError::PolicyViolation {
            code: e.code(),
            message: e.to_string(),
        },
        SessionError::RoomFull
        | SessionError::NoRoomAvailable
        | SessionError::PatientOverlap
        | SessionError::StaffOverlap
        | SessionError::InvalidStatusTransition(_) => AppError::Conflict {
            code: e.code(),
            message: e.to_string(),
        },
        SessionError::Database(msg) => AppError::Database(msg),
    }
}

/// Non-platform actors may only operate inside their own hospital.
fn ensure_tenant_scope(user: &User, hospital_id: Uuid) -> Result<(), AppError> {
    if is_tenant_superseding(user) || user.hospital_id == Some(hospital_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Not authorized for this hospital".to_string(),
        ))
    }
}

#[axum::debug_handler]
pub async fn create_session(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(mut request): Json<CreateSessionRequest>,
) -> Result<Json<Value>, AppError> {
    ensure_tenant_scope(&user, request.hospital_id)?;

    // Generated-session status is reserved for the background scheduler
    request.system_generated = false;

    let booking_service = SessionBookingService::new(&state);
    let session = booking_service
        .create_session(request, &user, auth.token())
        .await
        .map_err(map_session_error)?;

    Ok(Json(json!({
        "success": true,
        "session": session,
    })))
}

#[axum::debug_handler]
pub async fn search_sessions(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Query(mut query): Query<SessionSearchQuery>,
) -> Result<Json<Value>, AppError> {
    // Tenant scoping: regular users see only their own hospital, and
    // patients only their own sessions
    if !is_tenant_superseding(&user) {
        let tenant = user.hospital_id.ok_or_else(|| {
            AppError::Forbidden("No hospital scope on this account".to_string())
        })?;
        query.hospital_id = Some(tenant);
    }
    if !can_schedule_sessions(&user) {
        let own_id = Uuid::parse_str(&user.id)
            .map_err(|_| AppError::Forbidden("Patient identity required".to_string()))?;
        query.patient_id = Some(own_id);
    }

    let booking_service = SessionBookingService::new(&state);
    let sessions = booking_service
        .search_sessions(query, auth.token())
        .await
        .map_err(map_session_error)?;

    Ok(Json(json!({
        "sessions": sessions,
        "count": sessions.len(),
    })))
}

#[axum::debug_handler]
pub async fn get_session(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let booking_service = SessionBookingService::new(&state);
    let session = booking_service
        .get_session(session_id, auth.token())
        .await
        .map_err(map_session_error)?;

    ensure_tenant_scope(&user, session.hospital_id)?;
    if !can_schedule_sessions(&user) && user.id != session.patient_id.to_string() {
        return Err(AppError::Forbidden(
            "Not authorized to view this session".to_string(),
        ));
    }

    Ok(Json(json!({ "session": session })))
}

#[axum::debug_handler]
pub async fn update_session(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<UpdateSessionRequest>,
) -> Result<Json<Value>, AppError> {
    let booking_service = SessionBookingService::new(&state);
    let session = booking_service
        .modify_session(session_id, request, &user, auth.token())
        .await
        .map_err(map_session_error)?;

    Ok(Json(json!({
        "success": true,
        "session": session,
    })))
}

#[axum::debug_handler]
pub async fn transition_session_status(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<TransitionStatusRequest>,
) -> Result<Json<Value>, AppError> {
    let booking_service = SessionBookingService::new(&state);
    let session = booking_service
        .transition_status(session_id, request.status, &user, auth.token())
        .await
        .map_err(map_session_error)?;

    Ok(Json(json!({
        "success": true,
        "session": session,
    })))
}

#[axum::debug_handler]
pub async fn delete_session(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let booking_service = SessionBookingService::new(&state);
    booking_service
        .delete_session(session_id, &user, auth.token())
        .await
        .map_err(map_session_error)?;

    Ok(Json(json!({
        "success": true,
        "message": "Session deleted",
    })))
}

#[axum::debug_handler]
pub async fn room_availability(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Query(query): Query<RoomAvailabilityQuery>,
) -> Result<Json<Value>, AppError> {
    ensure_tenant_scope(&user, query.hospital_id)?;

    let booking_service = SessionBookingService::new(&state);
    let availability = booking_service
        .room_availability(query, auth.token())
        .await
        .map_err(map_session_error)?;

    Ok(Json(json!({ "rooms": availability })))
}
