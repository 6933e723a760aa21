// libs/reschedule-cell/src/models.rs
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use scheduling_cell::models::SessionError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl fmt::Display for RescheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescheduleStatus::Pending => write!(f, "pending"),
            RescheduleStatus::Approved => write!(f, "approved"),
            RescheduleStatus::Rejected => write!(f, "rejected"),
            RescheduleStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A patient's proposal to move an existing session. At most one pending
/// request per session; resolved by staff or by the background scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub id: Uuid,
    pub hospital_id: Uuid,
    pub session_id: Uuid,
    pub requested_date: Option<NaiveDate>,
    pub requested_time: Option<NaiveTime>,
    pub reason: String,
    pub status: RescheduleStatus,
    /// User id of the requester (JWT subject).
    pub requested_by: String,
    pub processed_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRescheduleRequest {
    pub requested_date: Option<NaiveDate>,
    pub requested_time: Option<NaiveTime>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleAction {
    Approved,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleDecision {
    pub decision: RescheduleAction,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RescheduleListQuery {
    pub session_id: Option<Uuid>,
    pub status: Option<RescheduleStatus>,
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RescheduleError {
    #[error("Reschedule request not found")]
    NotFound,

    #[error("Session not found")]
    SessionNotFound,

    #[error("A pending reschedule request already exists for this session")]
    AlreadyPending,

    #[error("Reschedule request limit of {0} per week reached")]
    RateLimited(i32),

    #[error("Request is already {0}")]
    InvalidState(RescheduleStatus),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A scheduling-pipeline rejection, surfaced with its own stable code
    /// (plausibility validation or the approval-time session move).
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RescheduleError {
    pub fn code(&self) -> &'static str {
        match self {
            RescheduleError::NotFound => "not_found",
            RescheduleError::SessionNotFound => "session_not_found",
            RescheduleError::AlreadyPending => "already_pending",
            RescheduleError::RateLimited(_) => "rate_limited",
            RescheduleError::InvalidState(_) => "invalid_state",
            RescheduleError::Unauthorized(_) => "unauthorized",
            RescheduleError::Validation(_) => "validation",
            RescheduleError::Database(_) => "database",
            RescheduleError::Session(e) => e.code(),
        }
    }
}
