// libs/scheduling-cell/src/models.rs
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Sessions shorter than this are rejected outright.
pub const MIN_SESSION_MINUTES: i32 = 10;

// ==============================================================================
// TENANT READ MODELS
// ==============================================================================

/// Daily opening window, interpreted in UTC like every other timestamp in
/// the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BusinessWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AllowedHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Per-therapy-type tenant configuration. A therapy type absent from the
/// tenant's map gets the default: zero buffer, no hour restriction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TherapyTypeConfig {
    #[serde(default)]
    pub buffer_minutes: i32,
    #[serde(default)]
    pub allowed_hours: Option<AllowedHours>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalPolicies {
    #[serde(default = "default_lead_time_hours")]
    pub lead_time_hours: i64,
    #[serde(default = "default_patient_daily_cap")]
    pub max_sessions_per_patient_per_day: i32,
    #[serde(default = "default_staff_daily_cap")]
    pub max_sessions_per_staff_per_day: i32,
    #[serde(default)]
    pub auto_assign_staff: bool,
    #[serde(default = "default_reschedule_weekly_cap")]
    pub max_reschedule_requests_per_week: i32,
    #[serde(default = "default_stale_request_hours")]
    pub stale_request_hours: i64,
}

fn default_lead_time_hours() -> i64 {
    24
}
fn default_patient_daily_cap() -> i32 {
    3
}
fn default_staff_daily_cap() -> i32 {
    8
}
fn default_reschedule_weekly_cap() -> i32 {
    3
}
fn default_stale_request_hours() -> i64 {
    48
}

impl Default for HospitalPolicies {
    fn default() -> Self {
        Self {
            lead_time_hours: default_lead_time_hours(),
            max_sessions_per_patient_per_day: default_patient_daily_cap(),
            max_sessions_per_staff_per_day: default_staff_daily_cap(),
            auto_assign_staff: false,
            max_reschedule_requests_per_week: default_reschedule_weekly_cap(),
            stale_request_hours: default_stale_request_hours(),
        }
    }
}

/// Tenant read model. Owned by hospital-administration CRUD; the scheduling
/// engine only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hospital {
    pub id: Uuid,
    pub name: String,
    /// Keyed by lowercase weekday ("mon".."sun"); an absent key means the
    /// hospital is closed all day.
    #[serde(default)]
    pub business_hours: HashMap<String, BusinessWindow>,
    #[serde(default)]
    pub blackout_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub policies: HospitalPolicies,
    /// Keyed by normalized therapy key (see `policy::normalize_therapy_key`).
    #[serde(default)]
    pub therapy_config: HashMap<String, TherapyTypeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub hospital_id: Uuid,
    pub name: String,
    pub capacity: i32,
    /// Empty list means the room supports every therapy type.
    #[serde(default)]
    pub supported_therapies: Vec<String>,
    pub status: RoomStatus,
}

/// Minimal staff read model used for auto-assignment candidate selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Uuid,
    pub hospital_id: Uuid,
    #[serde(default)]
    pub therapies: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

// ==============================================================================
// SESSION
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    AwaitingConfirmation,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Scheduled => write!(f, "scheduled"),
            SessionStatus::AwaitingConfirmation => write!(f, "awaiting_confirmation"),
            SessionStatus::Confirmed => write!(f, "confirmed"),
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
            SessionStatus::NoShow => write!(f, "no_show"),
        }
    }
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::NoShow
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionApprovals {
    #[serde(default)]
    pub doctor_approved: bool,
    #[serde(default)]
    pub admin_approved: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOutcomes {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub observations: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TherapySession {
    pub id: Uuid,
    pub hospital_id: Uuid,
    pub patient_id: Uuid,
    pub staff_id: Option<Uuid>,
    pub therapy_type: String,
    pub room_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: SessionStatus,
    #[serde(default)]
    pub approvals: SessionApprovals,
    #[serde(default)]
    pub outcomes: SessionOutcomes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TherapySession {
    /// Non-cancelled sessions occupy their resources for all overlap,
    /// capacity, and daily-cap purposes.
    pub fn occupies_resources(&self) -> bool {
        self.status != SessionStatus::Cancelled
    }
}

/// Half-open interval `[start, end)` used for every overlap and capacity
/// check. `end` already includes the therapy buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub hospital_id: Uuid,
    pub patient_id: Uuid,
    pub therapy_type: String,
    pub staff_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    /// Set by the background scheduler only; generated sessions start in
    /// `awaiting_confirmation` instead of `scheduled`.
    #[serde(default)]
    pub system_generated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub room_id: Option<Uuid>,
    pub staff_id: Option<Uuid>,
    pub doctor_approved: Option<bool>,
    pub admin_approved: Option<bool>,
    pub observations: Option<String>,
}

impl UpdateSessionRequest {
    /// Whether the patch touches scheduling state (time, room, staff or
    /// duration) and therefore must re-run the whole validation pipeline.
    pub fn touches_schedule(&self) -> bool {
        self.scheduled_at.is_some()
            || self.duration_minutes.is_some()
            || self.room_id.is_some()
            || self.staff_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionStatusRequest {
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSearchQuery {
    pub hospital_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub staff_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub status: Option<SessionStatus>,
    pub therapy_type: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomAvailabilityQuery {
    pub hospital_id: Uuid,
    pub therapy_type: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub duration_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomAvailability {
    pub room: Room,
    pub occupied: i32,
    pub capacity: i32,
    pub available: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct RoomCapacityCheck {
    pub ok: bool,
    pub occupied: i32,
    pub capacity: i32,
}

/// Which column a conflict query filters on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceKind {
    Patient,
    Staff,
    Room,
}

impl ResourceKind {
    pub fn column(&self) -> &'static str {
        match self {
            ResourceKind::Patient => "patient_id",
            ResourceKind::Staff => "staff_id",
            ResourceKind::Room => "room_id",
        }
    }
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Hospital not found")]
    HospitalNotFound,

    #[error("Requested room not found")]
    RoomNotFound,

    #[error("Room does not support {0} sessions")]
    TherapyUnsupported(String),

    #[error("Room is at capacity for the requested window")]
    RoomFull,

    #[error("No room available for the requested window")]
    NoRoomAvailable,

    #[error("Requested window falls outside business hours")]
    OutsideBusinessHours,

    #[error("Hospital is closed on {0}")]
    BlackoutDate(NaiveDate),

    #[error("{0} sessions are not offered at the requested hour")]
    TherapyHoursRestricted(String),

    #[error("Bookings require at least {0} hours notice")]
    LeadTime(i64),

    #[error("Patient has reached the daily session limit")]
    PatientDailyCap,

    #[error("Staff member has reached the daily session limit")]
    StaffDailyCap,

    #[error("Patient already has a session in this window")]
    PatientOverlap,

    #[error("Staff member already has a session in this window")]
    StaffOverlap,

    #[error("Invalid status transition from {0}")]
    InvalidStatusTransition(SessionStatus),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl SessionError {
    /// Stable machine code; callers (and the background worker) branch on
    /// these rather than on messages.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound => "not_found",
            SessionError::HospitalNotFound => "hospital_not_found",
            SessionError::RoomNotFound => "room_not_found",
            SessionError::TherapyUnsupported(_) => "therapy_unsupported",
            SessionError::RoomFull => "room_full",
            SessionError::NoRoomAvailable => "no_room_available",
            SessionError::OutsideBusinessHours => "outside_business_hours",
            SessionError::BlackoutDate(_) => "blackout_date",
            SessionError::TherapyHoursRestricted(_) => "therapy_hours_restricted",
            SessionError::LeadTime(_) => "lead_time",
            SessionError::PatientDailyCap => "patient_daily_cap",
            SessionError::StaffDailyCap => "staff_daily_cap",
            SessionError::PatientOverlap => "patient_overlap",
            SessionError::StaffOverlap => "staff_overlap",
            SessionError::InvalidStatusTransition(_) => "invalid_transition",
            SessionError::Unauthorized(_) => "unauthorized",
            SessionError::Validation(_) => "validation",
            SessionError::Database(_) => "database",
        }
    }
}

// ==============================================================================
// NOTIFICATION SIDE-CHANNEL
// ==============================================================================

/// Stable event shape handed to the (out-of-scope) notification dispatcher.
/// `recipient_id = None` means a tenant-wide broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub hospital_id: Uuid,
    pub recipient_id: Option<Uuid>,
    pub title: String,
    pub message: String,
}
