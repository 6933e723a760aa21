use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub hospital_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Synthetic actor used by the background scheduler. Holds scheduling
/// capability but is NOT tenant-superseding, so generated bookings obey
/// lead time and every other tenant policy.
pub const SYSTEM_ACTOR_ID: &str = "system-scheduler";

impl User {
    pub fn system() -> Self {
        Self {
            id: SYSTEM_ACTOR_ID.to_string(),
            email: None,
            role: Some("scheduler".to_string()),
            hospital_id: None,
            metadata: None,
            created_at: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_ACTOR_ID
    }

    fn role_str(&self) -> &str {
        self.role.as_deref().unwrap_or("")
    }
}

// Authorization policy is defined once here and reused by the interactive
// handlers and the worker. Handlers must not match on role strings directly.

/// Platform-wide administrators are exempt from tenant-scoped policy
/// checks such as the lead-time floor.
pub fn is_tenant_superseding(user: &User) -> bool {
    user.role_str() == "super_admin"
}

/// Who may create, move, delete, and drive the status of therapy sessions.
pub fn can_schedule_sessions(user: &User) -> bool {
    matches!(
        user.role_str(),
        "super_admin" | "admin" | "doctor" | "therapist" | "receptionist" | "scheduler"
    )
}

/// Who may resolve reschedule requests and run the maintenance sweep.
pub fn can_manage_reschedule(user: &User) -> bool {
    matches!(
        user.role_str(),
        "super_admin" | "admin" | "doctor" | "receptionist" | "scheduler"
    )
}

/// Who may request a reschedule on behalf of a patient.
pub fn can_request_reschedule(user: &User) -> bool {
    matches!(user.role_str(), "patient" | "guardian") || can_manage_reschedule(user)
}

/// Who may file a reschedule request for a session that is not their own:
/// guardians and reschedule managers. Patients act only on their own
/// sessions.
pub fn can_request_reschedule_for_others(user: &User) -> bool {
    user.role_str() == "guardian" || can_manage_reschedule(user)
}

pub fn can_set_doctor_approval(user: &User) -> bool {
    matches!(user.role_str(), "doctor" | "super_admin")
}

pub fn can_set_admin_approval(user: &User) -> bool {
    matches!(user.role_str(), "admin" | "super_admin")
}
