// libs/scheduling-cell/src/services/conflict.rs
use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{
    Hospital, ResourceKind, Room, RoomCapacityCheck, SessionError, SessionWindow, TherapySession,
};
use crate::services::policy::PolicyResolver;

pub struct ConflictDetectionService {
    supabase: Arc<SupabaseClient>,
}

impl ConflictDetectionService {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    /// Whether the resource already has a non-cancelled session whose
    /// effective window intersects `window`. Buffers are re-derived from the
    /// tenant's current therapy configuration at check time; they are never
    /// stored on the session.
    pub async fn has_overlap(
        &self,
        hospital: &Hospital,
        resource: ResourceKind,
        resource_id: Uuid,
        window: SessionWindow,
        exclude_session_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<bool, SessionError> {
        let existing = self
            .sessions_for_resource_on_day(
                hospital.id,
                resource,
                resource_id,
                window.start.date_naive(),
                exclude_session_id,
                auth_token,
            )
            .await?;

        for session in &existing {
            let other = Self::session_window(hospital, session);
            if Self::windows_overlap(window, other) {
                debug!(
                    "Overlap for {} {} against session {}",
                    resource.column(),
                    resource_id,
                    session.id
                );
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Count overlapping sessions in a room and compare to its capacity.
    /// A room with capacity 0 is never eligible.
    pub async fn room_capacity_check(
        &self,
        hospital: &Hospital,
        room: &Room,
        window: SessionWindow,
        exclude_session_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<RoomCapacityCheck, SessionError> {
        let existing = self
            .sessions_for_resource_on_day(
                hospital.id,
                ResourceKind::Room,
                room.id,
                window.start.date_naive(),
                exclude_session_id,
                auth_token,
            )
            .await?;

        let occupied = existing
            .iter()
            .filter(|session| Self::windows_overlap(window, Self::session_window(hospital, session)))
            .count() as i32;

        let ok = room.capacity > 0 && occupied < room.capacity;
        if !ok {
            warn!(
                "Room {} at capacity: {}/{} occupied for {}",
                room.id, occupied, room.capacity, window.start
            );
        }

        Ok(RoomCapacityCheck {
            ok,
            occupied,
            capacity: room.capacity,
        })
    }

    /// Number of non-cancelled sessions a patient or staff member holds on
    /// a calendar day; input to the per-tenant daily caps.
    pub async fn count_sessions_on_day(
        &self,
        hospital_id: Uuid,
        resource: ResourceKind,
        resource_id: Uuid,
        date: NaiveDate,
        exclude_session_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<usize, SessionError> {
        let sessions = self
            .sessions_for_resource_on_day(
                hospital_id,
                resource,
                resource_id,
                date,
                exclude_session_id,
                auth_token,
            )
            .await?;
        Ok(sessions.len())
    }

    /// Half-open interval intersection: `[s1, e1)` and `[s2, e2)` overlap
    /// iff `s1 < e2 && s2 < e1`.
    pub fn windows_overlap(a: SessionWindow, b: SessionWindow) -> bool {
        a.start < b.end && b.start < a.end
    }

    /// A stored session's effective window under the tenant's current
    /// buffer configuration.
    pub fn session_window(hospital: &Hospital, session: &TherapySession) -> SessionWindow {
        let config = PolicyResolver::therapy_config(hospital, &session.therapy_type);
        PolicyResolver::effective_window(
            session.scheduled_at,
            session.duration_minutes,
            config.buffer_minutes,
        )
    }

    pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
        (start, start + Duration::days(1))
    }

    // ==============================================================================
    // PRIVATE HELPER METHODS
    // ==============================================================================

    async fn sessions_for_resource_on_day(
        &self,
        hospital_id: Uuid,
        resource: ResourceKind,
        resource_id: Uuid,
        date: NaiveDate,
        exclude_session_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<Vec<TherapySession>, SessionError> {
        let (day_start, day_end) = Self::day_bounds(date);

        let mut query_parts = vec![
            format!("hospital_id=eq.{}", hospital_id),
            format!("{}=eq.{}", resource.column(), resource_id),
            format!("scheduled_at=gte.{}", urlencoding::encode(&day_start.to_rfc3339())),
            format!("scheduled_at=lt.{}", urlencoding::encode(&day_end.to_rfc3339())),
            "status=neq.cancelled".to_string(),
        ];

        if let Some(exclude_id) = exclude_session_id {
            query_parts.push(format!("id=neq.{}", exclude_id));
        }

        let path = format!(
            "/rest/v1/sessions?{}&order=scheduled_at.asc",
            query_parts.join("&")
        );

        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        let sessions: Vec<TherapySession> = result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<TherapySession>, _>>()
            .map_err(|e| SessionError::Database(format!("Failed to parse sessions: {}", e)))?;

        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> SessionWindow {
        SessionWindow {
            start: Utc.with_ymd_and_hms(2025, 5, 10, start_h, start_m, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 5, 10, end_h, end_m, 0).unwrap(),
        }
    }

    #[test]
    fn test_windows_overlap() {
        assert!(ConflictDetectionService::windows_overlap(
            window(10, 0, 11, 0),
            window(10, 30, 11, 30)
        ));
        assert!(ConflictDetectionService::windows_overlap(
            window(10, 0, 11, 0),
            window(9, 0, 12, 0)
        ));
    }

    #[test]
    fn test_back_to_back_windows_do_not_overlap() {
        // Half-open intervals: one ending exactly when the next starts is fine
        assert!(!ConflictDetectionService::windows_overlap(
            window(10, 0, 11, 0),
            window(11, 0, 12, 0)
        ));
        assert!(!ConflictDetectionService::windows_overlap(
            window(11, 0, 12, 0),
            window(10, 0, 11, 0)
        ));
    }

    #[test]
    fn test_day_bounds_are_half_open() {
        let (start, end) = ConflictDetectionService::day_bounds(
            NaiveDate::from_ymd_opt(2025, 5, 10).unwrap(),
        );
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 5, 10, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 5, 11, 0, 0, 0).unwrap());
    }
}
