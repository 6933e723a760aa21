// libs/scheduling-cell/src/services/allocation.rs
use chrono::NaiveDate;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{
    Hospital, ResourceKind, Room, RoomStatus, SessionError, SessionWindow, StaffMember,
};
use crate::services::conflict::ConflictDetectionService;
use crate::services::policy::normalize_therapy_key;

pub struct ResourceAllocatorService {
    supabase: Arc<SupabaseClient>,
    conflict: ConflictDetectionService,
}

impl ResourceAllocatorService {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        let conflict = ConflictDetectionService::new(Arc::clone(&supabase));
        Self { supabase, conflict }
    }

    /// Validate an explicitly requested room, or pick the first
    /// therapy-compatible active room with spare capacity. Rooms are
    /// iterated in name order so repeated runs fill the same room first.
    pub async fn allocate_room(
        &self,
        hospital: &Hospital,
        therapy_key: &str,
        window: SessionWindow,
        requested_room_id: Option<Uuid>,
        exclude_session_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<Room, SessionError> {
        if let Some(room_id) = requested_room_id {
            return self
                .validate_requested_room(
                    hospital,
                    therapy_key,
                    window,
                    room_id,
                    exclude_session_id,
                    auth_token,
                )
                .await;
        }

        let rooms = self.fetch_active_rooms(hospital.id, auth_token).await?;

        for room in rooms {
            if !Self::room_supports(&room, therapy_key) {
                continue;
            }
            let check = self
                .conflict
                .room_capacity_check(hospital, &room, window, exclude_session_id, auth_token)
                .await?;
            if check.ok {
                debug!(
                    "Auto-allocated room {} ({}/{} occupied) for {}",
                    room.id, check.occupied, check.capacity, therapy_key
                );
                return Ok(room);
            }
        }

        Err(SessionError::NoRoomAvailable)
    }

    /// Pick the candidate with the fewest non-cancelled sessions that day,
    /// ties broken by input order. Greedy load balancing; it does not look
    /// ahead to avoid starving a later slot.
    pub async fn allocate_staff(
        &self,
        hospital_id: Uuid,
        candidates: &[Uuid],
        date: NaiveDate,
        auth_token: &str,
    ) -> Result<Option<Uuid>, SessionError> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut loads = Vec::with_capacity(candidates.len());
        for staff_id in candidates {
            let count = self
                .conflict
                .count_sessions_on_day(
                    hospital_id,
                    ResourceKind::Staff,
                    *staff_id,
                    date,
                    None,
                    auth_token,
                )
                .await?;
            loads.push((*staff_id, count));
        }

        let picked = Self::pick_least_loaded(&loads);
        if let Some(staff_id) = picked {
            info!("Auto-assigned staff {} for {}", staff_id, date);
        }
        Ok(picked)
    }

    /// Active staff of the hospital who can deliver the therapy, in stable
    /// creation order. Candidate pool for auto-assignment.
    pub async fn fetch_staff_candidates(
        &self,
        hospital_id: Uuid,
        therapy_key: &str,
        auth_token: &str,
    ) -> Result<Vec<Uuid>, SessionError> {
        let path = format!(
            "/rest/v1/staff?hospital_id=eq.{}&active=eq.true&order=id.asc",
            hospital_id
        );

        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        let staff: Vec<StaffMember> = result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<StaffMember>, _>>()
            .map_err(|e| SessionError::Database(format!("Failed to parse staff: {}", e)))?;

        Ok(staff
            .into_iter()
            .filter(|member| {
                member.therapies.is_empty()
                    || member
                        .therapies
                        .iter()
                        .any(|t| normalize_therapy_key(t) == therapy_key)
            })
            .map(|member| member.id)
            .collect())
    }

    pub fn room_supports(room: &Room, therapy_key: &str) -> bool {
        room.supported_therapies.is_empty()
            || room
                .supported_therapies
                .iter()
                .any(|t| normalize_therapy_key(t) == therapy_key)
    }

    pub fn pick_least_loaded(loads: &[(Uuid, usize)]) -> Option<Uuid> {
        loads
            .iter()
            .min_by_key(|(_, count)| *count)
            .map(|(staff_id, _)| *staff_id)
    }

    pub async fn fetch_active_rooms(
        &self,
        hospital_id: Uuid,
        auth_token: &str,
    ) -> Result<Vec<Room>, SessionError> {
        let path = format!(
            "/rest/v1/rooms?hospital_id=eq.{}&status=eq.active&order=name.asc",
            hospital_id
        );

        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Room>, _>>()
            .map_err(|e| SessionError::Database(format!("Failed to parse rooms: {}", e)))
    }

    // ==============================================================================
    // PRIVATE HELPER METHODS
    // ==============================================================================

    async fn validate_requested_room(
        &self,
        hospital: &Hospital,
        therapy_key: &str,
        window: SessionWindow,
        room_id: Uuid,
        exclude_session_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<Room, SessionError> {
        let path = format!("/rest/v1/rooms?id=eq.{}", room_id);
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        let room: Room = match result.into_iter().next() {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| SessionError::Database(format!("Failed to parse room: {}", e)))?,
            None => return Err(SessionError::RoomNotFound),
        };

        if room.hospital_id != hospital.id || room.status != RoomStatus::Active {
            return Err(SessionError::RoomNotFound);
        }

        if !Self::room_supports(&room, therapy_key) {
            return Err(SessionError::TherapyUnsupported(therapy_key.to_string()));
        }

        let check = self
            .conflict
            .room_capacity_check(hospital, &room, window, exclude_session_id, auth_token)
            .await?;
        if !check.ok {
            return Err(SessionError::RoomFull);
        }

        Ok(room)
    }

}
