// libs/scheduling-cell/src/services/booking.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::auth::{
    can_schedule_sessions, can_set_admin_approval, can_set_doctor_approval, is_tenant_superseding,
    User,
};

use crate::models::{
    CreateSessionRequest, Hospital, NotificationEvent, ResourceKind, Room, RoomAvailability,
    RoomAvailabilityQuery, SessionError, SessionSearchQuery, SessionStatus, SessionWindow,
    TherapySession, UpdateSessionRequest, MIN_SESSION_MINUTES,
};
use crate::services::allocation::ResourceAllocatorService;
use crate::services::conflict::ConflictDetectionService;
use crate::services::consistency::TenantGate;
use crate::services::lifecycle::SessionLifecycleService;
use crate::services::notify::NotificationService;
use crate::services::policy::{normalize_therapy_key, PolicyResolver};

/// Outcome of the full validation pipeline: the room that will host the
/// session and the staff member (explicit or auto-assigned) who will run it.
struct ValidatedSchedule {
    room: Room,
    staff_id: Option<Uuid>,
    therapy_key: String,
}

/// Actors operate only inside their own hospital; the platform admin and
/// the background scheduler cross tenants.
fn ensure_actor_tenant(actor: &User, hospital_id: Uuid) -> Result<(), SessionError> {
    if is_tenant_superseding(actor) || actor.is_system() || actor.hospital_id == Some(hospital_id) {
        Ok(())
    } else {
        Err(SessionError::Unauthorized(
            "Not authorized for this hospital".to_string(),
        ))
    }
}

/// Owns every mutation of the sessions table. All writes run the same
/// validation pipeline and are serialized per tenant through the gate, so
/// no component can observe a half-validated session.
pub struct SessionBookingService {
    supabase: Arc<SupabaseClient>,
    conflict: ConflictDetectionService,
    allocator: ResourceAllocatorService,
    lifecycle: SessionLifecycleService,
    notifier: NotificationService,
    gate: &'static TenantGate,
}

impl SessionBookingService {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_client(Arc::new(SupabaseClient::new(config)))
    }

    pub fn with_client(supabase: Arc<SupabaseClient>) -> Self {
        let conflict = ConflictDetectionService::new(Arc::clone(&supabase));
        let allocator = ResourceAllocatorService::new(Arc::clone(&supabase));
        let notifier = NotificationService::new(Arc::clone(&supabase));

        Self {
            conflict,
            allocator,
            lifecycle: SessionLifecycleService::new(),
            notifier,
            gate: TenantGate::global(),
            supabase,
        }
    }

    /// Book a therapy session. Every policy, capacity, and overlap check
    /// runs before anything is persisted; a failing check aborts with its
    /// specific reason and no partial state.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
        actor: &User,
        auth_token: &str,
    ) -> Result<TherapySession, SessionError> {
        info!(
            "Booking {} session for patient {} at {}",
            request.therapy_type, request.patient_id, request.scheduled_at
        );

        if !can_schedule_sessions(actor) && actor.id != request.patient_id.to_string() {
            return Err(SessionError::Unauthorized(
                "Not allowed to book sessions for this patient".to_string(),
            ));
        }
        ensure_actor_tenant(actor, request.hospital_id)?;

        let hospital = self.fetch_hospital(request.hospital_id, auth_token).await?;

        // Hold the tenant gate across validate-then-insert so concurrent
        // bookings cannot both pass the same capacity check
        let _gate = self.gate.acquire(hospital.id).await;

        let validated = self
            .validate_schedule(
                &hospital,
                request.patient_id,
                &request.therapy_type,
                request.staff_id,
                request.room_id,
                request.scheduled_at,
                request.duration_minutes,
                None,
                actor,
                auth_token,
            )
            .await?;

        let status = if request.system_generated && actor.is_system() {
            SessionStatus::AwaitingConfirmation
        } else {
            SessionStatus::Scheduled
        };

        let session = self
            .insert_session(&request, &validated, status, auth_token)
            .await?;

        self.notifier.publish(
            NotificationEvent {
                hospital_id: session.hospital_id,
                recipient_id: Some(session.patient_id),
                title: "Therapy session booked".to_string(),
                message: format!(
                    "A {} session was booked for {} in {}",
                    session.therapy_type, session.scheduled_at, validated.room.name
                ),
            },
            auth_token,
        );

        info!("Session {} booked in room {}", session.id, session.room_id);
        Ok(session)
    }

    /// Reschedule or reassign a session. Rejected once care has started or
    /// the session is closed; schedule changes re-run the entire creation
    /// pipeline against the candidate values with the session's own prior
    /// occupancy excluded from every count.
    pub async fn modify_session(
        &self,
        session_id: Uuid,
        request: UpdateSessionRequest,
        actor: &User,
        auth_token: &str,
    ) -> Result<TherapySession, SessionError> {
        debug!("Modifying session {}", session_id);

        if request.doctor_approved.is_some() && !can_set_doctor_approval(actor) {
            return Err(SessionError::Unauthorized(
                "Only doctors may set doctor approval".to_string(),
            ));
        }
        if request.admin_approved.is_some() && !can_set_admin_approval(actor) {
            return Err(SessionError::Unauthorized(
                "Only administrators may set admin approval".to_string(),
            ));
        }
        if (request.touches_schedule() || request.observations.is_some())
            && !can_schedule_sessions(actor)
        {
            return Err(SessionError::Unauthorized(
                "Scheduling privilege required".to_string(),
            ));
        }

        let current = self.get_session(session_id, auth_token).await?;
        ensure_actor_tenant(actor, current.hospital_id)?;
        let hospital = self.fetch_hospital(current.hospital_id, auth_token).await?;
        let _gate = self.gate.acquire(hospital.id).await;

        let mut update = serde_json::Map::new();

        if request.touches_schedule() {
            if !self.lifecycle.can_modify(&current.status) {
                return Err(SessionError::InvalidStatusTransition(current.status));
            }

            let scheduled_at = request.scheduled_at.unwrap_or(current.scheduled_at);
            let duration_minutes = request.duration_minutes.unwrap_or(current.duration_minutes);
            let staff_id = request.staff_id.or(current.staff_id);
            let room_id = request.room_id.or(Some(current.room_id));

            let validated = self
                .validate_schedule(
                    &hospital,
                    current.patient_id,
                    &current.therapy_type,
                    staff_id,
                    room_id,
                    scheduled_at,
                    duration_minutes,
                    Some(current.id),
                    actor,
                    auth_token,
                )
                .await?;

            update.insert("scheduled_at".to_string(), json!(scheduled_at.to_rfc3339()));
            update.insert("duration_minutes".to_string(), json!(duration_minutes));
            update.insert("room_id".to_string(), json!(validated.room.id));
            update.insert("staff_id".to_string(), json!(validated.staff_id));
        }

        if request.doctor_approved.is_some() || request.admin_approved.is_some() {
            let mut approvals = current.approvals.clone();
            if let Some(flag) = request.doctor_approved {
                approvals.doctor_approved = flag;
            }
            if let Some(flag) = request.admin_approved {
                approvals.admin_approved = flag;
            }
            update.insert(
                "approvals".to_string(),
                serde_json::to_value(&approvals)
                    .map_err(|e| SessionError::Database(e.to_string()))?,
            );
        }

        if let Some(observations) = &request.observations {
            let mut outcomes = current.outcomes.clone();
            outcomes.observations = Some(observations.clone());
            update.insert(
                "outcomes".to_string(),
                serde_json::to_value(&outcomes)
                    .map_err(|e| SessionError::Database(e.to_string()))?,
            );
        }

        if update.is_empty() {
            return Ok(current);
        }

        update.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        let updated = self
            .patch_session(session_id, Value::Object(update), auth_token)
            .await?;

        info!("Session {} updated", session_id);
        Ok(updated)
    }

    /// Drive the session state machine. Entering `in_progress` stamps
    /// `outcomes.started_at` once; entering `completed` stamps
    /// `outcomes.completed_at` once.
    pub async fn transition_status(
        &self,
        session_id: Uuid,
        new_status: SessionStatus,
        actor: &User,
        auth_token: &str,
    ) -> Result<TherapySession, SessionError> {
        debug!("Transitioning session {} to {}", session_id, new_status);

        let current = self.get_session(session_id, auth_token).await?;
        ensure_actor_tenant(actor, current.hospital_id)?;
        let hospital = self.fetch_hospital(current.hospital_id, auth_token).await?;
        let _gate = self.gate.acquire(hospital.id).await;

        self.lifecycle
            .validate_status_transition(&current.status, &new_status)?;

        let is_own_session = actor.id == current.patient_id.to_string();
        match new_status {
            SessionStatus::Cancelled => {
                if !is_own_session && !can_schedule_sessions(actor) {
                    return Err(SessionError::Unauthorized(
                        "Not allowed to cancel this session".to_string(),
                    ));
                }
                // Cancellation honors the same lead-time floor, applied to
                // the session's existing start time
                if !is_tenant_superseding(actor) {
                    let earliest =
                        Utc::now() + ChronoDuration::hours(hospital.policies.lead_time_hours);
                    if current.scheduled_at < earliest {
                        return Err(SessionError::LeadTime(hospital.policies.lead_time_hours));
                    }
                }
            }
            _ => {
                if !can_schedule_sessions(actor) {
                    return Err(SessionError::Unauthorized(
                        "Scheduling privilege required".to_string(),
                    ));
                }
            }
        }

        let now = Utc::now();
        let mut outcomes = current.outcomes.clone();
        match new_status {
            SessionStatus::InProgress => {
                if outcomes.started_at.is_none() {
                    outcomes.started_at = Some(now);
                }
            }
            SessionStatus::Completed => {
                if outcomes.completed_at.is_none() {
                    outcomes.completed_at = Some(now);
                }
            }
            _ => {}
        }

        let update = json!({
            "status": new_status.to_string(),
            "outcomes": outcomes,
            "updated_at": now.to_rfc3339(),
        });

        let updated = self.patch_session(session_id, update, auth_token).await?;

        if new_status == SessionStatus::Cancelled {
            self.notifier.publish(
                NotificationEvent {
                    hospital_id: updated.hospital_id,
                    recipient_id: Some(updated.patient_id),
                    title: "Therapy session cancelled".to_string(),
                    message: format!(
                        "Your {} session scheduled for {} was cancelled",
                        updated.therapy_type, updated.scheduled_at
                    ),
                },
                auth_token,
            );
        }

        info!("Session {} transitioned to {}", session_id, new_status);
        Ok(updated)
    }

    /// Hard removal, permitted only with scheduling privilege and only
    /// before the lead-time cutoff relative to the session's current start.
    pub async fn delete_session(
        &self,
        session_id: Uuid,
        actor: &User,
        auth_token: &str,
    ) -> Result<(), SessionError> {
        if !can_schedule_sessions(actor) {
            return Err(SessionError::Unauthorized(
                "Scheduling privilege required".to_string(),
            ));
        }

        let current = self.get_session(session_id, auth_token).await?;
        ensure_actor_tenant(actor, current.hospital_id)?;
        let hospital = self.fetch_hospital(current.hospital_id, auth_token).await?;
        let _gate = self.gate.acquire(hospital.id).await;

        if !is_tenant_superseding(actor) {
            let earliest = Utc::now() + ChronoDuration::hours(hospital.policies.lead_time_hours);
            if current.scheduled_at < earliest {
                return Err(SessionError::LeadTime(hospital.policies.lead_time_hours));
            }
        }

        let path = format!("/rest/v1/sessions?id=eq.{}", session_id);
        self.supabase
            .request::<Value>(Method::DELETE, &path, Some(auth_token), None)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        info!("Session {} deleted", session_id);
        Ok(())
    }

    pub async fn get_session(
        &self,
        session_id: Uuid,
        auth_token: &str,
    ) -> Result<TherapySession, SessionError> {
        let path = format!("/rest/v1/sessions?id=eq.{}", session_id);
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(SessionError::NotFound);
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| SessionError::Database(format!("Failed to parse session: {}", e)))
    }

    pub async fn search_sessions(
        &self,
        query: SessionSearchQuery,
        auth_token: &str,
    ) -> Result<Vec<TherapySession>, SessionError> {
        debug!("Searching sessions with filters: {:?}", query);

        let mut query_parts = Vec::new();

        if let Some(hospital_id) = query.hospital_id {
            query_parts.push(format!("hospital_id=eq.{}", hospital_id));
        }
        if let Some(patient_id) = query.patient_id {
            query_parts.push(format!("patient_id=eq.{}", patient_id));
        }
        if let Some(staff_id) = query.staff_id {
            query_parts.push(format!("staff_id=eq.{}", staff_id));
        }
        if let Some(room_id) = query.room_id {
            query_parts.push(format!("room_id=eq.{}", room_id));
        }
        if let Some(status) = &query.status {
            query_parts.push(format!("status=eq.{}", status));
        }
        if let Some(therapy_type) = &query.therapy_type {
            query_parts.push(format!("therapy_type=eq.{}", normalize_therapy_key(therapy_type)));
        }
        if let Some(from_date) = query.from_date {
            query_parts.push(format!(
                "scheduled_at=gte.{}",
                urlencoding::encode(&from_date.to_rfc3339())
            ));
        }
        if let Some(to_date) = query.to_date {
            query_parts.push(format!(
                "scheduled_at=lte.{}",
                urlencoding::encode(&to_date.to_rfc3339())
            ));
        }

        let mut path = format!(
            "/rest/v1/sessions?{}&order=scheduled_at.desc",
            query_parts.join("&")
        );

        if let Some(limit) = query.limit {
            path.push_str(&format!("&limit={}", limit));
        }
        if let Some(offset) = query.offset {
            path.push_str(&format!("&offset={}", offset));
        }

        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<TherapySession>, _>>()
            .map_err(|e| SessionError::Database(format!("Failed to parse sessions: {}", e)))
    }

    /// Spare capacity per candidate room for a prospective window, using
    /// the same capacity semantics as booking itself.
    pub async fn room_availability(
        &self,
        query: RoomAvailabilityQuery,
        auth_token: &str,
    ) -> Result<Vec<RoomAvailability>, SessionError> {
        let hospital = self.fetch_hospital(query.hospital_id, auth_token).await?;
        let therapy_key = normalize_therapy_key(&query.therapy_type);
        let config = PolicyResolver::therapy_config(&hospital, &therapy_key);

        let scheduled_at = query.date.and_time(query.time).and_utc();
        let window = PolicyResolver::effective_window(
            scheduled_at,
            query.duration_minutes,
            config.buffer_minutes,
        );

        let rooms = self
            .allocator
            .fetch_active_rooms(hospital.id, auth_token)
            .await?;

        let mut availability = Vec::new();
        for room in rooms {
            if !ResourceAllocatorService::room_supports(&room, &therapy_key) {
                continue;
            }
            let check = self
                .conflict
                .room_capacity_check(&hospital, &room, window, None, auth_token)
                .await?;
            availability.push(RoomAvailability {
                occupied: check.occupied,
                capacity: check.capacity,
                available: (check.capacity - check.occupied).max(0),
                room,
            });
        }

        Ok(availability)
    }

    /// Run a prospective reschedule slot through the full validation
    /// pipeline (business day, lead time, caps, overlaps, room capacity)
    /// without moving the session. Used by the reschedule workflow to tell
    /// a requester immediately whether their preference is plausible.
    pub async fn validate_reschedule_candidate(
        &self,
        hospital: &Hospital,
        session: &TherapySession,
        scheduled_at: DateTime<Utc>,
        actor: &User,
        auth_token: &str,
    ) -> Result<(), SessionError> {
        self.validate_schedule(
            hospital,
            session.patient_id,
            &session.therapy_type,
            session.staff_id,
            Some(session.room_id),
            scheduled_at,
            session.duration_minutes,
            Some(session.id),
            actor,
            auth_token,
        )
        .await
        .map(|_| ())
    }

    pub async fn fetch_hospital(
        &self,
        hospital_id: Uuid,
        auth_token: &str,
    ) -> Result<Hospital, SessionError> {
        let path = format!("/rest/v1/hospitals?id=eq.{}", hospital_id);
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(SessionError::HospitalNotFound);
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| SessionError::Database(format!("Failed to parse hospital: {}", e)))
    }

    // ==============================================================================
    // PRIVATE HELPER METHODS
    // ==============================================================================

    /// The validation pipeline shared by creation, modification, and (via
    /// those) the reschedule workflow and the background worker. Order:
    /// input shape, business day, lead time, daily caps, person overlaps,
    /// then room allocation.
    #[allow(clippy::too_many_arguments)]
    async fn validate_schedule(
        &self,
        hospital: &Hospital,
        patient_id: Uuid,
        therapy_raw: &str,
        staff_id: Option<Uuid>,
        room_id: Option<Uuid>,
        scheduled_at: DateTime<Utc>,
        duration_minutes: i32,
        exclude_session_id: Option<Uuid>,
        actor: &User,
        auth_token: &str,
    ) -> Result<ValidatedSchedule, SessionError> {
        let therapy_key = normalize_therapy_key(therapy_raw);
        if therapy_key.is_empty() {
            return Err(SessionError::Validation("Therapy type is required".to_string()));
        }
        if duration_minutes < MIN_SESSION_MINUTES {
            return Err(SessionError::Validation(format!(
                "Session duration must be at least {} minutes",
                MIN_SESSION_MINUTES
            )));
        }

        let config = PolicyResolver::therapy_config(hospital, &therapy_key);
        let window =
            PolicyResolver::effective_window(scheduled_at, duration_minutes, config.buffer_minutes);

        PolicyResolver::validate_business_day(hospital, &therapy_key, window)?;

        if !is_tenant_superseding(actor) {
            let earliest = Utc::now() + ChronoDuration::hours(hospital.policies.lead_time_hours);
            if scheduled_at < earliest {
                return Err(SessionError::LeadTime(hospital.policies.lead_time_hours));
            }
        }

        let date = scheduled_at.date_naive();

        let patient_count = self
            .conflict
            .count_sessions_on_day(
                hospital.id,
                ResourceKind::Patient,
                patient_id,
                date,
                exclude_session_id,
                auth_token,
            )
            .await?;
        if patient_count as i32 >= hospital.policies.max_sessions_per_patient_per_day {
            return Err(SessionError::PatientDailyCap);
        }

        if self
            .conflict
            .has_overlap(
                hospital,
                ResourceKind::Patient,
                patient_id,
                window,
                exclude_session_id,
                auth_token,
            )
            .await?
        {
            return Err(SessionError::PatientOverlap);
        }

        let staff_id = match staff_id {
            Some(id) => {
                self.check_staff_availability(hospital, id, window, exclude_session_id, auth_token)
                    .await?;
                Some(id)
            }
            None if hospital.policies.auto_assign_staff => {
                self.auto_assign_staff(hospital, &therapy_key, window, exclude_session_id, auth_token)
                    .await?
            }
            None => None,
        };

        let room = self
            .allocator
            .allocate_room(
                hospital,
                &therapy_key,
                window,
                room_id,
                exclude_session_id,
                auth_token,
            )
            .await?;

        Ok(ValidatedSchedule {
            room,
            staff_id,
            therapy_key,
        })
    }

    async fn check_staff_availability(
        &self,
        hospital: &Hospital,
        staff_id: Uuid,
        window: SessionWindow,
        exclude_session_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<(), SessionError> {
        let date = window.start.date_naive();

        let staff_count = self
            .conflict
            .count_sessions_on_day(
                hospital.id,
                ResourceKind::Staff,
                staff_id,
                date,
                exclude_session_id,
                auth_token,
            )
            .await?;
        if staff_count as i32 >= hospital.policies.max_sessions_per_staff_per_day {
            return Err(SessionError::StaffDailyCap);
        }

        if self
            .conflict
            .has_overlap(
                hospital,
                ResourceKind::Staff,
                staff_id,
                window,
                exclude_session_id,
                auth_token,
            )
            .await?
        {
            return Err(SessionError::StaffOverlap);
        }

        Ok(())
    }

    /// Least-loaded candidate who also clears the daily cap and overlap
    /// checks for this window. Leaves the session unassigned when nobody
    /// qualifies; assignment can happen later through modification.
    async fn auto_assign_staff(
        &self,
        hospital: &Hospital,
        therapy_key: &str,
        window: SessionWindow,
        exclude_session_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<Option<Uuid>, SessionError> {
        let mut candidates = self
            .allocator
            .fetch_staff_candidates(hospital.id, therapy_key, auth_token)
            .await?;

        let date = window.start.date_naive();
        while !candidates.is_empty() {
            let Some(staff_id) = self
                .allocator
                .allocate_staff(hospital.id, &candidates, date, auth_token)
                .await?
            else {
                break;
            };

            if self
                .check_staff_availability(hospital, staff_id, window, exclude_session_id, auth_token)
                .await
                .is_ok()
            {
                return Ok(Some(staff_id));
            }
            candidates.retain(|id| *id != staff_id);
        }

        debug!("No staff candidate free for window starting {}", window.start);
        Ok(None)
    }

    async fn insert_session(
        &self,
        request: &CreateSessionRequest,
        validated: &ValidatedSchedule,
        status: SessionStatus,
        auth_token: &str,
    ) -> Result<TherapySession, SessionError> {
        let now = Utc::now();

        let session_data = json!({
            "hospital_id": request.hospital_id,
            "patient_id": request.patient_id,
            "staff_id": validated.staff_id,
            "therapy_type": validated.therapy_key,
            "room_id": validated.room.id,
            "scheduled_at": request.scheduled_at.to_rfc3339(),
            "duration_minutes": request.duration_minutes,
            "status": status.to_string(),
            "approvals": { "doctor_approved": false, "admin_approved": false },
            "outcomes": { "started_at": null, "completed_at": null, "observations": null },
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let result = self
            .supabase
            .insert_returning("/rest/v1/sessions", Some(auth_token), session_data)
            .await
            .map_err(|e| {
                warn!("Session insert failed: {}", e);
                SessionError::Database(e.to_string())
            })?;

        let created = result
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::Database("Failed to create session".to_string()))?;

        serde_json::from_value(created)
            .map_err(|e| SessionError::Database(format!("Failed to parse created session: {}", e)))
    }

    async fn patch_session(
        &self,
        session_id: Uuid,
        body: Value,
        auth_token: &str,
    ) -> Result<TherapySession, SessionError> {
        let path = format!("/rest/v1/sessions?id=eq.{}", session_id);
        let result = self
            .supabase
            .patch_returning(&path, Some(auth_token), body)
            .await
            .map_err(|e| SessionError::Database(e.to_string()))?;

        let updated = result
            .into_iter()
            .next()
            .ok_or(SessionError::NotFound)?;

        serde_json::from_value(updated)
            .map_err(|e| SessionError::Database(format!("Failed to parse updated session: {}", e)))
    }
}
