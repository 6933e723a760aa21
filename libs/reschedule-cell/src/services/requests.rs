// libs/reschedule-cell/src/services/requests.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::auth::{
    can_manage_reschedule, can_request_reschedule, can_request_reschedule_for_others,
    is_tenant_superseding, User,
};

use scheduling_cell::models::{
    NotificationEvent, TherapySession, UpdateSessionRequest,
};
use scheduling_cell::services::booking::SessionBookingService;
use scheduling_cell::services::notify::NotificationService;

use crate::models::{
    CreateRescheduleRequest, RescheduleAction, RescheduleError, RescheduleListQuery,
    RescheduleRequest, RescheduleStatus,
};

/// Owns every mutation of the reschedule_requests table. Session moves
/// always go through the booking service so the two records never diverge.
pub struct RescheduleRequestService {
    supabase: Arc<SupabaseClient>,
    booking: SessionBookingService,
    notifier: NotificationService,
}

impl RescheduleRequestService {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_client(Arc::new(SupabaseClient::new(config)))
    }

    pub fn with_client(supabase: Arc<SupabaseClient>) -> Self {
        let booking = SessionBookingService::with_client(Arc::clone(&supabase));
        let notifier = NotificationService::new(Arc::clone(&supabase));
        Self {
            supabase,
            booking,
            notifier,
        }
    }

    /// File a reschedule request for a session. Enforces the single-pending
    /// rule and the requester's weekly rate limit; when a preferred slot is
    /// given it is validated through the same pipeline as a real booking so
    /// the requester learns immediately whether it is plausible.
    pub async fn create_request(
        &self,
        session_id: Uuid,
        request: CreateRescheduleRequest,
        actor: &User,
        auth_token: &str,
    ) -> Result<RescheduleRequest, RescheduleError> {
        info!("Reschedule request for session {} by {}", session_id, actor.id);

        if request.reason.trim().is_empty() {
            return Err(RescheduleError::Validation("A reason is required".to_string()));
        }

        let session = self
            .booking
            .get_session(session_id, auth_token)
            .await
            .map_err(|e| match e {
                scheduling_cell::models::SessionError::NotFound => RescheduleError::SessionNotFound,
                other => RescheduleError::Session(other),
            })?;

        self.authorize_requester(actor, &session)?;

        if session.status.is_terminal() {
            return Err(RescheduleError::Validation(
                "Completed or cancelled sessions cannot be rescheduled".to_string(),
            ));
        }

        // At most one request in flight per session
        let pending = self
            .requests_for_session(session_id, RescheduleStatus::Pending, auth_token)
            .await?;
        if !pending.is_empty() {
            return Err(RescheduleError::AlreadyPending);
        }

        let hospital = self
            .booking
            .fetch_hospital(session.hospital_id, auth_token)
            .await?;

        // Trailing-7-day rate limit, counted per requester across all of
        // their sessions regardless of how those requests ended up
        let weekly_cap = hospital.policies.max_reschedule_requests_per_week;
        let window_start = Utc::now() - ChronoDuration::days(7);
        let recent = self
            .count_requests_by(&actor.id, session.hospital_id, window_start, auth_token)
            .await?;
        if recent as i32 >= weekly_cap {
            return Err(RescheduleError::RateLimited(weekly_cap));
        }

        // Early plausibility check of the preferred slot; the session is
        // not moved here
        if let Some(candidate) = Self::candidate_start(&request, &session) {
            self.booking
                .validate_reschedule_candidate(&hospital, &session, candidate, actor, auth_token)
                .await?;
        }

        let now = Utc::now();
        let request_data = json!({
            "hospital_id": session.hospital_id,
            "session_id": session_id,
            "requested_date": request.requested_date,
            "requested_time": request.requested_time,
            "reason": request.reason,
            "status": RescheduleStatus::Pending.to_string(),
            "requested_by": actor.id,
            "created_at": now.to_rfc3339(),
        });

        let result = self
            .supabase
            .insert_returning("/rest/v1/reschedule_requests", Some(auth_token), request_data)
            .await
            .map_err(|e| RescheduleError::Database(e.to_string()))?;

        let created: RescheduleRequest = result
            .into_iter()
            .next()
            .ok_or_else(|| RescheduleError::Database("Failed to create request".to_string()))
            .and_then(|value| {
                serde_json::from_value(value)
                    .map_err(|e| RescheduleError::Database(format!("Failed to parse request: {}", e)))
            })?;

        self.notifier.publish(
            NotificationEvent {
                hospital_id: session.hospital_id,
                recipient_id: None,
                title: "Reschedule requested".to_string(),
                message: format!(
                    "A reschedule was requested for the {} session on {}",
                    session.therapy_type, session.scheduled_at
                ),
            },
            auth_token,
        );

        info!("Reschedule request {} created", created.id);
        Ok(created)
    }

    /// Resolve a pending request. Approval moves the session first and only
    /// then marks the request, so the two can never diverge.
    pub async fn act(
        &self,
        request_id: Uuid,
        decision: RescheduleAction,
        actor: &User,
        auth_token: &str,
    ) -> Result<RescheduleRequest, RescheduleError> {
        debug!("Acting on reschedule request {}: {:?}", request_id, decision);

        if !can_manage_reschedule(actor) {
            return Err(RescheduleError::Unauthorized(
                "Reschedule management privilege required".to_string(),
            ));
        }

        let request = self.get_request(request_id, auth_token).await?;
        let in_tenant = actor.hospital_id == Some(request.hospital_id)
            || is_tenant_superseding(actor)
            || actor.is_system();
        if !in_tenant {
            return Err(RescheduleError::Unauthorized(
                "Not authorized for this hospital".to_string(),
            ));
        }
        if request.status != RescheduleStatus::Pending {
            return Err(RescheduleError::InvalidState(request.status));
        }

        let new_status = match decision {
            RescheduleAction::Approved => {
                let session = self
                    .booking
                    .get_session(request.session_id, auth_token)
                    .await?;

                let candidate = Self::candidate_start_from_request(&request, &session)
                    .ok_or_else(|| {
                        RescheduleError::Validation(
                            "Request carries no preferred date to approve".to_string(),
                        )
                    })?;

                let patch = UpdateSessionRequest {
                    scheduled_at: Some(candidate),
                    ..Default::default()
                };
                self.booking
                    .modify_session(request.session_id, patch, actor, auth_token)
                    .await?;

                RescheduleStatus::Approved
            }
            RescheduleAction::Rejected => RescheduleStatus::Rejected,
            RescheduleAction::Cancelled => RescheduleStatus::Cancelled,
        };

        let updated = self
            .mark_request(&request, new_status, &actor.id, auth_token)
            .await?;

        if let Ok(recipient) = Uuid::parse_str(&updated.requested_by) {
            self.notifier.publish(
                NotificationEvent {
                    hospital_id: updated.hospital_id,
                    recipient_id: Some(recipient),
                    title: format!("Reschedule request {}", updated.status),
                    message: format!(
                        "Your reschedule request for session {} was {}",
                        updated.session_id, updated.status
                    ),
                },
                auth_token,
            );
        }

        info!("Reschedule request {} {}", request_id, updated.status);
        Ok(updated)
    }

    /// Requests visible to the actor: their own, or the whole hospital for
    /// privileged staff.
    pub async fn list_requests(
        &self,
        hospital_id: Uuid,
        query: RescheduleListQuery,
        actor: &User,
        auth_token: &str,
    ) -> Result<Vec<RescheduleRequest>, RescheduleError> {
        let mut query_parts = vec![format!("hospital_id=eq.{}", hospital_id)];

        if !can_manage_reschedule(actor) {
            query_parts.push(format!("requested_by=eq.{}", actor.id));
        }
        if let Some(session_id) = query.session_id {
            query_parts.push(format!("session_id=eq.{}", session_id));
        }
        if let Some(status) = &query.status {
            query_parts.push(format!("status=eq.{}", status));
        }

        let mut path = format!(
            "/rest/v1/reschedule_requests?{}&order=created_at.desc",
            query_parts.join("&")
        );
        if let Some(limit) = query.limit {
            path.push_str(&format!("&limit={}", limit));
        }
        if let Some(offset) = query.offset {
            path.push_str(&format!("&offset={}", offset));
        }

        self.fetch_requests(&path, auth_token).await
    }

    /// Bulk-cancel pending requests older than the tenant's
    /// `stale_request_hours`. Idempotent; only touches requests already past
    /// their window, so it is safe to run concurrently with anything else.
    pub async fn cleanup_stale(
        &self,
        hospital_id: Uuid,
        auth_token: &str,
    ) -> Result<usize, RescheduleError> {
        let hospital = self.booking.fetch_hospital(hospital_id, auth_token).await?;
        let cutoff = Utc::now() - ChronoDuration::hours(hospital.policies.stale_request_hours);

        let path = format!(
            "/rest/v1/reschedule_requests?hospital_id=eq.{}&status=eq.pending&created_at=lt.{}",
            hospital_id,
            urlencoding::encode(&cutoff.to_rfc3339())
        );

        let body = json!({
            "status": RescheduleStatus::Cancelled.to_string(),
            "processed_by": shared_models::auth::SYSTEM_ACTOR_ID,
            "processed_at": Utc::now().to_rfc3339(),
        });

        let result = self
            .supabase
            .patch_returning(&path, Some(auth_token), body)
            .await
            .map_err(|e| RescheduleError::Database(e.to_string()))?;

        let cleaned = result.len();
        if cleaned > 0 {
            info!(
                "Cancelled {} stale reschedule requests for hospital {}",
                cleaned, hospital_id
            );
        }
        Ok(cleaned)
    }

    /// Pending requests that carry an explicit preferred date; the
    /// background scheduler tries to satisfy these automatically.
    pub async fn pending_with_preference(
        &self,
        hospital_id: Uuid,
        auth_token: &str,
    ) -> Result<Vec<RescheduleRequest>, RescheduleError> {
        let path = format!(
            "/rest/v1/reschedule_requests?hospital_id=eq.{}&status=eq.pending&requested_date=not.is.null&order=created_at.asc",
            hospital_id
        );
        self.fetch_requests(&path, auth_token).await
    }

    pub async fn get_request(
        &self,
        request_id: Uuid,
        auth_token: &str,
    ) -> Result<RescheduleRequest, RescheduleError> {
        let path = format!("/rest/v1/reschedule_requests?id=eq.{}", request_id);
        let requests = self.fetch_requests(&path, auth_token).await?;
        requests.into_iter().next().ok_or(RescheduleError::NotFound)
    }

    // ==============================================================================
    // PRIVATE HELPER METHODS
    // ==============================================================================

    fn authorize_requester(
        &self,
        actor: &User,
        session: &TherapySession,
    ) -> Result<(), RescheduleError> {
        let is_own_session = actor.id == session.patient_id.to_string();
        let in_tenant = actor.hospital_id == Some(session.hospital_id)
            || is_tenant_superseding(actor)
            || actor.is_system();

        let authorized = can_request_reschedule(actor)
            && (is_own_session || (can_request_reschedule_for_others(actor) && in_tenant));

        if authorized {
            Ok(())
        } else {
            Err(RescheduleError::Unauthorized(
                "Only the session's patient, their guardian, or scheduling staff may request a reschedule"
                    .to_string(),
            ))
        }
    }

    /// The prospective new start: preferred date plus preferred time,
    /// falling back to the session's current time of day.
    fn candidate_start(
        request: &CreateRescheduleRequest,
        session: &TherapySession,
    ) -> Option<DateTime<Utc>> {
        request.requested_date.map(|date| {
            let time = request.requested_time.unwrap_or(session.scheduled_at.time());
            date.and_time(time).and_utc()
        })
    }

    fn candidate_start_from_request(
        request: &RescheduleRequest,
        session: &TherapySession,
    ) -> Option<DateTime<Utc>> {
        request.requested_date.map(|date| {
            let time = request.requested_time.unwrap_or(session.scheduled_at.time());
            date.and_time(time).and_utc()
        })
    }

    async fn mark_request(
        &self,
        request: &RescheduleRequest,
        status: RescheduleStatus,
        processed_by: &str,
        auth_token: &str,
    ) -> Result<RescheduleRequest, RescheduleError> {
        let path = format!("/rest/v1/reschedule_requests?id=eq.{}", request.id);
        let body = json!({
            "status": status.to_string(),
            "processed_by": processed_by,
            "processed_at": Utc::now().to_rfc3339(),
        });

        let result = self
            .supabase
            .patch_returning(&path, Some(auth_token), body)
            .await
            .map_err(|e| RescheduleError::Database(e.to_string()))?;

        result
            .into_iter()
            .next()
            .ok_or(RescheduleError::NotFound)
            .and_then(|value| {
                serde_json::from_value(value)
                    .map_err(|e| RescheduleError::Database(format!("Failed to parse request: {}", e)))
            })
    }

    async fn requests_for_session(
        &self,
        session_id: Uuid,
        status: RescheduleStatus,
        auth_token: &str,
    ) -> Result<Vec<RescheduleRequest>, RescheduleError> {
        let path = format!(
            "/rest/v1/reschedule_requests?session_id=eq.{}&status=eq.{}",
            session_id, status
        );
        self.fetch_requests(&path, auth_token).await
    }

    async fn count_requests_by(
        &self,
        requester: &str,
        hospital_id: Uuid,
        since: DateTime<Utc>,
        auth_token: &str,
    ) -> Result<usize, RescheduleError> {
        let path = format!(
            "/rest/v1/reschedule_requests?hospital_id=eq.{}&requested_by=eq.{}&created_at=gte.{}",
            hospital_id,
            requester,
            urlencoding::encode(&since.to_rfc3339())
        );
        let requests = self.fetch_requests(&path, auth_token).await?;
        Ok(requests.len())
    }

    async fn fetch_requests(
        &self,
        path: &str,
        auth_token: &str,
    ) -> Result<Vec<RescheduleRequest>, RescheduleError> {
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, path, Some(auth_token), None)
            .await
            .map_err(|e| {
                warn!("Reschedule request query failed: {}", e);
                RescheduleError::Database(e.to_string())
            })?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<RescheduleRequest>, _>>()
            .map_err(|e| RescheduleError::Database(format!("Failed to parse requests: {}", e)))
    }
}
