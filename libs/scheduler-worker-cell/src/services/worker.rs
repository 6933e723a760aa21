// libs/scheduler-worker-cell/src/services/worker.rs
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Datelike, Duration, Utc};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::auth::User;

use reschedule_cell::models::RescheduleAction;
use reschedule_cell::services::requests::RescheduleRequestService;
use scheduling_cell::models::{CreateSessionRequest, Hospital};
use scheduling_cell::services::booking::SessionBookingService;
use scheduling_cell::services::policy::{normalize_therapy_key, weekday_key, PolicyResolver};

use crate::models::{Prescription, SweepReport, TherapyPlanEntry, WorkerConfig, WorkerError};

/// Background scheduler: a singleton timer process that materializes
/// sessions from therapy plans and tries to satisfy pending reschedule
/// requests. It drives the same booking and reschedule primitives as the
/// interactive API, as a system actor bound by every tenant policy.
pub struct PlanSchedulerWorker {
    config: WorkerConfig,
    supabase: Arc<SupabaseClient>,
    booking: SessionBookingService,
    reschedule: RescheduleRequestService,
    service_token: String,
    is_shutdown: RwLock<bool>,
    /// A tick that fires while the previous one is still running is
    /// skipped, never queued.
    tick_lock: Mutex<()>,
    last_report: RwLock<Option<SweepReport>>,
}

impl PlanSchedulerWorker {
    pub fn new(config: &AppConfig) -> Self {
        let supabase = Arc::new(SupabaseClient::new(config));
        Self {
            config: WorkerConfig::from_app_config(config),
            booking: SessionBookingService::with_client(Arc::clone(&supabase)),
            reschedule: RescheduleRequestService::with_client(Arc::clone(&supabase)),
            service_token: config.supabase_service_key.clone(),
            supabase,
            is_shutdown: RwLock::new(false),
            tick_lock: Mutex::new(()),
            last_report: RwLock::new(None),
        }
    }

    /// Run the timer loop until `stop()` is called.
    pub async fn start(self: Arc<Self>) {
        info!(
            "Starting plan scheduler (every {}s, horizon {} days)",
            self.config.tick_interval_seconds, self.config.horizon_days
        );

        let mut interval =
            tokio::time::interval(StdDuration::from_secs(self.config.tick_interval_seconds));
        // The first tick of tokio's interval fires immediately; skip it so
        // startup does not race application wiring
        interval.tick().await;

        loop {
            interval.tick().await;
            if *self.is_shutdown.read().await {
                break;
            }
            match self.run_tick().await {
                Ok(report) if report.skipped => {}
                Ok(report) => debug!("Scheduler tick finished: {:?}", report),
                Err(e) => error!("Scheduler tick failed: {}", e),
            }
        }

        info!("Plan scheduler stopped");
    }

    pub async fn stop(&self) {
        info!("Stopping plan scheduler");
        let mut is_shutdown = self.is_shutdown.write().await;
        *is_shutdown = true;
    }

    pub async fn last_report(&self) -> Option<SweepReport> {
        self.last_report.read().await.clone()
    }

    /// One full pass over every tenant: plan materialization, then
    /// reschedule maintenance. Each sweep is isolated from the other's
    /// failures, and one tenant's failure never stops the others.
    #[instrument(skip(self))]
    pub async fn run_tick(&self) -> Result<SweepReport, WorkerError> {
        let _guard = match self.tick_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Previous scheduler tick still running, skipping");
                return Ok(SweepReport::skipped_tick());
            }
        };

        let started = Instant::now();
        let budget = StdDuration::from_secs(self.config.tick_budget_seconds);
        let mut report = SweepReport::default();

        // Tenant configuration is re-read every sweep so administrator
        // edits take effect promptly
        let hospitals = self.fetch_hospitals().await?;
        report.hospitals_scanned = hospitals.len();

        for hospital in &hospitals {
            if started.elapsed() > budget {
                warn!("Tick budget exhausted during plan sweep, yielding");
                report.budget_exhausted = true;
                break;
            }
            if let Err(e) = self
                .materialize_plans(hospital, started, budget, &mut report)
                .await
            {
                warn!("Plan sweep failed for hospital {}: {}", hospital.id, e);
            }
        }

        for hospital in &hospitals {
            if started.elapsed() > budget {
                warn!("Tick budget exhausted during reschedule sweep, yielding");
                report.budget_exhausted = true;
                break;
            }
            if let Err(e) = self.process_reschedules(hospital, &mut report).await {
                warn!("Reschedule sweep failed for hospital {}: {}", hospital.id, e);
            }
        }

        info!(
            "Scheduler tick: {} hospitals, {} created, {} existing, {} rejected, {} approved, {} cleaned",
            report.hospitals_scanned,
            report.sessions_created,
            report.occurrences_existing,
            report.occurrences_rejected,
            report.requests_approved,
            report.requests_cleaned
        );

        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    // ==============================================================================
    // PLAN MATERIALIZATION SWEEP
    // ==============================================================================

    async fn materialize_plans(
        &self,
        hospital: &Hospital,
        started: Instant,
        budget: StdDuration,
        report: &mut SweepReport,
    ) -> Result<(), WorkerError> {
        let prescriptions = self.fetch_prescriptions(hospital.id).await?;
        let now = Utc::now();

        for prescription in &prescriptions {
            for entry in &prescription.therapies {
                for occurrence in
                    plan_occurrences(entry, hospital, now, self.config.horizon_days)
                {
                    if started.elapsed() > budget {
                        report.budget_exhausted = true;
                        return Ok(());
                    }
                    self.materialize_occurrence(hospital, prescription, entry, occurrence, report)
                        .await;
                }
            }
        }

        Ok(())
    }

    /// Create one planned occurrence unless an identical session already
    /// exists. Rejections are logged and skipped; they never abort the
    /// sweep for other occurrences, plans, or tenants.
    async fn materialize_occurrence(
        &self,
        hospital: &Hospital,
        prescription: &Prescription,
        entry: &TherapyPlanEntry,
        occurrence: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let therapy_key = normalize_therapy_key(&entry.name);

        match self
            .session_exists(hospital.id, prescription.patient_id, &therapy_key, occurrence)
            .await
        {
            Ok(true) => {
                report.occurrences_existing += 1;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Idempotency check failed, skipping occurrence: {}", e);
                report.occurrences_rejected += 1;
                return;
            }
        }

        let request = CreateSessionRequest {
            hospital_id: hospital.id,
            patient_id: prescription.patient_id,
            therapy_type: entry.name.clone(),
            staff_id: entry.plan_assigned_staff_id,
            room_id: None,
            scheduled_at: occurrence,
            duration_minutes: entry.plan_duration_min,
            system_generated: true,
        };

        match self
            .booking
            .create_session(request, &User::system(), &self.service_token)
            .await
        {
            Ok(session) => {
                debug!(
                    "Materialized {} session {} for patient {} at {}",
                    therapy_key, session.id, prescription.patient_id, occurrence
                );
                report.sessions_created += 1;
            }
            Err(e) => {
                debug!(
                    "Skipping {} occurrence at {} for patient {}: {} ({})",
                    therapy_key,
                    occurrence,
                    prescription.patient_id,
                    e,
                    e.code()
                );
                report.occurrences_rejected += 1;
            }
        }
    }

    // ==============================================================================
    // RESCHEDULE MAINTENANCE SWEEP
    // ==============================================================================

    async fn process_reschedules(
        &self,
        hospital: &Hospital,
        report: &mut SweepReport,
    ) -> Result<(), WorkerError> {
        let cleaned = self
            .reschedule
            .cleanup_stale(hospital.id, &self.service_token)
            .await
            .map_err(|e| WorkerError::Database(e.to_string()))?;
        report.requests_cleaned += cleaned;

        let pending = self
            .reschedule
            .pending_with_preference(hospital.id, &self.service_token)
            .await
            .map_err(|e| WorkerError::Database(e.to_string()))?;

        for request in pending {
            match self
                .reschedule
                .act(
                    request.id,
                    RescheduleAction::Approved,
                    &User::system(),
                    &self.service_token,
                )
                .await
            {
                Ok(_) => report.requests_approved += 1,
                // Not satisfiable right now; a human or a later tick gets it
                Err(e) => debug!(
                    "Leaving reschedule request {} pending: {} ({})",
                    request.id,
                    e,
                    e.code()
                ),
            }
        }

        Ok(())
    }

    // ==============================================================================
    // PRIVATE HELPER METHODS
    // ==============================================================================

    async fn fetch_hospitals(&self) -> Result<Vec<Hospital>, WorkerError> {
        let result: Vec<Value> = self
            .supabase
            .request(
                Method::GET,
                "/rest/v1/hospitals?order=id.asc",
                Some(&self.service_token),
                None,
            )
            .await
            .map_err(|e| WorkerError::Database(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Hospital>, _>>()
            .map_err(|e| WorkerError::Database(format!("Failed to parse hospitals: {}", e)))
    }

    async fn fetch_prescriptions(&self, hospital_id: Uuid) -> Result<Vec<Prescription>, WorkerError> {
        let path = format!("/rest/v1/prescriptions?hospital_id=eq.{}", hospital_id);
        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(&self.service_token), None)
            .await
            .map_err(|e| WorkerError::Database(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Prescription>, _>>()
            .map_err(|e| WorkerError::Database(format!("Failed to parse prescriptions: {}", e)))
    }

    /// Idempotency probe: a session for the same tenant, patient, therapy
    /// and exact timestamp in any status means this occurrence was already
    /// materialized (or deliberately cancelled).
    async fn session_exists(
        &self,
        hospital_id: Uuid,
        patient_id: Uuid,
        therapy_key: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, WorkerError> {
        let path = format!(
            "/rest/v1/sessions?hospital_id=eq.{}&patient_id=eq.{}&therapy_type=eq.{}&scheduled_at=eq.{}",
            hospital_id,
            patient_id,
            therapy_key,
            urlencoding::encode(&scheduled_at.to_rfc3339())
        );

        let result: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, Some(&self.service_token), None)
            .await
            .map_err(|e| WorkerError::Database(e.to_string()))?;

        Ok(!result.is_empty())
    }
}

/// Prospective occurrence instants for one plan entry: `plan_start_date +
/// i × interval` for `i` in `[0, plan_sessions)`, filtered to the rolling
/// horizon, the future, and the plan's preferred weekdays. Time of day is
/// the plan's preference, else the weekday's business-window open.
pub fn plan_occurrences(
    entry: &TherapyPlanEntry,
    hospital: &Hospital,
    now: DateTime<Utc>,
    horizon_days: i64,
) -> Vec<DateTime<Utc>> {
    let mut occurrences = Vec::new();
    if entry.plan_sessions <= 0 || entry.plan_interval_days <= 0 {
        return occurrences;
    }

    let horizon_end = now + Duration::days(horizon_days);

    for i in 0..entry.plan_sessions {
        let date = entry.plan_start_date
            + Duration::days(i as i64 * entry.plan_interval_days as i64);

        if !entry.plan_preferred_days.is_empty() {
            let key = weekday_key(date.weekday());
            if !entry
                .plan_preferred_days
                .iter()
                .any(|day| day.eq_ignore_ascii_case(key))
            {
                continue;
            }
        }

        let time = entry
            .plan_preferred_time
            .or_else(|| PolicyResolver::business_window(hospital, date.weekday()).map(|w| w.open));
        let Some(time) = time else {
            // Closed all day; the occurrence has no slot to anchor to
            continue;
        };

        let occurrence = date.and_time(time).and_utc();
        if occurrence <= now || occurrence > horizon_end {
            continue;
        }

        occurrences.push(occurrence);
    }

    occurrences
}
