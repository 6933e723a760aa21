// libs/scheduler-worker-cell/src/models.rs
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_config::AppConfig;

/// One prescribed therapy course on a prescription; the generation source
/// for the plan-materialization sweep. Owned by clinical-records CRUD and
/// consumed read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TherapyPlanEntry {
    pub name: String,
    pub plan_sessions: i32,
    pub plan_interval_days: i32,
    pub plan_start_date: NaiveDate,
    pub plan_duration_min: i32,
    pub plan_preferred_time: Option<NaiveTime>,
    /// Weekday keys ("mon".."sun"); empty means any weekday.
    #[serde(default)]
    pub plan_preferred_days: Vec<String>,
    pub plan_assigned_staff_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prescription {
    pub id: Uuid,
    pub hospital_id: Uuid,
    pub patient_id: Uuid,
    #[serde(default)]
    pub therapies: Vec<TherapyPlanEntry>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub tick_interval_seconds: u64,
    pub horizon_days: i64,
    pub tick_budget_seconds: u64,
}

impl WorkerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tick_interval_seconds: config.scheduler_tick_interval_seconds,
            horizon_days: config.scheduler_horizon_days,
            tick_budget_seconds: config.scheduler_tick_budget_seconds,
        }
    }
}

/// Outcome of one tick; kept around for the status endpoint and the logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// A previous tick was still running, so this one did nothing.
    pub skipped: bool,
    pub hospitals_scanned: usize,
    pub sessions_created: usize,
    /// Idempotency skips: a matching session already existed.
    pub occurrences_existing: usize,
    /// Occurrences rejected by the validation pipeline.
    pub occurrences_rejected: usize,
    pub requests_approved: usize,
    pub requests_cleaned: usize,
    pub budget_exhausted: bool,
}

impl SweepReport {
    pub fn skipped_tick() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Database(String),
}
