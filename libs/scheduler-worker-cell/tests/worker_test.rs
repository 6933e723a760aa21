// libs/scheduler-worker-cell/tests/worker_test.rs
//
// Integration tests for the background scheduler sweeps against a mocked
// PostgREST backend.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scheduler_worker_cell::PlanSchedulerWorker;
use shared_config::AppConfig;

// ==============================================================================
// TEST FIXTURES AND UTILITIES
// ==============================================================================

struct TestSetup {
    worker: PlanSchedulerWorker,
    mock_server: MockServer,
    hospital_id: Uuid,
    patient_id: Uuid,
    room_id: Uuid,
}

impl TestSetup {
    async fn new() -> Self {
        let mock_server = MockServer::start().await;

        let config = AppConfig {
            supabase_url: mock_server.uri(),
            supabase_anon_key: "test-anon-key".to_string(),
            supabase_service_key: "test-service-key".to_string(),
            supabase_jwt_secret: "test-secret".to_string(),
            scheduler_tick_interval_seconds: 300,
            scheduler_horizon_days: 14,
            scheduler_tick_budget_seconds: 60,
        };

        Mock::given(method("POST"))
            .and(path("/rest/v1/notifications"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
            .mount(&mock_server)
            .await;

        Self {
            worker: PlanSchedulerWorker::new(&config),
            mock_server,
            hospital_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
        }
    }

    /// Hospital open 09:00-17:00 every day of the week, lead time 2h.
    async fn mount_hospital(&self, blackout_dates: Vec<String>) {
        let window = json!({ "open": "09:00:00", "close": "17:00:00" });
        Mock::given(method("GET"))
            .and(path("/rest/v1/hospitals"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![json!({
                "id": self.hospital_id,
                "name": "Test Clinic",
                "business_hours": {
                    "mon": window, "tue": window, "wed": window, "thu": window,
                    "fri": window, "sat": window, "sun": window,
                },
                "blackout_dates": blackout_dates,
                "policies": {
                    "lead_time_hours": 2,
                    "max_sessions_per_patient_per_day": 3,
                    "max_sessions_per_staff_per_day": 8,
                    "auto_assign_staff": false,
                    "max_reschedule_requests_per_week": 3,
                    "stale_request_hours": 48,
                },
                "therapy_config": {},
            })]))
            .mount(&self.mock_server)
            .await;
    }

    /// One prescription carrying a single-occurrence abhyanga plan.
    async fn mount_plan(&self, start_date: NaiveDate) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/prescriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![json!({
                "id": Uuid::new_v4(),
                "hospital_id": self.hospital_id,
                "patient_id": self.patient_id,
                "therapies": [{
                    "name": "Abhyanga",
                    "plan_sessions": 1,
                    "plan_interval_days": 7,
                    "plan_start_date": start_date.to_string(),
                    "plan_duration_min": 60,
                    "plan_preferred_time": "10:00:00",
                    "plan_preferred_days": [],
                    "plan_assigned_staff_id": null,
                }],
            })]))
            .mount(&self.mock_server)
            .await;
    }

    async fn mount_no_prescriptions(&self) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/prescriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
            .mount(&self.mock_server)
            .await;
    }

    async fn mount_quiet_reschedule_sweep(&self) {
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/reschedule_requests"))
            .and(body_partial_json(json!({ "status": "cancelled" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
            .mount(&self.mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/reschedule_requests"))
            .and(query_param("status", "eq.pending"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
            .mount(&self.mock_server)
            .await;
    }

    fn session_body(&self, scheduled_at: DateTime<Utc>, status: &str) -> Value {
        json!({
            "id": Uuid::new_v4(),
            "hospital_id": self.hospital_id,
            "patient_id": self.patient_id,
            "staff_id": null,
            "therapy_type": "abhyanga",
            "room_id": self.room_id,
            "scheduled_at": scheduled_at.to_rfc3339(),
            "duration_minutes": 60,
            "status": status,
            "approvals": { "doctor_approved": false, "admin_approved": false },
            "outcomes": { "started_at": null, "completed_at": null, "observations": null },
            "created_at": Utc::now().to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
        })
    }
}

/// A plan start date one week out; its 10:00 occurrence is inside the
/// 14-day horizon and clears the 2-hour lead time.
fn start_date_in_a_week() -> NaiveDate {
    (Utc::now() + Duration::days(7)).date_naive()
}

fn occurrence_at(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(10, 0, 0).unwrap().and_utc()
}

// ==============================================================================
// TESTS
// ==============================================================================

#[tokio::test]
async fn test_plan_materialization_is_idempotent_across_ticks() {
    let setup = TestSetup::new().await;
    let start = start_date_in_a_week();
    let occurrence = occurrence_at(start);

    setup.mount_hospital(vec![]).await;
    setup.mount_plan(start).await;
    setup.mount_quiet_reschedule_sweep().await;

    // Idempotency probe: empty on the first tick, then the created session.
    // Probe queries are the only session reads filtered by therapy_type.
    Mock::given(method("GET"))
        .and(path("/rest/v1/sessions"))
        .and(query_param("therapy_type", "eq.abhyanga"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
        .up_to_n_times(1)
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/sessions"))
        .and(query_param("therapy_type", "eq.abhyanga"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(vec![setup.session_body(occurrence, "awaiting_confirmation")]),
        )
        .mount(&setup.mock_server)
        .await;

    // Validation-pipeline reads: nothing else booked anywhere
    Mock::given(method("GET"))
        .and(path("/rest/v1/sessions"))
        .and(query_param("patient_id", format!("eq.{}", setup.patient_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/rooms"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![json!({
            "id": setup.room_id,
            "hospital_id": setup.hospital_id,
            "name": "Room A",
            "capacity": 1,
            "supported_therapies": [],
            "status": "active",
        })]))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/sessions"))
        .and(query_param("room_id", format!("eq.{}", setup.room_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
        .mount(&setup.mock_server)
        .await;

    // Exactly one insert across both ticks, in awaiting_confirmation
    Mock::given(method("POST"))
        .and(path("/rest/v1/sessions"))
        .and(body_partial_json(json!({ "status": "awaiting_confirmation" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(vec![setup.session_body(occurrence, "awaiting_confirmation")]),
        )
        .expect(1)
        .mount(&setup.mock_server)
        .await;

    let first = setup.worker.run_tick().await.expect("first tick");
    assert_eq!(first.sessions_created, 1);
    assert_eq!(first.occurrences_existing, 0);

    let second = setup.worker.run_tick().await.expect("second tick");
    assert_eq!(second.sessions_created, 0);
    assert_eq!(second.occurrences_existing, 1);
}

#[tokio::test]
async fn test_rejected_occurrence_is_skipped_not_fatal() {
    let setup = TestSetup::new().await;
    let start = start_date_in_a_week();

    // The occurrence date is blacked out, so the pipeline rejects it
    setup.mount_hospital(vec![start.to_string()]).await;
    setup.mount_plan(start).await;
    setup.mount_quiet_reschedule_sweep().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/sessions"))
        .and(query_param("therapy_type", "eq.abhyanga"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
        .mount(&setup.mock_server)
        .await;

    // Nothing may be written
    Mock::given(method("POST"))
        .and(path("/rest/v1/sessions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(0)
        .mount(&setup.mock_server)
        .await;

    let report = setup.worker.run_tick().await.expect("tick survives rejections");

    assert_eq!(report.hospitals_scanned, 1);
    assert_eq!(report.sessions_created, 0);
    assert_eq!(report.occurrences_rejected, 1);
}

#[tokio::test]
async fn test_unsatisfiable_reschedule_request_stays_pending() {
    let setup = TestSetup::new().await;
    let session_id = Uuid::new_v4();
    let request_id = Uuid::new_v4();
    let requested_date = start_date_in_a_week();
    let candidate = occurrence_at(requested_date);

    setup.mount_hospital(vec![]).await;
    setup.mount_no_prescriptions().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(body_partial_json(json!({ "status": "cancelled" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
        .mount(&setup.mock_server)
        .await;

    let request_row = json!({
        "id": request_id,
        "hospital_id": setup.hospital_id,
        "session_id": session_id,
        "requested_date": requested_date.to_string(),
        "requested_time": "10:00:00",
        "reason": "conflict with work",
        "status": "pending",
        "requested_by": setup.patient_id.to_string(),
        "processed_by": null,
        "processed_at": null,
        "created_at": Utc::now().to_rfc3339(),
    });

    Mock::given(method("GET"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(query_param("status", "eq.pending"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![request_row.clone()]))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(query_param("id", format!("eq.{}", request_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![request_row]))
        .mount(&setup.mock_server)
        .await;

    let mut session_row = setup.session_body(Utc::now() + Duration::days(2), "scheduled");
    session_row["id"] = json!(session_id);
    Mock::given(method("GET"))
        .and(path("/rest/v1/sessions"))
        .and(query_param("id", format!("eq.{}", session_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![session_row]))
        .mount(&setup.mock_server)
        .await;

    // The patient already has a session covering the requested slot, so
    // the move is rejected and the request must stay pending
    Mock::given(method("GET"))
        .and(path("/rest/v1/sessions"))
        .and(query_param("patient_id", format!("eq.{}", setup.patient_id)))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(vec![setup.session_body(candidate, "confirmed")]),
        )
        .mount(&setup.mock_server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(body_partial_json(json!({ "status": "approved" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&setup.mock_server)
        .await;

    let report = setup.worker.run_tick().await.expect("tick completes");

    assert_eq!(report.requests_approved, 0);
    assert_eq!(report.requests_cleaned, 0);
}
