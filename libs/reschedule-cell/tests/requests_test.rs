// libs/reschedule-cell/tests/requests_test.rs
//
// Integration tests for the reschedule request workflow against a mocked
// PostgREST backend.

use assert_matches::assert_matches;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use reschedule_cell::models::{
    CreateRescheduleRequest, RescheduleAction, RescheduleError, RescheduleStatus,
};
use reschedule_cell::services::requests::RescheduleRequestService;
use shared_config::AppConfig;
use shared_models::auth::User;

// ==============================================================================
// TEST FIXTURES AND UTILITIES
// ==============================================================================

struct TestSetup {
    service: RescheduleRequestService,
    mock_server: MockServer,
    hospital_id: Uuid,
    patient_id: Uuid,
    session_id: Uuid,
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
            service: RescheduleRequestService::new(&config),
            mock_server,
            hospital_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
        }
    }

    fn patient(&self) -> User {
        User {
            id: self.patient_id.to_string(),
            email: None,
            role: Some("patient".to_string()),
            hospital_id: Some(self.hospital_id),
            metadata: None,
            created_at: None,
        }
    }

    fn admin(&self) -> User {
        User {
            id: Uuid::new_v4().to_string(),
            email: None,
            role: Some("admin".to_string()),
            hospital_id: Some(self.hospital_id),
            metadata: None,
            created_at: None,
        }
    }

    fn session_body(&self, scheduled_at: DateTime<Utc>) -> Value {
        json!({
            "id": self.session_id,
            "hospital_id": self.hospital_id,
            "patient_id": self.patient_id,
            "staff_id": null,
            "therapy_type": "abhyanga",
            "room_id": self.room_id,
            "scheduled_at": scheduled_at.to_rfc3339(),
            "duration_minutes": 60,
            "status": "scheduled",
            "approvals": { "doctor_approved": false, "admin_approved": false },
            "outcomes": { "started_at": null, "completed_at": null, "observations": null },
            "created_at": Utc::now().to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
        })
    }

    fn request_body(&self, id: Uuid, status: &str, created_at: DateTime<Utc>) -> Value {
        json!({
            "id": id,
            "hospital_id": self.hospital_id,
            "session_id": self.session_id,
            "requested_date": (Utc::now() + Duration::days(7)).date_naive().to_string(),
            "requested_time": "10:00:00",
            "reason": "conflict with work",
            "status": status,
            "requested_by": self.patient_id.to_string(),
            "processed_by": null,
            "processed_at": null,
            "created_at": created_at.to_rfc3339(),
        })
    }

    async fn mount_hospital(&self) {
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
                "blackout_dates": [],
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

    async fn mount_session(&self, scheduled_at: DateTime<Utc>) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/sessions"))
            .and(query_param("id", format!("eq.{}", self.session_id)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(vec![self.session_body(scheduled_at)]),
            )
            .mount(&self.mock_server)
            .await;
    }

    /// The single-pending uniqueness probe for this session.
    async fn mount_pending_probe(&self, rows: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/reschedule_requests"))
            .and(query_param("session_id", format!("eq.{}", self.session_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows))
            .mount(&self.mock_server)
            .await;
    }

    /// The trailing-7-day rate-limit count for the requester.
    async fn mount_weekly_count(&self, rows: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/reschedule_requests"))
            .and(query_param("requested_by", format!("eq.{}", self.patient_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows))
            .mount(&self.mock_server)
            .await;
    }
}

fn slot_in_days(days_ahead: i64) -> DateTime<Utc> {
    (Utc::now() + Duration::days(days_ahead))
        .date_naive()
        .and_hms_opt(10, 0, 0)
        .unwrap()
        .and_utc()
}

// ==============================================================================
// TESTS
// ==============================================================================

#[tokio::test]
async fn test_fourth_request_in_a_week_is_rate_limited() {
    let setup = TestSetup::new().await;
    setup.mount_hospital().await;
    setup.mount_session(slot_in_days(7)).await;
    setup.mount_pending_probe(vec![]).await;

    // Three requests already filed in the trailing seven days (cap is 3)
    let recent: Vec<Value> = (0..3)
        .map(|i| setup.request_body(Uuid::new_v4(), "rejected", Utc::now() - Duration::days(i)))
        .collect();
    setup.mount_weekly_count(recent).await;

    let result = setup
        .service
        .create_request(
            setup.session_id,
            CreateRescheduleRequest {
                requested_date: None,
                requested_time: None,
                reason: "please move this".to_string(),
            },
            &setup.patient(),
            "test-token",
        )
        .await;

    assert_matches!(result, Err(RescheduleError::RateLimited(3)));
}

#[tokio::test]
async fn test_second_pending_request_for_same_session_rejected() {
    let setup = TestSetup::new().await;
    setup.mount_session(slot_in_days(7)).await;
    setup
        .mount_pending_probe(vec![setup.request_body(Uuid::new_v4(), "pending", Utc::now())])
        .await;

    let result = setup
        .service
        .create_request(
            setup.session_id,
            CreateRescheduleRequest {
                requested_date: None,
                requested_time: None,
                reason: "please move this".to_string(),
            },
            &setup.patient(),
            "test-token",
        )
        .await;

    assert_matches!(result, Err(RescheduleError::AlreadyPending));
}

#[tokio::test]
async fn test_create_without_preference_skips_slot_validation() {
    let setup = TestSetup::new().await;
    setup.mount_hospital().await;
    setup.mount_session(slot_in_days(7)).await;
    setup.mount_pending_probe(vec![]).await;
    setup.mount_weekly_count(vec![]).await;

    let created_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(body_partial_json(json!({ "status": "pending" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(vec![json!({
            "id": created_id,
            "hospital_id": setup.hospital_id,
            "session_id": setup.session_id,
            "requested_date": null,
            "requested_time": null,
            "reason": "please move this",
            "status": "pending",
            "requested_by": setup.patient_id.to_string(),
            "processed_by": null,
            "processed_at": null,
            "created_at": Utc::now().to_rfc3339(),
        })]))
        .expect(1)
        .mount(&setup.mock_server)
        .await;

    let created = setup
        .service
        .create_request(
            setup.session_id,
            CreateRescheduleRequest {
                requested_date: None,
                requested_time: None,
                reason: "please move this".to_string(),
            },
            &setup.patient(),
            "test-token",
        )
        .await
        .expect("request without a preferred slot needs no slot validation");

    assert_eq!(created.id, created_id);
    assert_eq!(created.status, RescheduleStatus::Pending);
}

#[tokio::test]
async fn test_approval_moves_session_before_marking_request() {
    let setup = TestSetup::new().await;
    setup.mount_hospital().await;
    setup.mount_session(slot_in_days(2)).await;

    let request_id = Uuid::new_v4();
    let stored_request = setup.request_body(request_id, "pending", Utc::now() - Duration::hours(5));

    Mock::given(method("GET"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(query_param("id", format!("eq.{}", request_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![stored_request.clone()]))
        .mount(&setup.mock_server)
        .await;

    // Validation pipeline data for the session move
    Mock::given(method("GET"))
        .and(path("/rest/v1/sessions"))
        .and(query_param("patient_id", format!("eq.{}", setup.patient_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/rooms"))
        .and(query_param("id", format!("eq.{}", setup.room_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![json!({
            "id": setup.room_id,
            "hospital_id": setup.hospital_id,
            "name": "Room A",
            "capacity": 2,
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

    // The session must be moved to the requested slot...
    let target = stored_request
        .get("requested_date")
        .and_then(|v| v.as_str())
        .map(|date| format!("{}T10:00:00+00:00", date))
        .unwrap();
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/sessions"))
        .and(body_partial_json(json!({ "scheduled_at": target })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(vec![setup.session_body(slot_in_days(7))]),
        )
        .expect(1)
        .mount(&setup.mock_server)
        .await;

    // ...and only then the request marked approved
    let mut approved = stored_request.clone();
    approved["status"] = json!("approved");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(body_partial_json(json!({ "status": "approved" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![approved]))
        .expect(1)
        .mount(&setup.mock_server)
        .await;

    let updated = setup
        .service
        .act(request_id, RescheduleAction::Approved, &setup.admin(), "test-token")
        .await
        .expect("a free requested slot should auto-approve");

    assert_eq!(updated.status, RescheduleStatus::Approved);
}

#[tokio::test]
async fn test_stale_cleanup_cancels_only_old_pending_requests() {
    let setup = TestSetup::new().await;
    setup.mount_hospital().await;

    // The bulk PATCH carries the status filter and the cutoff; rows past the
    // window come back cancelled
    let stale = setup.request_body(Uuid::new_v4(), "cancelled", Utc::now() - Duration::hours(50));
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(query_param("status", "eq.pending"))
        .and(body_partial_json(json!({ "status": "cancelled" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![stale]))
        .expect(1)
        .mount(&setup.mock_server)
        .await;

    let cleaned = setup
        .service
        .cleanup_stale(setup.hospital_id, "test-token")
        .await
        .expect("cleanup sweep is idempotent");

    assert_eq!(cleaned, 1);
}

#[tokio::test]
async fn test_acting_on_resolved_request_rejected() {
    let setup = TestSetup::new().await;
    let request_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/reschedule_requests"))
        .and(query_param("id", format!("eq.{}", request_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![
            setup.request_body(request_id, "rejected", Utc::now() - Duration::hours(3)),
        ]))
        .mount(&setup.mock_server)
        .await;

    let result = setup
        .service
        .act(request_id, RescheduleAction::Approved, &setup.admin(), "test-token")
        .await;

    assert_matches!(result, Err(RescheduleError::InvalidState(RescheduleStatus::Rejected)));
}

#[tokio::test]
async fn test_unrelated_patient_cannot_request_reschedule() {
    let setup = TestSetup::new().await;
    setup.mount_session(slot_in_days(7)).await;

    let stranger = User {
        id: Uuid::new_v4().to_string(),
        email: None,
        role: Some("patient".to_string()),
        hospital_id: Some(setup.hospital_id),
        metadata: None,
        created_at: None,
    };

    let result = setup
        .service
        .create_request(
            setup.session_id,
            CreateRescheduleRequest {
                requested_date: None,
                requested_time: None,
                reason: "not my session".to_string(),
            },
            &stranger,
            "test-token",
        )
        .await;

    assert_matches!(result, Err(RescheduleError::Unauthorized(_)));
}
