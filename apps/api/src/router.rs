use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use reschedule_cell::router::reschedule_routes;
use scheduler_worker_cell::router::scheduler_routes;
use scheduler_worker_cell::PlanSchedulerWorker;
use scheduling_cell::router::session_routes;
use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>, worker: Arc<PlanSchedulerWorker>) -> Router {
    Router::new()
        .route("/", get(|| async { "Therapy scheduling API is running!" }))
        .nest("/sessions", session_routes(state.clone()))
        .nest("/reschedule-requests", reschedule_routes(state.clone()))
        .nest("/scheduler", scheduler_routes(state.clone(), worker))
}
