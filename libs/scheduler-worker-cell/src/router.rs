// libs/scheduler-worker-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::services::worker::PlanSchedulerWorker;

pub fn scheduler_routes(config: Arc<AppConfig>, worker: Arc<PlanSchedulerWorker>) -> Router {
    let protected_routes = Router::new()
        .route("/tick", post(handlers::trigger_tick))
        .route("/status", get(handlers::scheduler_status))
        .layer(middleware::from_fn_with_state(config, auth_middleware));

    Router::new().merge(protected_routes).with_state(worker)
}
