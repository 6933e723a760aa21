// libs/reschedule-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;

pub fn reschedule_routes(state: Arc<AppConfig>) -> Router {
    let protected_routes = Router::new()
        .route("/sessions/{session_id}", post(handlers::create_reschedule_request))
        .route("/", get(handlers::list_reschedule_requests))
        .route("/{request_id}/act", post(handlers::act_on_reschedule_request))
        .route("/cleanup", post(handlers::cleanup_stale_requests))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new().merge(protected_routes).with_state(state)
}
