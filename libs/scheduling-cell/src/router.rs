// libs/scheduling-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;

pub fn session_routes(state: Arc<AppConfig>) -> Router {
    // All session operations require authentication
    let protected_routes = Router::new()
        .route("/", post(handlers::create_session))
        .route("/search", get(handlers::search_sessions))
        .route("/rooms/availability", get(handlers::room_availability))
        .route("/{session_id}", get(handlers::get_session))
        .route("/{session_id}", put(handlers::update_session))
        .route("/{session_id}", delete(handlers::delete_session))
        .route("/{session_id}/status", post(handlers::transition_session_status))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new().merge(protected_routes).with_state(state)
}
