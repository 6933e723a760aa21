use std::net::SocketAddr;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use scheduler_worker_cell::PlanSchedulerWorker;
use shared_config::AppConfig;

#[tokio::main]
async fn main() {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting therapy scheduling API server");

    // Load configuration
    let config = AppConfig::from_env();

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Create shared state
    let state = Arc::new(config);

    // Background scheduler: one singleton worker for the whole process
    let worker = Arc::new(PlanSchedulerWorker::new(&state));
    if state.is_worker_configured() {
        tokio::spawn(Arc::clone(&worker).start());
    } else {
        warn!("Service role key missing - background scheduling disabled");
    }

    // Build the application router
    let app = router::create_router(state, Arc::clone(&worker))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(worker))
        .await
        .unwrap();
}

async fn shutdown_signal(worker: Arc<PlanSchedulerWorker>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    info!("Shutdown signal received");
    worker.stop().await;
}
