pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use router::scheduler_routes;
pub use services::worker::PlanSchedulerWorker;
