use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_key: String,
    pub supabase_jwt_secret: String,
    pub scheduler_tick_interval_seconds: u64,
    pub scheduler_horizon_days: i64,
    pub scheduler_tick_budget_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, scheduler worker will run unauthenticated");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            scheduler_tick_interval_seconds: parse_env_or("SCHEDULER_TICK_INTERVAL_SECONDS", 300),
            scheduler_horizon_days: parse_env_or("SCHEDULER_HORIZON_DAYS", 14),
            scheduler_tick_budget_seconds: parse_env_or("SCHEDULER_TICK_BUDGET_SECONDS", 60),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn is_worker_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_service_key.is_empty()
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid number, using default", key);
            default
        }),
        Err(_) => default,
    }
}
