// libs/scheduling-cell/src/services/notify.rs
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use shared_database::supabase::SupabaseClient;

use crate::models::NotificationEvent;

/// Fire-and-forget notification side-channel. Delivery (email, push,
/// sockets) is handled by an external dispatcher reading the notifications
/// table; the engine only records the event and must never block or fail a
/// scheduling operation because of it.
pub struct NotificationService {
    supabase: Arc<SupabaseClient>,
}

impl NotificationService {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    pub fn publish(&self, event: NotificationEvent, auth_token: &str) {
        let supabase = Arc::clone(&self.supabase);
        let token = auth_token.to_string();

        tokio::spawn(async move {
            let body = json!({
                "hospital_id": event.hospital_id,
                "recipient_id": event.recipient_id,
                "title": event.title,
                "message": event.message,
            });

            match supabase
                .request::<Value>(Method::POST, "/rest/v1/notifications", Some(&token), Some(body))
                .await
            {
                Ok(_) => debug!(
                    "Notification recorded for hospital {}: {}",
                    event.hospital_id, event.title
                ),
                Err(e) => warn!("Failed to record notification: {}", e),
            }
        });
    }
}
