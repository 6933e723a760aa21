// libs/scheduling-cell/src/services/lifecycle.rs
use tracing::{debug, warn};

use crate::models::{SessionError, SessionStatus};

pub struct SessionLifecycleService;

impl SessionLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Validate that a status transition is allowed
    pub fn validate_status_transition(
        &self,
        current_status: &SessionStatus,
        new_status: &SessionStatus,
    ) -> Result<(), SessionError> {
        debug!(
            "Validating status transition from {} to {}",
            current_status, new_status
        );

        let valid_transitions = self.valid_transitions(current_status);

        if !valid_transitions.contains(new_status) {
            warn!(
                "Invalid status transition attempted: {} -> {}",
                current_status, new_status
            );
            return Err(SessionError::InvalidStatusTransition(current_status.clone()));
        }

        Ok(())
    }

    /// Get all valid next statuses for a given current status
    pub fn valid_transitions(&self, current_status: &SessionStatus) -> Vec<SessionStatus> {
        match current_status {
            SessionStatus::Scheduled | SessionStatus::AwaitingConfirmation => vec![
                SessionStatus::Confirmed,
                SessionStatus::InProgress,
                SessionStatus::Cancelled,
                SessionStatus::NoShow,
            ],
            SessionStatus::Confirmed => vec![
                SessionStatus::InProgress,
                SessionStatus::Completed,
                SessionStatus::Cancelled,
                SessionStatus::NoShow,
            ],
            SessionStatus::InProgress => vec![
                SessionStatus::Completed,
                SessionStatus::Cancelled,
            ],
            // Terminal states - no transitions allowed
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::NoShow => vec![],
        }
    }

    /// Whether the session may still be moved or reassigned. Once care has
    /// started (or the session is closed out) the schedule is frozen.
    pub fn can_modify(&self, status: &SessionStatus) -> bool {
        matches!(
            status,
            SessionStatus::Scheduled | SessionStatus::AwaitingConfirmation | SessionStatus::Confirmed
        )
    }
}

impl Default for SessionLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}
