// libs/scheduling-cell/src/services/consistency.rs
//
// Per-tenant mutual exclusion for the validate-then-write span of every
// session mutation. Two near-simultaneous bookings for the same room and
// window would otherwise both pass the overlap check before either insert
// lands; holding the tenant's lock across check and write closes that race.
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

static GLOBAL_GATE: OnceLock<TenantGate> = OnceLock::new();

/// Keyed registry of per-hospital async locks. The engine runs as a single
/// process, so in-process exclusion is sufficient; REST-layer write failures
/// are still surfaced as retryable conflicts.
pub struct TenantGate {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TenantGate {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide gate shared by interactive handlers, the reschedule
    /// workflow, and the background worker. Service structs are rebuilt per
    /// request, so the registry cannot live on them.
    pub fn global() -> &'static TenantGate {
        GLOBAL_GATE.get_or_init(TenantGate::new)
    }

    /// Acquire the tenant's lock, creating it on first use. The returned
    /// guard must be held until the mutation's write has been issued.
    pub async fn acquire(&self, hospital_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(hospital_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        debug!("Acquiring scheduling gate for hospital {}", hospital_id);
        lock.lock_owned().await
    }
}

impl Default for TenantGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_gate_serializes_same_tenant() {
        let gate = Arc::new(TenantGate::new());
        let hospital_id = Uuid::new_v4();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let in_flight = Arc::clone(&in_flight);
            handles.push(tokio::spawn(async move {
                let _guard = gate.acquire(hospital_id).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst);
                assert_eq!(now, 0, "two mutations inside the same tenant gate");
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_distinct_tenants_do_not_block_each_other() {
        let gate = TenantGate::new();
        let guard_a = gate.acquire(Uuid::new_v4()).await;
        // A second tenant acquires immediately even while the first guard
        // is held
        let guard_b = gate.acquire(Uuid::new_v4()).await;
        drop(guard_a);
        drop(guard_b);
    }
}
