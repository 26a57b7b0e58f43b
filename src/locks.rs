//! Per-call serialization.
//!
//! Every state-mutating operation on a call — stage advancement, approval
//! resolution, effect dispatch — acquires that call's lock first, so two
//! workers racing on the same call id serialize while distinct call ids
//! never contend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct CallLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl CallLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one call id, waiting if another worker holds it.
    /// The guard is owned so it can cross await points.
    pub async fn acquire(&self, call_id: Uuid) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            map.entry(call_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}
