//! Per-tenant admission serialization
//!
//! Quota is checked at submit and charged when a job starts. Both sides run
//! under the same per-tenant mutex so concurrent submits cannot interleave
//! read-then-write and over-admit past the ceiling.

use dashmap::DashMap;
use sched_core::TenantId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A table of per-tenant admission locks
#[derive(Default)]
pub struct QuotaGate {
    locks: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl QuotaGate {
    /// Create an empty gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the admission lock for a tenant
    ///
    /// The guard is owned, so it may be held across repository awaits.
    pub async fn acquire(&self, tenant_id: &TenantId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(tenant_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
