//! Tenants and per-tenant quota accounting

use crate::error::{Error, Result};
use crate::types::{PriorityTier, ResourceRequest, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quota ceiling for a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_gpus: u32,
    pub max_gpu_memory_mb: u64,
    pub max_cpu_cores: u32,
    pub max_memory_mb: u64,
    pub max_concurrent_jobs: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_gpus: 8,
            max_gpu_memory_mb: 640_000,
            max_cpu_cores: 64,
            max_memory_mb: 512_000,
            max_concurrent_jobs: 16,
        }
    }
}

/// Current resource usage, mirroring the quota shape
///
/// Counters increase when a job transitions Pending -> Running and decrease
/// on any exit from Running. Every dimension stays within `0 ..= ceiling`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub gpus: u32,
    pub gpu_memory_mb: u64,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub jobs: u32,
}

/// A tenant in the multi-tenant system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Unique tenant identifier
    pub id: TenantId,

    /// Human-readable name
    pub name: String,

    /// Quota ceiling
    pub quota: QuotaLimits,

    /// Current usage
    pub usage: QuotaUsage,

    /// Default priority tier for this tenant's jobs
    pub tier: PriorityTier,

    /// Whether this tenant's running jobs may be chosen as preemption victims
    pub allow_preemption: bool,

    /// Whether this tenant's jobs may preempt other tenants' jobs
    pub can_preempt_others: bool,

    /// Inactive tenants cannot submit
    pub active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Create a new active tenant with the given quota
    pub fn new(id: impl Into<TenantId>, name: impl Into<String>, quota: QuotaLimits) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            quota,
            usage: QuotaUsage::default(),
            tier: PriorityTier::Medium,
            allow_preemption: false,
            can_preempt_others: false,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder pattern for optional fields
    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_allow_preemption(mut self, allow: bool) -> Self {
        self.allow_preemption = allow;
        self
    }

    pub fn with_can_preempt_others(mut self, can: bool) -> Self {
        self.can_preempt_others = can;
        self
    }

    /// Check whether `request` fits under the quota ceiling
    ///
    /// Succeeds iff every dimension of (current + request) stays within the
    /// ceiling and the concurrent-job count has headroom. On failure the
    /// error names the first violated dimension.
    pub fn check_admission(&self, request: &ResourceRequest) -> Result<()> {
        let q = &self.quota;
        let u = &self.usage;

        if u.gpus + request.gpu_count > q.max_gpus {
            return Err(Error::QuotaExceeded {
                tenant_id: self.id.clone(),
                resource: "GPUs",
                requested: request.gpu_count as u64,
                ceiling: q.max_gpus as u64,
                current: u.gpus as u64,
            });
        }
        if u.gpu_memory_mb + request.gpu_memory_mb > q.max_gpu_memory_mb {
            return Err(Error::QuotaExceeded {
                tenant_id: self.id.clone(),
                resource: "GPU memory",
                requested: request.gpu_memory_mb,
                ceiling: q.max_gpu_memory_mb,
                current: u.gpu_memory_mb,
            });
        }
        if u.cpu_cores + request.cpu_cores > q.max_cpu_cores {
            return Err(Error::QuotaExceeded {
                tenant_id: self.id.clone(),
                resource: "CPU cores",
                requested: request.cpu_cores as u64,
                ceiling: q.max_cpu_cores as u64,
                current: u.cpu_cores as u64,
            });
        }
        if u.memory_mb + request.memory_mb > q.max_memory_mb {
            return Err(Error::QuotaExceeded {
                tenant_id: self.id.clone(),
                resource: "memory",
                requested: request.memory_mb,
                ceiling: q.max_memory_mb,
                current: u.memory_mb,
            });
        }
        if u.jobs + 1 > q.max_concurrent_jobs {
            return Err(Error::QuotaExceeded {
                tenant_id: self.id.clone(),
                resource: "concurrent jobs",
                requested: 1,
                ceiling: q.max_concurrent_jobs as u64,
                current: u.jobs as u64,
            });
        }

        Ok(())
    }

    /// Charge usage for a job entering Running
    pub fn charge(&mut self, request: &ResourceRequest) {
        self.usage.gpus += request.gpu_count;
        self.usage.gpu_memory_mb += request.gpu_memory_mb;
        self.usage.cpu_cores += request.cpu_cores;
        self.usage.memory_mb += request.memory_mb;
        self.usage.jobs += 1;
        self.updated_at = Utc::now();
    }

    /// Release usage for a job leaving Running
    ///
    /// Saturating so that a double release cannot drive a counter negative.
    pub fn release(&mut self, request: &ResourceRequest) {
        self.usage.gpus = self.usage.gpus.saturating_sub(request.gpu_count);
        self.usage.gpu_memory_mb = self.usage.gpu_memory_mb.saturating_sub(request.gpu_memory_mb);
        self.usage.cpu_cores = self.usage.cpu_cores.saturating_sub(request.cpu_cores);
        self.usage.memory_mb = self.usage.memory_mb.saturating_sub(request.memory_mb);
        self.usage.jobs = self.usage.jobs.saturating_sub(1);
        self.updated_at = Utc::now();
    }

    /// Default priority score for this tenant's jobs
    pub fn priority_score(&self) -> i32 {
        self.tier.score()
    }
}
