//! Preemption: victim selection and cascading resource reclamation
//!
//! One victim per attempt. Large requests may need several scheduling cycles
//! to clear enough room; every preemption strictly reduces the shortfall.

use sched_core::{AllocationState, Job, JobId, JobState, Repository, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Selects and evicts lower-priority running jobs
pub struct Preemptor {
    repo: Arc<dyn Repository>,
}

impl Preemptor {
    /// Create a new preemptor over the given repository
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Pick the single best victim for `requesting`, if any
    ///
    /// A candidate must be Running, have strictly lower priority than the
    /// requesting job, and belong to a tenant that allows preemption. Among
    /// candidates the lowest priority wins; ties go to the job that has run
    /// longest (earliest started_at), amortizing the lost work.
    pub async fn select_victim(&self, requesting: &Job) -> Result<Option<Job>> {
        let running = self.repo.list_jobs_by_state(JobState::Running).await?;

        let mut candidates = Vec::new();
        for job in running {
            if job.priority >= requesting.priority {
                continue;
            }
            match self.repo.get_tenant(&job.tenant_id).await {
                Ok(tenant) if tenant.allow_preemption => candidates.push(job),
                Ok(_) => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "skipping candidate with unreadable tenant");
                }
            }
        }

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.started_at.cmp(&b.started_at))
        });

        Ok(candidates.into_iter().next())
    }

    /// Evict `victim` on behalf of the admitting job
    ///
    /// Marks the job Preempted, releases each of its active allocations with
    /// the same atomic reversal used on completion, and refunds the victim
    /// tenant's usage. The job record itself survives.
    pub async fn preempt(&self, victim: &Job, admitted_by: &JobId) -> Result<()> {
        info!(
            victim_id = %victim.id,
            admitted_by = %admitted_by,
            victim_priority = victim.priority,
            "preempting job"
        );

        let mut job = self.repo.get_job(&victim.id).await?;
        job.transition(JobState::Preempted)?;
        self.repo.update_job(&job).await?;

        for allocation in self.repo.list_allocations_by_job(&job.id).await? {
            if !allocation.is_active() {
                continue;
            }
            self.repo
                .release_allocation(
                    &allocation.id,
                    AllocationState::Preempted,
                    Some(admitted_by.clone()),
                )
                .await?;
        }

        let mut tenant = self.repo.get_tenant(&job.tenant_id).await?;
        tenant.release(&job.resources);
        self.repo.update_tenant(&tenant).await?;

        info!(victim_id = %job.id, "job preempted");
        Ok(())
    }
}
