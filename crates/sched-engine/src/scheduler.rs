//! The scheduling orchestrator
//!
//! One logical scheduler loop drives all allocation decisions; submission,
//! cancellation, and status queries run concurrently on caller tasks. The
//! cycle never skips the head of the queue: a job that cannot be placed
//! blocks everything behind it until aging or preemption resolves it, which
//! keeps strict priority ordering predictable.

use crate::allocator::Allocator;
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::preemptor::Preemptor;
use crate::queue::JobQueue;
use crate::quota::QuotaGate;
use chrono::Utc;
use sched_core::{
    AllocationRequest, AllocationState, Error, Job, JobId, JobState, JobStatus, Placement,
    Repository, Result, SchedulerConfig,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Coarse fleet-wide counts surfaced to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    pub total_gpus: usize,
    pub available_gpus: usize,
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub pending_jobs: usize,
    pub running_jobs: usize,
}

/// The scheduling orchestrator
pub struct Scheduler {
    queue: Arc<JobQueue>,
    allocator: Allocator,
    preemptor: Preemptor,
    repo: Arc<dyn Repository>,
    config: SchedulerConfig,
    quota_gate: QuotaGate,
    metrics: Arc<SchedulerMetrics>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Compose a scheduler over the given repository
    pub fn new(config: SchedulerConfig, repo: Arc<dyn Repository>) -> Self {
        let queue = Arc::new(JobQueue::new(config.max_queue_size));
        let allocator = Allocator::new(repo.clone(), config.enable_thermal_aware);
        let preemptor = Preemptor::new(repo.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            queue,
            allocator,
            preemptor,
            repo,
            config,
            quota_gate: QuotaGate::new(),
            metrics: Arc::new(SchedulerMetrics::new()),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Scheduling counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The scheduling queue, for observability surfaces
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Prepare the engine: reconcile persisted state and replay the backlog
    ///
    /// After a restart every Pending job in the repository is re-enqueued in
    /// submitted_at order, so scheduling proceeds as if the process had
    /// never died.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("scheduler is already running"));
        }

        info!(
            interval_ms = self.config.scheduling_interval_ms,
            preemption = self.config.enable_preemption,
            "starting scheduler"
        );

        if let Err(e) = self.reconcile().await {
            error!(error = %e, "startup reconciliation failed");
        }
        self.load_pending_jobs().await?;
        Ok(())
    }

    /// Run the scheduling loop until [`shutdown`](Self::shutdown) is called
    ///
    /// The in-flight cycle always completes before the loop exits; no
    /// allocation commit is abandoned halfway.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.scheduling_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
        Ok(())
    }

    /// Signal the loop to exit after the current cycle
    pub fn shutdown(&self) {
        // send_replace: works even before run() has subscribed a receiver.
        self.shutdown_tx.send_replace(true);
    }

    /// Submit a job for scheduling
    ///
    /// Validates the declaration, checks the tenant's quota admission under
    /// the per-tenant lock, persists the job as Pending, and enqueues it.
    /// Usage is charged when the job starts, not here.
    pub async fn submit(&self, mut job: Job) -> Result<JobId> {
        self.validate(&job)?;

        if job.priority == 0 {
            job.priority = self.config.default_priority;
        }

        let _guard = self.quota_gate.acquire(&job.tenant_id).await;

        let tenant = self.repo.get_tenant(&job.tenant_id).await?;
        if !tenant.active {
            return Err(Error::validation("tenant_id", "tenant is not active"));
        }
        tenant.check_admission(&job.resources)?;

        job.state = JobState::Pending;
        job.submitted_at = Some(Utc::now());
        self.repo.create_job(&job).await?;

        if let Err(e) = self.queue.enqueue(job.clone()) {
            // The Pending row stays behind; startup replay recovers it.
            warn!(job_id = %job.id, error = %e, "persisted job could not be enqueued");
            return Err(e);
        }

        self.metrics.incr_submitted();
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            priority = job.priority,
            queue_depth = self.queue.len(),
            "job submitted"
        );
        Ok(job.id)
    }

    /// Cancel a pending or running job
    pub async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let mut job = self.repo.get_job(job_id).await?;

        match job.state {
            JobState::Pending => {
                self.queue.remove(job_id);
                job.transition(JobState::Cancelled)?;
                self.repo.update_job(&job).await?;
            }
            JobState::Running => {
                job.transition(JobState::Cancelled)?;
                self.repo.update_job(&job).await?;
                self.release_job_resources(&job).await?;
            }
            _ => {
                return Err(Error::invalid_transition(
                    sched_core::Entity::Job,
                    job_id,
                    job.state,
                    JobState::Cancelled,
                ));
            }
        }

        self.metrics.incr_cancelled();
        info!(%job_id, "job cancelled");
        Ok(())
    }

    /// Current status of a job
    pub async fn status(&self, job_id: &JobId) -> Result<JobStatus> {
        let job = self.repo.get_job(job_id).await?;
        let mut status = JobStatus::new(job.id.clone(), job.state);

        match job.state {
            JobState::Pending => {
                if let Some(position) = self.queue.position(job_id) {
                    status.queue_position = Some(position);
                    status.estimated_wait = Some(self.config.wait_estimate(position));
                }
            }
            JobState::Running => {
                let allocations = self.repo.list_allocations_by_job(job_id).await?;
                if let Some(active) = allocations.iter().find(|a| a.is_active()) {
                    status.allocated_gpus = active.gpu_ids.clone();
                    status.node_id = Some(active.node_id.clone());
                }
            }
            _ => {}
        }

        Ok(status)
    }

    /// Fleet-wide counts
    pub async fn cluster_summary(&self) -> Result<ClusterSummary> {
        let nodes = self.repo.list_nodes().await?;
        let gpus = self.repo.list_gpus().await?;
        let now = Utc::now();

        Ok(ClusterSummary {
            total_gpus: gpus.len(),
            available_gpus: gpus
                .iter()
                .filter(|g| g.is_available(self.config.enable_thermal_aware, now))
                .count(),
            total_nodes: nodes.len(),
            online_nodes: nodes.iter().filter(|n| n.online).count(),
            pending_jobs: self.repo.list_jobs_by_state(JobState::Pending).await?.len(),
            running_jobs: self.repo.list_jobs_by_state(JobState::Running).await?.len(),
        })
    }

    /// One scheduling pass
    ///
    /// Ages the queue, then repeatedly tries to place the head job. Per-job
    /// failures are logged and end the pass without poisoning anything;
    /// resource failures may trigger one preemption and a retry.
    pub async fn run_cycle(&self) {
        self.queue.apply_aging(
            self.config.aging_boost,
            self.config.aging_threshold(),
            self.config.max_aging_boost,
        );

        loop {
            let Some(job) = self.queue.peek() else {
                break;
            };

            let request = AllocationRequest::for_job(&job);
            match self.allocator.allocate(&request).await {
                Ok(placement) => {
                    // Remove by id: a concurrent submit may have put a new
                    // head in front of the job we just placed.
                    if !self.queue.remove(&job.id) {
                        // The job left the queue while being placed (a
                        // concurrent cancel); hand the resources back.
                        if let Err(e) = self
                            .repo
                            .release_allocation(
                                &placement.allocation_id,
                                AllocationState::Failed,
                                None,
                            )
                            .await
                        {
                            error!(allocation_id = %placement.allocation_id, error = %e, "failed to release allocation of vanished job");
                        }
                        continue;
                    }
                    let mut job = job;
                    if let Err(e) = self.start_job(&mut job, &placement).await {
                        error!(job_id = %job.id, error = %e, "failed to start job after allocation");
                        self.metrics.incr_failed();
                        self.abort_start(&mut job, &placement).await;
                    } else {
                        self.metrics.incr_scheduled();
                    }
                }
                Err(e) if e.is_resource_error() && self.config.enable_preemption => {
                    if self.try_preemption(&job).await {
                        // Resources freed; re-attempt the same head job.
                        continue;
                    }
                    debug!(job_id = %job.id, "head job unplaceable and no victim available");
                    break;
                }
                Err(e) if e.is_transient() => {
                    debug!(job_id = %job.id, error = %e, "head job cannot be placed this cycle");
                    break;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "allocation error");
                    break;
                }
            }
        }

        self.metrics.incr_cycles();
    }

    /// Reject malformed submissions before touching the repository
    fn validate(&self, job: &Job) -> Result<()> {
        if job.tenant_id.is_empty() {
            return Err(Error::validation("tenant_id", "tenant id is required"));
        }
        if job.resources.gpu_count == 0 {
            return Err(Error::validation("gpu_count", "GPU count must be positive"));
        }
        if job.resources.gpu_count > self.config.max_gpus_per_job {
            return Err(Error::validation(
                "gpu_count",
                format!(
                    "GPU count cannot exceed {}",
                    self.config.max_gpus_per_job
                ),
            ));
        }
        if job.gang_scheduling && !self.config.enable_gang_scheduling {
            return Err(Error::validation(
                "gang_scheduling",
                "gang scheduling is disabled",
            ));
        }
        Ok(())
    }

    /// Transition a placed job to Running and charge its tenant
    async fn start_job(&self, job: &mut Job, placement: &Placement) -> Result<()> {
        let now = Utc::now();
        job.scheduled_at = Some(now);
        job.started_at = Some(now);
        job.transition(JobState::Running)?;
        self.repo.update_job(job).await?;

        let _guard = self.quota_gate.acquire(&job.tenant_id).await;
        let mut tenant = self.repo.get_tenant(&job.tenant_id).await?;
        tenant.charge(&job.resources);
        self.repo.update_tenant(&tenant).await?;

        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            node_id = %placement.node_id,
            "job started"
        );
        Ok(())
    }

    /// Best-effort cleanup when a committed placement cannot start
    async fn abort_start(&self, job: &mut Job, placement: &Placement) {
        if let Err(e) = self
            .repo
            .release_allocation(&placement.allocation_id, AllocationState::Failed, None)
            .await
        {
            error!(allocation_id = %placement.allocation_id, error = %e, "failed to release aborted allocation");
        }
        if job.state == JobState::Running {
            if job.transition(JobState::Failed).is_ok() {
                if let Err(e) = self.repo.update_job(job).await {
                    error!(job_id = %job.id, error = %e, "failed to mark aborted job failed");
                }
            }
        }
    }

    /// Try to free resources for `job` by evicting one victim
    async fn try_preemption(&self, job: &Job) -> bool {
        match self.repo.get_tenant(&job.tenant_id).await {
            Ok(tenant) if tenant.can_preempt_others => {}
            Ok(_) => {
                debug!(job_id = %job.id, "tenant may not preempt others");
                return false;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "cannot load tenant for preemption check");
                return false;
            }
        }

        let victim = match self.preemptor.select_victim(job).await {
            Ok(Some(victim)) => victim,
            Ok(None) => return false,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "victim selection failed");
                return false;
            }
        };

        match self.preemptor.preempt(&victim, &job.id).await {
            Ok(()) => {
                self.metrics.incr_preempted();
                true
            }
            Err(e) => {
                error!(victim_id = %victim.id, error = %e, "preemption failed");
                false
            }
        }
    }

    /// Release every allocation of a job and refund its tenant
    async fn release_job_resources(&self, job: &Job) -> Result<()> {
        for allocation in self.repo.list_allocations_by_job(&job.id).await? {
            if allocation.is_active() {
                if let Err(e) = self.allocator.free(&allocation.id).await {
                    error!(allocation_id = %allocation.id, error = %e, "failed to free allocation");
                }
            }
        }

        let _guard = self.quota_gate.acquire(&job.tenant_id).await;
        let mut tenant = self.repo.get_tenant(&job.tenant_id).await?;
        tenant.release(&job.resources);
        self.repo.update_tenant(&tenant).await
    }

    /// Replay the Pending backlog into the queue in submitted_at order
    async fn load_pending_jobs(&self) -> Result<()> {
        let mut pending = self.repo.list_jobs_by_state(JobState::Pending).await?;
        pending.sort_by_key(|j| j.submitted_at);

        let count = pending.len();
        for job in pending {
            if let Err(e) = self.queue.enqueue(job.clone()) {
                warn!(job_id = %job.id, error = %e, "failed to enqueue pending job");
            }
        }

        info!(count, "loaded pending jobs");
        Ok(())
    }

    /// Rebuild node availability and GPU bindings from allocation rows
    ///
    /// A crash mid-preemption can leave counters ahead of reality; the
    /// allocation table is the owning side, so everything is recomputed from
    /// its Active rows.
    async fn reconcile(&self) -> Result<()> {
        let active = self.repo.list_active_allocations().await?;

        for mut node in self.repo.list_nodes().await? {
            let mut used_gpus = 0u32;
            let mut used_cores = 0u32;
            let mut used_memory = 0u64;
            for allocation in active.iter().filter(|a| a.node_id == node.id) {
                used_gpus += allocation.gpu_ids.len() as u32;
                used_cores += allocation.cpu_cores;
                used_memory += allocation.memory_mb;
            }

            let expected_gpus = node.total_gpus.saturating_sub(used_gpus);
            let expected_cores = node.total_cpu_cores.saturating_sub(used_cores);
            let expected_memory = node.total_memory_mb.saturating_sub(used_memory);

            if node.available_gpus != expected_gpus
                || node.available_cpu_cores != expected_cores
                || node.available_memory_mb != expected_memory
            {
                warn!(
                    node_id = %node.id,
                    available_gpus = node.available_gpus,
                    expected_gpus,
                    "reconciling drifted node counters"
                );
                node.available_gpus = expected_gpus;
                node.available_cpu_cores = expected_cores;
                node.available_memory_mb = expected_memory;
                self.repo.update_node(&node).await?;
            }
        }

        for mut gpu in self.repo.list_gpus().await? {
            let owner = active.iter().find(|a| a.gpu_ids.contains(&gpu.id));
            match owner {
                Some(allocation) => {
                    let correct = gpu
                        .binding
                        .as_ref()
                        .is_some_and(|b| b.allocation_id == allocation.id);
                    if !correct {
                        warn!(gpu_id = %gpu.id, allocation_id = %allocation.id, "rebinding GPU to its active allocation");
                        gpu.bind(
                            allocation.id.clone(),
                            allocation.job_id.clone(),
                            allocation.tenant_id.clone(),
                        );
                        self.repo.update_gpu(&gpu).await?;
                    }
                }
                None => {
                    if gpu.is_allocated() {
                        warn!(gpu_id = %gpu.id, "clearing dangling GPU binding");
                        gpu.unbind();
                        self.repo.update_gpu(&gpu).await?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sched_core::{Gpu, GpuModel, Node, QuotaLimits, ResourceRequest, Tenant};
    use sched_store::MemoryRepository;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            scheduling_interval_ms: 20,
            ..Default::default()
        }
    }

    async fn repo_with_tenant() -> Arc<MemoryRepository> {
        let repo = Arc::new(MemoryRepository::new());
        let tenant = Tenant::new("tenant-1", "research", QuotaLimits::default());
        repo.create_tenant(&tenant).await.unwrap();
        repo
    }

    fn job(priority: i32, gpus: u32) -> Job {
        Job::new(
            "tenant-1",
            "job",
            priority,
            ResourceRequest::new(gpus, 16_000, 4, 16_000),
        )
    }

    #[tokio::test]
    async fn test_submit_validates_gpu_count() {
        let repo = repo_with_tenant().await;
        let scheduler = Scheduler::new(config(), repo);

        let err = scheduler.submit(job(100, 0)).await.unwrap_err();
        assert!(matches!(err, Error::Validation { field: "gpu_count", .. }));

        let err = scheduler.submit(job(100, 9)).await.unwrap_err();
        assert!(matches!(err, Error::Validation { field: "gpu_count", .. }));
    }

    #[tokio::test]
    async fn test_submit_rejects_gang_when_disabled() {
        let repo = repo_with_tenant().await;
        let mut cfg = config();
        cfg.enable_gang_scheduling = false;
        let scheduler = Scheduler::new(cfg, repo);

        let err = scheduler
            .submit(job(100, 2).with_gang_scheduling(true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                field: "gang_scheduling",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_submit_applies_default_priority() {
        let repo = repo_with_tenant().await;
        let scheduler = Scheduler::new(config(), repo.clone());

        let id = scheduler.submit(job(0, 1)).await.unwrap();
        let stored = repo.get_job(&id).await.unwrap();
        assert_eq!(stored.priority, 100);
        assert_eq!(stored.state, JobState::Pending);
        assert!(stored.submitted_at.is_some());
    }

    #[tokio::test]
    async fn test_submit_unknown_tenant() {
        let repo = Arc::new(MemoryRepository::new());
        let scheduler = Scheduler::new(config(), repo);

        let err = scheduler.submit(job(100, 1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_scheduler_refuses_double_start() {
        let repo = repo_with_tenant().await;
        let scheduler = Scheduler::new(config(), repo);

        scheduler.start().await.unwrap();
        assert!(scheduler.start().await.is_err());
    }

    #[tokio::test]
    async fn test_cycle_places_job_and_charges_tenant() {
        let repo = repo_with_tenant().await;
        let node = Node::new("node-a", "fleet:7070", 4, 64, 512_000);
        repo.create_node(&node).await.unwrap();
        for i in 0..4 {
            repo.create_gpu(&Gpu::new(format!("gpu-{i}"), "node-a", i, GpuModel::A100, 80_000))
                .await
                .unwrap();
        }

        let scheduler = Scheduler::new(config(), repo.clone());
        let id = scheduler.submit(job(500, 2)).await.unwrap();
        scheduler.run_cycle().await;

        let stored = repo.get_job(&id).await.unwrap();
        assert_eq!(stored.state, JobState::Running);
        assert!(stored.scheduled_at.is_some());
        assert!(stored.started_at.is_some());

        let tenant = repo.get_tenant(&stored.tenant_id).await.unwrap();
        assert_eq!(tenant.usage.gpus, 2);
        assert_eq!(tenant.usage.jobs, 1);
        assert_eq!(scheduler.metrics().jobs_scheduled, 1);
    }

    #[tokio::test]
    async fn test_reconcile_rebuilds_drifted_state() {
        let repo = repo_with_tenant().await;
        let node = Node::new("node-a", "fleet:7070", 2, 64, 512_000);
        repo.create_node(&node).await.unwrap();
        for i in 0..2 {
            repo.create_gpu(&Gpu::new(format!("gpu-{i}"), "node-a", i, GpuModel::A100, 80_000))
                .await
                .unwrap();
        }

        // A crash mid-preemption: allocation rows gone Preempted, but one
        // GPU still carries a binding and the node counter lags.
        let mut gpu = repo.get_gpu(&"gpu-0".into()).await.unwrap();
        gpu.bind("alloc-ghost".into(), "job-ghost".into(), "tenant-1".into());
        repo.update_gpu(&gpu).await.unwrap();
        let mut node = repo.get_node(&"node-a".into()).await.unwrap();
        node.available_gpus = 0;
        repo.update_node(&node).await.unwrap();

        let scheduler = Scheduler::new(config(), repo.clone());
        scheduler.start().await.unwrap();

        let node = repo.get_node(&"node-a".into()).await.unwrap();
        assert_eq!(node.available_gpus, 2);
        assert!(!repo.get_gpu(&"gpu-0".into()).await.unwrap().is_allocated());
    }
}
