//! In-memory repository for tests and development
//!
//! Entities live in per-type concurrent maps. The two allocation composites
//! serialize on a single async mutex and validate before mutating anything,
//! so a rejected commit leaves the store untouched.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sched_core::{
    Allocation, AllocationId, AllocationState, Entity, Error, Gpu, GpuId, Job, JobId, JobState,
    Node, NodeId, Repository, ResourceRequest, Result, Tenant, TenantId,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Operation counters for the store
#[derive(Debug, Default)]
pub struct StoreStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub commits: AtomicU64,
    pub releases: AtomicU64,
    pub stale_commits: AtomicU64,
}

/// In-memory implementation of the [`Repository`] contract
#[derive(Clone, Default)]
pub struct MemoryRepository {
    jobs: Arc<DashMap<JobId, Job>>,
    tenants: Arc<DashMap<TenantId, Tenant>>,
    gpus: Arc<DashMap<GpuId, Gpu>>,
    nodes: Arc<DashMap<NodeId, Node>>,
    allocations: Arc<DashMap<AllocationId, Allocation>>,

    /// Serializes the transactional composites
    commit_lock: Arc<Mutex<()>>,

    stats: Arc<StoreStats>,
}

impl MemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation counters
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    fn read(&self) {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self) {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_job(&self, job: &Job) -> Result<()> {
        self.write();
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Job> {
        self.read();
        self.jobs
            .get(job_id)
            .map(|j| j.clone())
            .ok_or_else(|| Error::not_found(Entity::Job, job_id))
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        self.write();
        if !self.jobs.contains_key(&job.id) {
            return Err(Error::not_found(Entity::Job, &job.id));
        }
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        self.write();
        self.jobs
            .remove(job_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(Entity::Job, job_id))
    }

    async fn list_jobs_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        self.read();
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.state == state)
            .map(|j| j.clone())
            .collect())
    }

    async fn list_jobs_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Job>> {
        self.read();
        Ok(self
            .jobs
            .iter()
            .filter(|j| &j.tenant_id == tenant_id)
            .map(|j| j.clone())
            .collect())
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.write();
        self.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &TenantId) -> Result<Tenant> {
        self.read();
        self.tenants
            .get(tenant_id)
            .map(|t| t.clone())
            .ok_or_else(|| Error::not_found(Entity::Tenant, tenant_id))
    }

    async fn update_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.write();
        if !self.tenants.contains_key(&tenant.id) {
            return Err(Error::not_found(Entity::Tenant, &tenant.id));
        }
        self.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &TenantId) -> Result<()> {
        self.write();
        self.tenants
            .remove(tenant_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(Entity::Tenant, tenant_id))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        self.read();
        Ok(self.tenants.iter().map(|t| t.clone()).collect())
    }

    async fn create_gpu(&self, gpu: &Gpu) -> Result<()> {
        self.write();
        self.gpus.insert(gpu.id.clone(), gpu.clone());
        Ok(())
    }

    async fn get_gpu(&self, gpu_id: &GpuId) -> Result<Gpu> {
        self.read();
        self.gpus
            .get(gpu_id)
            .map(|g| g.clone())
            .ok_or_else(|| Error::not_found(Entity::Gpu, gpu_id))
    }

    async fn update_gpu(&self, gpu: &Gpu) -> Result<()> {
        self.write();
        if !self.gpus.contains_key(&gpu.id) {
            return Err(Error::not_found(Entity::Gpu, &gpu.id));
        }
        self.gpus.insert(gpu.id.clone(), gpu.clone());
        Ok(())
    }

    async fn delete_gpu(&self, gpu_id: &GpuId) -> Result<()> {
        self.write();
        self.gpus
            .remove(gpu_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(Entity::Gpu, gpu_id))
    }

    async fn list_gpus(&self) -> Result<Vec<Gpu>> {
        self.read();
        Ok(self.gpus.iter().map(|g| g.clone()).collect())
    }

    async fn list_gpus_by_node(&self, node_id: &NodeId) -> Result<Vec<Gpu>> {
        self.read();
        Ok(self
            .gpus
            .iter()
            .filter(|g| &g.node_id == node_id)
            .map(|g| g.clone())
            .collect())
    }

    async fn list_available_gpus(&self) -> Result<Vec<Gpu>> {
        self.read();
        let now = Utc::now();
        Ok(self
            .gpus
            .iter()
            .filter(|g| g.is_available(true, now))
            .map(|g| g.clone())
            .collect())
    }

    async fn create_node(&self, node: &Node) -> Result<()> {
        self.write();
        self.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, node_id: &NodeId) -> Result<Node> {
        self.read();
        self.nodes
            .get(node_id)
            .map(|n| n.clone())
            .ok_or_else(|| Error::not_found(Entity::Node, node_id))
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        self.write();
        if !self.nodes.contains_key(&node.id) {
            return Err(Error::not_found(Entity::Node, &node.id));
        }
        self.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, node_id: &NodeId) -> Result<()> {
        self.write();
        self.nodes
            .remove(node_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(Entity::Node, node_id))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.read();
        Ok(self.nodes.iter().map(|n| n.clone()).collect())
    }

    async fn get_allocation(&self, allocation_id: &AllocationId) -> Result<Allocation> {
        self.read();
        self.allocations
            .get(allocation_id)
            .map(|a| a.clone())
            .ok_or_else(|| Error::not_found(Entity::Allocation, allocation_id))
    }

    async fn update_allocation(&self, allocation: &Allocation) -> Result<()> {
        self.write();
        if !self.allocations.contains_key(&allocation.id) {
            return Err(Error::not_found(Entity::Allocation, &allocation.id));
        }
        self.allocations
            .insert(allocation.id.clone(), allocation.clone());
        Ok(())
    }

    async fn list_allocations_by_job(&self, job_id: &JobId) -> Result<Vec<Allocation>> {
        self.read();
        Ok(self
            .allocations
            .iter()
            .filter(|a| &a.job_id == job_id)
            .map(|a| a.clone())
            .collect())
    }

    async fn list_active_allocations(&self) -> Result<Vec<Allocation>> {
        self.read();
        Ok(self
            .allocations
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.clone())
            .collect())
    }

    async fn commit_allocation(&self, allocation: &Allocation) -> Result<Allocation> {
        if allocation.state != AllocationState::Active {
            return Err(Error::repository(format!(
                "cannot commit allocation {} in state {}",
                allocation.id, allocation.state
            )));
        }

        let _guard = self.commit_lock.lock().await;

        // Validate everything before touching anything, so failure leaves no
        // partial bindings behind.
        let mut node = self
            .nodes
            .get(&allocation.node_id)
            .map(|n| n.clone())
            .ok_or_else(|| Error::not_found(Entity::Node, &allocation.node_id))?;

        let mut bound_gpus = Vec::with_capacity(allocation.gpu_ids.len());
        for gpu_id in &allocation.gpu_ids {
            let gpu = self
                .gpus
                .get(gpu_id)
                .map(|g| g.clone())
                .ok_or_else(|| Error::not_found(Entity::Gpu, gpu_id))?;
            if gpu.is_allocated() {
                self.stats.stale_commits.fetch_add(1, Ordering::Relaxed);
                return Err(Error::stale_node(format!(
                    "GPU {} already bound to allocation {}",
                    gpu_id,
                    gpu.binding.as_ref().map(|b| b.allocation_id.as_str()).unwrap_or("")
                )));
            }
            bound_gpus.push(gpu);
        }

        let reservation = ResourceRequest::new(
            allocation.gpu_ids.len() as u32,
            0,
            allocation.cpu_cores,
            allocation.memory_mb,
        );
        if !node.reserve(&reservation) {
            self.stats.stale_commits.fetch_add(1, Ordering::Relaxed);
            return Err(Error::stale_node(format!(
                "node {} counters no longer cover the request",
                node.id
            )));
        }

        // Apply: allocation row, GPU bindings, node counters.
        for mut gpu in bound_gpus {
            gpu.bind(
                allocation.id.clone(),
                allocation.job_id.clone(),
                allocation.tenant_id.clone(),
            );
            self.gpus.insert(gpu.id.clone(), gpu);
        }
        self.nodes.insert(node.id.clone(), node);
        self.allocations
            .insert(allocation.id.clone(), allocation.clone());

        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        debug!(
            allocation_id = %allocation.id,
            job_id = %allocation.job_id,
            node_id = %allocation.node_id,
            gpus = allocation.gpu_ids.len(),
            "allocation committed"
        );
        Ok(allocation.clone())
    }

    async fn release_allocation(
        &self,
        allocation_id: &AllocationId,
        final_state: AllocationState,
        preempted_by: Option<JobId>,
    ) -> Result<Allocation> {
        let _guard = self.commit_lock.lock().await;

        let mut allocation = self
            .allocations
            .get(allocation_id)
            .map(|a| a.clone())
            .ok_or_else(|| Error::not_found(Entity::Allocation, allocation_id))?;

        if !allocation.is_active() {
            debug!(%allocation_id, state = %allocation.state, "release on already-released allocation");
            return Ok(allocation);
        }

        allocation.finish(final_state, preempted_by)?;

        for gpu_id in &allocation.gpu_ids {
            match self.gpus.get(gpu_id).map(|g| g.clone()) {
                Some(mut gpu) => {
                    // Only clear bindings that still point at this allocation.
                    if gpu
                        .binding
                        .as_ref()
                        .is_some_and(|b| &b.allocation_id == allocation_id)
                    {
                        gpu.unbind();
                        self.gpus.insert(gpu.id.clone(), gpu);
                    }
                }
                None => warn!(%gpu_id, %allocation_id, "bound GPU missing during release"),
            }
        }

        if let Some(mut node) = self.nodes.get(&allocation.node_id).map(|n| n.clone()) {
            node.restore(
                allocation.gpu_ids.len() as u32,
                allocation.cpu_cores,
                allocation.memory_mb,
            );
            self.nodes.insert(node.id.clone(), node);
        } else {
            warn!(node_id = %allocation.node_id, %allocation_id, "node missing during release");
        }

        self.allocations
            .insert(allocation.id.clone(), allocation.clone());

        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        debug!(%allocation_id, state = %final_state, "allocation released");
        Ok(allocation)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
