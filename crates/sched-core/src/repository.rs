//! The storage contract the scheduler depends on
//!
//! Any backend (in-memory for tests, a SQL store in production) implements
//! this surface. Entities are stored one table per type; list fields inside a
//! row (GPU ids, command, env) serialize as JSON.

use crate::allocation::{Allocation, AllocationState};
use crate::gpu::Gpu;
use crate::job::{Job, JobState};
use crate::node::Node;
use crate::tenant::Tenant;
use crate::types::{AllocationId, GpuId, JobId, NodeId, TenantId};
use crate::Result;
use async_trait::async_trait;

/// Durable CRUD for jobs, tenants, GPUs, nodes, and allocations
///
/// Get operations distinguish not-found from other failures via
/// [`crate::Error::NotFound`]. The two allocation composites are the only
/// multi-entity writes the scheduler needs to be atomic; a backend must apply
/// each of them entirely or not at all. A partial commit that leaves
/// dangling GPU bindings after a crash violates the contract.
#[async_trait]
pub trait Repository: Send + Sync {
    // Job operations
    async fn create_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, job_id: &JobId) -> Result<Job>;
    async fn update_job(&self, job: &Job) -> Result<()>;
    async fn delete_job(&self, job_id: &JobId) -> Result<()>;
    async fn list_jobs_by_state(&self, state: JobState) -> Result<Vec<Job>>;
    async fn list_jobs_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Job>>;

    // Tenant operations
    async fn create_tenant(&self, tenant: &Tenant) -> Result<()>;
    async fn get_tenant(&self, tenant_id: &TenantId) -> Result<Tenant>;
    async fn update_tenant(&self, tenant: &Tenant) -> Result<()>;
    async fn delete_tenant(&self, tenant_id: &TenantId) -> Result<()>;
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    // GPU operations
    async fn create_gpu(&self, gpu: &Gpu) -> Result<()>;
    async fn get_gpu(&self, gpu_id: &GpuId) -> Result<Gpu>;
    async fn update_gpu(&self, gpu: &Gpu) -> Result<()>;
    async fn delete_gpu(&self, gpu_id: &GpuId) -> Result<()>;
    async fn list_gpus(&self) -> Result<Vec<Gpu>>;
    async fn list_gpus_by_node(&self, node_id: &NodeId) -> Result<Vec<Gpu>>;
    async fn list_available_gpus(&self) -> Result<Vec<Gpu>>;

    // Node operations
    async fn create_node(&self, node: &Node) -> Result<()>;
    async fn get_node(&self, node_id: &NodeId) -> Result<Node>;
    async fn update_node(&self, node: &Node) -> Result<()>;
    async fn delete_node(&self, node_id: &NodeId) -> Result<()>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    // Allocation operations
    async fn get_allocation(&self, allocation_id: &AllocationId) -> Result<Allocation>;
    async fn update_allocation(&self, allocation: &Allocation) -> Result<()>;
    async fn list_allocations_by_job(&self, job_id: &JobId) -> Result<Vec<Allocation>>;
    async fn list_active_allocations(&self) -> Result<Vec<Allocation>>;

    /// Atomically persist an Active allocation: insert the allocation row,
    /// bind every referenced GPU, and decrement the node's available
    /// counters. Fails with stale-node (and changes nothing) when a GPU was
    /// taken or the node counters drifted since selection.
    async fn commit_allocation(&self, allocation: &Allocation) -> Result<Allocation>;

    /// Atomically reverse a commit: move the allocation to `final_state`,
    /// unbind its GPUs, and restore the node's counters. Idempotent: an
    /// already-released allocation is returned unchanged.
    async fn release_allocation(
        &self,
        allocation_id: &AllocationId,
        final_state: AllocationState,
        preempted_by: Option<JobId>,
    ) -> Result<Allocation>;

    /// Health check against the backing store
    async fn ping(&self) -> Result<()>;

    /// Release any backend resources
    async fn close(&self) -> Result<()>;
}
