//! Resource allocations and allocation requests

use crate::error::{Entity, Error, Result};
use crate::gpu::GpuModel;
use crate::job::Job;
use crate::types::{AllocationId, GpuId, JobId, NodeId, ResourceRequest, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of an allocation
///
/// Everything other than Active is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    Active,
    Preempted,
    Completed,
    Failed,
}

impl AllocationState {
    /// Whether a transition from `self` to `next` is permitted
    pub fn can_transition_to(self, next: AllocationState) -> bool {
        self == AllocationState::Active && next != AllocationState::Active
    }

    /// Whether the state is terminal
    pub fn is_terminal(self) -> bool {
        self != AllocationState::Active
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationState::Active => write!(f, "active"),
            AllocationState::Preempted => write!(f, "preempted"),
            AllocationState::Completed => write!(f, "completed"),
            AllocationState::Failed => write!(f, "failed"),
        }
    }
}

/// A set of resources bound to a job on a single node
///
/// The allocation owns its GPU id list; the GPU-side binding is a
/// denormalized back-pointer. All GPUs belong to `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique allocation identifier
    pub id: AllocationId,

    /// Job this allocation serves
    pub job_id: JobId,

    /// Tenant owning the job
    pub tenant_id: TenantId,

    /// Node the resources live on
    pub node_id: NodeId,

    /// GPUs bound to the job; cardinality equals the job's gpu_count
    pub gpu_ids: Vec<GpuId>,

    /// CPU cores reserved on the node
    pub cpu_cores: u32,

    /// Host memory reserved on the node in MB
    pub memory_mb: u64,

    /// Lifecycle state
    pub state: AllocationState,

    pub allocated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub preempted_at: Option<DateTime<Utc>>,

    /// The admitting job when the allocation was preempted
    pub preempted_by: Option<JobId>,

    /// Wall-clock lifetime, computed when the allocation leaves Active
    pub actual_duration: Option<Duration>,

    /// Running average GPU utilization over the allocation
    pub avg_gpu_utilization: f32,

    /// Peak GPU utilization over the allocation
    pub peak_gpu_utilization: f32,
}

impl Allocation {
    /// Create a new active allocation
    pub fn new(
        job_id: JobId,
        tenant_id: TenantId,
        node_id: NodeId,
        gpu_ids: Vec<GpuId>,
        cpu_cores: u32,
        memory_mb: u64,
    ) -> Self {
        Self {
            id: AllocationId::generate(),
            job_id,
            tenant_id,
            node_id,
            gpu_ids,
            cpu_cores,
            memory_mb,
            state: AllocationState::Active,
            allocated_at: Utc::now(),
            completed_at: None,
            preempted_at: None,
            preempted_by: None,
            actual_duration: None,
            avg_gpu_utilization: 0.0,
            peak_gpu_utilization: 0.0,
        }
    }

    /// Whether the allocation currently holds its resources
    pub fn is_active(&self) -> bool {
        self.state == AllocationState::Active
    }

    /// Move the allocation to a terminal state, stamping timestamps
    pub fn finish(&mut self, state: AllocationState, preempted_by: Option<JobId>) -> Result<()> {
        if !self.state.can_transition_to(state) {
            return Err(Error::invalid_transition(
                Entity::Allocation,
                &self.id,
                self.state,
                state,
            ));
        }

        let now = Utc::now();
        match state {
            AllocationState::Preempted => {
                self.preempted_at = Some(now);
                self.preempted_by = preempted_by;
            }
            AllocationState::Completed | AllocationState::Failed => {
                self.completed_at = Some(now);
            }
            AllocationState::Active => unreachable!(),
        }
        self.actual_duration = (now - self.allocated_at).to_std().ok();
        self.state = state;
        Ok(())
    }

    /// Fold a utilization sample into the aggregates
    pub fn update_utilization(&mut self, current: f32) {
        if current > self.peak_gpu_utilization {
            self.peak_gpu_utilization = current;
        }
        if self.avg_gpu_utilization == 0.0 {
            self.avg_gpu_utilization = current;
        } else {
            self.avg_gpu_utilization = (self.avg_gpu_utilization + current) / 2.0;
        }
    }
}

/// A request for the allocator to place a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Job to place
    pub job_id: JobId,

    /// Tenant owning the job
    pub tenant_id: TenantId,

    /// Resources to reserve
    pub resources: ResourceRequest,

    /// All-or-nothing placement on one node
    pub gang_scheduling: bool,

    /// Nodes to try before the rest of the fleet
    pub preferred_nodes: Vec<NodeId>,

    /// Labels a node must carry to be considered
    pub required_labels: HashMap<String, String>,

    /// Affinity: place on the node hosting this job's active allocation
    pub colocate_with: Option<JobId>,

    /// Anti-affinity: avoid nodes hosting these jobs' active allocations
    pub anti_colocate_with: Vec<JobId>,

    /// Restrict placement to a specific GPU model
    pub gpu_model: Option<GpuModel>,
}

impl AllocationRequest {
    /// Build the request for a job's declared resources
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            resources: job.resources,
            gang_scheduling: job.gang_scheduling,
            preferred_nodes: Vec::new(),
            required_labels: HashMap::new(),
            colocate_with: None,
            anti_colocate_with: Vec::new(),
            gpu_model: None,
        }
    }

    /// Builder pattern for placement hints
    pub fn with_preferred_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.preferred_nodes = nodes;
        self
    }

    pub fn with_required_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required_labels.insert(key.into(), value.into());
        self
    }

    pub fn with_colocate_with(mut self, job_id: JobId) -> Self {
        self.colocate_with = Some(job_id);
        self
    }

    pub fn with_anti_colocate_with(mut self, jobs: Vec<JobId>) -> Self {
        self.anti_colocate_with = jobs;
        self
    }

    pub fn with_gpu_model(mut self, model: GpuModel) -> Self {
        self.gpu_model = Some(model);
        self
    }
}

/// A successful placement returned by the allocator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub allocation_id: AllocationId,
    pub node_id: NodeId,
    pub gpu_ids: Vec<GpuId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocation() -> Allocation {
        Allocation::new(
            JobId::new("job-1"),
            TenantId::new("tenant-1"),
            NodeId::new("node-a"),
            vec![GpuId::new("gpu-0"), GpuId::new("gpu-1")],
            8,
            32_000,
        )
    }

    #[test]
    fn test_new_allocation_is_active() {
        let alloc = test_allocation();
        assert!(alloc.is_active());
        assert!(alloc.completed_at.is_none());
    }

    #[test]
    fn test_finish_completed_stamps_duration() {
        let mut alloc = test_allocation();
        alloc.finish(AllocationState::Completed, None).unwrap();
        assert_eq!(alloc.state, AllocationState::Completed);
        assert!(alloc.completed_at.is_some());
        assert!(alloc.actual_duration.is_some());
    }

    #[test]
    fn test_finish_preempted_records_preemptor() {
        let mut alloc = test_allocation();
        let admitted = JobId::new("job-2");
        alloc
            .finish(AllocationState::Preempted, Some(admitted.clone()))
            .unwrap();
        assert_eq!(alloc.preempted_by, Some(admitted));
        assert!(alloc.preempted_at.is_some());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut alloc = test_allocation();
        alloc.finish(AllocationState::Completed, None).unwrap();

        let err = alloc.finish(AllocationState::Failed, None).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_utilization_aggregates() {
        let mut alloc = test_allocation();
        alloc.update_utilization(0.4);
        alloc.update_utilization(0.8);
        assert_eq!(alloc.peak_gpu_utilization, 0.8);
        assert!((alloc.avg_gpu_utilization - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_request_for_job_carries_gang_flag() {
        let job = Job::new(
            "tenant-1",
            "train",
            500,
            ResourceRequest::new(4, 40_000, 16, 64_000),
        )
        .with_gang_scheduling(true);

        let request = AllocationRequest::for_job(&job);
        assert!(request.gang_scheduling);
        assert_eq!(request.resources.gpu_count, 4);
        assert_eq!(request.job_id, job.id);
        assert!(request.colocate_with.is_none());
        assert!(request.anti_colocate_with.is_empty());
    }

    #[test]
    fn test_request_affinity_hints() {
        let job = Job::new(
            "tenant-1",
            "serve",
            500,
            ResourceRequest::new(1, 16_000, 4, 16_000),
        );
        let peer = JobId::new("job-peer");
        let rival = JobId::new("job-rival");

        let request = AllocationRequest::for_job(&job)
            .with_colocate_with(peer.clone())
            .with_anti_colocate_with(vec![rival.clone()]);

        assert_eq!(request.colocate_with, Some(peer));
        assert_eq!(request.anti_colocate_with, vec![rival]);
    }
}
