//! Jobs and the job lifecycle state machine

use crate::error::{Entity, Error, Result};
use crate::types::{GpuId, JobId, NodeId, ResourceRequest, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in the scheduling queue
    Pending,
    /// Holds exactly one active allocation
    Running,
    /// Finished successfully (terminal)
    Completed,
    /// Finished unsuccessfully (terminal)
    Failed,
    /// Evicted by a higher-priority job; not terminal, but not re-queued
    Preempted,
    /// Cancelled by the submitter (terminal)
    Cancelled,
}

impl JobState {
    /// Whether a transition from `self` to `next` is permitted
    ///
    /// ```text
    /// Pending  -> Running | Cancelled
    /// Running  -> Completed | Failed | Cancelled | Preempted
    /// Preempted -> Pending   (explicit re-enqueue only)
    /// ```
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Preempted)
                | (Preempted, Pending)
        )
    }

    /// Whether the state is a sink with no transitions out
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Preempted => write!(f, "preempted"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A GPU job submitted by a tenant
///
/// The scheduler never runs the payload; `image`, `command`, and `env` are
/// opaque to the engine and handed to the external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// Human-readable name
    pub name: String,

    /// Current lifecycle state
    pub state: JobState,

    /// Integer priority; higher is more urgent
    pub priority: i32,

    /// Declared resources
    pub resources: ResourceRequest,

    /// All-or-nothing allocation of the full GPU set
    pub gang_scheduling: bool,

    /// Maximum runtime before the executor should stop the job
    pub max_runtime: Option<Duration>,

    /// Container image (opaque executor payload)
    pub image: Option<String>,

    /// Command and arguments (opaque executor payload)
    pub command: Vec<String>,

    /// Environment variables (opaque executor payload)
    pub env: HashMap<String, String>,

    /// Free-form metadata labels
    pub labels: HashMap<String, String>,

    /// Set when the job is accepted for scheduling
    pub submitted_at: Option<DateTime<Utc>>,

    /// Set when the scheduler picks a placement
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Set when the job enters Running
    pub started_at: Option<DateTime<Utc>>,

    /// Set when the job reaches a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// How many times this job has been preempted
    pub preempted_count: u32,
}

impl Job {
    /// Create a new job in Pending state
    pub fn new(
        tenant_id: impl Into<TenantId>,
        name: impl Into<String>,
        priority: i32,
        resources: ResourceRequest,
    ) -> Self {
        Self {
            id: JobId::generate(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            state: JobState::Pending,
            priority,
            resources,
            gang_scheduling: false,
            max_runtime: None,
            image: None,
            command: Vec::new(),
            env: HashMap::new(),
            labels: HashMap::new(),
            submitted_at: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            preempted_count: 0,
        }
    }

    /// Builder pattern for optional fields
    pub fn with_gang_scheduling(mut self, gang: bool) -> Self {
        self.gang_scheduling = gang;
        self
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Move the job to `next`, stamping timestamps
    ///
    /// Rejects transitions the state machine forbids, including any
    /// transition out of a terminal state.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_transition(
                Entity::Job,
                &self.id,
                self.state,
                next,
            ));
        }

        match next {
            JobState::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            JobState::Completed | JobState::Failed | JobState::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            JobState::Preempted => {
                self.preempted_count += 1;
            }
            JobState::Pending => {}
        }

        self.state = next;
        Ok(())
    }

    /// Whether the job is pending or running
    pub fn is_active(&self) -> bool {
        matches!(self.state, JobState::Pending | JobState::Running)
    }

    /// Wall-clock runtime, if the job has both started and finished
    pub fn actual_duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Detailed status report for a job, as surfaced to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// The job this status describes
    pub job_id: JobId,

    /// Current lifecycle state
    pub state: JobState,

    /// GPUs bound to the job (Running only)
    pub allocated_gpus: Vec<GpuId>,

    /// Node hosting the job (Running only)
    pub node_id: Option<NodeId>,

    /// 1-indexed rank in the queue (Pending only)
    pub queue_position: Option<usize>,

    /// Coarse, advisory wait estimate (Pending only)
    pub estimated_wait: Option<Duration>,
}

impl JobStatus {
    /// Create a status report carrying only the state
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            allocated_gpus: Vec::new(),
            node_id: None,
            queue_position: None,
            estimated_wait: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Job {
        Job::new("tenant-1", "train-llm", 500, ResourceRequest::new(2, 16000, 8, 32000))
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = test_job();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.started_at.is_none());
        assert_eq!(job.preempted_count, 0);
    }

    #[test]
    fn test_pending_to_running_stamps_started_at() {
        let mut job = test_job();
        job.transition(JobState::Running).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                JobState::Pending,
                JobState::Running,
                JobState::Completed,
                JobState::Failed,
                JobState::Preempted,
                JobState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut job = test_job();
        let err = job.transition(JobState::Completed).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        // State unchanged on rejection
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_preemption_increments_counter() {
        let mut job = test_job();
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Preempted).unwrap();
        assert_eq!(job.preempted_count, 1);
        assert!(!job.state.is_terminal());

        // Preempted may be explicitly re-queued
        job.transition(JobState::Pending).unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_cancel_stamps_completed_at() {
        let mut job = test_job();
        job.transition(JobState::Cancelled).unwrap();
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_builder_payload_fields() {
        let job = test_job()
            .with_gang_scheduling(true)
            .with_image("nvcr.io/pytorch:24.01")
            .with_command(vec!["python".into(), "train.py".into()])
            .with_env("BATCH_SIZE", "128");

        assert!(job.gang_scheduling);
        assert_eq!(job.image.as_deref(), Some("nvcr.io/pytorch:24.01"));
        assert_eq!(job.env.get("BATCH_SIZE").map(String::as_str), Some("128"));
    }
}
