//! # sched-core
//!
//! Core types, traits, and utilities for the GPU scheduler, a multi-tenant
//! job scheduler for GPU fleets.
//!
//! This crate provides the foundational data structures and interfaces shared
//! by the scheduling engine and storage backends. It includes:
//!
//! - Domain entities: jobs, tenants, GPUs, nodes, and allocations
//! - The job and allocation lifecycle state machines
//! - The async [`Repository`] trait that storage backends implement
//! - Configuration schema and parsing utilities
//! - Error handling types and utilities

pub mod allocation;
pub mod config;
pub mod error;
pub mod gpu;
pub mod job;
pub mod node;
pub mod repository;
pub mod tenant;
pub mod types;

// Re-export commonly used types at the crate root
pub use allocation::{Allocation, AllocationRequest, AllocationState, Placement};
pub use config::SchedulerConfig;
pub use error::{Entity, Error, Result};
pub use gpu::{Gpu, GpuBinding, GpuHealth, GpuModel};
pub use job::{Job, JobState, JobStatus};
pub use node::Node;
pub use repository::Repository;
pub use tenant::{QuotaLimits, QuotaUsage, Tenant};
pub use types::{AllocationId, GpuId, JobId, NodeId, PriorityTier, ResourceRequest, TenantId};
