//! Core type definitions for the scheduler

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $prefix:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create an id from a string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random id
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4()))
            }

            /// Get the string representation of the id
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the id is the empty string
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

id_type!(
    /// Unique identifier for a job
    JobId,
    "job"
);
id_type!(
    /// Unique identifier for a tenant
    TenantId,
    "tenant"
);
id_type!(
    /// Unique identifier for a GPU
    GpuId,
    "gpu"
);
id_type!(
    /// Unique identifier for a node in the fleet
    NodeId,
    "node"
);
id_type!(
    /// Unique identifier for a resource allocation
    AllocationId,
    "alloc"
);

/// Priority tier assigned to a tenant
///
/// Individual jobs carry an integer priority directly; the tier provides the
/// default score for a tenant's jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityTier {
    /// Integer priority score for this tier
    pub fn score(&self) -> i32 {
        match self {
            PriorityTier::Low => 100,
            PriorityTier::Medium => 500,
            PriorityTier::High => 1000,
            PriorityTier::Critical => 5000,
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityTier::Low => write!(f, "low"),
            PriorityTier::Medium => write!(f, "medium"),
            PriorityTier::High => write!(f, "high"),
            PriorityTier::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(PriorityTier::Low),
            "medium" => Ok(PriorityTier::Medium),
            "high" => Ok(PriorityTier::High),
            "critical" => Ok(PriorityTier::Critical),
            _ => Err(format!("Unknown priority tier: {}", s)),
        }
    }
}

/// Resources a job declares at submission time
///
/// The same shape is used for quota accounting and allocation requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Number of whole GPUs
    pub gpu_count: u32,

    /// GPU memory per device in MB
    pub gpu_memory_mb: u64,

    /// Host CPU cores
    pub cpu_cores: u32,

    /// Host memory in MB
    pub memory_mb: u64,
}

impl ResourceRequest {
    /// Create a new resource request
    pub fn new(gpu_count: u32, gpu_memory_mb: u64, cpu_cores: u32, memory_mb: u64) -> Self {
        Self {
            gpu_count,
            gpu_memory_mb,
            cpu_cores,
            memory_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation_is_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("job-"));
    }

    #[test]
    fn test_id_from_str() {
        let id = NodeId::from("node-a");
        assert_eq!(id.as_str(), "node-a");
        assert_eq!(id.to_string(), "node-a");
    }

    #[test]
    fn test_priority_tier_scores() {
        assert_eq!(PriorityTier::Low.score(), 100);
        assert_eq!(PriorityTier::Medium.score(), 500);
        assert_eq!(PriorityTier::High.score(), 1000);
        assert_eq!(PriorityTier::Critical.score(), 5000);
    }

    #[test]
    fn test_priority_tier_parse() {
        assert_eq!("critical".parse::<PriorityTier>(), Ok(PriorityTier::Critical));
        assert_eq!("HIGH".parse::<PriorityTier>(), Ok(PriorityTier::High));
        assert!("urgent".parse::<PriorityTier>().is_err());
    }
}
