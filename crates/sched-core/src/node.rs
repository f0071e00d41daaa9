//! Fleet nodes and their capacity counters

use crate::types::{NodeId, ResourceRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A physical node hosting GPUs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier
    pub id: NodeId,

    /// Network address of the node agent
    pub address: String,

    /// Total GPUs installed
    pub total_gpus: u32,

    /// GPUs not held by an active allocation
    pub available_gpus: u32,

    /// Total CPU cores
    pub total_cpu_cores: u32,

    /// CPU cores not held by an active allocation
    pub available_cpu_cores: u32,

    /// Total host memory in MB
    pub total_memory_mb: u64,

    /// Host memory not held by an active allocation in MB
    pub available_memory_mb: u64,

    /// Whether the node agent is reachable
    pub online: bool,

    /// Whether the operator has marked the node schedulable
    pub schedulable: bool,

    /// Draining nodes accept no new work
    pub draining: bool,

    /// Scheduling labels matched against placement hints
    pub labels: HashMap<String, String>,

    /// Last heartbeat from the node agent
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    /// Create a new online, schedulable node with all capacity available
    pub fn new(
        id: impl Into<NodeId>,
        address: impl Into<String>,
        total_gpus: u32,
        total_cpu_cores: u32,
        total_memory_mb: u64,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            total_gpus,
            available_gpus: total_gpus,
            total_cpu_cores,
            available_cpu_cores: total_cpu_cores,
            total_memory_mb,
            available_memory_mb: total_memory_mb,
            online: true,
            schedulable: true,
            draining: false,
            labels: HashMap::new(),
            last_heartbeat: Utc::now(),
        }
    }

    /// Builder pattern for labels
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether the node may receive new work at all
    pub fn is_schedulable(&self) -> bool {
        self.online && self.schedulable && !self.draining
    }

    /// Whether the node is schedulable and its available counters cover
    /// `request`
    pub fn has_capacity(&self, request: &ResourceRequest) -> bool {
        self.is_schedulable()
            && self.available_gpus >= request.gpu_count
            && self.available_cpu_cores >= request.cpu_cores
            && self.available_memory_mb >= request.memory_mb
    }

    /// Whether every required label matches this node's labels
    pub fn matches_labels(&self, required: &HashMap<String, String>) -> bool {
        required
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }

    /// Subtract an allocation's resources from the available counters
    ///
    /// Returns false when the counters no longer cover the request, leaving
    /// them untouched.
    pub fn reserve(&mut self, request: &ResourceRequest) -> bool {
        if self.available_gpus < request.gpu_count
            || self.available_cpu_cores < request.cpu_cores
            || self.available_memory_mb < request.memory_mb
        {
            return false;
        }
        self.available_gpus -= request.gpu_count;
        self.available_cpu_cores -= request.cpu_cores;
        self.available_memory_mb -= request.memory_mb;
        true
    }

    /// Return an allocation's resources to the available counters
    ///
    /// Clamped so that available never exceeds total.
    pub fn restore(&mut self, gpu_count: u32, cpu_cores: u32, memory_mb: u64) {
        self.available_gpus = (self.available_gpus + gpu_count).min(self.total_gpus);
        self.available_cpu_cores = (self.available_cpu_cores + cpu_cores).min(self.total_cpu_cores);
        self.available_memory_mb = (self.available_memory_mb + memory_mb).min(self.total_memory_mb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> Node {
        Node::new("node-a", "10.0.0.1:7070", 8, 64, 512_000)
    }

    #[test]
    fn test_schedulable_predicate() {
        let mut node = test_node();
        assert!(node.is_schedulable());

        node.draining = true;
        assert!(!node.is_schedulable());

        node.draining = false;
        node.online = false;
        assert!(!node.is_schedulable());
    }

    #[test]
    fn test_has_capacity() {
        let node = test_node();
        assert!(node.has_capacity(&ResourceRequest::new(8, 0, 64, 512_000)));
        assert!(!node.has_capacity(&ResourceRequest::new(9, 0, 1, 1)));
    }

    #[test]
    fn test_reserve_and_restore() {
        let mut node = test_node();
        let request = ResourceRequest::new(4, 0, 16, 128_000);

        assert!(node.reserve(&request));
        assert_eq!(node.available_gpus, 4);
        assert_eq!(node.available_cpu_cores, 48);

        node.restore(4, 16, 128_000);
        assert_eq!(node.available_gpus, 8);
        assert_eq!(node.available_memory_mb, 512_000);
    }

    #[test]
    fn test_reserve_fails_without_mutation() {
        let mut node = test_node();
        assert!(!node.reserve(&ResourceRequest::new(9, 0, 1, 1)));
        assert_eq!(node.available_gpus, 8);
    }

    #[test]
    fn test_restore_clamps_to_total() {
        let mut node = test_node();
        node.restore(2, 2, 2);
        assert_eq!(node.available_gpus, 8);
        assert_eq!(node.available_cpu_cores, 64);
        assert_eq!(node.available_memory_mb, 512_000);
    }

    #[test]
    fn test_label_matching() {
        let node = test_node().with_label("zone", "us-east-1a").with_label("tier", "a100");

        let mut required = HashMap::new();
        required.insert("zone".to_string(), "us-east-1a".to_string());
        assert!(node.matches_labels(&required));

        required.insert("tier".to_string(), "h100".to_string());
        assert!(!node.matches_labels(&required));
    }
}
