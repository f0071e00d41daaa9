//! GPU devices: allocation binding, telemetry, health, and thermal state

use crate::types::{AllocationId, GpuId, JobId, NodeId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// GPU hardware models known to the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuModel {
    A100,
    A10,
    H100,
    V100,
    T4,
    L4,
}

impl fmt::Display for GpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuModel::A100 => write!(f, "A100"),
            GpuModel::A10 => write!(f, "A10"),
            GpuModel::H100 => write!(f, "H100"),
            GpuModel::V100 => write!(f, "V100"),
            GpuModel::T4 => write!(f, "T4"),
            GpuModel::L4 => write!(f, "L4"),
        }
    }
}

/// Health status of a GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuHealth {
    Healthy,
    Warning,
    Degraded,
    Unhealthy,
}

/// Back-pointer from a GPU to the allocation it is bound to
///
/// Present iff the GPU is allocated; the owning side of the relationship is
/// the allocation's GPU id list, this is a denormalized lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuBinding {
    pub allocation_id: AllocationId,
    pub job_id: JobId,
    pub tenant_id: TenantId,
}

/// A physical GPU on a fleet node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    /// Unique GPU identifier
    pub id: GpuId,

    /// Node hosting this GPU
    pub node_id: NodeId,

    /// Hardware index on the node
    pub index: u32,

    /// Hardware model
    pub model: GpuModel,

    /// Total device memory in MB
    pub memory_total_mb: u64,

    /// Device memory in use in MB
    pub memory_used_mb: u64,

    /// Current allocation, if any
    pub binding: Option<GpuBinding>,

    /// Compute utilization (0.0 to 1.0)
    pub utilization: f32,

    /// Temperature in Celsius
    pub temperature_c: f32,

    /// Power draw in Watts
    pub power_watts: f32,

    /// Health status derived from telemetry
    pub health: GpuHealth,

    /// Whether the device is thermally throttled
    pub thermal_throttle: bool,

    /// The GPU is kept out of scheduling until this instant
    pub cooling_until: Option<DateTime<Utc>>,

    /// Last telemetry report
    pub last_heartbeat: DateTime<Utc>,
}

impl Gpu {
    /// Create a new healthy, unallocated GPU
    pub fn new(
        id: impl Into<GpuId>,
        node_id: impl Into<NodeId>,
        index: u32,
        model: GpuModel,
        memory_total_mb: u64,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            index,
            model,
            memory_total_mb,
            memory_used_mb: 0,
            binding: None,
            utilization: 0.0,
            temperature_c: 0.0,
            power_watts: 0.0,
            health: GpuHealth::Healthy,
            thermal_throttle: false,
            cooling_until: None,
            last_heartbeat: Utc::now(),
        }
    }

    /// Whether the GPU is bound to an allocation
    pub fn is_allocated(&self) -> bool {
        self.binding.is_some()
    }

    /// Free device memory in MB
    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }

    /// Whether the GPU can be handed to a new allocation
    ///
    /// Available means: not allocated, healthy, and (when thermal awareness
    /// is on) neither throttled nor inside its cooling window.
    pub fn is_available(&self, thermal_aware: bool, now: DateTime<Utc>) -> bool {
        if self.is_allocated() || self.health != GpuHealth::Healthy {
            return false;
        }
        if thermal_aware {
            if self.thermal_throttle {
                return false;
            }
            if let Some(until) = self.cooling_until {
                if now < until {
                    return false;
                }
            }
        }
        true
    }

    /// Bind the GPU to an allocation
    pub fn bind(&mut self, allocation_id: AllocationId, job_id: JobId, tenant_id: TenantId) {
        self.binding = Some(GpuBinding {
            allocation_id,
            job_id,
            tenant_id,
        });
    }

    /// Clear the allocation binding
    pub fn unbind(&mut self) {
        self.binding = None;
    }

    /// Ingest a telemetry report and re-derive health
    pub fn update_telemetry(&mut self, utilization: f32, temperature_c: f32, power_watts: f32) {
        self.utilization = utilization.clamp(0.0, 1.0);
        self.temperature_c = temperature_c;
        self.power_watts = power_watts;
        self.last_heartbeat = Utc::now();
        self.update_health();
    }

    /// Re-derive health from the current temperature
    pub fn update_health(&mut self) {
        self.health = match self.temperature_c {
            t if t > 85.0 => GpuHealth::Unhealthy,
            t if t > 75.0 => GpuHealth::Degraded,
            t if t > 65.0 => GpuHealth::Warning,
            _ => GpuHealth::Healthy,
        };
    }

    /// Whether the GPU is above the configured throttling threshold
    pub fn needs_cooling(&self, threshold_c: f32) -> bool {
        self.temperature_c > threshold_c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_gpu() -> Gpu {
        Gpu::new("gpu-0", "node-a", 0, GpuModel::A100, 80_000)
    }

    #[test]
    fn test_new_gpu_is_available() {
        let gpu = test_gpu();
        assert!(!gpu.is_allocated());
        assert!(gpu.is_available(true, Utc::now()));
    }

    #[test]
    fn test_bound_gpu_is_unavailable() {
        let mut gpu = test_gpu();
        gpu.bind(
            AllocationId::new("alloc-1"),
            JobId::new("job-1"),
            TenantId::new("tenant-1"),
        );
        assert!(gpu.is_allocated());
        assert!(!gpu.is_available(true, Utc::now()));

        gpu.unbind();
        assert!(gpu.is_available(true, Utc::now()));
    }

    #[test]
    fn test_thermal_throttle_respects_awareness_flag() {
        let mut gpu = test_gpu();
        gpu.thermal_throttle = true;
        assert!(!gpu.is_available(true, Utc::now()));
        // Thermal awareness off: throttle and cooling are ignored
        assert!(gpu.is_available(false, Utc::now()));
    }

    #[test]
    fn test_cooling_window() {
        let mut gpu = test_gpu();
        let now = Utc::now();
        gpu.cooling_until = Some(now + Duration::seconds(60));
        assert!(!gpu.is_available(true, now));
        assert!(gpu.is_available(true, now + Duration::seconds(61)));
    }

    #[test]
    fn test_health_ladder() {
        let mut gpu = test_gpu();

        gpu.update_telemetry(0.9, 60.0, 250.0);
        assert_eq!(gpu.health, GpuHealth::Healthy);

        gpu.update_telemetry(0.9, 70.0, 250.0);
        assert_eq!(gpu.health, GpuHealth::Warning);

        gpu.update_telemetry(0.9, 80.0, 250.0);
        assert_eq!(gpu.health, GpuHealth::Degraded);

        gpu.update_telemetry(0.9, 90.0, 250.0);
        assert_eq!(gpu.health, GpuHealth::Unhealthy);
        assert!(!gpu.is_available(true, Utc::now()));
    }

    #[test]
    fn test_needs_cooling() {
        let mut gpu = test_gpu();
        gpu.temperature_c = 80.0;
        assert!(gpu.needs_cooling(75.0));
        assert!(!gpu.needs_cooling(85.0));
    }
}
