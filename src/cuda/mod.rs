//! Bindings to the NVIDIA CUDA checkpoint entry points.
//!
//! The driver owns the per-process checkpoint state; this module only
//! observes and transitions it. The entry points are reached through the
//! [`CudaDriver`] trait so that the state machine and its tests can run
//! against a pure in-memory simulator ([`FakeDriver`]).

mod driver;
mod fake;
mod machine;
mod migration;

pub use driver::CheckpointTool;
pub use fake::{DriverCall, FakeDriver};
pub use machine::Checkpointer;
pub use migration::{GpuInfo, GpuUuid, MigrationPlan};

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Driver code reported when the lock deadline elapses before the process
/// reaches a quiescent point.
pub const CUDA_ERROR_TIMEOUT: i32 = 909;

/// Driver code reported when the PID is not a CUDA process.
pub const CUDA_ERROR_PROCESS_NOT_FOUND: i32 = 910;

/// The checkpoint state the driver holds for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    Locked,
    Checkpointed,
    /// A driver-reported value outside the known set.
    Unknown(i32),
}

impl ProcessState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ProcessState::Running,
            1 => ProcessState::Locked,
            2 => ProcessState::Checkpointed,
            other => ProcessState::Unknown(other),
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Locked => write!(f, "locked"),
            ProcessState::Checkpointed => write!(f, "checkpointed"),
            ProcessState::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// The driver's process-checkpoint entry points.
///
/// Implementations are re-entrant across distinct PIDs, but each per-PID
/// sequence `lock -> checkpoint -> restore -> unlock` must be linear.
/// Every failure carries the driver's numeric code and the logical
/// operation name; implementations never swallow codes.
pub trait CudaDriver: Send + Sync {
    /// Observe the checkpoint state of a process.
    fn get_state(&self, pid: u32) -> Result<ProcessState>;

    /// Block further work submission from `pid`. Fails with the driver's
    /// timeout code when no quiescent point is reached within `timeout_ms`.
    fn lock(&self, pid: u32, timeout_ms: u32) -> Result<()>;

    /// Evacuate VRAM to driver-owned host memory. Precondition: `Locked`.
    fn checkpoint(&self, pid: u32) -> Result<()>;

    /// Move host memory contents back to VRAM. Precondition: `Checkpointed`.
    fn restore(&self, pid: u32) -> Result<()>;

    /// Like [`CudaDriver::restore`], remapping VRAM blob references from
    /// the device `old` onto the device `new`.
    fn restore_with_remap(&self, pid: u32, old: &GpuUuid, new: &GpuUuid) -> Result<()>;

    /// Inverse of [`CudaDriver::lock`]; state returns to `Running`.
    fn unlock(&self, pid: u32) -> Result<()>;

    fn device_count(&self) -> Result<usize>;

    fn device_uuid(&self, index: usize) -> Result<GpuUuid>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_raw() {
        assert_eq!(ProcessState::from_raw(0), ProcessState::Running);
        assert_eq!(ProcessState::from_raw(1), ProcessState::Locked);
        assert_eq!(ProcessState::from_raw(2), ProcessState::Checkpointed);
        assert_eq!(ProcessState::from_raw(7), ProcessState::Unknown(7));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Locked.to_string(), "locked");
        assert_eq!(ProcessState::Checkpointed.to_string(), "checkpointed");
        assert_eq!(ProcessState::Unknown(5).to_string(), "unknown(5)");
    }
}
