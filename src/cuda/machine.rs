//! The four-state checkpoint protocol and its rollback.
//!
//! ```text
//! RUNNING --lock--> LOCKED --checkpoint--> CHECKPOINTED
//!    ^                 |                          |
//!    |--unlock---------+--------restore-----------+
//! ```
//!
//! The composite helpers refuse to act on a process that is not at the
//! expected endpoint state, so repeating a full cycle is a `WrongState`
//! error rather than a double transition.

use crate::cuda::{CudaDriver, GpuInfo, MigrationPlan, ProcessState};
use crate::{KybernateError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Checkpointer {
    driver: Arc<dyn CudaDriver>,
}

impl Checkpointer {
    pub fn new(driver: Arc<dyn CudaDriver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<dyn CudaDriver> {
        &self.driver
    }

    pub fn state(&self, pid: u32) -> Result<ProcessState> {
        self.driver.get_state(pid)
    }

    pub fn lock(&self, pid: u32, timeout_ms: u32) -> Result<()> {
        self.driver.lock(pid, timeout_ms)
    }

    pub fn checkpoint(&self, pid: u32) -> Result<()> {
        self.driver.checkpoint(pid)
    }

    pub fn restore(&self, pid: u32) -> Result<()> {
        self.driver.restore(pid)
    }

    pub fn unlock(&self, pid: u32) -> Result<()> {
        self.driver.unlock(pid)
    }

    /// Full VRAM evacuation: `lock` then `checkpoint`.
    ///
    /// Requires the process to be `Running`. If `checkpoint` fails after a
    /// successful `lock`, a best-effort `unlock` returns the process to
    /// `Running` and the checkpoint error is reported.
    pub fn full_checkpoint(&self, pid: u32, timeout_ms: u32) -> Result<()> {
        let observed = self.driver.get_state(pid)?;
        if observed != ProcessState::Running {
            return Err(KybernateError::WrongState {
                expected: ProcessState::Running,
                observed,
            });
        }

        self.driver.lock(pid, timeout_ms)?;
        debug!("locked CUDA process {}", pid);

        if let Err(e) = self.driver.checkpoint(pid) {
            if let Err(unlock_err) = self.driver.unlock(pid) {
                warn!(
                    "rollback unlock failed for PID {} after checkpoint error: {}",
                    pid, unlock_err
                );
            }
            return Err(e);
        }

        info!("VRAM checkpointed to host memory for PID {}", pid);
        Ok(())
    }

    /// Full VRAM repopulation: `restore` (optionally remapping devices)
    /// then `unlock`.
    ///
    /// Requires the process to be `Checkpointed`. An `unlock` failure is
    /// surfaced without a re-lock; the process already holds VRAM, so the
    /// partial unlock is a diagnostic-only degradation.
    pub fn full_restore(&self, pid: u32, plan: Option<&MigrationPlan>) -> Result<()> {
        let observed = self.driver.get_state(pid)?;
        if observed != ProcessState::Checkpointed {
            return Err(KybernateError::WrongState {
                expected: ProcessState::Checkpointed,
                observed,
            });
        }

        match plan {
            Some(plan) => {
                info!(
                    "restoring PID {} with device remap {} -> {}",
                    pid, plan.source, plan.target
                );
                self.driver
                    .restore_with_remap(pid, &plan.source, &plan.target)?;
            }
            None => self.driver.restore(pid)?,
        }
        debug!("VRAM restored for PID {}", pid);

        self.driver.unlock(pid)?;
        info!("CUDA process {} unlocked and running", pid);
        Ok(())
    }

    pub fn devices(&self) -> Result<Vec<GpuInfo>> {
        let count = self.driver.device_count()?;
        let mut devices = Vec::with_capacity(count);
        for index in 0..count {
            devices.push(GpuInfo {
                index,
                uuid: self.driver.device_uuid(index)?,
            });
        }
        Ok(devices)
    }

    /// Build a remap plan between two enumerated devices.
    pub fn migration_plan(&self, source_index: usize, target_index: usize) -> Result<MigrationPlan> {
        Ok(MigrationPlan::new(
            self.driver.device_uuid(source_index)?,
            self.driver.device_uuid(target_index)?,
        ))
    }
}
