//! In-memory stand-in for the driver's checkpoint entry points.
//!
//! Holds a per-PID state table, enforces the transition diagram, and keeps
//! an observable log of every call so tests can assert on rollback
//! behavior. Failures are injectable per operation.

use crate::cuda::{
    CudaDriver, GpuUuid, ProcessState, CUDA_ERROR_PROCESS_NOT_FOUND, CUDA_ERROR_TIMEOUT,
};
use crate::{KybernateError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    GetState(u32),
    Lock { pid: u32, timeout_ms: u32 },
    Checkpoint(u32),
    Restore(u32),
    RestoreRemap { pid: u32, old: GpuUuid, new: GpuUuid },
    Unlock(u32),
}

#[derive(Default)]
struct Inner {
    procs: HashMap<u32, ProcessState>,
    calls: Vec<DriverCall>,
    lock_delay_ms: u32,
    fail_checkpoint: Option<i32>,
    fail_restore: Option<i32>,
    fail_unlock: Option<i32>,
    devices: Vec<GpuUuid>,
}

#[derive(Default)]
pub struct FakeDriver {
    inner: Mutex<Inner>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a PID in the `Running` state, as a freshly started CUDA
    /// process would appear.
    pub fn register(&self, pid: u32) {
        self.register_with_state(pid, ProcessState::Running);
    }

    pub fn register_with_state(&self, pid: u32, state: ProcessState) {
        self.inner.lock().unwrap().procs.insert(pid, state);
    }

    pub fn add_device(&self, uuid: GpuUuid) {
        self.inner.lock().unwrap().devices.push(uuid);
    }

    /// Simulate a driver that needs `delay_ms` to reach a quiescent point;
    /// a lock with a smaller budget fails with the timeout code.
    pub fn set_lock_delay_ms(&self, delay_ms: u32) {
        self.inner.lock().unwrap().lock_delay_ms = delay_ms;
    }

    pub fn fail_checkpoint_with(&self, code: i32) {
        self.inner.lock().unwrap().fail_checkpoint = Some(code);
    }

    pub fn fail_restore_with(&self, code: i32) {
        self.inner.lock().unwrap().fail_restore = Some(code);
    }

    pub fn fail_unlock_with(&self, code: i32) {
        self.inner.lock().unwrap().fail_unlock = Some(code);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn unlock_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| matches!(c, DriverCall::Unlock(_)))
            .count()
    }

    fn transition(
        inner: &mut Inner,
        pid: u32,
        op: &'static str,
        expected: ProcessState,
        next: ProcessState,
        fail: Option<i32>,
    ) -> Result<()> {
        let observed = *inner
            .procs
            .get(&pid)
            .ok_or(KybernateError::Driver {
                code: CUDA_ERROR_PROCESS_NOT_FOUND,
                op,
            })?;
        if observed != expected {
            return Err(KybernateError::WrongState { expected, observed });
        }
        if let Some(code) = fail {
            return Err(KybernateError::Driver { code, op });
        }
        inner.procs.insert(pid, next);
        Ok(())
    }
}

impl CudaDriver for FakeDriver {
    fn get_state(&self, pid: u32) -> Result<ProcessState> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(DriverCall::GetState(pid));
        inner
            .procs
            .get(&pid)
            .copied()
            .ok_or(KybernateError::Driver {
                code: CUDA_ERROR_PROCESS_NOT_FOUND,
                op: "get_state",
            })
    }

    fn lock(&self, pid: u32, timeout_ms: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(DriverCall::Lock { pid, timeout_ms });
        if inner.lock_delay_ms > timeout_ms {
            // The deadline elapses before quiescence; state is unchanged.
            return Err(KybernateError::Driver {
                code: CUDA_ERROR_TIMEOUT,
                op: "lock",
            });
        }
        Self::transition(
            &mut inner,
            pid,
            "lock",
            ProcessState::Running,
            ProcessState::Locked,
            None,
        )
    }

    fn checkpoint(&self, pid: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(DriverCall::Checkpoint(pid));
        let fail = inner.fail_checkpoint;
        Self::transition(
            &mut inner,
            pid,
            "checkpoint",
            ProcessState::Locked,
            ProcessState::Checkpointed,
            fail,
        )
    }

    fn restore(&self, pid: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(DriverCall::Restore(pid));
        let fail = inner.fail_restore;
        Self::transition(
            &mut inner,
            pid,
            "restore",
            ProcessState::Checkpointed,
            ProcessState::Locked,
            fail,
        )
    }

    fn restore_with_remap(&self, pid: u32, old: &GpuUuid, new: &GpuUuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(DriverCall::RestoreRemap {
            pid,
            old: *old,
            new: *new,
        });
        let fail = inner.fail_restore;
        Self::transition(
            &mut inner,
            pid,
            "restore_with_remap",
            ProcessState::Checkpointed,
            ProcessState::Locked,
            fail,
        )
    }

    fn unlock(&self, pid: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(DriverCall::Unlock(pid));
        let fail = inner.fail_unlock;
        Self::transition(
            &mut inner,
            pid,
            "unlock",
            ProcessState::Locked,
            ProcessState::Running,
            fail,
        )
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.inner.lock().unwrap().devices.len())
    }

    fn device_uuid(&self, index: usize) -> Result<GpuUuid> {
        self.inner
            .lock()
            .unwrap()
            .devices
            .get(index)
            .copied()
            .ok_or_else(|| KybernateError::NotFound(format!("GPU device {index}")))
    }
}
