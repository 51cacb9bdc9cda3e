pub mod controller;
pub mod cuda;
pub mod locator;
pub mod mounts;
pub mod oci;
pub mod runtime;
pub mod shim;
pub mod utils;

pub use controller::{CheckpointController, CheckpointManifest};
pub use cuda::{CudaDriver, ProcessState};
pub use locator::GpuLocator;
pub use mounts::MountRecord;

use cuda::ProcessState as State;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KybernateError {
    #[error("CUDA error {code}: {op} failed")]
    Driver { code: i32, op: &'static str },

    #[error("wrong checkpoint state: expected {expected}, found {observed}")]
    WrongState { expected: State, observed: State },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("container spec invalid: {0}")]
    SpecInvalid(String),

    #[error("artifact IO error: {0}")]
    ArtifactIo(#[from] std::io::Error),

    #[error("base shim: {0}")]
    BaseShim(String),
}

impl KybernateError {
    /// True when the driver reported that the lock deadline elapsed.
    /// The caller may retry with a longer budget.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            KybernateError::Driver {
                code: cuda::CUDA_ERROR_TIMEOUT,
                ..
            }
        )
    }

    /// True when the target PID is not known to the driver as a CUDA process.
    pub fn is_not_found(&self) -> bool {
        match self {
            KybernateError::Driver { code, .. } => *code == cuda::CUDA_ERROR_PROCESS_NOT_FOUND,
            KybernateError::NotFound(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, KybernateError>;
