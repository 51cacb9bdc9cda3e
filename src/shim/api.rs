//! The task-v2 service surface the shim sits on.
//!
//! The supervisor's IPC framing is an external collaborator; these are the
//! request shapes the shim actually consumes, and [`TaskService`] is the
//! seam both the wrapped base shim and the GPU shim implement.

use crate::runtime::Options;
use crate::Result;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub id: String,
    pub bundle: PathBuf,
    pub terminal: bool,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    /// Checkpoint artifact to restore host state from.
    pub checkpoint: Option<PathBuf>,
    /// Runtime options; carried typed where the wire puts a protobuf any.
    pub options: Option<Options>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct StartResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteResponse {
    pub pid: u32,
    pub exit_status: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointRequest {
    pub id: String,
    /// Directory the checkpoint artifact is written into.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub id: String,
    pub exec_id: String,
    pub terminal: bool,
}

#[derive(Debug, Clone, Default)]
pub struct KillRequest {
    pub id: String,
    pub exec_id: String,
    pub signal: u32,
    pub all: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub id: String,
    pub resources: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct WaitRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct WaitResponse {
    pub exit_status: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StateRequest {
    pub id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct StateResponse {
    pub pid: u32,
    pub status: String,
    pub bundle: PathBuf,
}

pub trait TaskService: Send + Sync {
    fn create(&self, req: CreateRequest) -> Result<CreateResponse>;
    fn start(&self, req: StartRequest) -> Result<StartResponse>;
    fn delete(&self, req: DeleteRequest) -> Result<DeleteResponse>;
    fn checkpoint(&self, req: CheckpointRequest) -> Result<()>;
    fn exec(&self, req: ExecRequest) -> Result<()>;
    fn kill(&self, req: KillRequest) -> Result<()>;
    fn update(&self, req: UpdateRequest) -> Result<()>;
    fn wait(&self, req: WaitRequest) -> Result<WaitResponse>;
    fn state(&self, req: StateRequest) -> Result<StateResponse>;
}
