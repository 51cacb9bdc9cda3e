//! Adapter over the driver's `cuda-checkpoint` utility.
//!
//! The checkpoint entry points live behind a process boundary of the
//! driver's choosing; one utility invocation maps to one entry point.
//! Device enumeration goes through the driver query tool.

use crate::cuda::{CudaDriver, GpuUuid, ProcessState};
use crate::{KybernateError, Result};
use regex::Regex;
use std::process::Command;
use tracing::{debug, trace};

const CHECKPOINT_TOOL: &str = "cuda-checkpoint";
const QUERY_TOOL: &str = "nvidia-smi";

pub struct CheckpointTool {
    tool: String,
    query_tool: String,
}

impl CheckpointTool {
    /// Unprobed handle; calls fail with the driver's own errors when the
    /// tooling is absent.
    pub fn new() -> Self {
        Self {
            tool: CHECKPOINT_TOOL.to_string(),
            query_tool: QUERY_TOOL.to_string(),
        }
    }

    /// One-shot driver initialization. The returned handle is the
    /// precondition for every other call; construct it once per process
    /// and share it from a single ownership root.
    pub fn probe() -> Result<Self> {
        let tool = Self::new();
        // A bare invocation prints usage and exits nonzero; only a spawn
        // failure means the driver tooling is absent.
        match Command::new(&tool.tool).arg("--help").output() {
            Ok(_) => {
                debug!("CUDA checkpoint tooling available");
                Ok(tool)
            }
            Err(e) => Err(KybernateError::NotFound(format!(
                "{CHECKPOINT_TOOL} unavailable: {e}"
            ))),
        }
    }

    #[cfg(test)]
    fn with_paths(tool: &str, query_tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            query_tool: query_tool.to_string(),
        }
    }

    fn run(&self, args: &[String], op: &'static str) -> Result<String> {
        trace!("{} {:?}", self.tool, args);
        let output = Command::new(&self.tool)
            .args(args)
            .output()
            .map_err(|e| KybernateError::NotFound(format!("{}: {e}", self.tool)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        // The utility exits with the driver's numeric result code.
        let code = output.status.code().unwrap_or(-1);
        debug!(
            "{} {} failed with driver code {}: {}",
            self.tool,
            op,
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Err(KybernateError::Driver { code, op })
    }

    fn action(&self, name: &str, pid: u32, extra: &[String], op: &'static str) -> Result<()> {
        let mut args = vec![
            "--action".to_string(),
            name.to_string(),
            "--pid".to_string(),
            pid.to_string(),
        ];
        args.extend_from_slice(extra);
        self.run(&args, op).map(|_| ())
    }

    fn parse_state(text: &str) -> ProcessState {
        match text.to_ascii_lowercase().as_str() {
            "running" => ProcessState::Running,
            "locked" => ProcessState::Locked,
            "checkpointed" => ProcessState::Checkpointed,
            other => match other.parse::<i32>() {
                Ok(raw) => ProcessState::from_raw(raw),
                Err(_) => ProcessState::Unknown(-1),
            },
        }
    }

    fn device_uuids(&self) -> Result<Vec<GpuUuid>> {
        let output = Command::new(&self.query_tool)
            .args(["--query-gpu=uuid", "--format=csv,noheader"])
            .output()
            .map_err(|e| KybernateError::NotFound(format!("{}: {e}", self.query_tool)))?;
        if !output.status.success() {
            return Err(KybernateError::Driver {
                code: output.status.code().unwrap_or(-1),
                op: "device_uuid",
            });
        }

        let pattern = Regex::new(r"^GPU-[0-9a-fA-F-]+$").expect("static pattern");
        let mut uuids = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !pattern.is_match(line) {
                return Err(KybernateError::SpecInvalid(format!(
                    "unexpected device UUID line: {line}"
                )));
            }
            uuids.push(line.parse::<GpuUuid>()?);
        }
        Ok(uuids)
    }
}

impl Default for CheckpointTool {
    fn default() -> Self {
        Self::new()
    }
}

impl CudaDriver for CheckpointTool {
    fn get_state(&self, pid: u32) -> Result<ProcessState> {
        let out = self.run(
            &["--get-state".to_string(), "--pid".to_string(), pid.to_string()],
            "get_state",
        )?;
        Ok(Self::parse_state(&out))
    }

    fn lock(&self, pid: u32, timeout_ms: u32) -> Result<()> {
        self.action(
            "lock",
            pid,
            &["--timeout".to_string(), timeout_ms.to_string()],
            "lock",
        )
    }

    fn checkpoint(&self, pid: u32) -> Result<()> {
        self.action("checkpoint", pid, &[], "checkpoint")
    }

    fn restore(&self, pid: u32) -> Result<()> {
        self.action("restore", pid, &[], "restore")
    }

    fn restore_with_remap(&self, pid: u32, old: &GpuUuid, new: &GpuUuid) -> Result<()> {
        self.action(
            "restore",
            pid,
            &["--gpu-pair".to_string(), format!("{old}={new}")],
            "restore_with_remap",
        )
    }

    fn unlock(&self, pid: u32) -> Result<()> {
        self.action("unlock", pid, &[], "unlock")
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.device_uuids()?.len())
    }

    fn device_uuid(&self, index: usize) -> Result<GpuUuid> {
        let uuids = self.device_uuids()?;
        uuids
            .get(index)
            .copied()
            .ok_or_else(|| KybernateError::NotFound(format!("GPU device {index}")))
    }
}
