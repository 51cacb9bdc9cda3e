//! Enumeration of GPU-using processes via the driver query tool.

use crate::{KybernateError, Result};
use std::process::Command;
use std::sync::Mutex;
use tracing::debug;

/// One process currently holding GPU memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: u32,
    /// Bytes of device memory in use.
    pub used_memory: u64,
    pub name: String,
}

pub trait GpuQuery: Send + Sync {
    fn gpu_processes(&self) -> Result<Vec<GpuProcess>>;
}

/// Queries `nvidia-smi` for compute apps.
pub struct NvidiaSmi;

impl NvidiaSmi {
    pub fn new() -> Self {
        Self
    }

    fn parse(output: &str) -> Vec<GpuProcess> {
        let mut processes = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split(", ").collect();
            if parts.len() < 2 {
                continue;
            }
            let Ok(pid) = parts[0].trim().parse::<u32>() else {
                continue;
            };
            // used_memory is MiB with --nounits.
            let mem_mib = parts[1].trim().parse::<u64>().unwrap_or(0);
            let name = parts.get(2).map(|s| s.trim().to_string()).unwrap_or_default();

            processes.push(GpuProcess {
                pid,
                used_memory: mem_mib * 1024 * 1024,
                name,
            });
        }
        processes
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuQuery for NvidiaSmi {
    fn gpu_processes(&self) -> Result<Vec<GpuProcess>> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-compute-apps=pid,used_memory,process_name",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| KybernateError::NotFound(format!("nvidia-smi: {e}")))?;

        if !output.status.success() {
            // No driver or no device; treat as an empty process set.
            debug!(
                "nvidia-smi query failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(Vec::new());
        }

        Ok(Self::parse(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Fixed process set for tests and dry runs.
#[derive(Default)]
pub struct FakeQuery {
    processes: Mutex<Vec<GpuProcess>>,
}

impl FakeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pid: u32, used_memory: u64, name: &str) {
        self.processes.lock().unwrap().push(GpuProcess {
            pid,
            used_memory,
            name: name.to_string(),
        });
    }
}

impl GpuQuery for FakeQuery {
    fn gpu_processes(&self) -> Result<Vec<GpuProcess>> {
        Ok(self.processes.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compute_apps() {
        let out = "1000, 512, python3\n1500, 2048, trainer\n\n";
        let procs = NvidiaSmi::parse(out);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 1000);
        assert_eq!(procs[0].used_memory, 512 * 1024 * 1024);
        assert_eq!(procs[1].name, "trainer");
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let out = "garbage\n[N/A], 12, x\n77, 1, app\n";
        let procs = NvidiaSmi::parse(out);
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 77);
    }
}
