//! Resolution of the GPU-using PID inside a container, and of the
//! container's init PID.
//!
//! Container runtimes identify the same container differently across
//! subsystems, and some write their PID files only after the create RPC
//! returns, so both resolutions work from a candidate-ID set and the init
//! resolver retries on a bounded budget.

mod query;

pub use query::{FakeQuery, GpuProcess, GpuQuery, NvidiaSmi};

use crate::{KybernateError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(15);
const DEFAULT_RETRY_CADENCE: Duration = Duration::from_millis(200);

/// Containerd namespaces the task-state paths are probed under.
const TASK_NAMESPACES: &[&str] = &["k8s.io", "moby", "default"];

pub struct GpuLocator {
    query: Box<dyn GpuQuery>,
    proc_root: PathBuf,
    task_state_root: PathBuf,
    runc_root: PathBuf,
    runc_binary: String,
    retry_budget: Duration,
    retry_cadence: Duration,
}

impl GpuLocator {
    pub fn new() -> Self {
        Self::with_parts(Box::new(NvidiaSmi::new()), PathBuf::from("/proc"))
    }

    /// Build a locator over an alternate query tool and proc root, for
    /// fixtures.
    pub fn with_parts(query: Box<dyn GpuQuery>, proc_root: PathBuf) -> Self {
        Self {
            query,
            proc_root,
            task_state_root: PathBuf::from("/run/containerd/io.containerd.runtime.v2.task"),
            runc_root: PathBuf::from("/run/containerd/runc"),
            runc_binary: "runc".to_string(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            retry_cadence: DEFAULT_RETRY_CADENCE,
        }
    }

    pub fn with_task_state_root(mut self, root: PathBuf) -> Self {
        self.task_state_root = root;
        self
    }

    pub fn with_runc(mut self, binary: String, root: PathBuf) -> Self {
        self.runc_binary = binary;
        self.runc_root = root;
        self
    }

    pub fn with_retry(mut self, budget: Duration, cadence: Duration) -> Self {
        self.retry_budget = budget;
        self.retry_cadence = cadence;
        self
    }

    /// The PID holding GPU memory inside the container identified by any
    /// of `candidates`, or by descent from `init_pid`. `None` means no GPU
    /// process.
    pub fn locate(&self, candidates: &[String], init_pid: Option<u32>) -> Option<u32> {
        let processes = match self.query.gpu_processes() {
            Ok(p) => p,
            Err(e) => {
                debug!("GPU process query failed: {}", e);
                return None;
            }
        };
        if processes.is_empty() {
            return None;
        }

        // Strategy 1: cgroup membership names the container directly.
        if !candidates.is_empty() {
            for proc in &processes {
                if let Some(cgroup) = self.read_cgroup(proc.pid) {
                    if candidates.iter().any(|c| cgroup.contains(c.as_str())) {
                        debug!("GPU PID {} matched container cgroup", proc.pid);
                        return Some(proc.pid);
                    }
                }
            }
        }

        let init_pid = init_pid?;

        // Strategy 2: walk parent pointers from each GPU PID to the init.
        for proc in &processes {
            if self.is_descendant(proc.pid, init_pid) {
                debug!(
                    "GPU PID {} is a descendant of init PID {}",
                    proc.pid, init_pid
                );
                return Some(proc.pid);
            }
        }

        // Strategy 3: walk the children files down from the init.
        let gpu_pids: Vec<u32> = processes.iter().map(|p| p.pid).collect();
        for child in self.descendants_of(init_pid) {
            if gpu_pids.contains(&child) {
                debug!("GPU PID {} found in children walk", child);
                return Some(child);
            }
        }

        None
    }

    pub fn find_for_container(&self, container_id: &str) -> Option<u32> {
        self.locate(&[container_id.to_string()], None)
    }

    /// Device memory currently held by `pid`, per the query tool.
    pub fn gpu_memory(&self, pid: u32) -> Option<u64> {
        self.query
            .gpu_processes()
            .ok()?
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.used_memory)
    }

    pub fn find_for_task(&self, init_pid: u32) -> Option<u32> {
        self.locate(&[], Some(init_pid))
    }

    /// Resolve the container's init PID, retrying on the configured budget
    /// because some runtimes write `init.pid` after the create RPC returns.
    pub fn resolve_init_pid(&self, bundle: &Path, candidates: &[String]) -> Result<u32> {
        let deadline = Instant::now() + self.retry_budget;
        loop {
            if let Some(pid) = self.try_resolve_init_pid(bundle, candidates) {
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.retry_cadence);
        }
        Err(KybernateError::NotFound(format!(
            "init PID for container (candidates: {})",
            candidates.join(", ")
        )))
    }

    fn try_resolve_init_pid(&self, bundle: &Path, candidates: &[String]) -> Option<u32> {
        // (a) The runtime's pid file inside the bundle.
        if let Some(pid) = self.read_pid_file(&bundle.join("init.pid")) {
            return Some(pid);
        }

        // (b) Known container-supervisor task-state paths.
        for ns in TASK_NAMESPACES {
            for id in candidates {
                let path = self.task_state_root.join(ns).join(id).join("init.pid");
                if let Some(pid) = self.read_pid_file(&path) {
                    return Some(pid);
                }
            }
        }

        // (c) The underlying runtime's state command.
        for ns in TASK_NAMESPACES {
            for id in candidates {
                if let Some(pid) = self.runc_state_pid(ns, id) {
                    return Some(pid);
                }
            }
        }

        // (d) Full cgroup scan; the lowest matching PID is the init.
        if let Some(pid) = self.scan_cgroups(candidates) {
            return Some(pid);
        }

        // (e) The supervisor shim process itself, taking its first child.
        self.shim_first_child(candidates)
    }

    fn read_pid_file(&self, path: &Path) -> Option<u32> {
        let text = fs::read_to_string(path).ok()?;
        let pid = text.trim().parse::<u32>().ok()?;
        if !self.alive(pid) {
            trace!("pid file {} names dead PID {}", path.display(), pid);
            return None;
        }
        Some(pid)
    }

    fn runc_state_pid(&self, ns: &str, id: &str) -> Option<u32> {
        let root = self.runc_root.join(ns);
        let output = Command::new(&self.runc_binary)
            .arg("--root")
            .arg(&root)
            .arg("state")
            .arg(id)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let state: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        let pid = state
            .get("init_process_pid")
            .or_else(|| state.get("pid"))
            .and_then(|v| v.as_u64())? as u32;
        if pid == 0 || !self.alive(pid) {
            return None;
        }
        Some(pid)
    }

    fn scan_cgroups(&self, candidates: &[String]) -> Option<u32> {
        if candidates.is_empty() {
            return None;
        }
        let entries = fs::read_dir(&self.proc_root).ok()?;
        let mut matches: Vec<u32> = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            if let Some(cgroup) = self.read_cgroup(pid) {
                if candidates.iter().any(|c| cgroup.contains(c.as_str())) {
                    matches.push(pid);
                }
            }
        }
        matches.into_iter().min()
    }

    fn shim_first_child(&self, candidates: &[String]) -> Option<u32> {
        if candidates.is_empty() {
            return None;
        }
        let entries = fs::read_dir(&self.proc_root).ok()?;
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let cmdline_path = self.proc_root.join(pid.to_string()).join("cmdline");
            let Ok(raw) = fs::read(&cmdline_path) else {
                continue;
            };
            let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
            if !cmdline.contains("containerd-shim") {
                continue;
            }
            if !candidates.iter().any(|c| cmdline.contains(c.as_str())) {
                continue;
            }
            if let Some(child) = self.descendants_of(pid).first().copied() {
                warn!(
                    "init PID {} taken from shim process {} children",
                    child, pid
                );
                return Some(child);
            }
        }
        None
    }

    fn alive(&self, pid: u32) -> bool {
        self.proc_root.join(pid.to_string()).exists()
    }

    fn read_cgroup(&self, pid: u32) -> Option<String> {
        fs::read_to_string(self.proc_root.join(pid.to_string()).join("cgroup")).ok()
    }

    /// The parent PID, from the fourth stat field; the comm field may
    /// contain spaces so parsing starts after its closing parenthesis.
    fn parent_of(&self, pid: u32) -> Option<u32> {
        let stat = fs::read_to_string(self.proc_root.join(pid.to_string()).join("stat")).ok()?;
        let after_comm = &stat[stat.rfind(')')? + 1..];
        let mut fields = after_comm.split_whitespace();
        let _state = fields.next()?;
        fields.next()?.parse::<u32>().ok()
    }

    fn is_descendant(&self, child: u32, parent: u32) -> bool {
        if child == parent {
            return true;
        }
        let mut current = child;
        while current > 1 {
            match self.parent_of(current) {
                Some(ppid) if ppid == parent => return true,
                Some(ppid) if ppid < current => current = ppid,
                // A ppid >= current means a corrupt or reused entry.
                _ => return false,
            }
        }
        false
    }

    /// Depth-first descendant enumeration through the children files.
    fn descendants_of(&self, pid: u32) -> Vec<u32> {
        let mut result = Vec::new();
        let path = self
            .proc_root
            .join(pid.to_string())
            .join("task")
            .join(pid.to_string())
            .join("children");
        let Ok(text) = fs::read_to_string(&path) else {
            return result;
        };
        for field in text.split_whitespace() {
            if let Ok(child) = field.parse::<u32>() {
                result.push(child);
                result.extend(self.descendants_of(child));
            }
        }
        result
    }
}

impl Default for GpuLocator {
    fn default() -> Self {
        Self::new()
    }
}

/// All known aliases of one container: the full IDs and a 12-character
/// prefix of each, order-preserving and deduplicated. The supervisor may
/// identify the container differently across subsystems.
pub fn expand_candidates(
    task_id: &str,
    bundle: &Path,
    sandbox_id: Option<&str>,
) -> Vec<String> {
    fn push_unique(ids: &mut Vec<String>, id: &str) {
        if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }

    let mut ids: Vec<String> = Vec::new();
    push_unique(&mut ids, task_id);
    if let Some(name) = bundle.file_name().and_then(|n| n.to_str()) {
        push_unique(&mut ids, name);
    }
    if let Some(sandbox) = sandbox_id {
        push_unique(&mut ids, sandbox);
    }

    let full: Vec<String> = ids.clone();
    for id in &full {
        if id.len() > 12 {
            push_unique(&mut ids, &id[..12]);
        }
    }
    ids
}
