//! OCI runtime wrapper.
//!
//! Drop-in replacement for runc/nvidia-container-runtime that performs the
//! GPU stage ahead of a `checkpoint` invocation, then execs the underlying
//! runtime. Every other command execs straight through.

use kybernate::cuda::{CheckpointTool, Checkpointer, ProcessState};
use kybernate::locator::GpuLocator;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const RUNTIME_CANDIDATES: &[&str] = &["nvidia-container-runtime", "runc"];
const RUNTIME_FALLBACK_PATHS: &[&str] = &[
    "/usr/bin/nvidia-container-runtime",
    "/usr/bin/runc",
    "/usr/sbin/runc",
];
const DEFAULT_RUNC_ROOT: &str = "/run/containerd/runc/k8s.io";
const LOCK_TIMEOUT_MS: u32 = 30_000;
const LOG_FILE: &str = "/tmp/kybernate-runtime.log";

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let runtime = match find_runtime() {
        Some(path) => path,
        None => {
            eprintln!("kybernate-runtime: no OCI runtime found");
            std::process::exit(1);
        }
    };

    if args.iter().any(|a| a == "checkpoint") {
        handle_checkpoint(&args);
    }
    // Restore needs the process running first; the task shim drives the
    // GPU stage after start, so restore execs straight through.

    exec_runtime(&runtime, &args);
}

fn init_logging() {
    // The supervisor owns stdio of an OCI runtime; log to a file instead.
    if let Ok(file) = OpenOptions::new().create(true).append(true).open(LOG_FILE) {
        let _ = tracing_subscriber::fmt()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .try_init();
    }
}

fn find_runtime() -> Option<PathBuf> {
    for name in RUNTIME_CANDIDATES {
        if let Some(path) = find_in_path(name) {
            return Some(path);
        }
    }
    for path in RUNTIME_FALLBACK_PATHS {
        if Path::new(path).exists() {
            return Some(PathBuf::from(path));
        }
    }
    None
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        // This binary commonly shadows the real runtime under the same
        // name; skip any candidate that is this executable.
        let candidate = dir.join(name);
        if is_executable(&candidate) && !is_self(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn is_self(path: &Path) -> bool {
    match (std::env::current_exe(), path.canonicalize()) {
        (Ok(me), Ok(candidate)) => me == candidate,
        _ => false,
    }
}

fn handle_checkpoint(args: &[String]) {
    info!("checkpoint command detected");

    let Some(container_id) = args.iter().rev().find(|a| !a.starts_with('-')) else {
        warn!("no container ID in checkpoint args, skipping GPU stage");
        return;
    };
    let root = find_root_arg(args).unwrap_or_else(|| DEFAULT_RUNC_ROOT.to_string());

    let Some(init_pid) = state_init_pid(Path::new(&root), container_id) else {
        warn!("no init PID for container {container_id}, skipping GPU stage");
        return;
    };
    debug!("container {container_id} init PID {init_pid}");

    let machine = match CheckpointTool::probe() {
        Ok(tool) => Checkpointer::new(Arc::new(tool)),
        Err(e) => {
            warn!("CUDA tooling unavailable: {e}, skipping GPU stage");
            return;
        }
    };

    let Some(gpu_pid) = GpuLocator::new().find_for_task(init_pid) else {
        info!("container {container_id} has no GPU process, skipping GPU stage");
        return;
    };

    // The base runtime still checkpoints host state on failure here; only
    // VRAM is at risk, and that is the documented degradation.
    match machine.state(gpu_pid) {
        Ok(ProcessState::Running) => {
            match machine.full_checkpoint(gpu_pid, LOCK_TIMEOUT_MS) {
                Ok(()) => info!("CUDA checkpoint successful for PID {gpu_pid}"),
                Err(e) => warn!("CUDA checkpoint failed for PID {gpu_pid}: {e} (continuing)"),
            }
        }
        Ok(state) => info!("PID {gpu_pid} is {state}, skipping CUDA checkpoint"),
        Err(e) => warn!("could not observe CUDA state of PID {gpu_pid}: {e}"),
    }
}

fn find_root_arg(args: &[String]) -> Option<String> {
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "--root" {
            return iter.peek().map(|s| s.to_string());
        }
        if let Some(value) = arg.strip_prefix("--root=") {
            return Some(value.to_string());
        }
    }
    None
}

/// The container init PID from the runtime's `state.json`.
fn state_init_pid(root: &Path, container_id: &str) -> Option<u32> {
    let path = root.join(container_id).join("state.json");
    let data = std::fs::read_to_string(&path).ok()?;
    let state: serde_json::Value = serde_json::from_str(&data).ok()?;
    let pid = state
        .get("init_process_pid")
        .or_else(|| state.get("pid"))
        .and_then(|v| v.as_u64())? as u32;
    (pid > 0).then_some(pid)
}

fn exec_runtime(runtime: &Path, args: &[String]) -> ! {
    debug!("executing {} {:?}", runtime.display(), args);

    let program = CString::new(runtime.as_os_str().as_encoded_bytes())
        .expect("runtime path has no NUL bytes");
    let mut argv = vec![program.clone()];
    for arg in args {
        match CString::new(arg.as_str()) {
            Ok(arg) => argv.push(arg),
            Err(_) => {
                eprintln!("kybernate-runtime: argument contains NUL byte");
                std::process::exit(1);
            }
        }
    }

    // On success exec never returns.
    let err = nix::unistd::execv(&program, &argv).unwrap_err();
    eprintln!("kybernate-runtime: failed to exec {}: {err}", runtime.display());
    std::process::exit(1);
}
