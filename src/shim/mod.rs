//! The GPU-aware task shim.
//!
//! One shim instance serves one container. Every task RPC delegates to the
//! wrapped base shim; `create` and `checkpoint` are intercepted to
//! interleave the GPU stages around the base supervisor's work. GPU-stage
//! failures degrade: the container keeps running (or starting) and the
//! event is logged with enough identity to reconstruct the path.

pub mod api;

pub use api::TaskService;

use crate::cuda::{Checkpointer, CudaDriver, ProcessState};
use crate::locator::{expand_candidates, GpuLocator};
use crate::oci::Spec;
use crate::runtime::{self, Options, NVIDIA_RUNTIME};
use crate::{mounts, Result};
use api::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ShimConfig {
    /// Budget for the driver to reach a quiescent point during lock.
    pub lock_timeout_ms: u32,
    /// Pause after the base restore before the GPU stage, letting the
    /// restored process tree settle.
    pub restore_settle: Duration,
    pub proc_root: PathBuf,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            restore_settle: Duration::from_millis(500),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// What `create` learned about the container, consumed by `checkpoint`
/// and the post-restore stage.
#[derive(Debug, Clone, Default)]
struct ContainerFacts {
    bundle: Option<PathBuf>,
    candidates: Vec<String>,
}

pub struct GpuShim<S> {
    base: S,
    machine: Checkpointer,
    locator: GpuLocator,
    config: ShimConfig,
    facts: Mutex<ContainerFacts>,
    /// Serializes every GPU-interacting path for this container; a process
    /// must never be observed in two states by two callers.
    gpu_lock: Mutex<()>,
}

impl<S: TaskService> GpuShim<S> {
    pub fn new(base: S, driver: Arc<dyn CudaDriver>, locator: GpuLocator) -> Self {
        Self::with_config(base, driver, locator, ShimConfig::default())
    }

    pub fn with_config(
        base: S,
        driver: Arc<dyn CudaDriver>,
        locator: GpuLocator,
        config: ShimConfig,
    ) -> Self {
        Self {
            base,
            machine: Checkpointer::new(driver),
            locator,
            config,
            facts: Mutex::new(ContainerFacts::default()),
            gpu_lock: Mutex::new(()),
        }
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    /// Steer the container-internal runtime to the GPU-aware userspace
    /// runtime: preferably through the request's options field, otherwise
    /// by writing `options.json` into the bundle.
    fn switch_runtime(&self, req: &mut CreateRequest) {
        match req.options.as_mut() {
            Some(options) => {
                options.binary_name = NVIDIA_RUNTIME.to_string();
                info!("switched runtime binary via request options");
            }
            None => {
                let options = Options {
                    binary_name: NVIDIA_RUNTIME.to_string(),
                    ..Default::default()
                };
                match runtime::write_options(&req.bundle, &options) {
                    Ok(()) => info!("switched runtime binary via bundle options.json"),
                    Err(e) => warn!(
                        "could not write options.json into {}: {}",
                        req.bundle.display(),
                        e
                    ),
                }
            }
        }
    }

    /// Patch the restored container's spec with the mounts captured at
    /// checkpoint time and pre-create their rootfs targets. Degraded: a
    /// missing or unreadable sidecar only logs.
    fn inject_restore_mounts(&self, spec: &mut Spec, bundle: &Path, artifact: &Path) {
        let records = match mounts::load_mount_records(artifact) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    "no GPU mount sidecar under {}: {} (restoring without driver mounts)",
                    artifact.display(),
                    e
                );
                return;
            }
        };

        let added = mounts::inject_mounts(spec, &records);
        info!(
            "injected {} of {} captured GPU mounts into restored spec",
            added,
            records.len()
        );

        let rootfs = spec.rootfs_path(bundle);
        if let Err(e) = mounts::prepare_rootfs(&rootfs, &records) {
            warn!("rootfs preparation failed under {}: {}", rootfs.display(), e);
        }

        if let Err(e) = spec.save(bundle) {
            warn!("could not persist rewritten spec: {}", e);
        }
    }

    /// The GPU half of restore, after the base shim reconstructed host
    /// state. All edges degrade to a successfully started container.
    fn restore_gpu_state(&self, bundle: &Path, candidates: &[String], container: &str) {
        let _serialized = self.gpu_lock.lock().unwrap();
        std::thread::sleep(self.config.restore_settle);

        let init_pid = match self.locator.resolve_init_pid(bundle, candidates) {
            Ok(pid) => pid,
            Err(e) => {
                warn!(
                    "init PID unresolved for restored container {}: {} (GPU restore skipped)",
                    container, e
                );
                return;
            }
        };

        // The PID recorded at checkpoint time is advisory at best; PID
        // namespaces remap across restores, so the locator re-resolves.
        let gpu_pid = self
            .locator
            .locate(candidates, Some(init_pid))
            .unwrap_or(init_pid);

        match self.machine.state(gpu_pid) {
            Ok(ProcessState::Checkpointed) => {
                match self.machine.full_restore(gpu_pid, None) {
                    Ok(()) => info!(
                        "GPU state restored for PID {} in container {}",
                        gpu_pid, container
                    ),
                    Err(e) => warn!(
                        "CUDA restore failed for PID {} in container {}: {}",
                        gpu_pid, container, e
                    ),
                }
            }
            Ok(state) => debug!(
                "PID {} in container {} is {}, no GPU restore needed",
                gpu_pid, container, state
            ),
            Err(e) => debug!(
                "PID {} in container {} is not a CUDA process: {}",
                gpu_pid, container, e
            ),
        }
    }
}

impl<S: TaskService> TaskService for GpuShim<S> {
    fn create(&self, req: CreateRequest) -> Result<CreateResponse> {
        let mut req = req;
        debug!("create called for {} (bundle {})", req.id, req.bundle.display());

        let spec = match Spec::load(&req.bundle) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(
                    "could not read spec in {}: {} (delegating untouched)",
                    req.bundle.display(),
                    e
                );
                None
            }
        };

        let mut restore_from: Option<PathBuf> = None;
        let mut candidates = vec![req.id.clone()];

        if let Some(mut spec) = spec {
            candidates = expand_candidates(&req.id, &req.bundle, spec.sandbox_id());

            if let Some(artifact) = spec.restore_request() {
                info!(
                    "container {} restores from checkpoint {}",
                    req.id, artifact
                );
                let artifact = PathBuf::from(artifact);
                req.checkpoint = Some(artifact.clone());
                restore_from = Some(artifact);
            }

            if spec.wants_gpu() && restore_from.is_none() {
                info!("GPU container {} detected, switching runtime", req.id);
                self.switch_runtime(&mut req);
            }

            if let Some(artifact) = &restore_from {
                self.inject_restore_mounts(&mut spec, &req.bundle, artifact);
            }
        }

        {
            let mut facts = self.facts.lock().unwrap();
            facts.bundle = Some(req.bundle.clone());
            facts.candidates = candidates.clone();
        }

        let bundle = req.bundle.clone();
        let id = req.id.clone();
        let response = self.base.create(req)?;

        if restore_from.is_some() {
            self.restore_gpu_state(&bundle, &candidates, &id);
        }

        Ok(response)
    }

    fn checkpoint(&self, req: CheckpointRequest) -> Result<()> {
        debug!(
            "checkpoint called for {} into {}",
            req.id,
            req.path.display()
        );
        let facts = self.facts.lock().unwrap().clone();
        let _serialized = self.gpu_lock.lock().unwrap();

        let mut capture_pid: Option<u32> = None;
        let mut gpu_checkpointed: Option<u32> = None;
        if let Some(bundle) = &facts.bundle {
            match self.locator.resolve_init_pid(bundle, &facts.candidates) {
                Ok(init_pid) => {
                    capture_pid = Some(init_pid);
                    match self.locator.locate(&facts.candidates, Some(init_pid)) {
                        Some(gpu_pid) => {
                            capture_pid = Some(gpu_pid);
                            match self.machine.state(gpu_pid) {
                                Ok(ProcessState::Running) => {
                                    match self
                                        .machine
                                        .full_checkpoint(gpu_pid, self.config.lock_timeout_ms)
                                    {
                                        Ok(()) => gpu_checkpointed = Some(gpu_pid),
                                        // Non-fatal: the base checkpoint still
                                        // preserves host state; VRAM is lost.
                                        Err(e) => warn!(
                                            "CUDA checkpoint failed for PID {} in container {}: {}",
                                            gpu_pid, req.id, e
                                        ),
                                    }
                                }
                                Ok(state) => warn!(
                                    "GPU PID {} in container {} is {}, skipping CUDA checkpoint",
                                    gpu_pid, req.id, state
                                ),
                                Err(e) => warn!(
                                    "could not observe CUDA state of PID {} in container {}: {}",
                                    gpu_pid, req.id, e
                                ),
                            }
                        }
                        None => debug!(
                            "no GPU process in container {} (CPU-only checkpoint)",
                            req.id
                        ),
                    }
                }
                Err(e) => warn!(
                    "init PID unresolved for container {}: {} (CPU-only checkpoint)",
                    req.id, e
                ),
            }
        } else {
            warn!(
                "no bundle recorded for container {}, skipping GPU stage",
                req.id
            );
        }

        if let Some(pid) = capture_pid {
            match mounts::capture_gpu_mounts(pid, &self.config.proc_root) {
                Ok(records) => {
                    if let Err(e) = std::fs::create_dir_all(&req.path)
                        .map_err(Into::into)
                        .and_then(|_| mounts::save_mount_records(&req.path, &records))
                    {
                        warn!(
                            "could not write mount sidecar into {}: {}",
                            req.path.display(),
                            e
                        );
                    }
                }
                Err(e) => warn!(
                    "mount capture failed for PID {} in container {}: {}",
                    pid, req.id, e
                ),
            }
        }

        let id = req.id.clone();
        let result = self.base.checkpoint(req);

        if result.is_err() {
            if let Some(pid) = gpu_checkpointed {
                // The host image was not written; un-freeze rather than
                // leave the process with its VRAM stuck in host memory.
                match self.machine.full_restore(pid, None) {
                    Ok(()) => info!(
                        "rolled back GPU checkpoint for PID {} in container {}",
                        pid, id
                    ),
                    Err(e) => warn!(
                        "rollback restore failed for PID {} in container {}: {}",
                        pid, id, e
                    ),
                }
            }
        }

        result
    }

    fn start(&self, req: StartRequest) -> Result<StartResponse> {
        self.base.start(req)
    }

    fn delete(&self, req: DeleteRequest) -> Result<DeleteResponse> {
        self.base.delete(req)
    }

    fn exec(&self, req: ExecRequest) -> Result<()> {
        self.base.exec(req)
    }

    fn kill(&self, req: KillRequest) -> Result<()> {
        self.base.kill(req)
    }

    fn update(&self, req: UpdateRequest) -> Result<()> {
        self.base.update(req)
    }

    fn wait(&self, req: WaitRequest) -> Result<WaitResponse> {
        self.base.wait(req)
    }

    fn state(&self, req: StateRequest) -> Result<StateResponse> {
        self.base.state(req)
    }
}
