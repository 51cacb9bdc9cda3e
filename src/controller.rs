//! Out-of-band checkpoint orchestration for operator tooling.
//!
//! The controller drives the same two stages as the shim, but through
//! external commands: the supervisor CLI resolves container IDs, the
//! underlying runtime binary performs the userspace checkpoint, and the
//! state machine handles the GPU stage directly.

use crate::cuda::{Checkpointer, CudaDriver, ProcessState};
use crate::locator::GpuLocator;
use crate::{mounts, utils, KybernateError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "kybernate-metadata.json";

const DEFAULT_CHECKPOINT_DIR: &str = "/var/lib/kybernate/checkpoints";

/// Persisted next to the checkpoint artifact; consumed by list/status and
/// by restore. `gpu_pid` is advisory only: PID namespaces remap across
/// restores, so restore re-runs the locator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointManifest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_pid: Option<u32>,
    pub timestamp: String,
    pub artifact_path: PathBuf,
}

impl CheckpointManifest {
    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| KybernateError::SpecInvalid(e.to_string()))?;
        fs::write(dir.join(MANIFEST_FILE), data)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data)
            .map_err(|e| KybernateError::SpecInvalid(format!("{}: {e}", path.display())))
    }
}

pub struct ControllerConfig {
    pub checkpoint_dir: PathBuf,
    pub crictl_binary: String,
    pub runc_binary: String,
    pub runc_root: PathBuf,
    pub lock_timeout_ms: u32,
    pub proc_root: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            crictl_binary: "crictl".to_string(),
            runc_binary: "runc".to_string(),
            runc_root: PathBuf::from("/run/containerd/runc/k8s.io"),
            lock_timeout_ms: 60_000,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

#[derive(Debug)]
pub struct CheckpointOutcome {
    pub manifest: CheckpointManifest,
    pub gpu_checkpointed: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub from: PathBuf,
    /// Image for the restore pod template; must match the original.
    pub image: Option<String>,
}

#[derive(Debug)]
pub enum RestoreOutcome {
    /// The target container is running again and its GPU state was
    /// handled in place.
    Restored {
        container_id: String,
        gpu_pid: Option<u32>,
    },
    /// No such container yet; the operator applies this pod manifest and
    /// the runtime shim finishes the restore.
    PodTemplate(String),
}

#[derive(Debug)]
pub struct StatusReport {
    pub container_id: String,
    pub gpu_pid: Option<u32>,
    pub state: Option<ProcessState>,
    pub gpu_memory: Option<u64>,
}

pub struct CheckpointController {
    machine: Checkpointer,
    locator: GpuLocator,
    config: ControllerConfig,
    node_name: String,
}

impl CheckpointController {
    pub fn new(driver: Arc<dyn CudaDriver>, locator: GpuLocator, config: ControllerConfig) -> Self {
        let node_name = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            machine: Checkpointer::new(driver),
            locator,
            config,
            node_name,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Container ID from the supervisor CLI, by pod coordinates.
    pub fn container_id(&self, namespace: &str, pod: &str, container: &str) -> Result<String> {
        let output = Command::new(&self.config.crictl_binary)
            .args([
                "ps",
                "-q",
                "--label",
                &format!("io.kubernetes.pod.namespace={namespace}"),
                "--label",
                &format!("io.kubernetes.pod.name={pod}"),
                "--label",
                &format!("io.kubernetes.container.name={container}"),
            ])
            .output()
            .map_err(|e| {
                KybernateError::NotFound(format!("{}: {e}", self.config.crictl_binary))
            })?;

        if !output.status.success() {
            return Err(KybernateError::NotFound(format!(
                "container {namespace}/{pod}/{container}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if id.is_empty() {
            return Err(KybernateError::NotFound(format!(
                "container {namespace}/{pod}/{container}"
            )));
        }
        Ok(id)
    }

    /// The two-stage checkpoint: VRAM to host memory through the driver,
    /// then host memory to disk through the userspace checkpoint engine.
    pub async fn checkpoint(&self, req: &CheckpointRequest) -> Result<CheckpointOutcome> {
        let start = Instant::now();
        let container_id = self.container_id(&req.namespace, &req.pod, &req.container)?;
        info!(
            "checkpointing {}/{}/{} (container {})",
            req.namespace, req.pod, req.container, container_id
        );

        let gpu_pid = self.locator.find_for_container(&container_id);
        match gpu_pid {
            Some(pid) => info!("GPU process PID {} found", pid),
            None => info!("no GPU process detected (CPU-only checkpoint)"),
        }

        let stamp = utils::timestamp();
        let artifact = self
            .config
            .checkpoint_dir
            .join(&req.namespace)
            .join(&req.pod)
            .join(&req.container)
            .join(&stamp);
        fs::create_dir_all(&artifact)?;

        let mut gpu_checkpointed = false;
        if let Some(pid) = gpu_pid {
            match self.machine.state(pid)? {
                ProcessState::Running => {
                    self.machine
                        .full_checkpoint(pid, self.config.lock_timeout_ms)?;
                    gpu_checkpointed = true;
                }
                state => debug!("PID {} already {}, skipping GPU stage", pid, state),
            }

            // The sidecar makes the artifact restorable through the shim
            // path; losing it degrades the restore, not the checkpoint.
            match mounts::capture_gpu_mounts(pid, &self.config.proc_root) {
                Ok(records) => {
                    if let Err(e) = mounts::save_mount_records(&artifact, &records) {
                        warn!("could not write mount sidecar: {}", e);
                    }
                }
                Err(e) => warn!("mount capture failed for PID {}: {}", pid, e),
            }
        }

        if let Err(e) = self.engine_checkpoint(&container_id, &artifact) {
            if gpu_checkpointed {
                if let Some(pid) = gpu_pid {
                    // Do not leave the process frozen with its VRAM in
                    // host memory.
                    if let Err(restore_err) = self.machine.full_restore(pid, None) {
                        warn!(
                            "rollback restore failed for PID {}: {}",
                            pid, restore_err
                        );
                    }
                }
            }
            return Err(e);
        }

        let manifest = CheckpointManifest {
            namespace: req.namespace.clone(),
            pod: req.pod.clone(),
            container: req.container.clone(),
            container_id,
            gpu_pid,
            timestamp: stamp,
            artifact_path: artifact.clone(),
        };
        manifest.save(&artifact)?;

        info!("checkpoint complete: {}", artifact.display());
        Ok(CheckpointOutcome {
            manifest,
            gpu_checkpointed,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn engine_checkpoint(&self, container_id: &str, artifact: &Path) -> Result<()> {
        let output = Command::new(&self.config.runc_binary)
            .arg("--root")
            .arg(&self.config.runc_root)
            .arg("checkpoint")
            .arg("--image-path")
            .arg(artifact)
            .arg("--leave-running")
            .arg(container_id)
            .output()
            .map_err(|e| KybernateError::BaseShim(format!("{}: {e}", self.config.runc_binary)))?;

        if !output.status.success() {
            return Err(KybernateError::BaseShim(format!(
                "userspace checkpoint failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// The restore half. When the container already runs again (the
    /// runtime shim or the operator recreated it), the GPU stage is driven
    /// in place; otherwise a restore pod template is produced.
    pub async fn restore(&self, req: &RestoreRequest) -> Result<RestoreOutcome> {
        let manifest = CheckpointManifest::load(&req.from)?;
        info!(
            "restoring {}/{}/{} from {}",
            manifest.namespace,
            manifest.pod,
            manifest.container,
            req.from.display()
        );

        match self.container_id(&req.namespace, &req.pod, &req.container) {
            Ok(container_id) => {
                // The manifest's recorded PID is stale by construction;
                // resolve the live one.
                let gpu_pid = self.locator.find_for_container(&container_id);
                if let Some(pid) = gpu_pid {
                    match self.machine.state(pid)? {
                        ProcessState::Checkpointed => {
                            self.machine.full_restore(pid, None)?;
                            info!("GPU state restored for PID {}", pid);
                        }
                        state => debug!("PID {} is {}, nothing to restore", pid, state),
                    }
                }
                Ok(RestoreOutcome::Restored {
                    container_id,
                    gpu_pid,
                })
            }
            Err(_) => Ok(RestoreOutcome::PodTemplate(restore_pod_template(
                &manifest,
                &req.from,
                req.image.as_deref(),
            ))),
        }
    }

    pub fn list(&self, namespace: Option<&str>) -> Result<Vec<CheckpointManifest>> {
        let base = match namespace {
            Some(ns) => self.config.checkpoint_dir.join(ns),
            None => self.config.checkpoint_dir.clone(),
        };
        let mut manifests = Vec::new();
        collect_manifests(&base, &mut manifests);
        manifests.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(manifests)
    }

    pub fn status(&self, namespace: &str, pod: &str, container: &str) -> Result<StatusReport> {
        let container_id = self.container_id(namespace, pod, container)?;
        let gpu_pid = self.locator.find_for_container(&container_id);

        let (state, gpu_memory) = match gpu_pid {
            Some(pid) => (
                self.machine.state(pid).ok(),
                self.locator.gpu_memory(pid),
            ),
            None => (None, None),
        };

        Ok(StatusReport {
            container_id,
            gpu_pid,
            state,
            gpu_memory,
        })
    }
}

fn collect_manifests(dir: &Path, out: &mut Vec<CheckpointManifest>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.join(MANIFEST_FILE).exists() {
            match CheckpointManifest::load(&path) {
                Ok(manifest) => out.push(manifest),
                Err(e) => warn!("unreadable manifest under {}: {}", path.display(), e),
            }
        }
        collect_manifests(&path, out);
    }
}

/// A pod manifest that asks the runtime shim to finish the restore. The
/// annotation and env are the shim's two restore triggers.
pub fn restore_pod_template(
    manifest: &CheckpointManifest,
    from: &Path,
    image: Option<&str>,
) -> String {
    let gpu_resources = if manifest.gpu_pid.is_some() {
        "\n        nvidia.com/gpu: 1"
    } else {
        ""
    };
    format!(
        r#"apiVersion: v1
kind: Pod
metadata:
  name: {pod}-restored
  namespace: {namespace}
  annotations:
    kybernate.io/restore-from: "{from}"
spec:
  runtimeClassName: kybernate
  restartPolicy: OnFailure
  containers:
  - name: {container}
    image: {image}
    env:
    - name: RESTORE_FROM
      value: "{from}"
    resources:
      limits:{gpu_resources}
        memory: "4Gi"
        cpu: "2"
    securityContext:
      privileged: true
"#,
        pod = manifest.pod,
        namespace = manifest.namespace,
        container = manifest.container,
        image = image.unwrap_or("<original image>"),
        from = from.display(),
        gpu_resources = gpu_resources,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_manifest(dir: &Path) -> CheckpointManifest {
        CheckpointManifest {
            namespace: "default".to_string(),
            pod: "trainer".to_string(),
            container: "main".to_string(),
            container_id: "abc123".to_string(),
            gpu_pid: Some(4242),
            timestamp: "20260801-120000".to_string(),
            artifact_path: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_manifest_roundtrip_uses_camel_case() {
        let dir = tempdir().unwrap();
        let manifest = sample_manifest(dir.path());
        manifest.save(dir.path()).unwrap();

        let raw = fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(raw.contains("\"containerId\""));
        assert!(raw.contains("\"gpuPid\""));
        assert!(raw.contains("\"artifactPath\""));

        let loaded = CheckpointManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.container_id, "abc123");
        assert_eq!(loaded.gpu_pid, Some(4242));
    }

    #[test]
    fn test_collect_manifests_walks_nested_layout() {
        let root = tempdir().unwrap();
        let leaf = root
            .path()
            .join("default")
            .join("trainer")
            .join("main")
            .join("20260801-120000");
        fs::create_dir_all(&leaf).unwrap();
        sample_manifest(&leaf).save(&leaf).unwrap();

        let mut found = Vec::new();
        collect_manifests(root.path(), &mut found);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pod, "trainer");
    }

    #[test]
    fn test_restore_pod_template_carries_both_triggers() {
        let dir = tempdir().unwrap();
        let manifest = sample_manifest(dir.path());
        let yaml = restore_pod_template(&manifest, dir.path(), Some("cuda:12"));
        assert!(yaml.contains("kybernate.io/restore-from"));
        assert!(yaml.contains("RESTORE_FROM"));
        assert!(yaml.contains("nvidia.com/gpu: 1"));
        assert!(yaml.contains("image: cuda:12"));
    }
}
