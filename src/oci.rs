//! Minimal model of the container spec (`config.json`).
//!
//! Only the fields the system reads or mutates are typed; everything else
//! rides along in flattened maps so a load -> mutate -> save round trip
//! preserves the rest of the spec byte-for-byte in meaning.

use crate::{KybernateError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const RESTORE_ANNOTATION: &str = "kybernate.io/restore-from";
pub const GPU_QUANTITY_ANNOTATION: &str = "io.kubernetes.cri.nvidia-gpu-quantity";
pub const SANDBOX_ANNOTATION: &str = "io.kubernetes.cri.sandbox-id";

const RESTORE_ENV_PREFIX: &str = "RESTORE_FROM=";
const GPU_ENV_PREFIXES: &[&str] = &["NVIDIA_VISIBLE_DEVICES=", "NVIDIA_DRIVER_CAPABILITIES="];

/// Character-device major number of the NVIDIA driver nodes.
const NVIDIA_DEV_MAJOR: i64 = 195;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Process {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Root {
    #[serde(default)]
    pub path: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,

    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceRule>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRule {
    #[serde(default)]
    pub allow: bool,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub dev_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

impl Spec {
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join("config.json");
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data)
            .map_err(|e| KybernateError::SpecInvalid(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, bundle: &Path) -> Result<()> {
        let path = bundle.join("config.json");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| KybernateError::SpecInvalid(e.to_string()))?;
        fs::write(&path, data)?;
        Ok(())
    }

    fn env(&self) -> &[String] {
        self.process.as_ref().map(|p| p.env.as_slice()).unwrap_or(&[])
    }

    /// The checkpoint artifact this container asks to be restored from,
    /// via annotation or environment.
    pub fn restore_request(&self) -> Option<String> {
        if let Some(path) = self.annotations.get(RESTORE_ANNOTATION) {
            return Some(path.clone());
        }
        self.env()
            .iter()
            .find_map(|e| e.strip_prefix(RESTORE_ENV_PREFIX))
            .map(|p| p.to_string())
    }

    /// Whether the container intends to use the GPU: a device rule for the
    /// NVIDIA major, the CRI GPU-quantity annotation, or the NVIDIA
    /// container-toolkit environment.
    pub fn wants_gpu(&self) -> bool {
        if self.annotations.contains_key(GPU_QUANTITY_ANNOTATION) {
            return true;
        }

        let device_rule = self
            .linux
            .as_ref()
            .and_then(|l| l.resources.as_ref())
            .map(|r| {
                r.devices
                    .iter()
                    .any(|d| d.allow && d.major == Some(NVIDIA_DEV_MAJOR))
            })
            .unwrap_or(false);
        if device_rule {
            return true;
        }

        self.env()
            .iter()
            .any(|e| GPU_ENV_PREFIXES.iter().any(|p| e.starts_with(p)))
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.annotations.get(SANDBOX_ANNOTATION).map(|s| s.as_str())
    }

    pub fn rootfs_path(&self, bundle: &Path) -> std::path::PathBuf {
        match self.root.as_ref() {
            Some(root) if Path::new(&root.path).is_absolute() => root.path.clone().into(),
            Some(root) => bundle.join(&root.path),
            None => bundle.join("rootfs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_env(env: &[&str]) -> Spec {
        Spec {
            process: Some(Process {
                env: env.iter().map(|e| e.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_restore_request_from_annotation() {
        let mut spec = Spec::default();
        spec.annotations.insert(
            RESTORE_ANNOTATION.to_string(),
            "/var/lib/kybernate/ckpt".to_string(),
        );
        assert_eq!(
            spec.restore_request().as_deref(),
            Some("/var/lib/kybernate/ckpt")
        );
    }

    #[test]
    fn test_restore_request_from_env() {
        let spec = spec_with_env(&["PATH=/bin", "RESTORE_FROM=/ckpt/a"]);
        assert_eq!(spec.restore_request().as_deref(), Some("/ckpt/a"));
    }

    #[test]
    fn test_gpu_intent_from_device_rule() {
        let spec = Spec {
            linux: Some(Linux {
                resources: Some(Resources {
                    devices: vec![DeviceRule {
                        allow: true,
                        dev_type: Some("c".to_string()),
                        major: Some(195),
                        minor: None,
                        access: Some("rwm".to_string()),
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(spec.wants_gpu());
    }

    #[test]
    fn test_gpu_intent_from_env_and_annotation() {
        assert!(spec_with_env(&["NVIDIA_VISIBLE_DEVICES=all"]).wants_gpu());
        assert!(spec_with_env(&["NVIDIA_DRIVER_CAPABILITIES=compute,utility"]).wants_gpu());
        assert!(!spec_with_env(&["PATH=/bin"]).wants_gpu());

        let mut spec = Spec::default();
        spec.annotations
            .insert(GPU_QUANTITY_ANNOTATION.to_string(), "1".to_string());
        assert!(spec.wants_gpu());
    }

    #[test]
    fn test_denied_device_rule_is_not_gpu_intent() {
        let spec = Spec {
            linux: Some(Linux {
                resources: Some(Resources {
                    devices: vec![DeviceRule {
                        allow: false,
                        major: Some(195),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!spec.wants_gpu());
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let raw = r#"{
            "ociVersion": "1.0.2",
            "annotations": {"a": "b"},
            "process": {"env": ["X=1"], "cwd": "/work"},
            "hooks": {"createRuntime": []}
        }"#;
        let spec: Spec = serde_json::from_str(raw).unwrap();
        let out = serde_json::to_value(&spec).unwrap();
        assert_eq!(out["ociVersion"], "1.0.2");
        assert_eq!(out["process"]["cwd"], "/work");
        assert!(out["hooks"].is_object());
    }
}
