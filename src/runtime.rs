//! Runtime options carried in a bundle's `options.json`.
//!
//! The container-internal runtime binary is chosen here: GPU containers
//! are steered to the GPU-aware userspace runtime, everything else keeps
//! the default.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_RUNTIME: &str = "runc";
pub const NVIDIA_RUNTIME: &str = "nvidia-container-runtime";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub binary_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub systemd_cgroup: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_pivot_root: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_new_keyring: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub criu_image_path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub criu_work_path: String,
}

/// Read `options.json` from the bundle; a missing file yields defaults.
pub fn read_options(bundle: &Path) -> Result<Options> {
    let path = bundle.join("options.json");
    match fs::read_to_string(&path) {
        Ok(data) => serde_json::from_str(&data)
            .map_err(|e| crate::KybernateError::SpecInvalid(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Options::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn write_options(bundle: &Path, options: &Options) -> Result<()> {
    let data = serde_json::to_string(options)
        .map_err(|e| crate::KybernateError::SpecInvalid(e.to_string()))?;
    fs::write(bundle.join("options.json"), data)?;
    Ok(())
}

/// The runtime binary the bundle asks for, defaulting to runc.
pub fn runtime_binary(bundle: &Path) -> String {
    match read_options(bundle) {
        Ok(options) if !options.binary_name.is_empty() => options.binary_name,
        _ => DEFAULT_RUNTIME.to_string(),
    }
}

pub fn is_nvidia_runtime(binary: &str) -> bool {
    binary == NVIDIA_RUNTIME || binary.ends_with("/nvidia-container-runtime")
}
