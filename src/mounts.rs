//! Capture and replay of the GPU driver's bind mounts.
//!
//! The driver toolchain injects a family of `nvidia*` bind mounts into a
//! container at setup time; they are not part of the image, so a restored
//! container must get them back through the spec. Capture reads the live
//! process's mount table, replay patches the mount list of the spec being
//! restored.

use crate::oci::{Mount, Spec};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Sidecar file written next to the checkpoint artifact.
pub const MOUNTS_FILE: &str = "nvidia-mounts.json";

/// Substrings marking a mount as GPU-related.
const GPU_KEYWORDS: &[&str] = &["nvidia", "cuda", "libnv", "gsp_"];

/// Filesystem types that must never be replayed into a restored spec.
const EXCLUDED_FSTYPES: &[&str] = &[
    "proc", "sysfs", "cgroup", "cgroup2", "devtmpfs", "devpts", "mqueue", "overlay",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub options: Vec<String>,
}

impl From<&MountRecord> for Mount {
    fn from(record: &MountRecord) -> Self {
        Mount {
            destination: record.destination.clone(),
            fs_type: record.fs_type.clone(),
            source: record.source.clone(),
            options: record.options.clone(),
        }
    }
}

/// One parsed mountinfo row. Fields follow proc(5): the mount root within
/// its filesystem, the mount point, the per-mount options, and past the
/// `-` separator the filesystem type and source.
#[derive(Debug)]
struct MountInfoEntry {
    root: String,
    mount_point: String,
    options: Vec<String>,
    fs_type: String,
    source: String,
}

fn parse_mountinfo_line(line: &str) -> Option<MountInfoEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let sep = fields.iter().position(|f| *f == "-")?;
    if fields.len() < 6 || fields.len() < sep + 3 {
        return None;
    }
    Some(MountInfoEntry {
        root: fields[3].to_string(),
        mount_point: fields[4].to_string(),
        options: fields[5].split(',').map(|o| o.to_string()).collect(),
        fs_type: fields[sep + 1].to_string(),
        source: fields[sep + 2].to_string(),
    })
}

fn is_gpu_related(entry: &MountInfoEntry) -> bool {
    GPU_KEYWORDS
        .iter()
        .any(|k| entry.mount_point.contains(k) || entry.source.contains(k))
}

/// Apply the selection and exclusion rules to a full mountinfo table,
/// in table order.
pub fn filter_gpu_mounts(mountinfo: &str) -> Vec<MountRecord> {
    let mut records = Vec::new();

    for line in mountinfo.lines() {
        let Some(entry) = parse_mountinfo_line(line) else {
            continue;
        };

        if EXCLUDED_FSTYPES.contains(&entry.fs_type.as_str()) {
            continue;
        }
        // The restore runtime rejects mounts under /proc as unsafe.
        if entry.mount_point.starts_with("/proc/") {
            continue;
        }
        if !is_gpu_related(&entry) {
            continue;
        }

        let record = if entry.fs_type == "tmpfs" {
            if entry.root == "/" {
                // A whole tmpfs mounted at the destination.
                MountRecord {
                    source: "tmpfs".to_string(),
                    destination: entry.mount_point.clone(),
                    fs_type: "tmpfs".to_string(),
                    options: entry.options.clone(),
                }
            } else {
                // A bind out of someone else's tmpfs; the host path is not
                // recoverable from the table, so the destination stands in.
                MountRecord {
                    source: entry.mount_point.clone(),
                    destination: entry.mount_point.clone(),
                    fs_type: "bind".to_string(),
                    options: bind_options(&entry.options),
                }
            }
        } else {
            let source = if entry.root != "/" {
                entry.root.clone()
            } else {
                entry.mount_point.clone()
            };
            MountRecord {
                source,
                destination: entry.mount_point.clone(),
                fs_type: "bind".to_string(),
                options: bind_options(&entry.options),
            }
        };

        trace!(
            "captured {} mount {} -> {}",
            record.fs_type,
            record.source,
            record.destination
        );
        records.push(record);
    }

    records
}

fn bind_options(mount_options: &[String]) -> Vec<String> {
    let mut options = Vec::with_capacity(mount_options.len() + 1);
    if !mount_options.iter().any(|o| o == "bind" || o == "rbind") {
        options.push("rbind".to_string());
    }
    options.extend(mount_options.iter().cloned());
    options
}

/// Snapshot the GPU-related mounts of a live process.
pub fn capture_gpu_mounts(pid: u32, proc_root: &Path) -> Result<Vec<MountRecord>> {
    let path = proc_root.join(pid.to_string()).join("mountinfo");
    let table = fs::read_to_string(&path)?;
    let records = filter_gpu_mounts(&table);
    debug!(
        "captured {} GPU mounts from PID {} mount table",
        records.len(),
        pid
    );
    Ok(records)
}

pub fn save_mount_records(dir: &Path, records: &[MountRecord]) -> Result<()> {
    let data = serde_json::to_string_pretty(records)
        .map_err(|e| crate::KybernateError::SpecInvalid(e.to_string()))?;
    fs::write(dir.join(MOUNTS_FILE), data)?;
    Ok(())
}

pub fn load_mount_records(dir: &Path) -> Result<Vec<MountRecord>> {
    let data = fs::read_to_string(dir.join(MOUNTS_FILE))?;
    serde_json::from_str(&data).map_err(|e| {
        crate::KybernateError::SpecInvalid(format!("{}: {e}", dir.join(MOUNTS_FILE).display()))
    })
}

/// Replay captured records into a spec's mount list in capture order.
/// Destinations already present win; among the records the first writer
/// wins. Returns the number of mounts added.
pub fn inject_mounts(spec: &mut Spec, records: &[MountRecord]) -> usize {
    let mut seen: Vec<String> = spec.mounts.iter().map(|m| m.destination.clone()).collect();
    let mut added = 0;

    for record in records {
        if seen.iter().any(|d| d == &record.destination) {
            debug!("skipping duplicate mount destination {}", record.destination);
            continue;
        }
        seen.push(record.destination.clone());
        spec.mounts.push(Mount::from(record));
        added += 1;
    }

    added
}

/// Pre-create the rootfs entries the injected mounts will land on.
/// Directories for directory sources, an empty placeholder file otherwise.
pub fn prepare_rootfs(rootfs: &Path, records: &[MountRecord]) -> Result<()> {
    for record in records {
        let target = rootfs.join(record.destination.trim_start_matches('/'));
        if target.exists() {
            continue;
        }

        let source_is_dir = record.fs_type == "tmpfs"
            || fs::metadata(&record.source)
                .map(|m| m.is_dir())
                .unwrap_or(false);

        if source_is_dir {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(e) = fs::write(&target, b"") {
                warn!(
                    "could not pre-create mount target {}: {}",
                    target.display(),
                    e
                );
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE_NVIDIA_BIND: &str = "610 605 259:1 /usr/bin/nvidia-smi /usr/bin/nvidia-smi rw,nosuid master:1 - ext4 /dev/nvme0n1p1 rw";
    const LINE_PROC: &str = "611 605 0:25 / /proc rw,nosuid,nodev,noexec - proc proc rw";

    #[test]
    fn test_parse_line_offsets() {
        let entry = parse_mountinfo_line(LINE_NVIDIA_BIND).unwrap();
        assert_eq!(entry.root, "/usr/bin/nvidia-smi");
        assert_eq!(entry.mount_point, "/usr/bin/nvidia-smi");
        assert_eq!(entry.options, vec!["rw", "nosuid"]);
        assert_eq!(entry.fs_type, "ext4");
        assert_eq!(entry.source, "/dev/nvme0n1p1");
    }

    #[test]
    fn test_parse_line_rejects_short_rows() {
        assert!(parse_mountinfo_line("").is_none());
        assert!(parse_mountinfo_line("610 605 259:1").is_none());
    }

    #[test]
    fn test_excluded_fstype_dropped_even_with_keyword() {
        let table = format!(
            "{}\n612 605 0:26 / /proc/driver/nvidia rw - proc proc rw\n",
            LINE_PROC
        );
        assert!(filter_gpu_mounts(&table).is_empty());
    }

    #[test]
    fn test_bind_gets_rbind_prepended_once() {
        let records = filter_gpu_mounts(LINE_NVIDIA_BIND);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].options[0], "rbind");

        let already = "613 605 259:1 /x /opt/nvidia rbind,rw - ext4 /dev/root rw";
        let records = filter_gpu_mounts(already);
        assert_eq!(
            records[0].options.iter().filter(|o| *o == "rbind").count(),
            1
        );
    }

    #[test]
    fn test_tmpfs_bind_uses_destination_as_source() {
        let line = "614 605 0:30 /hook /run/nvidia-ctk-hook.d rw - tmpfs tmpfs rw";
        let records = filter_gpu_mounts(line);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fs_type, "bind");
        assert_eq!(records[0].source, "/run/nvidia-ctk-hook.d");
    }
}
