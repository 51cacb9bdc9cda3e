//! GPU device identity and cross-device restore planning.
//!
//! A checkpoint taken on one device can be restored onto another by handing
//! the driver a remap pair; the plan carries the two device UUIDs.

use crate::{KybernateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 16-byte GPU device UUID as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuUuid(pub [u8; 16]);

impl fmt::Display for GpuUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU-")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for GpuUuid {
    type Err = KybernateError;

    /// Accepts the `GPU-` prefixed form the driver query tool prints,
    /// with or without dash grouping.
    fn from_str(s: &str) -> Result<Self> {
        let hex: String = s
            .trim()
            .strip_prefix("GPU-")
            .unwrap_or(s.trim())
            .chars()
            .filter(|c| *c != '-')
            .collect();
        if hex.len() != 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KybernateError::SpecInvalid(format!(
                "malformed GPU UUID: {s}"
            )));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).expect("hex digits are ascii");
            bytes[i] = u8::from_str_radix(pair, 16).expect("validated hex");
        }
        Ok(GpuUuid(bytes))
    }
}

/// One enumerated GPU device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuInfo {
    pub index: usize,
    pub uuid: GpuUuid,
}

/// Instructs the driver to remap VRAM blob references on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub source: GpuUuid,
    pub target: GpuUuid,
}

impl MigrationPlan {
    pub fn new(source: GpuUuid, target: GpuUuid) -> Self {
        Self { source, target }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_roundtrip() {
        let uuid = GpuUuid([
            0x8f, 0x4c, 0x27, 0x1d, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99,
            0xaa, 0xbb,
        ]);
        let text = uuid.to_string();
        assert!(text.starts_with("GPU-8f4c271d"));
        assert_eq!(text.parse::<GpuUuid>().unwrap(), uuid);
    }

    #[test]
    fn test_uuid_parses_dashed_form() {
        let parsed: GpuUuid = "GPU-8f4c271d-0011-2233-4455-66778899aabb".parse().unwrap();
        assert_eq!(parsed.0[0], 0x8f);
        assert_eq!(parsed.0[15], 0xbb);
    }

    #[test]
    fn test_uuid_rejects_garbage() {
        assert!("GPU-nothex".parse::<GpuUuid>().is_err());
        assert!("".parse::<GpuUuid>().is_err());
    }
}
