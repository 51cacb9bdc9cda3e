use std::time::{SystemTime, UNIX_EPOCH};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Device-memory sizes as the driver query tool reports them: MiB-granular
/// values that commonly reach tens of GiB.
pub fn format_memory(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{} MiB", bytes / MIB)
    } else {
        format!("{bytes} B")
    }
}

/// Wall clock of a checkpoint stage. Sub-second stages stay in
/// milliseconds; a large VRAM evacuation can run into minutes.
pub fn format_duration(ms: u64) -> String {
    match ms {
        0..=999 => format!("{ms}ms"),
        1000..=59_999 => format!("{:.1}s", ms as f64 / 1000.0),
        _ => format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}

// Checkpoint directories are stamped in local time; libc does the
// conversion so we avoid pulling in a date crate.

/// Current local time as `YYYYMMDD-HHMMSS`.
pub fn timestamp() -> String {
    let mut timebuf = libc::tm {
        tm_sec: 0,
        tm_min: 0,
        tm_hour: 0,
        tm_mday: 0,
        tm_mon: 0,
        tm_year: 0,
        tm_wday: 0,
        tm_yday: 0,
        tm_isdst: 0,
        tm_gmtoff: 0,
        tm_zone: std::ptr::null(),
    };
    let converted = unsafe {
        let t = libc::time(std::ptr::null_mut());
        !libc::localtime_r(&t, &mut timebuf).is_null()
    };

    if converted {
        format!(
            "{:04}{:02}{:02}-{:02}{:02}{:02}",
            timebuf.tm_year + 1900,
            timebuf.tm_mon + 1,
            timebuf.tm_mday,
            timebuf.tm_hour,
            timebuf.tm_min,
            timebuf.tm_sec
        )
    } else {
        // localtime_r has no good failure mode; epoch seconds at least
        // keep directory names unique.
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("epoch-{secs}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(0), "0 B");
        assert_eq!(format_memory(512), "512 B");
        assert_eq!(format_memory(512 * MIB), "512 MiB");
        assert_eq!(format_memory(GIB), "1.00 GiB");
        assert_eq!(format_memory(80 * GIB), "80.00 GiB");
        assert_eq!(format_memory(GIB + GIB / 2), "1.50 GiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0ms");
        assert_eq!(format_duration(500), "500ms");
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(65_500), "1m05s");
        assert_eq!(format_duration(125_000), "2m05s");
    }

    #[test]
    fn test_timestamp_shape() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), 15);
        assert_eq!(stamp.as_bytes()[8], b'-');
        assert!(stamp[..8].chars().all(|c| c.is_ascii_digit()));
        assert!(stamp[9..].chars().all(|c| c.is_ascii_digit()));
    }
}
