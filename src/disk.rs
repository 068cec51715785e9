//! Disk usage under the download root.

use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DiskInfo {
    pub free: u64,
    pub used: u64,
    pub total: u64,
}

impl DiskInfo {
    /// Stat the filesystem holding `path`. Called on demand, never cached.
    pub fn probe(path: &Path) -> io::Result<DiskInfo> {
        let free = fs2::available_space(path)?;
        let total = fs2::total_space(path)?;
        Ok(DiskInfo {
            free,
            used: total.saturating_sub(free),
            total,
        })
    }

    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.used as f64 / self.total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_something() {
        let tmp = tempfile::tempdir().unwrap();
        let info = DiskInfo::probe(tmp.path()).unwrap();
        assert!(info.total > 0);
        assert_eq!(info.total, info.free + info.used);
        assert!(info.used_percent() <= 100.0);
    }
}
