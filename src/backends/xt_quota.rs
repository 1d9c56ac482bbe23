// Fast-path quota updates through the xt_quota2 proc interface

use std::fs;
use std::path::PathBuf;

use super::QuotaControl;

pub const XT_QUOTA_DIR: &str = "/proc/net/xt_quota";

/// Writes new thresholds to `/proc/net/xt_quota/<name>`
#[derive(Debug, Clone)]
pub struct XtQuotaControl {
    dir: PathBuf,
}

impl Default for XtQuotaControl {
    fn default() -> Self {
        Self::new(XT_QUOTA_DIR)
    }
}

impl XtQuotaControl {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl QuotaControl for XtQuotaControl {
    fn update(&self, name: &str, bytes: u64) -> std::io::Result<()> {
        let path = self.dir.join(name);
        fs::write(&path, format!("{}\n", bytes))?;
        log::debug!("Updated quota {:?} to {} bytes", path, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_writes_value() {
        let dir = std::env::temp_dir().join(format!("bwcontrol-xtq-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let control = XtQuotaControl::new(&dir);
        control.update("rmnet0", 123457).unwrap();

        let written = fs::read_to_string(dir.join("rmnet0")).unwrap();
        assert_eq!(written, "123457\n");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_update_missing_dir_fails() {
        let control = XtQuotaControl::new("/nonexistent/bwcontrol/xt_quota");
        assert!(control.update("shared", 1).is_err());
    }
}
