// Daemon configuration load/save

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backends::xt_quota::XT_QUOTA_DIR;

const CONFIG_DIR: &str = ".config/bwcontrol";
const CONFIG_FILE: &str = "config.json";

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// IPv4 single-rule tool
    #[serde(default = "default_iptables")]
    pub iptables_path: PathBuf,

    /// IPv6 single-rule tool
    #[serde(default = "default_ip6tables")]
    pub ip6tables_path: PathBuf,

    #[serde(default = "default_iptables_restore")]
    pub iptables_restore_path: PathBuf,

    #[serde(default = "default_ip6tables_restore")]
    pub ip6tables_restore_path: PathBuf,

    /// Where live quota2 thresholds are exposed
    #[serde(default = "default_xt_quota_dir")]
    pub xt_quota_dir: PathBuf,

    /// Unix socket the line protocol is served on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Reconcile the chain topology on startup
    #[serde(default = "default_true")]
    pub setup_on_start: bool,

    /// Enable accounting right after setup
    #[serde(default)]
    pub enable_on_start: bool,
}

fn default_iptables() -> PathBuf {
    PathBuf::from("iptables")
}

fn default_ip6tables() -> PathBuf {
    PathBuf::from("ip6tables")
}

fn default_iptables_restore() -> PathBuf {
    PathBuf::from("iptables-restore")
}

fn default_ip6tables_restore() -> PathBuf {
    PathBuf::from("ip6tables-restore")
}

fn default_xt_quota_dir() -> PathBuf {
    PathBuf::from(XT_QUOTA_DIR)
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/bwcontrol.sock")
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iptables_path: default_iptables(),
            ip6tables_path: default_ip6tables(),
            iptables_restore_path: default_iptables_restore(),
            ip6tables_restore_path: default_ip6tables_restore(),
            xt_quota_dir: default_xt_quota_dir(),
            socket_path: default_socket_path(),
            setup_on_start: true,
            enable_on_start: false,
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load configuration from `path`, or the default location
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(&path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to `path`, or the default location
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .context(format!("Failed to create config directory: {:?}", dir))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents).context(format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "socket_path": "/tmp/bw.sock", "enable_on_start": true }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/bw.sock"));
        assert!(config.enable_on_start);
        assert!(config.setup_on_start);
        assert_eq!(config.xt_quota_dir, PathBuf::from("/proc/net/xt_quota"));
        assert_eq!(config.iptables_restore_path, PathBuf::from("iptables-restore"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("bwcontrol-config-{}", std::process::id()));
        let path = dir.join("nested").join(CONFIG_FILE);

        let mut config = Config::default();
        config.setup_on_start = false;
        config.ip6tables_path = PathBuf::from("/sbin/ip6tables");
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = Path::new("/nonexistent/bwcontrol/config.json");
        assert_eq!(Config::load(Some(path)).unwrap(), Config::default());
    }
}
