//! TOML tuning configuration
//!
//! Only non-secret knobs live in files. Credentials and hosts always come from
//! the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Get the scribedb config directory path (~/.scribedb)
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".scribedb"))
}

/// Tuning loaded from `~/.scribedb/config.toml` and `./scribedb.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScribeConfig {
    #[serde(default)]
    pub pool: PoolTuning,

    #[serde(default)]
    pub proxy: ProxyTuning,
}

/// Pool overrides applied on top of the per-strategy defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolTuning {
    pub max_connections: Option<u32>,
    pub min_idle: Option<u32>,
    pub idle_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub statement_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyTuning {
    /// Default local tunnel port (overridden by CLOUD_SQL_PROXY_PORT)
    #[serde(default)]
    pub port: Option<u16>,

    /// Tunnel binary for persistent environments
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Tunnel binary download URL for ephemeral environments
    #[serde(default)]
    pub download_url: Option<String>,

    #[serde(default = "default_scan_attempts")]
    pub scan_attempts: u16,

    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Bound on establishing the binary download connection
    #[serde(default = "default_download_connect_timeout_secs")]
    pub download_connect_timeout_secs: u64,

    /// Bound on the whole binary download, body included
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for ProxyTuning {
    fn default() -> Self {
        Self {
            port: None,
            binary: None,
            download_url: None,
            scan_attempts: default_scan_attempts(),
            settle_ms: default_settle_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            download_connect_timeout_secs: default_download_connect_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

fn default_scan_attempts() -> u16 {
    10
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_download_connect_timeout_secs() -> u64 {
    10
}

fn default_download_timeout_secs() -> u64 {
    120
}

impl ScribeConfig {
    /// Load config from TOML files
    ///
    /// Priority order (highest to lowest):
    /// 1. ./scribedb.toml (project-specific)
    /// 2. ~/.scribedb/config.toml (user defaults)
    /// 3. Built-in defaults
    ///
    /// Unreadable or malformed files are logged and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global) = config_dir().map(|d| d.join("config.toml")) {
            if global.exists() {
                match Self::from_file(&global) {
                    Ok(parsed) => {
                        debug!("loaded global config from {}", global.display());
                        config = parsed;
                    }
                    Err(e) => warn!("{}", e),
                }
            }
        }

        let local = PathBuf::from("scribedb.toml");
        if local.exists() {
            match Self::from_file(&local) {
                Ok(parsed) => {
                    debug!("loaded local config from {}", local.display());
                    config = Self::merge(config, parsed);
                }
                Err(e) => warn!("{}", e),
            }
        }

        config
    }

    /// Parse one config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Merge two configs field by field (overlay wins where it sets a value)
    fn merge(base: Self, overlay: Self) -> Self {
        let pool = PoolTuning {
            max_connections: overlay.pool.max_connections.or(base.pool.max_connections),
            min_idle: overlay.pool.min_idle.or(base.pool.min_idle),
            idle_timeout_secs: overlay.pool.idle_timeout_secs.or(base.pool.idle_timeout_secs),
            connect_timeout_secs: overlay
                .pool
                .connect_timeout_secs
                .or(base.pool.connect_timeout_secs),
            statement_timeout_secs: overlay
                .pool
                .statement_timeout_secs
                .or(base.pool.statement_timeout_secs),
        };

        // Scalar proxy knobs always carry a default, so the overlay file wins
        let proxy = ProxyTuning {
            port: overlay.proxy.port.or(base.proxy.port),
            binary: overlay.proxy.binary.or(base.proxy.binary),
            download_url: overlay.proxy.download_url.or(base.proxy.download_url),
            ..overlay.proxy
        };

        Self { pool, proxy }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config: ScribeConfig = toml::from_str("").unwrap();
        assert_eq!(config, ScribeConfig::default());
        assert_eq!(config.proxy.scan_attempts, 10);
        assert_eq!(config.proxy.settle_ms, 2000);
        assert_eq!(config.proxy.download_timeout_secs, 120);
    }

    #[test]
    fn from_file_reads_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pool]\nmax_connections = 3\n\n[proxy]\nport = 6543\nscan_attempts = 4"
        )
        .unwrap();

        let config = ScribeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.max_connections, Some(3));
        assert_eq!(config.proxy.port, Some(6543));
        assert_eq!(config.proxy.scan_attempts, 4);
    }

    #[test]
    fn malformed_file_names_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool\nmax_connections = ").unwrap();

        let err = ScribeConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::File { ref path, .. } if path == file.path()));
    }

    #[test]
    fn merge_keeps_base_values_the_overlay_omits() {
        let base = ScribeConfig {
            pool: PoolTuning {
                max_connections: Some(8),
                min_idle: Some(2),
                ..Default::default()
            },
            proxy: ProxyTuning {
                port: Some(5433),
                ..Default::default()
            },
        };
        let overlay = ScribeConfig {
            pool: PoolTuning {
                min_idle: Some(0),
                ..Default::default()
            },
            proxy: ProxyTuning::default(),
        };

        let merged = ScribeConfig::merge(base, overlay);
        assert_eq!(merged.pool.max_connections, Some(8));
        assert_eq!(merged.pool.min_idle, Some(0));
        assert_eq!(merged.proxy.port, Some(5433));
    }
}
