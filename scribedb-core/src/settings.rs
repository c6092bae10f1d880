//! Resolved connection and tunnel parameters
//!
//! Everything here is plain data: the pool crate turns [`ConnectSettings`]
//! into sqlx options, the proxy crate turns [`ProxySettings`] into a
//! subprocess invocation.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{PoolTuning, ProxyTuning, ScribeConfig};
use crate::env::{EnvSource, ProcessEnv};
use crate::error::ConfigError;
use crate::mode::{ConnectionStrategy, TlsPolicy};

/// Logical name of the pool most callers use
pub const DEFAULT_POOL: &str = "default";

/// Host the tunnel listens on
pub const TUNNEL_HOST: &str = "127.0.0.1";

pub const DEFAULT_DB_PORT: u16 = 5432;

pub const DEFAULT_PROXY_URL: &str =
    "https://storage.googleapis.com/cloud-sql-connectors/cloud-sql-proxy/v2.14.1/cloud-sql-proxy.linux.amd64";

pub const DEFAULT_PROXY_BINARY: &str = "cloud-sql-proxy";

/// Socket bounds and timeouts for one pool. Fixed at pool creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_connections: u32,
    pub min_idle: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
}

impl PoolLimits {
    /// Defaults per strategy: constrained production compute gets short
    /// timeouts, development tolerates cold starts through the tunnel.
    pub fn for_strategy(strategy: ConnectionStrategy) -> Self {
        match strategy {
            ConnectionStrategy::DirectSsl => Self {
                max_connections: 5,
                min_idle: 0,
                idle_timeout: Duration::from_secs(10),
                connect_timeout: Duration::from_secs(5),
                statement_timeout: Duration::from_secs(15),
            },
            ConnectionStrategy::ProxyTunnel => Self {
                max_connections: 10,
                min_idle: 1,
                idle_timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(30),
                statement_timeout: Duration::from_secs(60),
            },
        }
    }

    /// Apply file overrides
    pub fn tuned(mut self, tuning: &PoolTuning) -> Self {
        if let Some(max) = tuning.max_connections {
            self.max_connections = max.max(1);
        }
        if let Some(min) = tuning.min_idle {
            self.min_idle = min;
        }
        if let Some(secs) = tuning.idle_timeout_secs {
            self.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = tuning.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = tuning.statement_timeout_secs {
            self.statement_timeout = Duration::from_secs(secs);
        }
        self.min_idle = self.min_idle.min(self.max_connections);
        self
    }
}

/// Everything needed to build one named pool
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub tls: TlsPolicy,
    pub limits: PoolLimits,
}

impl fmt::Debug for ConnectSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("tls", &self.tls)
            .field("limits", &self.limits)
            .finish()
    }
}

impl ConnectSettings {
    /// Resolve settings for pool `name`.
    ///
    /// `default` reads `DB_*`. Any other name reads `DB_<NAME>_*` and falls
    /// back to `DB_*` per variable. Every missing variable is reported at once.
    pub fn from_env(
        env: &dyn EnvSource,
        name: &str,
        strategy: ConnectionStrategy,
        tuning: &ScribeConfig,
    ) -> Result<Self, ConfigError> {
        let prefix = pool_prefix(name);
        let lookup = |suffix: &str| {
            env.var(&format!("{prefix}{suffix}"))
                .or_else(|| env.var(&format!("DB_{suffix}")))
        };

        let mut missing = Vec::new();
        let mut require = |suffix: &str| {
            let value = lookup(suffix);
            if value.is_none() {
                missing.push(format!("{prefix}{suffix}"));
            }
            value.unwrap_or_default()
        };

        let user = require("USER");
        let password = require("PASSWORD");
        let database = require("NAME");
        let (host, port) = match strategy {
            ConnectionStrategy::DirectSsl => {
                let host = require("HOST");
                let port = match lookup("PORT") {
                    Some(raw) => parse_port(&format!("{prefix}PORT"), &raw)?,
                    None => DEFAULT_DB_PORT,
                };
                (host, port)
            }
            ConnectionStrategy::ProxyTunnel => {
                (TUNNEL_HOST.to_string(), proxy_port(env, &tuning.proxy)?)
            }
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing { vars: missing });
        }

        Ok(Self {
            host,
            port,
            user,
            password,
            database,
            tls: strategy.tls(),
            limits: PoolLimits::for_strategy(strategy).tuned(&tuning.pool),
        })
    }

    /// Same settings pointed at a different local port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Where the tunnel binary comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinarySource {
    /// Installed on disk (a bare name is resolved on PATH)
    Path(PathBuf),
    /// Fetched into a temp dir once per process
    Download { url: String },
}

/// Where the tunnel's service-account credentials come from
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Ambient credentials, no flag passed to the tunnel
    Ambient,
    File(PathBuf),
    /// Raw JSON blob to materialize into a temp file
    InlineJson(String),
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambient => f.write_str("Ambient"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::InlineJson(_) => f.write_str("InlineJson(<redacted>)"),
        }
    }
}

/// Parameters for the tunnel supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    /// `project:region:instance`; absence only fails when a start is attempted
    pub connection_name: Option<String>,
    pub default_port: u16,
    pub scan_attempts: u16,
    pub settle_time: Duration,
    pub probe_timeout: Duration,
    pub stop_grace: Duration,
    pub download_connect_timeout: Duration,
    /// Whole-request bound on fetching the tunnel binary
    pub download_timeout: Duration,
    pub binary: BinarySource,
    pub credentials: CredentialSource,
    pub ephemeral: bool,
}

impl ProxySettings {
    pub fn from_env(env: &dyn EnvSource, tuning: &ProxyTuning) -> Result<Self, ConfigError> {
        let ephemeral = env.flag("SCRIBEDB_EPHEMERAL");

        let binary = if ephemeral {
            BinarySource::Download {
                url: env
                    .var("CLOUD_SQL_PROXY_URL")
                    .or_else(|| tuning.download_url.clone())
                    .unwrap_or_else(|| DEFAULT_PROXY_URL.to_string()),
            }
        } else {
            BinarySource::Path(
                env.var("CLOUD_SQL_PROXY_BIN")
                    .map(PathBuf::from)
                    .or_else(|| tuning.binary.clone())
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_PROXY_BINARY)),
            )
        };

        let file = env.var("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from);
        let inline = env.var("GOOGLE_CREDENTIALS_JSON");
        // Ephemeral compute has no persistent filesystem, so inline JSON wins there
        let credentials = match (ephemeral, file, inline) {
            (true, _, Some(json)) => CredentialSource::InlineJson(json),
            (_, Some(path), _) => CredentialSource::File(path),
            (false, None, Some(json)) => CredentialSource::InlineJson(json),
            (_, None, None) => CredentialSource::Ambient,
        };

        Ok(Self {
            connection_name: env.var("CLOUD_SQL_CONNECTION_NAME"),
            default_port: proxy_port(env, tuning)?,
            scan_attempts: tuning.scan_attempts.max(1),
            settle_time: Duration::from_millis(tuning.settle_ms),
            probe_timeout: Duration::from_millis(tuning.probe_timeout_ms),
            stop_grace: Duration::from_millis(tuning.stop_grace_ms),
            download_connect_timeout: Duration::from_secs(
                tuning.download_connect_timeout_secs.max(1),
            ),
            download_timeout: Duration::from_secs(tuning.download_timeout_secs.max(1)),
            binary,
            credentials,
            ephemeral,
        })
    }
}

/// Fully loaded settings for one process
#[derive(Debug, Clone)]
pub struct Settings {
    pub strategy: ConnectionStrategy,
    pub config: ScribeConfig,
}

impl Settings {
    /// Load `.env` files and TOML tuning, then read the runtime indicator
    pub fn load() -> Result<Self, ConfigError> {
        crate::env::load_dotenv();
        let config = ScribeConfig::load();
        let strategy = ConnectionStrategy::from_env(&ProcessEnv)?;
        Ok(Self { strategy, config })
    }

    pub fn connect_settings(
        &self,
        env: &dyn EnvSource,
        name: &str,
    ) -> Result<ConnectSettings, ConfigError> {
        ConnectSettings::from_env(env, name, self.strategy, &self.config)
    }

    pub fn proxy_settings(&self, env: &dyn EnvSource) -> Result<ProxySettings, ConfigError> {
        ProxySettings::from_env(env, &self.config.proxy)
    }
}

fn pool_prefix(name: &str) -> String {
    if name == DEFAULT_POOL {
        "DB_".to_string()
    } else {
        format!("DB_{}_", name.to_ascii_uppercase().replace('-', "_"))
    }
}

fn proxy_port(env: &dyn EnvSource, tuning: &ProxyTuning) -> Result<u16, ConfigError> {
    match env.var("CLOUD_SQL_PROXY_PORT") {
        Some(raw) => parse_port("CLOUD_SQL_PROXY_PORT", &raw),
        None => Ok(tuning.port.unwrap_or(DEFAULT_DB_PORT)),
    }
}

fn parse_port(var: &str, raw: &str) -> Result<u16, ConfigError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::invalid(var, format!("'{}' is not a port number", raw))),
        Ok(port) => Ok(port),
    }
}
