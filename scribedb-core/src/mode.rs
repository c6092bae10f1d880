//! Runtime mode: which connectivity path the process uses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::env::EnvSource;
use crate::error::ConfigError;

/// Variable holding the runtime-environment indicator
pub const RUNTIME_VAR: &str = "SCRIBEDB_RUNTIME";

/// How database traffic reaches the managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStrategy {
    /// Unrestricted network: pooled TLS connections straight to the instance
    DirectSsl,
    /// Restricted network: plaintext to a local tunnel subprocess
    ProxyTunnel,
}

impl ConnectionStrategy {
    /// Resolve the strategy from the runtime indicator.
    ///
    /// An unset indicator means a development machine, which goes through
    /// the tunnel.
    pub fn from_env(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        match env.var(RUNTIME_VAR) {
            None => Ok(Self::ProxyTunnel),
            Some(value) => value.parse(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectSsl => "direct_ssl",
            Self::ProxyTunnel => "proxy_tunnel",
        }
    }

    /// TLS policy for connections made under this strategy.
    ///
    /// The tunnel encrypts upstream itself, so the local hop is plaintext.
    pub fn tls(&self) -> TlsPolicy {
        match self {
            Self::DirectSsl => TlsPolicy::Require,
            Self::ProxyTunnel => TlsPolicy::Disable,
        }
    }
}

impl FromStr for ConnectionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" | "direct" | "direct_ssl" => Ok(Self::DirectSsl),
            "development" | "dev" | "proxy" | "proxy_tunnel" | "restricted" => {
                Ok(Self::ProxyTunnel)
            }
            other => Err(ConfigError::invalid(
                RUNTIME_VAR,
                format!("unknown runtime '{}' (expected production or development)", other),
            )),
        }
    }
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport security for pooled connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    Disable,
    Require,
}
