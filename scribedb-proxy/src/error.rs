//! Error types for tunnel supervision

use std::fmt;
use std::io;
use std::time::Duration;

use scribedb_core::ConfigError;

/// Which part of bringing up the subprocess failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubprocessStage {
    Binary,
    Download,
    Credentials,
    Spawn,
}

impl fmt::Display for SubprocessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Binary => "binary lookup",
            Self::Download => "binary download",
            Self::Credentials => "credential materialization",
            Self::Spawn => "spawn",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Port held by a process we did not start and that does not proxy
    #[error(
        "port {port} is in use by a process that does not answer as a database tunnel; \
         stop that process or set CLOUD_SQL_PROXY_PORT to a free port"
    )]
    PortConflict { port: u16 },

    #[error("no free local port in {start}..{} ({attempts} attempts)", *start as u32 + *attempts as u32)]
    PortExhaustion { start: u16, attempts: u16 },

    #[error("tunnel {stage} failed: {reason}")]
    Subprocess {
        stage: SubprocessStage,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn subprocess(stage: SubprocessStage, reason: impl fmt::Display) -> Self {
        Self::Subprocess {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Stable label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::PortConflict { .. } => "port_conflict",
            Self::PortExhaustion { .. } => "port_exhaustion",
            Self::Subprocess { .. } => "subprocess",
            Self::Io(_) => "io",
        }
    }
}

/// Why a tunnel probe did not confirm a working tunnel
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply: {0}")]
    Protocol(String),

    #[error("test query failed: {0}")]
    Query(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_tells_the_operator_what_to_do() {
        let msg = ProxyError::PortConflict { port: 5432 }.to_string();
        assert!(msg.contains("5432"));
        assert!(msg.contains("CLOUD_SQL_PROXY_PORT"));
    }

    #[test]
    fn exhaustion_names_the_range() {
        let msg = ProxyError::PortExhaustion {
            start: 5432,
            attempts: 10,
        }
        .to_string();
        assert!(msg.contains("5432..5442"));
    }

    #[test]
    fn subprocess_errors_name_the_stage() {
        let err = ProxyError::subprocess(SubprocessStage::Download, "HTTP 404");
        assert_eq!(err.to_string(), "tunnel binary download failed: HTTP 404");
        assert_eq!(err.kind(), "subprocess");
    }
}
