//! Structured configuration errors.
//!
//! Every connectivity path resolves its parameters up front and fails with one
//! of these before any socket or subprocess is touched.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more required variables are absent (or empty)
    #[error("missing required configuration: {}", vars.join(", "))]
    Missing { vars: Vec<String> },

    /// A variable is present but cannot be used
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },

    /// A config file exists but could not be read or parsed
    #[error("config file {path:?}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Result type alias for configuration loading
pub type Result<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    /// Create a missing-variables error
    pub fn missing<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Missing {
            vars: vars.into_iter().map(Into::into).collect(),
        }
    }

    /// Create an invalid-value error
    pub fn invalid(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var: var.into(),
            reason: reason.into(),
        }
    }

    /// Names of the variables this error is about, for operator-facing logs
    pub fn variables(&self) -> Vec<&str> {
        match self {
            Self::Missing { vars } => vars.iter().map(String::as_str).collect(),
            Self::Invalid { var, .. } => vec![var.as_str()],
            Self::File { .. } => Vec::new(),
        }
    }
}
