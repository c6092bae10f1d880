//! Database error taxonomy
//!
//! Driver errors are classified once, at the lowest layer, into connection
//! failures (possibly transient) and statement failures (never retried).

use std::io;

use scribedb_core::ConfigError;

/// SQLSTATE codes treated as transient: admin_shutdown, crash_shutdown,
/// cannot_connect_now. Nothing else is retried.
pub const RETRYABLE_SQLSTATES: &[&str] = &["57P01", "57P02", "57P03"];

/// Socket error kinds treated as transient
pub const RETRYABLE_IO_KINDS: &[io::ErrorKind] = &[
    io::ErrorKind::ConnectionRefused,
    io::ErrorKind::ConnectionReset,
    io::ErrorKind::ConnectionAborted,
    io::ErrorKind::TimedOut,
];

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Required connection parameters are absent or malformed
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The connection could not be established or was lost
    #[error("connection error: {0}")]
    Connection(#[source] sqlx::Error),

    /// The statement itself failed (syntax, constraint, ...)
    #[error("query error: {0}")]
    Query(#[source] sqlx::Error),

    /// Client-side deadline elapsed; the connection was discarded
    #[error("statement timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

impl DbError {
    /// Sort a driver error into connection vs statement failures
    pub fn classify(err: sqlx::Error) -> Self {
        let connection_level = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => true,
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| code.starts_with("08") || RETRYABLE_SQLSTATES.contains(&&*code))
                .unwrap_or(false),
            _ => false,
        };

        if connection_level {
            Self::Connection(err)
        } else {
            Self::Query(err)
        }
    }

    /// Whether a single retry after a short backoff is allowed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(err) => is_transient(err),
            _ => false,
        }
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::Query(_) => "query",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Transient network failures: refused, reset, timed out, admin disconnect
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(io) => RETRYABLE_IO_KINDS.contains(&io.kind()),
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| RETRYABLE_SQLSTATES.contains(&&*code))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    /// Minimal server error carrying a SQLSTATE
    #[derive(Debug)]
    pub(crate) struct FakeDbError(pub &'static str);

    impl fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "server error {}", self.0)
        }
    }

    impl StdError for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            "server error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    pub(crate) fn refused() -> sqlx::Error {
        sqlx::Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    #[test]
    fn refused_connection_is_retryable() {
        let err = DbError::classify(refused());
        assert!(matches!(err, DbError::Connection(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn admin_shutdown_is_retryable() {
        let err = DbError::classify(sqlx::Error::Database(Box::new(FakeDbError("57P01"))));
        assert_eq!(err.kind(), "connection");
        assert!(err.is_retryable());
    }

    #[test]
    fn constraint_violation_is_a_query_error() {
        let err = DbError::classify(sqlx::Error::Database(Box::new(FakeDbError("23505"))));
        assert!(matches!(err, DbError::Query(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn connection_failure_outside_the_list_is_not_retried() {
        let err = DbError::classify(sqlx::Error::Database(Box::new(FakeDbError("08006"))));
        assert_eq!(err.kind(), "connection");
        assert!(!err.is_retryable());

        let err = DbError::classify(sqlx::Error::Io(io::Error::from(
            io::ErrorKind::PermissionDenied,
        )));
        assert!(!err.is_retryable());
    }

    #[test]
    fn configuration_errors_never_retry() {
        let err = DbError::from(ConfigError::missing(["DB_HOST"]));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("DB_HOST"));
    }
}
