//! scribedb-pool: named Postgres connection pools
//!
//! Provides a registry of lazily created, cached pools with a uniform
//! query / transaction / health interface. Leaf crate: knows nothing about
//! tunnels or runtime modes beyond the settings it is handed.

pub mod error;
pub mod manager;
pub mod resolver;
pub mod retry;
pub mod rows;

pub use error::{is_transient, DbError, RETRYABLE_IO_KINDS, RETRYABLE_SQLSTATES};
pub use manager::{ManagedPool, PoolManager, PoolStats};
pub use resolver::{ConnectionResolver, EnvResolver, StaticResolver};
pub use retry::RetryPolicy;
pub use rows::QueryResult;
