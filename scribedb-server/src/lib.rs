//! scribedb-server: HTTP surface over the database gate
//!
//! The gate picks the connectivity path once at startup. Handlers call
//! `ensure_database_reachable` before querying and answer 503 when it fails.

pub mod gate;
pub mod http;

pub use gate::{DatabaseGate, TunnelResolver};
pub use http::{
    build_router, run_server, shutdown_signal, ApiError, AppState, ServerConfig, ServerError,
};
