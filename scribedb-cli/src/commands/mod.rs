//! Subcommand implementations

pub mod config;
pub mod db;
pub mod proxy;
pub mod serve;

pub use config::run_config;
pub use db::run_db;
pub use proxy::run_proxy;
pub use serve::run_serve;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use scribedb_core::{ProcessEnv, Settings};
use scribedb_server::DatabaseGate;

/// Load settings from the process environment and build the gate
pub(crate) fn load_gate() -> Result<(Settings, Arc<DatabaseGate>)> {
    let settings = Settings::load().context("Failed to load scribedb settings")?;
    let gate = DatabaseGate::from_settings(&settings, Arc::new(ProcessEnv))
        .context("Failed to configure database connectivity")?;
    Ok((settings, Arc::new(gate)))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
