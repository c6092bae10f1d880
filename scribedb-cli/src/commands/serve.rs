//! HTTP server command
//!
//! Runs the API with the database gate. The tunnel (if any) is brought up
//! lazily by the first request that needs the database.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;

use scribedb_server::{run_server, ServerConfig};

use super::load_gate;

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to bind to (default: 127.0.0.1:3030)
    #[arg(long, short = 'b', default_value = "127.0.0.1:3030", env = "SCRIBEDB_BIND")]
    pub bind: SocketAddr,

    /// Allow permissive CORS (all origins) - use with caution
    #[arg(long)]
    pub cors_permissive: bool,

    /// Bring the database path up before accepting requests
    #[arg(long)]
    pub warm: bool,
}

/// Run the HTTP server
pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let (_, gate) = load_gate()?;

    tracing::info!(strategy = %gate.strategy(), "Starting scribedb server on {}", args.bind);

    if args.warm && !gate.ensure_database_reachable().await {
        tracing::warn!("database not reachable yet, requests will get 503 until it is");
    }

    let config = ServerConfig {
        bind_addr: args.bind,
        cors_permissive: args.cors_permissive,
    };

    run_server(gate, config).await.context("Server error")?;

    Ok(())
}
