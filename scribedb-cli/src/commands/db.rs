//! Database diagnostics

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use scribedb_core::DEFAULT_POOL;
use scribedb_server::DatabaseGate;

use super::{load_gate, print_json};

#[derive(Parser, Debug)]
pub struct DbArgs {
    #[command(subcommand)]
    pub command: DbCommand,
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Run the reachability gate for the active strategy
    Check,
    /// Gate, then `SELECT 1` on a named pool
    Ping {
        /// Pool name (reads DB_<NAME>_* with fallback to DB_*)
        #[arg(long, default_value = DEFAULT_POOL)]
        pool: String,
    },
}

pub async fn run_db(args: DbArgs) -> Result<()> {
    let (_, gate) = load_gate()?;

    let outcome = match args.command {
        DbCommand::Check => {
            let reachable = gate.ensure_database_reachable().await;
            print_json(&json!({
                "reachable": reachable,
                "strategy": gate.strategy(),
            }))?;
            if reachable {
                Ok(())
            } else {
                Err(anyhow::anyhow!("database is not reachable ({})", gate.strategy()))
            }
        }
        DbCommand::Ping { pool } => ping(&gate, &pool).await,
    };

    gate.shutdown().await;
    outcome
}

async fn ping(gate: &DatabaseGate, pool: &str) -> Result<()> {
    if !gate.ensure_database_reachable().await {
        bail!("database is not reachable ({})", gate.strategy());
    }
    let started = std::time::Instant::now();
    let result = gate
        .query_on(pool, "SELECT 1 AS ok", &[])
        .await
        .with_context(|| format!("ping on pool '{pool}' failed"))?;
    let stats = gate.pools().stats(pool);
    print_json(&json!({
        "pool": pool,
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "rows": result.rows,
        "stats": stats,
    }))
}
