//! Local tunnel commands
//!
//! Only meaningful under the `proxy_tunnel` strategy. A tunnel started here
//! belongs to this process and is stopped when the command finishes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use scribedb_proxy::{wait_until_healthy, ProxySupervisor, StartReport, StartStatus};
use scribedb_server::{shutdown_signal, DatabaseGate};

use super::{load_gate, print_json};

#[derive(Parser, Debug)]
pub struct ProxyArgs {
    #[command(subcommand)]
    pub command: ProxyCommand,
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommand {
    /// Probe the tunnel port without starting anything
    Check,
    /// Start the tunnel once, report, and stop it again
    Start,
    /// Start the tunnel and keep it up until Ctrl+C
    Run(RunArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Seconds to wait for a freshly spawned tunnel to answer
    #[arg(long, default_value_t = 30)]
    pub wait_secs: u64,

    /// Seconds between liveness checks while running
    #[arg(long, default_value_t = 10)]
    pub watch_secs: u64,
}

pub async fn run_proxy(args: ProxyArgs) -> Result<()> {
    let (_, gate) = load_gate()?;
    let Some(supervisor) = gate.supervisor().cloned() else {
        bail!(
            "the database tunnel is not used in {} mode (set SCRIBEDB_RUNTIME=development to use it)",
            gate.strategy()
        );
    };

    match args.command {
        ProxyCommand::Check => check(&supervisor).await,
        ProxyCommand::Start => start_once(&gate).await,
        ProxyCommand::Run(run) => run_foreground(&gate, &supervisor, run).await,
    }
}

async fn check(supervisor: &ProxySupervisor) -> Result<()> {
    let healthy = supervisor.is_healthy().await;
    let status = if healthy { "healthy" } else { "unhealthy" };
    print_json(&json!({
        "status": status,
        "port": supervisor.settings().default_port,
        "proxy": supervisor.snapshot(),
    }))?;
    if !healthy {
        bail!("database tunnel is not healthy");
    }
    Ok(())
}

async fn start_once(gate: &DatabaseGate) -> Result<()> {
    let report = ensure(gate).await?;
    print_json(&report)?;
    gate.shutdown().await;
    if !report.healthy {
        bail!("{}", report.message);
    }
    Ok(())
}

async fn run_foreground(
    gate: &DatabaseGate,
    supervisor: &Arc<ProxySupervisor>,
    args: RunArgs,
) -> Result<()> {
    let report = ensure(gate).await?;
    print_json(&report)?;

    let ready = report.healthy
        || (report.status == StartStatus::Started
            && wait_until_healthy(
                supervisor,
                Duration::from_secs(args.wait_secs),
                Duration::from_millis(500),
            )
            .await);
    if !ready {
        gate.shutdown().await;
        bail!("database tunnel did not become healthy: {}", report.message);
    }

    info!(port = ?supervisor.active_port(), "database tunnel up, Ctrl+C to stop");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.watch_secs.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let report = ensure(gate).await?;
                match report.status {
                    StartStatus::AlreadyRunning | StartStatus::ExternalProxyDetected => {}
                    StartStatus::Started => {
                        warn!(
                            port = ?report.port,
                            "database tunnel was down and has been restarted"
                        );
                    }
                    StartStatus::PortConflict | StartStatus::Error => {
                        warn!(
                            status = ?report.status,
                            "database tunnel unavailable: {}",
                            report.message
                        );
                    }
                }
            }
        }
    }

    gate.shutdown().await;
    Ok(())
}

async fn ensure(gate: &DatabaseGate) -> Result<StartReport> {
    match gate.ensure_tunnel().await {
        Some(report) => Ok(report),
        None => bail!("database tunnel is not configured"),
    }
}
