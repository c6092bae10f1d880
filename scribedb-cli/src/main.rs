//! scribedb CLI - Cloud SQL connectivity for the scribe service
//!
//! Entry point for the `scribedb` binary:
//! - HTTP API with the database reachability gate (`serve`)
//! - Local tunnel management for restricted networks (`proxy`)
//! - Pool diagnostics (`db`)
//! - Effective configuration, secrets redacted (`config show`)

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod tracing_setup;

use tracing_setup::TracingConfig;

#[derive(Parser, Debug)]
#[command(
    name = "scribedb",
    author,
    version,
    about = "Database connectivity for the scribe service",
    long_about = "Reach the managed Postgres instance directly over TLS in production, \
                  or through a supervised local tunnel on development machines."
)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,

    /// Export traces over OTLP (requires the telemetry feature)
    #[arg(long, global = true)]
    otel: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API server
    Serve(commands::serve::ServeArgs),
    /// Check, start or hold the local database tunnel
    Proxy(commands::proxy::ProxyArgs),
    /// Reachability and query diagnostics
    Db(commands::db::DbArgs),
    /// Inspect resolved configuration
    Config(commands::config::ConfigArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = tracing_setup::init(&TracingConfig {
        debug: cli.debug,
        otel: cli.otel,
    }) {
        eprintln!("tracing setup failed: {e}");
    }

    let outcome = match cli.command {
        Commands::Serve(args) => commands::run_serve(args).await,
        Commands::Proxy(args) => commands::run_proxy(args).await,
        Commands::Db(args) => commands::run_db(args).await,
        Commands::Config(args) => commands::run_config(args),
        Commands::Completions(args) => run_completions(args),
    };

    tracing_setup::shutdown_otel();
    outcome
}

fn run_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());
    Ok(())
}
