//! Show the configuration the process would actually run with
//!
//! Passwords and inline credentials never reach the output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use scribedb_core::{
    BinarySource, ConnectionStrategy, CredentialSource, EnvSource, ProcessEnv, ScribeConfig,
    Settings, TlsPolicy, DEFAULT_POOL,
};

const REDACTED: &str = "<redacted>";

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print resolved settings with secrets redacted
    Show {
        /// Pool whose connection settings to resolve
        #[arg(long, default_value = DEFAULT_POOL)]
        pool: String,

        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

#[derive(Debug, Serialize)]
struct EffectiveConfig {
    strategy: ConnectionStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    database_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<DatabaseView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<ProxyView>,
    tuning: ScribeConfig,
}

#[derive(Debug, Serialize)]
struct DatabaseView {
    pool: String,
    host: String,
    port: u16,
    user: String,
    password: &'static str,
    database: String,
    tls: TlsPolicy,
    max_connections: u32,
    min_idle: u32,
    idle_timeout_secs: u64,
    connect_timeout_secs: u64,
    statement_timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct ProxyView {
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_name: Option<String>,
    default_port: u16,
    binary: String,
    credentials: String,
    ephemeral: bool,
    scan_attempts: u16,
    settle_ms: u64,
    probe_timeout_ms: u64,
    stop_grace_ms: u64,
    download_connect_timeout_secs: u64,
    download_timeout_secs: u64,
}

pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Show { pool, format } => {
            let settings = Settings::load().context("Failed to load scribedb settings")?;
            let view = effective(&settings, &ProcessEnv, &pool);
            println!("{}", render(&view, format)?);
            Ok(())
        }
    }
}

fn effective(settings: &Settings, env: &dyn EnvSource, pool: &str) -> EffectiveConfig {
    let (database, database_error) = match settings.connect_settings(env, pool) {
        Ok(db) => (
            Some(DatabaseView {
                pool: pool.to_string(),
                host: db.host,
                port: db.port,
                user: db.user,
                password: REDACTED,
                database: db.database,
                tls: db.tls,
                max_connections: db.limits.max_connections,
                min_idle: db.limits.min_idle,
                idle_timeout_secs: db.limits.idle_timeout.as_secs(),
                connect_timeout_secs: db.limits.connect_timeout.as_secs(),
                statement_timeout_secs: db.limits.statement_timeout.as_secs(),
            }),
            None,
        ),
        Err(e) => (None, Some(e.to_string())),
    };

    let (proxy, proxy_error) = match settings.strategy {
        ConnectionStrategy::DirectSsl => (None, None),
        ConnectionStrategy::ProxyTunnel => match settings.proxy_settings(env) {
            Ok(proxy) => (
                Some(ProxyView {
                    connection_name: proxy.connection_name,
                    default_port: proxy.default_port,
                    binary: match proxy.binary {
                        BinarySource::Path(path) => format!("path:{}", path.display()),
                        BinarySource::Download { url } => format!("download:{url}"),
                    },
                    credentials: match proxy.credentials {
                        CredentialSource::Ambient => "ambient".to_string(),
                        CredentialSource::File(path) => format!("file:{}", path.display()),
                        CredentialSource::InlineJson(_) => format!("inline:{REDACTED}"),
                    },
                    ephemeral: proxy.ephemeral,
                    scan_attempts: proxy.scan_attempts,
                    settle_ms: proxy.settle_time.as_millis() as u64,
                    probe_timeout_ms: proxy.probe_timeout.as_millis() as u64,
                    stop_grace_ms: proxy.stop_grace.as_millis() as u64,
                    download_connect_timeout_secs: proxy.download_connect_timeout.as_secs(),
                    download_timeout_secs: proxy.download_timeout.as_secs(),
                }),
                None,
            ),
            Err(e) => (None, Some(e.to_string())),
        },
    };

    EffectiveConfig {
        strategy: settings.strategy,
        database_error,
        proxy_error,
        database,
        proxy,
        tuning: settings.config.clone(),
    }
}

fn render(view: &EffectiveConfig, format: Format) -> Result<String> {
    Ok(match format {
        Format::Toml => toml::to_string_pretty(view).context("Failed to render TOML")?,
        Format::Json => serde_json::to_string_pretty(view)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn settings_for(env: &HashMap<String, String>) -> Settings {
        Settings {
            strategy: ConnectionStrategy::from_env(env).unwrap(),
            config: ScribeConfig::default(),
        }
    }

    #[test]
    fn direct_mode_redacts_password_and_omits_proxy() {
        let env = env(&[
            ("SCRIBEDB_RUNTIME", "production"),
            ("DB_HOST", "10.1.2.3"),
            ("DB_USER", "scribe"),
            ("DB_PASSWORD", "hunter2"),
            ("DB_NAME", "scribe"),
        ]);
        let view = effective(&settings_for(&env), &env, DEFAULT_POOL);

        let out = render(&view, Format::Toml).unwrap();
        assert!(out.contains("strategy = \"direct_ssl\""));
        assert!(out.contains("10.1.2.3"));
        assert!(out.contains(REDACTED));
        assert!(!out.contains("hunter2"));
        assert!(view.proxy.is_none());
        assert!(view.proxy_error.is_none());
    }

    #[test]
    fn tunnel_mode_hides_inline_credentials() {
        let env = env(&[
            ("SCRIBEDB_RUNTIME", "development"),
            ("SCRIBEDB_EPHEMERAL", "true"),
            ("CLOUD_SQL_CONNECTION_NAME", "proj:region:inst"),
            ("GOOGLE_CREDENTIALS_JSON", r#"{"private_key":"very-secret"}"#),
        ]);
        let view = effective(&settings_for(&env), &env, DEFAULT_POOL);

        let proxy = view.proxy.as_ref().unwrap();
        assert_eq!(proxy.connection_name.as_deref(), Some("proj:region:inst"));
        assert!(proxy.binary.starts_with("download:"));
        assert_eq!(proxy.credentials, "inline:<redacted>");
        assert_eq!(proxy.download_timeout_secs, 120);

        let out = render(&view, Format::Json).unwrap();
        assert!(!out.contains("very-secret"));
    }

    #[test]
    fn missing_database_variables_are_reported_not_fatal() {
        let env = env(&[("SCRIBEDB_RUNTIME", "production")]);
        let view = effective(&settings_for(&env), &env, DEFAULT_POOL);

        assert!(view.database.is_none());
        let error = view.database_error.unwrap();
        assert!(error.contains("DB_HOST"));
    }
}
