//! Connection parameter resolution per logical pool name

use std::collections::HashMap;
use std::sync::Arc;

use scribedb_core::{
    ConfigError, ConnectSettings, ConnectionStrategy, EnvSource, ProcessEnv, ScribeConfig, Settings,
};

/// Turns a logical pool name into connection settings.
///
/// Called at most once per successful pool creation.
pub trait ConnectionResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<ConnectSettings, ConfigError>;
}

impl<F> ConnectionResolver for F
where
    F: Fn(&str) -> Result<ConnectSettings, ConfigError> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Result<ConnectSettings, ConfigError> {
        self(name)
    }
}

/// Reads `DB_*` / `DB_<NAME>_*` variables
pub struct EnvResolver {
    strategy: ConnectionStrategy,
    config: ScribeConfig,
    env: Arc<dyn EnvSource>,
}

impl EnvResolver {
    pub fn new(settings: &Settings) -> Self {
        Self::with_env(settings, Arc::new(ProcessEnv))
    }

    pub fn with_env(settings: &Settings, env: Arc<dyn EnvSource>) -> Self {
        Self {
            strategy: settings.strategy,
            config: settings.config.clone(),
            env,
        }
    }
}

impl ConnectionResolver for EnvResolver {
    fn resolve(&self, name: &str) -> Result<ConnectSettings, ConfigError> {
        ConnectSettings::from_env(self.env.as_ref(), name, self.strategy, &self.config)
    }
}

/// Fixed map of pre-built settings
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    pools: HashMap<String, ConnectSettings>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, name: impl Into<String>, settings: ConnectSettings) -> Self {
        self.pools.insert(name.into(), settings);
        self
    }
}

impl ConnectionResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Result<ConnectSettings, ConfigError> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| {
                ConfigError::invalid("pool", format!("no settings registered for '{}'", name))
            })
    }
}
