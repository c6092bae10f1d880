//! scribedb-core: shared settings for the database connectivity layer
//!
//! Resolves the runtime mode, connection parameters and tunnel parameters
//! from the environment and optional TOML tuning files.

pub mod config;
pub mod env;
pub mod error;
pub mod mode;
pub mod settings;

pub use config::{PoolTuning, ProxyTuning, ScribeConfig};
pub use env::{load_dotenv, EnvSource, ProcessEnv};
pub use error::ConfigError;
pub use mode::{ConnectionStrategy, TlsPolicy, RUNTIME_VAR};
pub use settings::{
    BinarySource, ConnectSettings, CredentialSource, PoolLimits, ProxySettings, Settings,
    DEFAULT_POOL, TUNNEL_HOST,
};
