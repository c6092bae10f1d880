//! Environment variable access
//!
//! Settings are resolved through [`EnvSource`] so tests can feed a plain map
//! instead of mutating the process environment.

use std::collections::HashMap;

/// A source of environment-style key/value pairs.
///
/// Empty values are treated the same as absent ones.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    /// Parse a boolean flag (`1`, `true`, `yes`, `on`)
    fn flag(&self, key: &str) -> bool {
        self.var(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }
}

/// Load `.env` files into the process environment.
///
/// Priority order (highest to lowest):
/// 1. Variables already set in the environment
/// 2. Current directory `.env`
/// 3. `~/.scribedb/.env`
///
/// dotenvy never overwrites existing variables, so loading in this order
/// gives the current directory precedence over the home directory.
pub fn load_dotenv() -> Vec<String> {
    let mut loaded_from = Vec::new();

    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded .env from current directory");
        loaded_from.push(path.display().to_string());
    }

    if let Some(env_file) = crate::config::config_dir().map(|d| d.join(".env")) {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => {
                    tracing::debug!(path = %env_file.display(), "loaded .env from config dir");
                    loaded_from.push(env_file.display().to_string());
                }
                Err(e) => tracing::debug!("failed to load {}: {}", env_file.display(), e),
            }
        }
    }

    if loaded_from.is_empty() {
        tracing::debug!("no .env files found, using process environment only");
    }

    loaded_from
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_count_as_absent() {
        let mut env = HashMap::new();
        env.insert("A".to_string(), "  ".to_string());
        env.insert("B".to_string(), "value".to_string());

        assert_eq!(env.var("A"), None);
        assert_eq!(env.var("B").as_deref(), Some("value"));
        assert_eq!(env.var("C"), None);
    }

    #[test]
    fn flags_accept_common_spellings() {
        let env: HashMap<String, String> = [("X", "TRUE"), ("Y", "0"), ("Z", "on")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert!(env.flag("X"));
        assert!(!env.flag("Y"));
        assert!(env.flag("Z"));
        assert!(!env.flag("MISSING"));
    }
}
