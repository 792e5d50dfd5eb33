use serde::Deserialize;
use std::path::Path;

/// Root application configuration. Loaded from environment variables
/// with the prefix `PIVOT__` and an optional config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Key namespace. Derived from `app_name` when unset.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub reward_mode: RewardMode,
}

/// How a reward is folded into the persisted running mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RewardMode {
    /// Single batch with a server-side read-modify-write per arm.
    #[default]
    Atomic,
    /// Increment-and-read batch followed by a separate write batch.
    /// Concurrent rewards on the same arm can lose updates.
    TwoPhase,
}

fn default_app_name() -> String {
    "app".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reward_mode: RewardMode::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            prefix: None,
            redis: RedisConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional file, overridden by environment variables.
    pub fn load_from(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("PIVOT")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Namespace every store key is placed under.
    pub fn key_prefix(&self) -> String {
        match &self.prefix {
            Some(prefix) if !prefix.is_empty() => prefix.clone(),
            _ => format!("pivot:ucb1:{}", self.app_name),
        }
    }
}

impl RedisConfig {
    /// Connection target with any password replaced, for logging.
    pub fn redacted_url(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("****"));
                }
                parsed.to_string()
            }
            Err(_) => "<invalid redis url>".to_string(),
        }
    }
}
