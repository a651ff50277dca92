use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Deadline applied to a request that carries no timeout of its own.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// A registered backend without a heartbeat for this long is no longer live.
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: i64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_dispatch_timeout_ms() -> u64 {
    30_000
}

fn default_backend_timeout_secs() -> i64 {
    30
}

fn default_prune_interval_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            backend_timeout_secs: default_backend_timeout_secs(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

/// Per-call knobs of the scatter dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub default_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Settings::default().dispatch_settings()
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path = std::env::var("SHARDGATE_CONFIG_PATH")
            .unwrap_or_else(|_| "crates/coordinator/config/default.toml".to_string());
        Self::from_file(&config_file_path)
    }

    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(config::Environment::with_prefix("SHARDGATE").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            default_timeout: Duration::from_millis(self.dispatch_timeout_ms),
        }
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}
