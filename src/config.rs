use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Configuration for the script host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub javascript: JavascriptConfig,
    pub sandbox: SandboxConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

/// Resource limits applied to every script run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JavascriptConfig {
    pub execution_timeout_ms: u64,
    pub max_memory_mb: usize,
    pub max_stack_kb: usize,
    /// Scripts larger than this are rejected at save time.
    pub max_script_size_bytes: usize,
}

impl Default for JavascriptConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 2000,
            max_memory_mb: 32,
            max_stack_kb: 512,
            max_script_size_bytes: 256 * 1024,
        }
    }
}

impl JavascriptConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

/// Which groups of the `server` namespace scripts get.
///
/// Fixed at startup; no script invocation can widen it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enable_db_read: bool,
    pub enable_templates: bool,
    pub enable_logging: bool,
    pub enable_utils: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enable_db_read: true,
            enable_templates: true,
            enable_logging: true,
            enable_utils: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Cadence of the `All` frequency.
    pub all_interval_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            all_interval_minutes: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

pub const ENV_PREFIX: &str = "SCRIPTHOST_";

impl Config {
    /// Defaults, then an optional TOML or YAML file, then `SCRIPTHOST_*`
    /// environment variables (`SCRIPTHOST_SERVER__PORT=8080`).
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(AppError::Config {
                    message: format!("config file {} not found", path.display()),
                });
            }
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| AppError::Config {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// The `All` cadence is a minute step in a cron field, so it must fit
    /// inside one hour.
    pub fn validate(&self) -> AppResult<()> {
        let minutes = self.scheduler.all_interval_minutes;
        if !(1..=59).contains(&minutes) {
            return Err(AppError::Config {
                message: format!(
                    "scheduler.all_interval_minutes must be between 1 and 59, got {}",
                    minutes
                ),
            });
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
