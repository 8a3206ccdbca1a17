//! Configuration structs with defaults and RON persistence.

use std::path::Path;
use std::time::Duration;

use conduit_net::{BackoffConfig, Network};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listening side.
    pub server: ServerConfig,
    /// Dialing side.
    pub client: ClientConfig,
    /// Accept-loop retry bounds.
    pub accept: AcceptConfig,
    /// Logging.
    pub log: LogConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// `"tcp"`, `"tcp4"` or `"tcp6"`.
    pub network: String,
    /// Host or IP to bind.
    pub address: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Outbound queue capacity per session (0 = synchronous sends).
    pub send_queue_capacity: usize,
}

impl ServerConfig {
    /// `address:port`, bracketing IPv6 literals.
    pub fn bind_address(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Connect timeout in milliseconds (0 = wait indefinitely).
    pub connect_timeout_ms: u64,
    /// Outbound queue capacity per session (0 = synchronous sends).
    pub send_queue_capacity: usize,
}

impl ClientConfig {
    /// The connect timeout, if one is set.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

/// Backoff applied to transient accept errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcceptConfig {
    /// First retry delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap on any retry delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl AcceptConfig {
    /// Convert to the accept loop's backoff bounds.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.initial_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `"info"` or `"info,conduit_net=debug"`.
    pub level: String,
    /// Also write JSON logs to `conduit.log` in the log directory.
    pub json_file: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            address: "127.0.0.1".to_string(),
            port: 7777,
            send_queue_capacity: 0,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            send_queue_capacity: 0,
        }
    }
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 5,
            max_backoff_ms: 1000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from `config_dir`, or write and return the defaults.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(config_dir)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Write this config to `config_dir` as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Re-read the file: `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(config_dir)?;
        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .network
            .parse::<Network>()
            .map_err(|err| ConfigError::Invalid(format!("server.network: {err}")))?;
        if self.accept.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "accept.initial_backoff_ms must be positive".to_string(),
            ));
        }
        if self.accept.max_backoff_ms < self.accept.initial_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "accept.max_backoff_ms ({}) is below initial_backoff_ms ({})",
                self.accept.max_backoff_ms, self.accept.initial_backoff_ms
            )));
        }
        Ok(())
    }

    fn read(config_dir: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(config_dir.join(CONFIG_FILE)).map_err(ConfigError::ReadError)?;
        let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }
}
