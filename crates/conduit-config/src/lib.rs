//! Runtime settings for conduit services, persisted as `config.ron`.
//!
//! Every section falls back to defaults for missing fields, so older and
//! newer config files keep loading. Command-line flags override file values.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{AcceptConfig, ClientConfig, Config, LogConfig, ServerConfig};
pub use error::ConfigError;
