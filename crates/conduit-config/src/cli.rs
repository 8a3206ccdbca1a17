//! Command-line overrides shared by conduit binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Common command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "conduit", about = "Conduit session service")]
pub struct CliArgs {
    /// Network family: tcp, tcp4 or tcp6.
    #[arg(long)]
    pub network: Option<String>,

    /// Address to bind or dial.
    #[arg(long)]
    pub address: Option<String>,

    /// Port to bind or dial.
    #[arg(long)]
    pub port: Option<u16>,

    /// Per-session outbound queue capacity (0 = synchronous sends).
    #[arg(long)]
    pub send_queue_capacity: Option<usize>,

    /// Log filter (error, warn, info, debug, trace, or full directives).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// The directory holding `config.ron`: `--config`, else the platform
    /// config dir, else the working directory.
    pub fn config_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config {
            return dir.clone();
        }
        dirs::config_dir()
            .map(|dir| dir.join("conduit"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref network) = args.network {
            self.server.network = network.clone();
        }
        if let Some(ref address) = args.address {
            self.server.address = address.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(capacity) = args.send_queue_capacity {
            self.server.send_queue_capacity = capacity;
            self.client.send_queue_capacity = capacity;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}
