//! CLI module for fleet-router
//!
//! Provides command-line interface for starting the gateway and checking fleet files.

use crate::config::{ServerConfig, CONFIG_ENV, HOST_ENV, PORT_ENV};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Fleet Router - Routes inference requests across a fleet of LLM backends
#[derive(Parser, Debug)]
#[command(name = "fleet-router")]
#[command(version, about, long_about = None)]
#[command(after_help = r#"ENVIRONMENT VARIABLES:
    FLEET_ROUTER_HOST                Bind address (default: 0.0.0.0)
    FLEET_ROUTER_PORT                Listen port (default: 8080)
    FLEET_ROUTER_CONFIG              Fleet configuration file (default: fleet.json)
    FLEET_ROUTER_LOG_LEVEL           Log filter (default: info)
    FLEET_ROUTER_LOG_DIR             Log directory (default: ~/.fleet-router/logs)
    FLEET_ROUTER_LOG_RETENTION_DAYS  Days to keep log files (default: 7)
"#)]
pub struct Cli {
    /// Fleet configuration file
    #[arg(short, long, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Bind address
    #[arg(long, env = HOST_ENV)]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long, env = PORT_ENV)]
    pub port: Option<u16>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Validate a fleet configuration file and print its backends
    Check {
        /// File to check (defaults to --config)
        path: Option<PathBuf>,
    },
}

impl Cli {
    /// Merge command-line flags over environment defaults
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.config {
            config.config_path = path.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [HOST_ENV, PORT_ENV, CONFIG_ENV] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_no_command_starts_server() {
        clear_env();
        let cli = Cli::try_parse_from(["fleet-router"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.server_config().bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    #[serial]
    fn test_flags_override_defaults() {
        clear_env();
        let cli = Cli::try_parse_from([
            "fleet-router",
            "--host",
            "127.0.0.1",
            "-p",
            "9100",
            "--config",
            "/etc/fleet.json",
        ])
        .unwrap();
        let config = cli.server_config();
        assert_eq!(config.bind_addr(), "127.0.0.1:9100");
        assert_eq!(config.config_path, PathBuf::from("/etc/fleet.json"));
    }

    #[test]
    #[serial]
    fn test_check_subcommand() {
        clear_env();
        let cli = Cli::try_parse_from(["fleet-router", "check", "fleet.json"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Check {
                path: Some(PathBuf::from("fleet.json"))
            })
        );

        let cli = Cli::try_parse_from(["fleet-router", "check"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Check { path: None }));
    }

    #[test]
    fn test_version_available() {
        let err = Cli::try_parse_from(["fleet-router", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(Cli::try_parse_from(["fleet-router", "--port", "http"]).is_err());
    }
}
