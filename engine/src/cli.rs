//! CLI interface for Plexus
//!
//! This module provides the command-line interface using clap's derive API.
//! The commands are offline tools for plugin authors and operators: checking
//! manifests, running the security pipeline on a package, resolving load
//! order, signing packages, and managing the configured plugins directory.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::SecurityPolicy;

/// Plexus plugin runtime
///
/// Validates, signs and resolves plugin packages using the same pipeline the
/// runtime applies before a plugin is loaded.
#[derive(Parser, Debug)]
#[command(name = "plexus")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse and structurally validate a manifest
    Inspect {
        /// Path to manifest.json
        manifest: PathBuf,
    },

    /// Run the security pipeline on a package
    Verify {
        /// Path to the package file
        package: PathBuf,

        /// URL the package was obtained from
        #[arg(long, value_name = "URL")]
        source: Option<String>,

        /// Override the configured security policy
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
    },

    /// Resolve the load order of plugins among the manifests in a directory
    Resolve {
        /// Directory of manifest files (*.json)
        catalog: PathBuf,

        /// Plugins to resolve
        #[arg(required = true)]
        plugins: Vec<String>,
    },

    /// Sign a package in place
    Sign {
        /// Path to the package file
        package: PathBuf,

        /// Publisher signing key (hex-encoded 32-byte seed)
        #[arg(long, value_name = "HEX")]
        key: String,

        /// Publisher certificate (JSON)
        #[arg(long, value_name = "PATH")]
        cert: PathBuf,

        /// Timestamp authority key (hex-encoded 32-byte seed)
        #[arg(long, value_name = "HEX")]
        timestamp_key: Option<String>,
    },

    /// Generate a fresh ed25519 key pair
    Keygen,

    /// Validate a package and install it into the plugins directory
    Install {
        /// Path to the package file
        package: PathBuf,

        /// URL the package was obtained from
        #[arg(long, value_name = "URL")]
        source: Option<String>,
    },

    /// Remove an installed plugin
    Uninstall {
        /// Plugin id
        plugin: String,
    },

    /// List installed plugins
    List,
}

/// Security policy names accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum PolicyArg {
    Enterprise,
    Standard,
    Relaxed,
}

impl From<PolicyArg> for SecurityPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Enterprise => SecurityPolicy::Enterprise,
            PolicyArg::Standard => SecurityPolicy::Standard,
            PolicyArg::Relaxed => SecurityPolicy::Relaxed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verify_with_policy() {
        let cli = Cli::try_parse_from([
            "plexus", "--json", "verify", "pkg.json", "--policy", "relaxed", "--source",
            "https://plugins.example.com/pkg.json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Verify { policy, source, .. } => {
                assert!(matches!(policy, Some(PolicyArg::Relaxed)));
                assert!(source.is_some());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_install_with_source() {
        let cli = Cli::try_parse_from(["plexus", "install", "pkg.json", "--source", "https://x.dev/pkg.json"]).unwrap();
        match cli.command {
            Command::Install { package, source } => {
                assert_eq!(package, PathBuf::from("pkg.json"));
                assert_eq!(source.as_deref(), Some("https://x.dev/pkg.json"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_requires_plugins() {
        assert!(Cli::try_parse_from(["plexus", "resolve", "catalog"]).is_err());
    }
}
