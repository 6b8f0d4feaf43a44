// Plexus plugin runtime
// Main entry point for the plexus binary

use clap::Parser;
use plexus_engine::cli::{Cli, Command};
use plexus_engine::config::Config;
use plexus_engine::handlers::{
    handle_inspect, handle_install, handle_keygen, handle_list, handle_resolve, handle_sign,
    handle_uninstall, handle_verify, OutputFormat,
};
use plexus_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::info!("Plexus v{}", env!("CARGO_PKG_VERSION"));

    // Handle commands
    match cli.command {
        Command::Inspect { manifest } => {
            tracing::info!("Inspecting manifest: {}", manifest.display());
            handle_inspect(&manifest, &config, format).await
        }

        Command::Verify {
            package,
            source,
            policy,
        } => {
            tracing::info!("Verifying package: {}", package.display());
            handle_verify(
                &package,
                source.as_deref(),
                policy.map(Into::into),
                &config,
                format,
            )
            .await
        }

        Command::Resolve { catalog, plugins } => {
            tracing::info!("Resolving {:?}", plugins);
            handle_resolve(&catalog, &plugins, format).await
        }

        Command::Sign {
            package,
            key,
            cert,
            timestamp_key,
        } => {
            tracing::info!("Signing package: {}", package.display());
            handle_sign(&package, &key, &cert, timestamp_key.as_deref(), format).await
        }

        Command::Keygen => handle_keygen(format),

        Command::Install { package, source } => {
            tracing::info!("Installing package: {}", package.display());
            handle_install(&package, source.as_deref(), &config, format).await
        }

        Command::Uninstall { plugin } => {
            tracing::info!("Uninstalling plugin: {}", plugin);
            handle_uninstall(&plugin, &config, format).await
        }

        Command::List => handle_list(&config, format).await,
    }
}
