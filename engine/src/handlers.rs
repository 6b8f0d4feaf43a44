//! Command handlers for CLI operations
//!
//! - inspect: parse and structurally validate a manifest
//! - verify: run the security pipeline on a package
//! - resolve: compute a load order from a directory of manifests
//! - sign: embed a signature in a package
//! - keygen: print a fresh key pair
//! - install, uninstall, list: manage the plugins directory through the runtime

use anyhow::{bail, Context, Result};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use sdk::errors::EngineError;
use sdk::manifest::Manifest;
use sdk::plugin::{Plugin, PluginFactory};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, SecurityPolicy};
use crate::package::PluginPackage;
use crate::resolver::{Catalog, DependencyResolver};
use crate::runtime::Runtime;
use crate::security::SecurityValidator;
use crate::signature::{parse_signing_key, Certificate, SignatureService};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Parse a manifest and list every structural problem
pub async fn handle_inspect(path: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest = Manifest::from_json(&contents).context("Failed to parse manifest")?;
    let problems = manifest.validate(&config.loader.supported_platforms);

    match format {
        OutputFormat::Text => {
            println!("{} {} ({})", manifest.id, manifest.version, manifest.name);
            println!("  Author:       {}", manifest.author);
            println!("  Platforms:    {}", manifest.platforms.join(", "));
            println!("  Permissions:  {}", manifest.permissions.join(", "));
            for dependency in &manifest.dependencies {
                println!(
                    "  Depends on:   {} {}{}",
                    dependency.id,
                    dependency.version,
                    if dependency.required { "" } else { " (optional)" }
                );
            }
            if problems.is_empty() {
                println!("Manifest is valid.");
            } else {
                println!("Problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "manifest": manifest,
                "valid": problems.is_empty(),
                "problems": problems,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    if !problems.is_empty() {
        bail!("manifest has {} problems", problems.len());
    }
    Ok(())
}

/// Run the security pipeline and fail if the policy blocks the package
pub async fn handle_verify(
    path: &Path,
    source: Option<&str>,
    policy: Option<SecurityPolicy>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let signatures = Arc::new(SignatureService::new(&config.security)?);
    let validator = SecurityValidator::new(config.security.clone(), signatures)?;
    let policy = policy.unwrap_or(config.security.policy);
    let result = validator.validate_with_policy(&bytes, source, policy)?;

    match format {
        OutputFormat::Text => {
            println!(
                "{}: {:?} under {:?} policy ({})",
                result.plugin_id,
                result.level,
                result.policy,
                if result.allowed { "allowed" } else { "blocked" }
            );
            for step in &result.steps {
                let status = if step.skipped {
                    "skipped"
                } else if step.passed {
                    "pass"
                } else {
                    "fail"
                };
                println!("  {:<16} {:<8} {}", format!("{:?}", step.step), status, step.detail);
            }
            for issue in &result.issues {
                println!(
                    "  [{:?}] {:?}: {}{}",
                    issue.severity,
                    issue.threat_type,
                    issue.message,
                    issue.file.as_deref().map(|f| format!(" ({})", f)).unwrap_or_default()
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    if !result.allowed {
        bail!("package blocked by {:?} policy", policy);
    }
    Ok(())
}

/// Resolve `plugins` against every manifest in `catalog_dir`
pub async fn handle_resolve(catalog_dir: &Path, plugins: &[String], format: OutputFormat) -> Result<()> {
    let catalog = read_catalog(catalog_dir).await?;
    let targets: Vec<&str> = plugins.iter().map(String::as_str).collect();

    match DependencyResolver::new().resolve(&targets, &Catalog::new(), &catalog) {
        Ok(resolution) => {
            match format {
                OutputFormat::Text => {
                    println!("Load order:");
                    for (i, id) in resolution.order.iter().enumerate() {
                        println!("  {}. {}", i + 1, id);
                    }
                }
                OutputFormat::Json => {
                    let output = json!({ "status": "resolved", "order": resolution.order });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
            Ok(())
        }
        Err(e) => {
            match format {
                OutputFormat::Text => print_resolution_failure(&e),
                OutputFormat::Json => {
                    let output = json!({ "status": "failed", "error": resolution_failure_json(&e) });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
            Err(e.into())
        }
    }
}

/// Sign a package file in place
pub async fn handle_sign(
    path: &Path,
    key: &str,
    cert_path: &Path,
    timestamp_key: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut package = PluginPackage::parse(&bytes)?;

    let cert_json = tokio::fs::read_to_string(cert_path)
        .await
        .with_context(|| format!("Failed to read {}", cert_path.display()))?;
    let certificate: Certificate = serde_json::from_str(&cert_json).context("Invalid certificate")?;

    let publisher = parse_signing_key(key)?;
    let authority = timestamp_key.map(parse_signing_key).transpose()?;

    let info = SignatureService::sign_package(&mut package, &publisher, certificate, authority.as_ref())?;
    tokio::fs::write(path, package.to_bytes()?)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    match format {
        OutputFormat::Text => {
            println!("Signed {} {}", package.manifest.id, package.manifest.version);
            println!("  Certificate: {} ({})", info.certificate.serial, info.certificate.subject);
            if let Some(ts) = &info.timestamp {
                println!("  Timestamp:   {}", ts.time);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }
    Ok(())
}

/// Print a new ed25519 key pair
pub fn handle_keygen(format: OutputFormat) -> Result<()> {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);

    let secret = hex::encode(seed);
    let public = hex::encode(key.verifying_key().to_bytes());

    match format {
        OutputFormat::Text => {
            println!("Secret key: {}", secret);
            println!("Public key: {}", public);
        }
        OutputFormat::Json => {
            let output = json!({ "secretKey": secret, "publicKey": public });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// The binary links no plugin implementations, so it can manage installs
/// but never instantiate a plugin
fn offline_runtime(config: &Config) -> Result<Runtime> {
    let factory: Arc<dyn PluginFactory> = Arc::new(|m: &Manifest| -> Result<Arc<dyn Plugin>, EngineError> {
        Err(EngineError::NotFound(format!("implementation for plugin {}", m.id)))
    });
    Ok(Runtime::from_config(config, factory)?)
}

/// Validate a package and install it into the plugins directory
pub async fn handle_install(path: &Path, source: Option<&str>, config: &Config, format: OutputFormat) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let runtime = offline_runtime(config)?;
    runtime.host.load_installed().await?;
    let report = runtime.host.install_package(&bytes, source).await?;

    match format {
        OutputFormat::Text => {
            println!(
                "Installed {} {} ({:?}, {} bytes)",
                report.record.id, report.record.version, report.security.level, report.record.size
            );
        }
        OutputFormat::Json => {
            let output = json!({ "record": report.record, "security": report.security });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Remove an installed plugin
pub async fn handle_uninstall(plugin_id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let runtime = offline_runtime(config)?;
    runtime.host.load_installed().await?;
    runtime.host.uninstall(plugin_id).await?;

    match format {
        OutputFormat::Text => println!("Uninstalled {}", plugin_id),
        OutputFormat::Json => println!("{}", json!({ "uninstalled": plugin_id })),
    }
    Ok(())
}

/// List installed plugins from their install records
pub async fn handle_list(config: &Config, format: OutputFormat) -> Result<()> {
    let runtime = offline_runtime(config)?;
    let mut records = runtime.host.load_installed().await?;
    records.sort_by(|a, b| a.id.cmp(&b.id));

    match format {
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No plugins installed in {}", config.plugins_dir().display());
            }
            for record in &records {
                println!(
                    "{:<24} {:<12} {:<10} {}",
                    record.id,
                    record.version,
                    record.state.to_string(),
                    record.dependencies.join(", ")
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}

async fn read_catalog(dir: &Path) -> Result<Catalog> {
    let mut catalog = Catalog::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        match Manifest::from_json(&contents) {
            Ok(manifest) => {
                catalog.insert(manifest.id.clone(), manifest);
            }
            Err(e) => tracing::warn!(path = %path.display(), "Skipping unreadable manifest: {}", e),
        }
    }

    Ok(catalog)
}

fn print_resolution_failure(error: &EngineError) {
    match error {
        EngineError::DependencyMissing { missing, .. } => {
            println!("Missing dependencies:");
            for m in missing {
                println!("  {} requires {} {}", m.requester, m.dependency_id, m.constraint);
            }
        }
        EngineError::DependencyConflict { conflicts } => {
            println!("Version conflicts:");
            for c in conflicts {
                for request in &c.conflicting {
                    println!(
                        "  {} requires {} {}, resolved {}",
                        request.requester, c.dependency_id, request.constraint, c.resolved_version
                    );
                }
            }
        }
        EngineError::DependencyCycle { cycles } => {
            println!("Dependency cycles:");
            for cycle in cycles {
                println!("  {}", cycle.join(" -> "));
            }
        }
        other => println!("Resolution failed: {}", other),
    }
}

fn resolution_failure_json(error: &EngineError) -> serde_json::Value {
    match error {
        EngineError::DependencyMissing { missing, .. } => json!({ "missing": missing }),
        EngineError::DependencyConflict { conflicts } => json!({ "conflicts": conflicts }),
        EngineError::DependencyCycle { cycles } => json!({ "cycles": cycles }),
        other => json!({ "message": other.to_string() }),
    }
}
