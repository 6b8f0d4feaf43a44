//! Integration tests for configuration management
//!
//! These tests verify that a Plexus config file is parsed, validated and
//! processed with defaults filled in and the data directory created.

use plexus_engine::config::{Config, SecurityPolicy};
use std::path::Path;
use tempfile::TempDir;

fn with_data_dir(body: &str, data_dir: &Path) -> String {
    format!("[core]\nlog_level = \"debug\"\ndata_dir = {:?}\n\n{}", data_dir, body)
}

#[test]
fn test_config_toml_parsing() {
    let temp = TempDir::new().unwrap();
    let toml = with_data_dir(
        r#"
[loader]
load_timeout_ms = 5000
supported_platforms = ["linux", "macos"]

[security]
policy = "enterprise"
trusted_sources = ["*.plexus.dev", "https://mirror.example.org/plugins/"]
blocked_sources = ["evil.example.com"]
revoked_certificates = ["serial-7"]
max_package_size = 1048576

[download]
max_concurrent = 2
max_retries = 5
resume = false

[hot_reload]
enabled = false
debounce_ms = 50

[messaging]
default_timeout_ms = 250
"#,
        &temp.path().join("data"),
    );

    let config = Config::from_toml_str(&toml).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.loader.load_timeout_ms, 5000);
    assert_eq!(config.loader.supported_platforms, vec!["linux", "macos"]);
    assert_eq!(config.security.policy, SecurityPolicy::Enterprise);
    assert_eq!(config.security.trusted_sources.len(), 2);
    assert_eq!(config.security.revoked_certificates, vec!["serial-7"]);
    assert_eq!(config.security.max_package_size, 1_048_576);
    assert_eq!(config.download.max_concurrent, 2);
    assert!(!config.download.resume);
    assert!(config.download.verify_signature);
    assert!(!config.hot_reload.enabled);
    assert_eq!(config.hot_reload.debounce_ms, 50);
    assert_eq!(config.messaging.default_timeout_ms, 250);
    assert_eq!(config.messaging.subscriber_buffer, 100);
}

#[test]
fn test_omitted_sections_take_defaults() {
    let temp = TempDir::new().unwrap();
    let config = Config::from_toml_str(&with_data_dir("", &temp.path().join("data"))).unwrap();

    assert_eq!(config.security.policy, SecurityPolicy::Standard);
    assert_eq!(config.security.supported_algorithms, vec!["ed25519"]);
    assert_eq!(config.download.max_retries, 3);
    assert_eq!(config.hot_reload.history_limit, 100);
    assert_eq!(config.loader.supported_platforms.len(), 6);
}

#[test]
fn test_data_dir_created_and_plugins_dir_below_it() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("nested").join("data");

    let config = Config::from_toml_str(&with_data_dir("", &data_dir)).unwrap();

    assert!(data_dir.is_dir());
    assert_eq!(config.plugins_dir(), data_dir.join("plugins"));
}

#[test]
fn test_load_from_path() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        with_data_dir("[security]\npolicy = \"relaxed\"\n", &temp.path().join("data")),
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.security.policy, SecurityPolicy::Relaxed);

    assert!(Config::load_from_path(&temp.path().join("missing.toml")).is_err());
}

#[test]
fn test_invalid_values_rejected() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("data");

    let cases = [
        "[security]\npolicy = \"paranoid\"\n",
        "[security]\nobfuscation_ratio = 1.5\n",
        "[security]\ntimestamp_authority_keys = [\"zz\"]\n",
        "[loader]\nload_timeout_ms = 0\n",
        "[loader]\nsupported_platforms = []\n",
        "[download]\nmax_concurrent = 0\n",
        "[messaging]\nsubscriber_buffer = 0\n",
    ];

    for body in cases {
        let result = Config::from_toml_str(&with_data_dir(body, &data_dir));
        assert!(result.is_err(), "accepted invalid config:\n{}", body);
    }
}

#[test]
fn test_missing_core_section_rejected() {
    assert!(Config::from_toml_str("[security]\npolicy = \"standard\"\n").is_err());
}
