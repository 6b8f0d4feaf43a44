//! Plexus Engine Library
//!
//! This library provides the Plexus plugin runtime: dependency resolution,
//! the plugin lifecycle, package security, downloads, hot reload and
//! messaging. It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Plugin package format
pub mod package;

/// Package signatures, certificates and timestamps
pub mod signature;

/// Package security pipeline
pub mod security;

/// File-store collaborator and install records
pub mod storage;

/// Resumable, checksum-verified downloads
pub mod downloader;

/// Dependency graph and load order
pub mod resolver;

/// In-memory plugin catalog
pub mod registry;

/// Lifecycle state machine
pub mod loader;

/// Hot reload with state preservation
pub mod hot_reload;

/// Event bus and plugin messaging
pub mod message_bus;

/// Install and activation pipelines
pub mod host;

/// Builds every service from the configuration
pub mod runtime;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
