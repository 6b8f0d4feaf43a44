//! Plexus SDK
//!
//! Shared library providing the plugin trait, manifest model, and error
//! taxonomy. This crate is used by both the engine and plugin implementations.

/// Plugin lifecycle trait and capability tags
pub mod plugin;

/// Error types and handling
pub mod errors;

/// Lifecycle, security, and dependency types
pub mod types;

/// Manifest types and validation
pub mod manifest;

// Re-export commonly used types
pub use errors::{EngineError, PlexusErrorExt};
pub use manifest::{Dependency, Manifest, Permission, PluginConfig};
pub use plugin::{Capability, Plugin, PluginContext, PluginFactory, PluginMessage, ToolKind};
pub use types::{
    MissingDependency, PluginInstance, PluginState, SecurityIssue, SecurityLevel, Severity,
    ThreatType, VersionConflict,
};
