//! Plugin manifest types and structural validation
//!
//! A manifest is parsed once per package and never mutated afterwards. The
//! wire format is JSON with camelCase keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Platforms a manifest may target
pub const KNOWN_PLATFORMS: &[&str] = &["android", "ios", "web", "linux", "macos", "windows"];

/// Plugin manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub category: String,
    /// Entry point, relative to the package root
    pub main: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_app_version: Option<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub config: PluginConfig,
    #[serde(default)]
    pub locales: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer: Option<Developer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<Support>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

/// A declared dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Target plugin id
    pub id: String,
    /// Semver range the target's version must satisfy
    #[serde(default = "default_constraint")]
    pub version: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Dependency {
    pub fn required(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            required: true,
            description: None,
        }
    }

    pub fn optional(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(id, version)
        }
    }
}

/// Runtime configuration block of a manifest
///
/// Unknown keys are preserved in `extra` so that state snapshots carry the
/// full plugin configuration across a reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    #[serde(default)]
    pub hot_reload: bool,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub background: bool,
    /// Memory ceiling in megabytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<u64>,
    /// Network timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_timeout: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Developer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Support {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// Recognised permission types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Storage,
    Network,
    Camera,
    Microphone,
    Location,
    Notifications,
    Clipboard,
    Filesystem,
    Background,
    System,
}

impl Permission {
    pub const ALL: [Permission; 10] = [
        Permission::Storage,
        Permission::Network,
        Permission::Camera,
        Permission::Microphone,
        Permission::Location,
        Permission::Notifications,
        Permission::Clipboard,
        Permission::Filesystem,
        Permission::Background,
        Permission::System,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Storage => "storage",
            Permission::Network => "network",
            Permission::Camera => "camera",
            Permission::Microphone => "microphone",
            Permission::Location => "location",
            Permission::Notifications => "notifications",
            Permission::Clipboard => "clipboard",
            Permission::Filesystem => "filesystem",
            Permission::Background => "background",
            Permission::System => "system",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission '{}'", s))
    }
}

fn default_constraint() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

/// Whether `id` matches `^[a-z0-9_]+$`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Parse the leading `MAJOR.MINOR.PATCH` of a version string
///
/// Full semver strings (with pre-release or build metadata) parse as-is;
/// anything else only needs to start with three dot-separated numbers,
/// e.g. `"2.1.0.beta"` yields `2.1.0`.
pub fn leading_version(version: &str) -> Option<semver::Version> {
    let version = version.trim().trim_start_matches('v');
    if let Ok(v) = semver::Version::parse(version) {
        return Some(v);
    }

    let mut parts = [0u64; 3];
    let mut rest = version;
    for (i, slot) in parts.iter_mut().enumerate() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        *slot = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        if i < 2 {
            rest = rest.strip_prefix('.')?;
        }
    }

    Some(semver::Version::new(parts[0], parts[1], parts[2]))
}

impl Manifest {
    /// Minimal manifest with the required fields filled in
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: version.into(),
            description: String::new(),
            author: "unknown".to_string(),
            category: "general".to_string(),
            main: "index.js".to_string(),
            homepage: None,
            repository: None,
            license: None,
            keywords: Vec::new(),
            icon: None,
            screenshots: Vec::new(),
            min_app_version: None,
            max_app_version: None,
            platforms: vec!["linux".into(), "macos".into(), "windows".into()],
            permissions: Vec::new(),
            dependencies: Vec::new(),
            assets: Vec::new(),
            config: PluginConfig::default(),
            locales: Vec::new(),
            default_locale: None,
            developer: None,
            support: None,
            changelog: None,
        }
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize manifest to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parsed version, if the version string is well formed
    pub fn semver(&self) -> Option<semver::Version> {
        leading_version(&self.version)
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.id.as_str())
    }

    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.iter().any(|d| d.id == id)
    }

    /// Declared permissions that are recognised
    pub fn recognised_permissions(&self) -> Vec<Permission> {
        self.permissions
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect()
    }

    /// Check the manifest structure and return every problem found
    ///
    /// An empty result means the manifest is structurally valid for a host
    /// supporting `supported_platforms`.
    pub fn validate(&self, supported_platforms: &[String]) -> Vec<String> {
        let mut problems = Vec::new();

        if self.id.is_empty() {
            problems.push("id is empty".to_string());
        } else if !is_valid_id(&self.id) {
            problems.push(format!("id '{}' must match ^[a-z0-9_]+$", self.id));
        }

        for (field, value) in [("name", &self.name), ("main", &self.main)] {
            if value.trim().is_empty() {
                problems.push(format!("{} is empty", field));
            }
        }

        if self.semver().is_none() {
            problems.push(format!(
                "version '{}' must start with MAJOR.MINOR.PATCH",
                self.version
            ));
        }

        if !self
            .platforms
            .iter()
            .any(|p| supported_platforms.iter().any(|s| s == p))
        {
            problems.push(format!(
                "no supported platform among [{}]",
                self.platforms.join(", ")
            ));
        }

        for permission in &self.permissions {
            if let Err(e) = permission.parse::<Permission>() {
                problems.push(e);
            }
        }

        for dependency in &self.dependencies {
            if !is_valid_id(&dependency.id) {
                problems.push(format!("dependency id '{}' is invalid", dependency.id));
            }
            if dependency.id == self.id {
                problems.push("plugin depends on itself".to_string());
            }
        }

        if let (Some(min), Some(max)) = (&self.min_app_version, &self.max_app_version) {
            match (leading_version(min), leading_version(max)) {
                (Some(min_v), Some(max_v)) if min_v > max_v => problems.push(format!(
                    "minAppVersion {} is greater than maxAppVersion {}",
                    min, max
                )),
                (None, _) | (_, None) => {
                    problems.push("app version bounds are not valid versions".to_string())
                }
                _ => {}
            }
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported() -> Vec<String> {
        KNOWN_PLATFORMS.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_manifest_from_json() {
        let json = r#"{
            "id": "color_picker",
            "name": "Color Picker",
            "version": "1.2.0",
            "description": "Pick colors",
            "author": "Plexus",
            "category": "tools",
            "main": "index.js",
            "platforms": ["ios", "android"],
            "permissions": ["storage"],
            "dependencies": [{ "id": "palette_core", "version": "^1.0.0" }],
            "config": { "hotReload": true, "theme": "dark" },
            "minAppVersion": "1.0.0"
        }"#;

        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.id, "color_picker");
        assert!(manifest.config.hot_reload);
        assert_eq!(manifest.config.extra.get("theme").unwrap(), "dark");
        assert!(manifest.dependencies[0].required);
        assert_eq!(manifest.min_app_version.as_deref(), Some("1.0.0"));
        assert!(manifest.validate(&supported()).is_empty());
    }

    #[test]
    fn test_missing_required_field_fails_to_parse() {
        let json = r#"{ "id": "x", "name": "X", "version": "1.0.0" }"#;
        assert!(Manifest::from_json(json).is_err());
    }

    #[test]
    fn test_id_pattern() {
        assert!(is_valid_id("abc_123"));
        assert!(!is_valid_id("Abc"));
        assert!(!is_valid_id("a-b"));
        assert!(!is_valid_id(""));
    }

    #[test]
    fn test_leading_version() {
        assert_eq!(leading_version("1.2.3"), Some(semver::Version::new(1, 2, 3)));
        assert_eq!(leading_version("2.0.1.beta"), Some(semver::Version::new(2, 0, 1)));
        assert!(leading_version("1.2.3-rc.1").unwrap().pre.as_str() == "rc.1");
        assert_eq!(leading_version("1.2"), None);
        assert_eq!(leading_version("latest"), None);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut manifest = Manifest::new("Bad-Id", "1.0");
        manifest.platforms = vec!["amiga".into()];
        manifest.permissions = vec!["storage".into(), "teleport".into()];

        let problems = manifest.validate(&supported());
        assert_eq!(problems.len(), 4, "{:?}", problems);
        assert!(problems.iter().any(|p| p.contains("teleport")));
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let manifest =
            Manifest::new("loop_plugin", "1.0.0").with_dependency(Dependency::required("loop_plugin", "*"));
        let problems = manifest.validate(&supported());
        assert!(problems.iter().any(|p| p.contains("itself")));
    }

    #[test]
    fn test_app_version_bounds() {
        let mut manifest = Manifest::new("bounded", "1.0.0");
        manifest.min_app_version = Some("3.0.0".into());
        manifest.max_app_version = Some("2.0.0".into());
        assert_eq!(manifest.validate(&supported()).len(), 1);
    }

    #[test]
    fn test_permission_parsing() {
        assert_eq!("camera".parse::<Permission>().unwrap(), Permission::Camera);
        assert!("root".parse::<Permission>().is_err());
    }
}
