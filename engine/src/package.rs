//! Plugin package format
//!
//! A package is a single JSON document holding the manifest, the plugin's
//! text sources keyed by relative path, and an optional embedded signature.
//! The signed payload is the canonical JSON of `{manifest, files}`; the
//! signature itself is kept as raw JSON so that a malformed signature block
//! surfaces at the signature stage instead of failing the whole parse.

use crate::signature::SignatureInfo;
use sdk::errors::EngineError;
use sdk::manifest::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A parsed plugin package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginPackage {
    pub manifest: Manifest,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct SignedBody<'a> {
    manifest: &'a Manifest,
    files: &'a BTreeMap<String, String>,
}

impl PluginPackage {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            files: BTreeMap::new(),
            signature: None,
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    /// Parse a package from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::ManifestParse(format!("Invalid package: {}", e)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self)
            .map_err(|e| EngineError::ManifestParse(format!("Failed to encode package: {}", e)))
    }

    /// Bytes covered by the package signature
    pub fn signed_payload(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(&SignedBody {
            manifest: &self.manifest,
            files: &self.files,
        })
        .map_err(|e| EngineError::ManifestParse(format!("Failed to encode payload: {}", e)))
    }

    /// The embedded signature, if any
    ///
    /// # Errors
    ///
    /// Returns `EngineError::SignatureInvalid` if a signature block is present
    /// but cannot be parsed.
    pub fn signature_info(&self) -> Result<Option<SignatureInfo>, EngineError> {
        match &self.signature {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|e| EngineError::SignatureInvalid(format!("Malformed signature block: {}", e))),
        }
    }

    pub fn embed_signature(&mut self, info: &SignatureInfo) -> Result<(), EngineError> {
        let raw = serde_json::to_value(info)
            .map_err(|e| EngineError::SignatureInvalid(format!("Failed to encode signature: {}", e)))?;
        self.signature = Some(raw);
        Ok(())
    }
}
