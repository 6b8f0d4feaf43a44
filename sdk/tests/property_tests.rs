use proptest::prelude::*;
use sdk::errors::{EngineError, PlexusErrorExt};
use sdk::manifest::{is_valid_id, leading_version, Dependency, Manifest, KNOWN_PLATFORMS};

fn sample_errors(detail: &str) -> Vec<EngineError> {
    vec![
        EngineError::Config(detail.to_string()),
        EngineError::Storage(detail.to_string()),
        EngineError::NotFound(detail.to_string()),
        EngineError::ManifestParse(detail.to_string()),
        EngineError::SignatureInvalid(detail.to_string()),
        EngineError::plugin_failure(detail, "start", detail),
        EngineError::DownloadFailed {
            task_id: detail.to_string(),
            retries: 3,
            reason: detail.to_string(),
        },
    ]
}

// Hints are static: whatever detail an error carries never leaks into them.
proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let reference = sample_errors("reference");
        for (err, baseline) in sample_errors(&error_str).iter().zip(reference.iter()) {
            prop_assert!(!err.user_hint().is_empty());
            prop_assert_eq!(err.user_hint(), baseline.user_hint());
        }
    }
}

// Ids built only from the allowed alphabet always validate; any other
// character makes them fail.
proptest! {
    #[test]
    fn test_id_alphabet(id in "[a-z0-9_]{1,24}", bad in "[A-Z\\-\\. ]") {
        prop_assert!(is_valid_id(&id));
        let tainted = format!("{}{}", id, bad);
        prop_assert!(!is_valid_id(&tainted));
    }
}

// Any string starting with MAJOR.MINOR.PATCH parses to that triple.
proptest! {
    #[test]
    fn test_leading_version_prefix(
        major in 0u64..1000,
        minor in 0u64..1000,
        patch in 0u64..1000,
        suffix in "(\\.[a-z]{1,6})?",
    ) {
        let raw = format!("{}.{}.{}{}", major, minor, patch, suffix);
        let parsed = leading_version(&raw).expect("version should parse");
        prop_assert_eq!(parsed.major, major);
        prop_assert_eq!(parsed.minor, minor);
        prop_assert_eq!(parsed.patch, patch);
    }
}

// Manifests survive a JSON round trip and remain structurally valid.
proptest! {
    #[test]
    fn test_manifest_roundtrip(
        id in "[a-z][a-z0-9_]{0,15}",
        version in "[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}",
        dep_id in "[a-z][a-z0-9_]{0,15}",
        required in any::<bool>(),
    ) {
        prop_assume!(id != dep_id);
        let dependency = if required {
            Dependency::required(dep_id.clone(), "^1.0.0")
        } else {
            Dependency::optional(dep_id.clone(), "^1.0.0")
        };
        let manifest = Manifest::new(id.clone(), version.clone())
            .with_dependency(dependency)
            .with_permission("storage");

        let json = manifest.to_json().expect("Failed to serialize manifest");
        let parsed = Manifest::from_json(&json).expect("Failed to deserialize manifest");

        prop_assert_eq!(&manifest, &parsed);
        let platforms: Vec<String> = KNOWN_PLATFORMS.iter().map(|p| p.to_string()).collect();
        prop_assert!(parsed.validate(&platforms).is_empty());
        prop_assert_eq!(parsed.dependencies[0].required, required);
    }
}
