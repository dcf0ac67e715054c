//! Package manifest loading.

use std::path::Path;

use serde::Deserialize;

use crate::error::DeployError;

/// The subset of `package.json` the engine consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Optional allowlist of files and directories to deploy.
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

impl PackageManifest {
    /// Reads `package.json` from the project root.
    ///
    /// An unreadable or unparsable manifest is a fatal input error; it
    /// indicates caller misuse, never a condition worth retrying.
    pub fn load(root: &Path) -> Result<Self, DeployError> {
        let path = root.join("package.json");
        let bytes = std::fs::read(&path).map_err(|_| DeployError::Manifest(path.clone()))?;
        serde_json::from_slice(&bytes).map_err(|_| DeployError::Manifest(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_parses_known_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            br#"{"name":"demo","version":"1.0.0","files":["src","index.js"],"scripts":{"start":"node ."}}"#,
        )
        .unwrap();

        let manifest = PackageManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("demo"));
        assert_eq!(manifest.version.as_deref(), Some("1.0.0"));
        assert_eq!(
            manifest.files,
            Some(vec!["src".to_string(), "index.js".to_string()])
        );
    }

    #[test]
    fn load_missing_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = PackageManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, DeployError::Manifest(_)));
        assert!(err.to_string().contains("package.json"));
    }

    #[test]
    fn load_unparsable_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), b"{ not json").unwrap();
        let err = PackageManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, DeployError::Manifest(_)));
    }
}
