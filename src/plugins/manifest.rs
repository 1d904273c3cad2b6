//! Plugin manifest parsing.
//!
//! Each plugin directory contains a `plugin.toml` manifest that defines:
//! - Plugin identity (id, name, version, language)
//! - The script payload (inline or referenced by path/URI)
//! - Declared permissions (capability scopes, path and binary allowlists)

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{PluginError, PluginResult};
use super::permissions::PermissionGrants;

/// Complete plugin manifest parsed from `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMeta,

    #[serde(default)]
    pub permissions: PermissionGrants,
}

impl PluginManifest {
    /// Load a manifest from a directory containing `plugin.toml`.
    pub fn load(plugin_dir: &Path) -> PluginResult<Self> {
        let manifest_path = plugin_dir.join("plugin.toml");

        if !manifest_path.exists() {
            return Err(PluginError::ManifestNotFound(plugin_dir.to_path_buf()));
        }

        let content = std::fs::read_to_string(&manifest_path)?;

        toml::from_str(&content).map_err(|e| PluginError::ManifestInvalid {
            path: manifest_path,
            message: e.to_string(),
        })
    }

    /// Validate the manifest for required fields and constraints.
    pub fn validate(&self) -> PluginResult<()> {
        let invalid = |message: &str| PluginError::ManifestInvalid {
            path: "plugin.toml".into(),
            message: message.to_string(),
        };

        if self.plugin.id.is_empty() {
            return Err(invalid("plugin.id is required"));
        }
        if self.plugin.name.is_empty() {
            return Err(invalid("plugin.name is required"));
        }
        if self.plugin.version.is_empty() {
            return Err(invalid("plugin.version is required"));
        }
        if self.plugin.kind != "plugin" {
            return Err(invalid("plugin.type must be \"plugin\""));
        }
        if self.plugin.language != "javascript" && self.plugin.language != "typescript" {
            return Err(invalid("plugin.language must be javascript or typescript"));
        }
        if self.plugin.payload.is_none() && self.plugin.payload_uri.is_none() {
            return Err(invalid("either plugin.payload or plugin.payload_uri is required"));
        }

        Ok(())
    }

    /// Resolve the script source, reading `payload_uri` relative to the
    /// plugin directory when no inline payload is present.
    pub fn resolve_payload(&self, plugin_dir: &Path) -> PluginResult<String> {
        if let Some(payload) = &self.plugin.payload {
            return Ok(payload.clone());
        }

        let uri = self.plugin.payload_uri.as_deref().unwrap_or_default();
        let path = plugin_dir.join(uri);
        std::fs::read_to_string(&path).map_err(|e| PluginError::LoadFailed {
            plugin: self.plugin.id.clone(),
            message: format!("failed to read payload {}: {}", path.display(), e),
        })
    }
}

/// Plugin identity and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    /// Globally unique identifier (reverse-domain style, e.g. "acme.watchlist").
    pub id: String,

    /// Human-readable display name.
    pub name: String,

    /// Semantic version (e.g. "1.0.0").
    pub version: String,

    /// Script language tag.
    #[serde(default = "default_language")]
    pub language: String,

    /// Extension type tag; the runtime only loads "plugin".
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,

    /// Short description.
    #[serde(default)]
    pub description: String,

    /// Author name.
    #[serde(default)]
    pub author: String,

    /// Icon URL or path.
    #[serde(default)]
    pub icon: Option<String>,

    /// Inline script source.
    #[serde(default)]
    pub payload: Option<String>,

    /// Script source location, relative to the plugin directory.
    #[serde(default)]
    pub payload_uri: Option<String>,

    /// Where this manifest was fetched from (used by the updater, opaque here).
    #[serde(default)]
    pub manifest_uri: Option<String>,
}

fn default_language() -> String {
    "javascript".to_string()
}

fn default_kind() -> String {
    "plugin".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_manifest() {
        let toml = r#"
[plugin]
id = "acme.test"
name = "Test Plugin"
version = "1.0.0"
payload = "console.log('hi')"
"#;

        let manifest: PluginManifest = toml::from_str(toml).unwrap();
        assert_eq!(manifest.plugin.id, "acme.test");
        assert_eq!(manifest.plugin.language, "javascript");
        assert_eq!(manifest.plugin.kind, "plugin");
        assert!(manifest.validate().is_ok());
        assert!(manifest.permissions.scopes.is_empty());
    }

    #[test]
    fn test_parse_full_manifest() {
        let toml = r#"
[plugin]
id = "acme.watchlist"
name = "Watchlist"
version = "2.1.0"
language = "javascript"
type = "plugin"
description = "Tracks upcoming episodes"
author = "acme"
icon = "https://example.com/icon.png"
payload_uri = "plugin.js"
manifest_uri = "https://example.com/plugin.toml"

[permissions]
scopes = ["storage", "anilist", "filesystem:read", "execute"]
allowed_paths = ["/data/downloads"]
allowed_binaries = ["ffprobe"]
"#;

        let manifest: PluginManifest = toml::from_str(toml).unwrap();
        assert_eq!(manifest.plugin.name, "Watchlist");
        assert_eq!(manifest.permissions.scopes.len(), 4);
        assert_eq!(manifest.permissions.allowed_paths, vec!["/data/downloads"]);
        assert_eq!(manifest.permissions.allowed_binaries, vec!["ffprobe"]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_payload() {
        let toml = r#"
[plugin]
id = "acme.test"
name = "Test"
version = "1.0.0"
"#;
        let manifest: PluginManifest = toml::from_str(toml).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let toml = r#"
[plugin]
id = "acme.test"
name = "Test"
version = "1.0.0"
type = "manga-provider"
payload = ";"
"#;
        let manifest: PluginManifest = toml::from_str(toml).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_resolve_payload_from_file() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("plugin.js"), "$ui.register(() => {});").unwrap();

        let toml = r#"
[plugin]
id = "acme.test"
name = "Test"
version = "1.0.0"
payload_uri = "plugin.js"
"#;
        let manifest: PluginManifest = toml::from_str(toml).unwrap();
        let payload = manifest.resolve_payload(temp.path()).unwrap();
        assert!(payload.contains("$ui.register"));
    }
}
