//! Error types for the plugin runtime.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the plugin runtime.
///
/// The first six variants are the kinds surfaced to scripts and to the
/// host; the rest belong to the loader and the wire layer.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A capability the plugin did not declare (or was not granted).
    #[error("permission denied: {scope}")]
    PermissionDenied { scope: String },

    /// A host module the binding needs is not set on the AppContext.
    #[error("host module unavailable: {module}")]
    Unavailable { module: &'static str },

    /// The VM was terminated by the host. Terminal for this VM instance.
    #[error("plugin interrupted: {reason}")]
    Interrupted { reason: String },

    /// A reply did not match the pending request it claims to answer.
    #[error("protocol mismatch for request {request_id}: expected {expected}, got {got}")]
    ProtocolMismatch {
        request_id: String,
        expected: String,
        got: String,
    },

    /// The WebSocket bus is gone; in-flight request/reply handles time out.
    #[error("client disconnected")]
    ClientDisconnected,

    /// An uncaught exception inside a scheduled task.
    #[error("script exception: {0}")]
    Script(String),

    #[error("plugin directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("manifest not found in plugin directory: {0}")]
    ManifestNotFound(PathBuf),

    #[error("invalid manifest in {path}: {message}")]
    ManifestInvalid { path: PathBuf, message: String },

    #[error("plugin '{0}' not found")]
    PluginNotFound(String),

    #[error("failed to load plugin '{plugin}': {message}")]
    LoadFailed { plugin: String, message: String },

    #[error("invalid cron expression '{expr}': {message}")]
    CronInvalid { expr: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    /// Short machine-readable kind tag, carried in thrown script errors
    /// and in `plugin:error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginError::PermissionDenied { .. } => "PermissionDenied",
            PluginError::Unavailable { .. } => "Unavailable",
            PluginError::Interrupted { .. } => "Interrupted",
            PluginError::ProtocolMismatch { .. } => "ProtocolMismatch",
            PluginError::ClientDisconnected => "ClientDisconnected",
            PluginError::Script(_) => "ScriptException",
            PluginError::DirectoryNotFound(_) => "DirectoryNotFound",
            PluginError::ManifestNotFound(_) => "ManifestNotFound",
            PluginError::ManifestInvalid { .. } => "ManifestInvalid",
            PluginError::PluginNotFound(_) => "PluginNotFound",
            PluginError::LoadFailed { .. } => "LoadFailed",
            PluginError::CronInvalid { .. } => "CronInvalid",
            PluginError::Io(_) => "Io",
            PluginError::TomlParse(_) => "TomlParse",
            PluginError::Json(_) => "Json",
        }
    }
}

/// Result type for plugin runtime operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_tags() {
        let err = PluginError::PermissionDenied {
            scope: "filesystem:read".to_string(),
        };
        assert_eq!(err.kind(), "PermissionDenied");
        assert!(err.to_string().contains("filesystem:read"));

        let err = PluginError::Unavailable { module: "anilist" };
        assert_eq!(err.kind(), "Unavailable");
    }
}
