//! Permission checks for plugin host bindings.
//!
//! Plugins declare capability scopes in their manifest. Every host binding
//! consults the plugin's `PermissionSet` before doing anything; filesystem
//! bindings additionally restrict paths to the plugin's data directory plus
//! explicitly granted prefixes, and `$os.cmd` matches against a binary
//! allowlist.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{PluginError, PluginResult};

/// Permissions as declared in the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionGrants {
    /// Capability scopes, e.g. "storage", "anilist", "filesystem:read".
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Path prefixes granted in addition to the plugin's data directory.
    #[serde(default)]
    pub allowed_paths: Vec<String>,

    /// Binaries `$os.cmd` may execute (basename match).
    #[serde(default)]
    pub allowed_binaries: Vec<String>,
}

/// The effective permission set attached to a loaded plugin.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    scopes: BTreeSet<String>,
    allowed_paths: Vec<PathBuf>,
    allowed_binaries: Vec<String>,
    /// The plugin's own data directory, always readable and writable.
    data_dir: PathBuf,
}

impl PermissionSet {
    /// Build the effective set from manifest grants and the plugin's data
    /// directory.
    pub fn from_grants(grants: &PermissionGrants, data_dir: PathBuf) -> Self {
        Self {
            scopes: grants.scopes.iter().cloned().collect(),
            allowed_paths: grants.allowed_paths.iter().map(expand_home).collect(),
            allowed_binaries: grants.allowed_binaries.clone(),
            data_dir,
        }
    }

    /// Check that a capability scope was declared.
    pub fn check(&self, scope: &str) -> PluginResult<()> {
        if self.scopes.contains(scope) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                scope: scope.to_string(),
            })
        }
    }

    pub fn has(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Whether a path falls inside the data directory or a granted prefix.
    pub fn path_allowed(&self, path: &Path) -> bool {
        let normalized = normalize_path(path);
        normalized.starts_with(&self.data_dir)
            || self.allowed_paths.iter().any(|p| normalized.starts_with(p))
    }

    /// Check filesystem access to a path. `write` selects between the
    /// `filesystem:read` and `filesystem:write` scopes; the path must fall
    /// inside the data directory or a granted prefix either way.
    pub fn check_path(&self, path: &Path, write: bool) -> PluginResult<()> {
        let scope = if write { "filesystem:write" } else { "filesystem:read" };
        self.check(scope)?;

        if self.path_allowed(path) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                scope: format!("{} ({})", scope, path.display()),
            })
        }
    }

    /// Check that a binary may be executed via `$os.cmd`.
    pub fn check_binary(&self, bin: &str) -> PluginResult<()> {
        self.check("execute")?;

        let base = Path::new(bin)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| bin.to_string());

        if self.allowed_binaries.iter().any(|b| *b == base) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                scope: format!("execute ({})", bin),
            })
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Scopes in declaration order, for diagnostics.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(|s| s.as_str())
    }
}

fn expand_home(path: &String) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

/// Lexically remove `.` and `..` components so prefix checks cannot be
/// escaped with traversal.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(scopes: &[&str]) -> PermissionSet {
        PermissionSet::from_grants(
            &PermissionGrants {
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
                allowed_paths: vec!["/data/shared".to_string()],
                allowed_binaries: vec!["ffprobe".to_string()],
            },
            PathBuf::from("/data/plugins/acme.test"),
        )
    }

    #[test]
    fn test_scope_check() {
        let p = perms(&["storage", "anilist"]);
        assert!(p.check("storage").is_ok());
        assert!(p.check("anilist").is_ok());
        assert!(matches!(
            p.check("database"),
            Err(PluginError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_path_check_requires_scope() {
        let p = perms(&[]);
        assert!(p
            .check_path(Path::new("/data/plugins/acme.test/x"), false)
            .is_err());
    }

    #[test]
    fn test_path_check_data_dir_and_grants() {
        let p = perms(&["filesystem:read", "filesystem:write"]);

        assert!(p
            .check_path(Path::new("/data/plugins/acme.test/notes.json"), false)
            .is_ok());
        assert!(p.check_path(Path::new("/data/shared/movie.mkv"), true).is_ok());
        assert!(p.check_path(Path::new("/etc/passwd"), false).is_err());
    }

    #[test]
    fn test_path_traversal_is_normalized() {
        let p = perms(&["filesystem:read"]);
        assert!(p
            .check_path(Path::new("/data/plugins/acme.test/../../../etc/passwd"), false)
            .is_err());
        assert!(p
            .check_path(Path::new("/data/plugins/acme.test/sub/../notes.json"), false)
            .is_ok());
    }

    #[test]
    fn test_binary_allowlist() {
        let p = perms(&["execute"]);
        assert!(p.check_binary("ffprobe").is_ok());
        assert!(p.check_binary("/usr/bin/ffprobe").is_ok());
        assert!(p.check_binary("rm").is_err());

        let no_exec = perms(&[]);
        assert!(no_exec.check_binary("ffprobe").is_err());
    }
}
