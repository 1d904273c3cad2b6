//! Plugin runtime for Aozora.
//!
//! This module hosts untrusted JavaScript plugins that extend the media
//! library: each plugin runs in its own embedded VM, driven by a dedicated
//! single-lane scheduler, and talks to the web client through the
//! WebSocket event bus (retained-mode trays/forms, DOM proxying, toasts).
//!
//! # Architecture
//!
//! ```text
//! PluginHost
//! ├── manifests: plugin.toml records from the plugins directory
//! ├── loaded: per-plugin { Scheduler, worker thread (owns the VM),
//! │           bus pump task, IO task set }
//! ├── AppContext: optional host module handles ($anilist, $database, ...)
//! └── HookManager: named host extension points
//!
//! worker thread
//! ├── JsEngine (deno_core isolate) + JS prelude (runtime.js)
//! └── Context: state cells, timers, listeners, trays, forms, actions,
//!     palettes, screen, DOM proxy, cron
//! ```
//!
//! Everything asynchronous resolves back into the lane as a task; the VM is
//! never entered from two places at once.

pub mod app_context;
pub mod cron;
pub mod error;
pub mod events;
pub mod fetch;
pub mod filename;
pub mod hooks;
pub mod host;
pub mod manifest;
pub mod ops;
pub mod permissions;
pub mod scheduler;
pub mod storage;
pub mod ui;
pub mod vm;

pub use app_context::{AppContext, AppContextModules};
pub use error::{PluginError, PluginResult};
pub use events::{ClientPluginEvent, EventBus, InMemoryEventBus, ServerPluginEvent};
pub use hooks::HookManager;
pub use host::{PluginHost, PluginHostConfig};
pub use manifest::PluginManifest;
pub use permissions::PermissionSet;
pub use scheduler::{
    Scheduler, MAX_EFFECT_CALLBACKS, MAX_EXCEPTIONS, RESET_EFFECT_CALLBACK_INTERVAL,
};

use std::path::PathBuf;

/// An installed plugin, immutable for the lifetime of one load. The id
/// persists across reloads; everything else is rebuilt from the manifest.
#[derive(Debug)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub version: String,
    pub language: String,
    pub permissions: PermissionSet,
    /// Script source text.
    pub payload: String,
    pub icon: Option<String>,
}

impl Plugin {
    /// Build the runtime record from a validated manifest.
    pub fn from_manifest(
        manifest: &PluginManifest,
        payload: String,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            id: manifest.plugin.id.clone(),
            name: manifest.plugin.name.clone(),
            version: manifest.plugin.version.clone(),
            language: manifest.plugin.language.clone(),
            permissions: PermissionSet::from_grants(&manifest.permissions, data_dir),
            payload,
            icon: manifest.plugin.icon.clone(),
        }
    }
}
