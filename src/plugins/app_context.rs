//! Host module handles exposed to plugin bindings.
//!
//! The process-wide [`AppContext`] carries optional handles to host
//! subsystems (database, anilist platform, playback manager, media player
//! repository, event bus). Each handle is set once at startup via
//! [`AppContext::set_modules_partial`] and read many times; during tests
//! most handles stay unset and dependent bindings fail with `Unavailable`.
//!
//! Domain payloads are opaque `serde_json::Value`s: the runtime moves them
//! between scripts and host modules without interpreting them.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::error::{PluginError, PluginResult};
use super::events::EventBus;

/// Anilist platform surface reachable from `$anilist`.
pub trait AnilistPlatform: Send + Sync {
    fn anime(&self, media_id: i64) -> PluginResult<Value>;
    fn anime_collection(&self) -> PluginResult<Value>;
    fn manga_collection(&self) -> PluginResult<Value>;
    fn update_entry(&self, payload: Value) -> PluginResult<Value>;
}

/// Local database surface reachable from `$database`.
pub trait Database: Send + Sync + std::fmt::Debug {
    fn local_files(&self) -> PluginResult<Value>;
    fn anime_entry(&self, media_id: i64) -> PluginResult<Value>;
}

/// Playback manager surface reachable from `ctx.playback`.
pub trait PlaybackManager: Send + Sync {
    fn play(&self, path: &str) -> PluginResult<()>;
    fn status(&self) -> PluginResult<Value>;
}

/// Media player repository surface (available players, default player).
pub trait MediaPlayerRepository: Send + Sync {
    fn players(&self) -> Vec<String>;
    fn default_player(&self) -> Option<String>;
}

/// Callback used for `$app.refreshAnimeCollection` / `refreshMangaCollection`.
pub type RefreshFn = Arc<dyn Fn() + Send + Sync>;

/// Handles to set on the context. `None` fields are left untouched, so the
/// host can populate modules incrementally as subsystems come up.
#[derive(Default)]
pub struct AppContextModules {
    pub database: Option<Arc<dyn Database>>,
    pub anilist_platform: Option<Arc<dyn AnilistPlatform>>,
    pub playback_manager: Option<Arc<dyn PlaybackManager>>,
    pub media_player_repository: Option<Arc<dyn MediaPlayerRepository>>,
    pub event_bus: Option<Arc<dyn EventBus>>,
    pub library_paths: Option<Vec<PathBuf>>,
    pub on_refresh_anime_collection: Option<RefreshFn>,
    pub on_refresh_manga_collection: Option<RefreshFn>,
}

#[derive(Default)]
struct Modules {
    database: Option<Arc<dyn Database>>,
    anilist_platform: Option<Arc<dyn AnilistPlatform>>,
    playback_manager: Option<Arc<dyn PlaybackManager>>,
    media_player_repository: Option<Arc<dyn MediaPlayerRepository>>,
    event_bus: Option<Arc<dyn EventBus>>,
    library_paths: Option<Vec<PathBuf>>,
    on_refresh_anime_collection: Option<RefreshFn>,
    on_refresh_manga_collection: Option<RefreshFn>,
}

/// Process-wide registry of host module handles.
pub struct AppContext {
    modules: RwLock<Modules>,
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(Modules::default()),
        }
    }

    /// Set the provided modules, leaving `None` fields unchanged.
    pub fn set_modules_partial(&self, update: AppContextModules) {
        let mut m = self.modules.write().unwrap();
        if update.database.is_some() {
            m.database = update.database;
        }
        if update.anilist_platform.is_some() {
            m.anilist_platform = update.anilist_platform;
        }
        if update.playback_manager.is_some() {
            m.playback_manager = update.playback_manager;
        }
        if update.media_player_repository.is_some() {
            m.media_player_repository = update.media_player_repository;
        }
        if update.event_bus.is_some() {
            m.event_bus = update.event_bus;
        }
        if update.library_paths.is_some() {
            m.library_paths = update.library_paths;
        }
        if update.on_refresh_anime_collection.is_some() {
            m.on_refresh_anime_collection = update.on_refresh_anime_collection;
        }
        if update.on_refresh_manga_collection.is_some() {
            m.on_refresh_manga_collection = update.on_refresh_manga_collection;
        }
    }

    pub fn database(&self) -> Option<Arc<dyn Database>> {
        self.modules.read().unwrap().database.clone()
    }

    pub fn anilist_platform(&self) -> Option<Arc<dyn AnilistPlatform>> {
        self.modules.read().unwrap().anilist_platform.clone()
    }

    pub fn playback_manager(&self) -> Option<Arc<dyn PlaybackManager>> {
        self.modules.read().unwrap().playback_manager.clone()
    }

    pub fn media_player_repository(&self) -> Option<Arc<dyn MediaPlayerRepository>> {
        self.modules.read().unwrap().media_player_repository.clone()
    }

    pub fn event_bus(&self) -> Option<Arc<dyn EventBus>> {
        self.modules.read().unwrap().event_bus.clone()
    }

    pub fn library_paths(&self) -> Option<Vec<PathBuf>> {
        self.modules.read().unwrap().library_paths.clone()
    }

    pub fn on_refresh_anime_collection(&self) -> Option<RefreshFn> {
        self.modules.read().unwrap().on_refresh_anime_collection.clone()
    }

    pub fn on_refresh_manga_collection(&self) -> Option<RefreshFn> {
        self.modules.read().unwrap().on_refresh_manga_collection.clone()
    }

    /// Resolve a handle or fail with `Unavailable`, for binding call sites.
    pub fn require<T: Clone>(handle: Option<T>, module: &'static str) -> PluginResult<T> {
        handle.ok_or(PluginError::Unavailable { module })
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}
