//! Aozora: self-hosted media library server.
//!
//! This crate contains the plugin runtime core: a sandboxed execution
//! environment for third-party JavaScript plugins that extend the host by
//! registering UI surfaces (trays, forms, actions, command palettes),
//! subscribing to host lifecycle hooks, proxying the web client's DOM, and
//! calling a permission-gated host API.
//!
//! # Architecture
//!
//! - [`plugins::host::PluginHost`]: discovery, load/unload/reload
//! - [`plugins::scheduler`]: one cooperative execution lane per plugin VM
//! - [`plugins::vm`]: the embedded JS engine (deno_core) behind a trait
//! - [`plugins::ui`]: the per-plugin context and retained-mode surfaces
//! - [`plugins::events`]: WebSocket envelope types and the event bus seam
//! - [`plugins::hooks`]: named host extension points with blocking dispatch
//!
//! The media-library domain itself (anilist, playback, scanning) reaches the
//! runtime only through the optional handles on
//! [`plugins::app_context::AppContext`].

pub mod plugins;

pub use plugins::{AppContext, AppContextModules, HookManager, PluginHost, PluginHostConfig};
