//! Plugin host: discovery, load, unload, reload.
//!
//! The host scans the plugins directory for `plugin.toml` manifests and
//! owns the per-plugin machinery: the scheduler lane with its worker thread
//! (which exclusively owns the VM), the bus pump task feeding the bounded
//! inbox, and the IO task set aborted on unload.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use super::app_context::AppContext;
use super::error::{PluginError, PluginResult};
use super::events::{EventBus, EventInbox, Outbound, EVENT_INBOX_CAPACITY};
use super::fetch::{FetchPool, IoTaskSet};
use super::hooks::HookManager;
use super::manifest::PluginManifest;
use super::ops::OpCtx;
use super::scheduler::{Scheduler, Task, Worker};
use super::storage::PluginStorage;
use super::ui::Context;
use super::vm::{EngineFactory, JsEngine};
use super::Plugin;

/// Configuration for the plugin host.
#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    /// Directory containing one subdirectory per plugin.
    pub plugins_dir: PathBuf,

    /// Root of per-plugin data directories (storage, granted file space).
    pub data_dir: PathBuf,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            plugins_dir: base.join("aozora").join("plugins"),
            data_dir: base.join("aozora").join("plugin-data"),
        }
    }
}

struct LoadedPlugin {
    plugin: Arc<Plugin>,
    scheduler: Scheduler,
    worker: Option<std::thread::JoinHandle<()>>,
    pump: tokio::task::JoinHandle<()>,
    io_tasks: Arc<IoTaskSet>,
}

/// Manages every installed plugin.
pub struct PluginHost {
    config: PluginHostConfig,
    app: Arc<AppContext>,
    bus: Arc<dyn EventBus>,
    hooks: Arc<HookManager>,
    io: tokio::runtime::Handle,
    manifests: HashMap<String, (PluginManifest, PathBuf)>,
    loaded: HashMap<String, LoadedPlugin>,
}

impl PluginHost {
    /// Create the host and scan the plugins directory.
    pub fn new(
        config: PluginHostConfig,
        app: Arc<AppContext>,
        bus: Arc<dyn EventBus>,
        hooks: Arc<HookManager>,
        io: tokio::runtime::Handle,
    ) -> PluginResult<Self> {
        let mut host = Self {
            config,
            app,
            bus,
            hooks,
            io,
            manifests: HashMap::new(),
            loaded: HashMap::new(),
        };
        host.scan()?;
        Ok(host)
    }

    /// Scan the plugins directory and (re)load all manifests. Invalid
    /// manifests are skipped with a warning; loaded plugins are untouched.
    pub fn scan(&mut self) -> PluginResult<()> {
        self.manifests.clear();

        if !self.config.plugins_dir.exists() {
            return Ok(());
        }

        for entry in std::fs::read_dir(&self.config.plugins_dir)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            match PluginManifest::load(&path) {
                Ok(manifest) => {
                    if let Err(e) = manifest.validate() {
                        tracing::warn!(path = %path.display(), error = %e, "invalid plugin manifest");
                        continue;
                    }
                    self.manifests
                        .insert(manifest.plugin.id.clone(), (manifest, path));
                }
                Err(PluginError::ManifestNotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read plugin manifest");
                }
            }
        }

        Ok(())
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.manifests.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn manifest(&self, plugin_id: &str) -> Option<&PluginManifest> {
        self.manifests.get(plugin_id).map(|(m, _)| m)
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.contains_key(plugin_id)
    }

    pub fn scheduler(&self, plugin_id: &str) -> Option<Scheduler> {
        self.loaded.get(plugin_id).map(|p| p.scheduler.clone())
    }

    pub fn plugin(&self, plugin_id: &str) -> Option<Arc<Plugin>> {
        self.loaded.get(plugin_id).map(|p| p.plugin.clone())
    }

    /// Load a plugin with the default JS engine.
    pub fn load(&mut self, plugin_id: &str) -> PluginResult<()> {
        self.load_with_engine(plugin_id, JsEngine::factory())
    }

    /// Load a plugin with a caller-provided engine, used by tests to drive
    /// the lane without booting V8.
    pub fn load_with_engine(
        &mut self,
        plugin_id: &str,
        factory: EngineFactory,
    ) -> PluginResult<()> {
        if self.loaded.contains_key(plugin_id) {
            return Ok(());
        }

        let (manifest, plugin_dir) = self
            .manifests
            .get(plugin_id)
            .ok_or_else(|| PluginError::PluginNotFound(plugin_id.to_string()))?;

        let payload = manifest.resolve_payload(plugin_dir)?;
        let data_dir = self.config.data_dir.join(plugin_id);
        let plugin = Arc::new(Plugin::from_manifest(manifest, payload.clone(), data_dir.clone()));

        let (scheduler, rx) = Scheduler::channel();
        let inbox = Arc::new(EventInbox::new(EVENT_INBOX_CAPACITY));
        let io_tasks = Arc::new(IoTaskSet::default());
        let out = Outbound::new(self.bus.clone(), plugin_id);

        let op_ctx = OpCtx {
            app: self.app.clone(),
            hooks: self.hooks.clone(),
            storage: RefCell::new(PluginStorage::new(plugin_id, data_dir)),
            io: self.io.clone(),
            fetch: FetchPool::new(),
            io_tasks: io_tasks.clone(),
        };

        // The worker thread owns the VM for this plugin's whole lifetime.
        let worker = {
            let plugin = plugin.clone();
            let scheduler = scheduler.clone();
            let inbox = inbox.clone();
            let plugin_id = plugin_id.to_string();
            let spawn_err_plugin_id = plugin_id.clone();
            std::thread::Builder::new()
                .name(format!("plugin-{plugin_id}"))
                .spawn(move || {
                    let ctx = Rc::new(RefCell::new(Context::new(
                        plugin,
                        scheduler.clone(),
                        out,
                        inbox,
                    )));
                    let engine = match factory(ctx.clone(), op_ctx) {
                        Ok(engine) => engine,
                        Err(e) => {
                            tracing::error!(plugin = %plugin_id, error = %e, "failed to create plugin VM");
                            return;
                        }
                    };
                    scheduler.schedule(Task::Eval { source: payload });
                    Worker::new(rx, scheduler, engine, ctx).run();
                })
                .map_err(|e| PluginError::LoadFailed {
                    plugin: spawn_err_plugin_id,
                    message: format!("failed to spawn worker thread: {e}"),
                })?
        };

        // Pump bus events targeting this plugin into its bounded inbox.
        let pump = {
            let mut events = self.bus.subscribe();
            let scheduler = scheduler.clone();
            let inbox = inbox.clone();
            let plugin_id = plugin_id.to_string();
            self.io.spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if scheduler.is_stopped() {
                                break;
                            }
                            if !event.targets(&plugin_id) {
                                continue;
                            }
                            inbox.push(&plugin_id, event);
                            scheduler.schedule(Task::PumpEvents);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                plugin = %plugin_id,
                                skipped,
                                "plugin event pump lagged behind the bus"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        tracing::info!(plugin = plugin_id, version = %plugin.version, "plugin loaded");
        self.loaded.insert(
            plugin_id.to_string(),
            LoadedPlugin {
                plugin,
                scheduler,
                worker: Some(worker),
                pump,
                io_tasks,
            },
        );
        Ok(())
    }

    /// Unload a plugin: interrupt the VM, stop the lane, abort in-flight IO,
    /// drop hook registrations. Idempotent; unloading an unknown id is a
    /// no-op.
    pub fn unload(&mut self, plugin_id: &str) {
        let Some(mut loaded) = self.loaded.remove(plugin_id) else {
            return;
        };

        loaded.scheduler.stop();
        loaded.io_tasks.abort_all();
        loaded.pump.abort();
        self.hooks.unregister_plugin(plugin_id);

        if let Some(worker) = loaded.worker.take() {
            if worker.join().is_err() {
                tracing::error!(plugin = plugin_id, "plugin worker panicked during unload");
            }
        }

        tracing::info!(plugin = plugin_id, "plugin unloaded");
    }

    /// Reload a plugin from disk. Identity (the id) persists; everything
    /// else is rebuilt.
    pub fn reload(&mut self, plugin_id: &str) -> PluginResult<()> {
        self.unload(plugin_id);
        self.scan()?;
        self.load(plugin_id)
    }

    /// Unload every plugin, for host shutdown.
    pub fn unload_all(&mut self) {
        let ids: Vec<String> = self.loaded.keys().cloned().collect();
        for id in ids {
            self.unload(&id);
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.unload_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::events::InMemoryEventBus;
    use crate::plugins::vm::{Interrupter, ScriptEngine, ScriptError};
    use serde_json::Value;
    use std::sync::Arc;

    struct NoopEngine;

    impl ScriptEngine for NoopEngine {
        fn eval(&mut self, _name: &'static str, _source: String) -> Result<(), ScriptError> {
            Ok(())
        }
        fn invoke(&mut self, _handler: &str, _args: &[Value]) -> Result<(), ScriptError> {
            Ok(())
        }
        fn interrupter(&mut self) -> Interrupter {
            Arc::new(|| {})
        }
    }

    fn noop_factory() -> EngineFactory {
        Box::new(|_ctx, _op| Ok(Box::new(NoopEngine) as Box<dyn ScriptEngine>))
    }

    fn write_plugin(dir: &std::path::Path, id: &str) {
        let plugin_dir = dir.join(id);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        let manifest = format!(
            r#"
[plugin]
id = "{id}"
name = "{id}"
version = "1.0.0"
payload = "$ui.register(() => {{}});"
"#
        );
        std::fs::write(plugin_dir.join("plugin.toml"), manifest).unwrap();
    }

    fn test_host(plugins_dir: PathBuf, data_dir: PathBuf) -> (PluginHost, tokio::runtime::Runtime) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let host = PluginHost::new(
            PluginHostConfig {
                plugins_dir,
                data_dir,
            },
            Arc::new(AppContext::new()),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(HookManager::new()),
            rt.handle().clone(),
        )
        .unwrap();
        (host, rt)
    }

    #[test]
    fn test_scan_finds_valid_manifests() {
        let temp = tempfile::tempdir().unwrap();
        write_plugin(temp.path(), "acme.one");
        write_plugin(temp.path(), "acme.two");
        // Not a plugin directory.
        std::fs::create_dir_all(temp.path().join("junk")).unwrap();

        let (host, _rt) = test_host(temp.path().to_path_buf(), temp.path().join("data"));
        assert_eq!(host.plugin_ids(), vec!["acme.one", "acme.two"]);
        assert!(host.manifest("acme.one").is_some());
        assert!(host.manifest("missing").is_none());
    }

    #[test]
    fn test_load_and_unload_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        write_plugin(temp.path(), "acme.test");

        let (mut host, _rt) = test_host(temp.path().to_path_buf(), temp.path().join("data"));

        host.load_with_engine("acme.test", noop_factory()).unwrap();
        assert!(host.is_loaded("acme.test"));
        let scheduler = host.scheduler("acme.test").unwrap();
        assert!(!scheduler.is_stopped());

        host.unload("acme.test");
        assert!(!host.is_loaded("acme.test"));
        assert!(scheduler.is_stopped());

        // Idempotent: a second unload changes nothing.
        host.unload("acme.test");
        assert!(!host.is_loaded("acme.test"));
    }

    #[test]
    fn test_load_unknown_plugin_fails() {
        let temp = tempfile::tempdir().unwrap();
        let (mut host, _rt) = test_host(temp.path().to_path_buf(), temp.path().join("data"));

        let err = host.load_with_engine("nope", noop_factory()).unwrap_err();
        assert_eq!(err.kind(), "PluginNotFound");
    }

    #[test]
    fn test_double_load_is_a_noop() {
        let temp = tempfile::tempdir().unwrap();
        write_plugin(temp.path(), "acme.test");
        let (mut host, _rt) = test_host(temp.path().to_path_buf(), temp.path().join("data"));

        host.load_with_engine("acme.test", noop_factory()).unwrap();
        host.load_with_engine("acme.test", noop_factory()).unwrap();
        assert!(host.is_loaded("acme.test"));
        host.unload_all();
    }
}
