//! End-to-end runtime scenarios: state/effect batching, budgets, hook
//! mutation ordering, DOM observer re-attach, tray render idempotence and
//! permission gating, driven through a scripted engine and the in-memory
//! event bus. The scripted engine stands in for the JS prelude: handlers
//! are Rust closures keyed by the same handler ids the VM would use.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use aozora::plugins::events::{
    client, ClientPluginEvent, EventBus, InMemoryEventBus, ServerPluginEvent,
};
use aozora::plugins::hooks::HookManager;
use aozora::plugins::host::{PluginHost, PluginHostConfig};
use aozora::plugins::permissions::{PermissionGrants, PermissionSet};
use aozora::plugins::scheduler::{HookSignal, Task, MAX_EFFECT_CALLBACKS, MAX_EXCEPTIONS};
use aozora::plugins::ui::node::UiNode;
use aozora::plugins::ui::tray::TrayOptions;
use aozora::plugins::ui::Context;
use aozora::plugins::vm::{EngineFactory, Interrupter, ScriptEngine, ScriptError};
use aozora::plugins::AppContext;

// ── Scripted engine ─────────────────────────────────────────────────────

type Behavior = Box<dyn FnMut(&Rc<RefCell<Context>>, &[Value]) + Send>;

#[derive(Default)]
struct Script {
    behaviors: HashMap<String, Behavior>,
    failing: HashSet<String>,
}

impl Script {
    fn on(
        mut self,
        handler: &str,
        behavior: impl FnMut(&Rc<RefCell<Context>>, &[Value]) + Send + 'static,
    ) -> Self {
        self.behaviors.insert(handler.to_string(), Box::new(behavior));
        self
    }

    fn throws(mut self, handler: &str) -> Self {
        self.failing.insert(handler.to_string());
        self
    }

    fn into_factory(self) -> EngineFactory {
        Box::new(move |ctx, _op| {
            Ok(Box::new(ScriptedEngine {
                ctx,
                behaviors: self.behaviors,
                failing: self.failing,
            }) as Box<dyn ScriptEngine>)
        })
    }
}

struct ScriptedEngine {
    ctx: Rc<RefCell<Context>>,
    behaviors: HashMap<String, Behavior>,
    failing: HashSet<String>,
}

impl ScriptEngine for ScriptedEngine {
    fn eval(&mut self, _name: &'static str, _source: String) -> Result<(), ScriptError> {
        // The payload's only observable act is registering the entry point.
        self.ctx.borrow_mut().entry_registered = true;
        Ok(())
    }

    fn invoke(&mut self, handler: &str, args: &[Value]) -> Result<(), ScriptError> {
        if handler == "$invokeHook" {
            let inner = args[0].as_str().unwrap_or_default().to_string();
            return self.invoke(&inner, &args[1..]);
        }
        if self.failing.contains(handler) {
            return Err(ScriptError::Exception(format!("{handler} threw")));
        }
        if let Some(behavior) = self.behaviors.get_mut(handler) {
            behavior(&self.ctx, args);
        }
        Ok(())
    }

    fn interrupter(&mut self) -> Interrupter {
        Arc::new(|| {})
    }
}

/// What `event.next()` compiles to on the scripted side.
fn hook_next(ctx: &Rc<RefCell<Context>>, args: &[Value], event: Value) {
    let dispatch_id = args[0].as_u64().unwrap() as u32;
    let waiter = ctx.borrow_mut().hook_waiters.remove(&dispatch_id);
    if let Some(waiter) = waiter {
        let _ = waiter.send(HookSignal::Next(event));
    }
}

// ── Fixture ─────────────────────────────────────────────────────────────

struct Fixture {
    _temp: tempfile::TempDir,
    _rt: tokio::runtime::Runtime,
    bus: Arc<InMemoryEventBus>,
    hooks: Arc<HookManager>,
    host: PluginHost,
}

/// Route runtime tracing through the test harness; `RUST_LOG=debug` shows
/// worker and dispatch activity when a scenario misbehaves.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fixture(plugin_ids: &[&str]) -> Fixture {
    init_tracing();
    let temp = tempfile::tempdir().unwrap();
    let plugins_dir = temp.path().join("plugins");

    for id in plugin_ids {
        let dir = plugins_dir.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.toml"),
            format!(
                r#"
[plugin]
id = "{id}"
name = "{id}"
version = "1.0.0"
payload = "$ui.register(() => {{}});"
"#
            ),
        )
        .unwrap();
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    let bus = Arc::new(InMemoryEventBus::new());
    let hooks = Arc::new(HookManager::new());
    let host = PluginHost::new(
        PluginHostConfig {
            plugins_dir,
            data_dir: temp.path().join("data"),
        },
        Arc::new(AppContext::new()),
        bus.clone() as Arc<dyn EventBus>,
        hooks.clone(),
        rt.handle().clone(),
    )
    .unwrap();

    Fixture {
        _temp: temp,
        _rt: rt,
        bus,
        hooks,
        host,
    }
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn drain(
    rx: &mut tokio::sync::broadcast::Receiver<ServerPluginEvent>,
) -> Vec<ServerPluginEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<ServerPluginEvent>,
    event_type: &str,
    timeout: Duration,
) -> Option<ServerPluginEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        while let Ok(event) = rx.try_recv() {
            if event.event_type == event_type {
                return Some(event);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

// ── Scenario 1: state/effect counting ───────────────────────────────────

#[test]
fn effect_runs_once_per_set_plus_initial_run() {
    let counter = Arc::new(AtomicUsize::new(0));
    let on_register = counter.clone();
    let on_effect = counter.clone();

    let script = Script::default()
        .on("$runEntry", move |ctx, _| {
            let mut guard = ctx.borrow_mut();
            let c = &mut *guard;
            let n = c.state.create(json!(0));
            c.state.register_effect("eff".to_string(), vec![n]);
            // The first effect run happens synchronously at registration.
            on_register.fetch_add(1, Ordering::SeqCst);
            for _ in 0..5 {
                let current = c.state.get(n).unwrap().as_i64().unwrap();
                c.state.set(n, json!(current + 1));
            }
        })
        .on("eff", move |_, _| {
            on_effect.fetch_add(1, Ordering::SeqCst);
        });

    let mut fx = fixture(&["acme.counter"]);
    fx.host
        .load_with_engine("acme.counter", script.into_factory())
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 6),
        "expected 6 effect runs (initial + 5 sets), got {}",
        counter.load(Ordering::SeqCst)
    );

    // No further runs without further sets.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(counter.load(Ordering::SeqCst), 6);
    fx.host.unload_all();
}

// ── Scenario 2: effect budget interrupt ─────────────────────────────────

#[test]
fn effect_feedback_loop_exhausts_budget_and_interrupts() {
    let cell_id = Arc::new(AtomicU32::new(0));
    let entry_cell = cell_id.clone();
    let effect_cell = cell_id.clone();

    let script = Script::default()
        .on("$runEntry", move |ctx, _| {
            let mut guard = ctx.borrow_mut();
            let c = &mut *guard;
            let a = c.state.create(json!(0));
            entry_cell.store(a, Ordering::SeqCst);
            c.state.register_effect("eff".to_string(), vec![a]);
            c.state.set(a, json!(1));
        })
        .on("eff", move |ctx, _| {
            // Writes a cell it depends on: every run queues another tick.
            let a = effect_cell.load(Ordering::SeqCst);
            let mut guard = ctx.borrow_mut();
            let c = &mut *guard;
            let current = c.state.get(a).unwrap().as_i64().unwrap();
            c.state.set(a, json!(current + 1));
        });

    let mut fx = fixture(&["acme.loop"]);
    let mut out = fx.bus.outbound();
    fx.host
        .load_with_engine("acme.loop", script.into_factory())
        .unwrap();
    let scheduler = fx.host.scheduler("acme.loop").unwrap();

    assert!(
        wait_until(Duration::from_secs(1), || scheduler.is_stopped()),
        "expected the effect loop to interrupt the plugin within the reset window"
    );
    assert!(scheduler.effect_count() <= MAX_EFFECT_CALLBACKS + 1);

    let interrupted = wait_for_event(&mut out, "plugin:error", Duration::from_secs(1))
        .filter(|e| e.payload["kind"] == "Interrupted");
    assert!(interrupted.is_some(), "expected an Interrupted plugin:error event");

    // Schedules on an interrupted lane are no-ops.
    assert!(!scheduler.schedule(Task::Tick));
    fx.host.unload_all();
}

// ── Scenario 3: hook mutation ordering ──────────────────────────────────

#[test]
fn hook_mutations_flow_through_plugins_in_registration_order() {
    let seen_by_b = Arc::new(AtomicUsize::new(0));
    let seen = seen_by_b.clone();

    let mut fx = fixture(&["acme.first", "acme.second"]);

    let hooks_a = fx.hooks.clone();
    let script_a = Script::default()
        .on("$runEntry", move |ctx, _| {
            let c = ctx.borrow();
            hooks_a.register("onAnimeEntryRequest", &c.plugin.id, "hookA", c.scheduler.clone());
        })
        .on("hookA", move |ctx, args| {
            let mut event = args[1].clone();
            event["mediaId"] = json!(21);
            hook_next(ctx, args, event);
        });

    let hooks_b = fx.hooks.clone();
    let script_b = Script::default()
        .on("$runEntry", move |ctx, _| {
            let c = ctx.borrow();
            hooks_b.register("onAnimeEntryRequest", &c.plugin.id, "hookB", c.scheduler.clone());
        })
        .on("hookB", move |ctx, args| {
            let mut event = args[1].clone();
            // Observes the first plugin's mutation, then overrides it.
            seen.store(event["mediaId"].as_u64().unwrap() as usize, Ordering::SeqCst);
            event["mediaId"] = json!(42);
            hook_next(ctx, args, event);
        });

    fx.host
        .load_with_engine("acme.first", script_a.into_factory())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        fx.hooks.registration_count("onAnimeEntryRequest") == 1
    }));

    fx.host
        .load_with_engine("acme.second", script_b.into_factory())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        fx.hooks.registration_count("onAnimeEntryRequest") == 2
    }));

    let final_event = fx
        .hooks
        .dispatch("onAnimeEntryRequest", json!({"mediaId": 0}));

    assert_eq!(seen_by_b.load(Ordering::SeqCst), 21);
    assert_eq!(final_event["mediaId"], 42);
    fx.host.unload_all();
}

// ── Scenario 4: DOM observer re-attach on dom:ready ─────────────────────

#[test]
fn dom_observer_reissues_after_client_reload() {
    let seen_elements = Arc::new(AtomicUsize::new(0));
    let seen = seen_elements.clone();

    let script = Script::default()
        .on("$runEntry", move |ctx, _| {
            let mut guard = ctx.borrow_mut();
            let c = &mut *guard;
            c.dom.observe(&c.out, ".card", "obs".to_string());
        })
        .on("obs", move |_, args| {
            let count = args[0].as_array().map_or(0, |a| a.len());
            seen.store(count, Ordering::SeqCst);
        });

    let mut fx = fixture(&["acme.observer"]);
    let mut out = fx.bus.outbound();
    fx.host
        .load_with_engine("acme.observer", script.into_factory())
        .unwrap();

    let observe = wait_for_event(&mut out, "dom:observe", Duration::from_secs(2))
        .expect("observer registration should reach the client");
    let observer_id = observe.payload["observerId"].as_str().unwrap().to_string();
    assert_eq!(observe.payload["selector"], ".card");

    // The client reports three matches.
    fx.bus.push_client_event(ClientPluginEvent::new(
        client::DOM_OBSERVE_RESULT,
        "acme.observer",
        json!({
            "observerId": observer_id,
            "elements": [
                {"id": "plugin-element-1", "tagName": "DIV"},
                {"id": "plugin-element-2", "tagName": "DIV"},
                {"id": "plugin-element-3", "tagName": "DIV"},
            ],
        }),
    ));
    assert!(wait_until(Duration::from_secs(2), || {
        seen_elements.load(Ordering::SeqCst) == 3
    }));

    // Client reload: dom:ready re-issues the observer without script action.
    fx.bus
        .push_client_event(ClientPluginEvent::new(client::DOM_READY, "", json!({})));
    let reissued = wait_for_event(&mut out, "dom:observe", Duration::from_secs(2))
        .expect("dom:ready should re-issue active observers");
    assert_eq!(reissued.payload["observerId"], observer_id.as_str());
    assert_eq!(reissued.payload["selector"], ".card");
    fx.host.unload_all();
}

// ── Scenario 5: tray render idempotence ─────────────────────────────────

#[test]
fn rendering_the_same_tree_twice_emits_two_identical_snapshots() {
    let tray_store = Arc::new(Mutex::new(String::new()));
    let entry_store = tray_store.clone();

    let script = Script::default()
        .on("$runEntry", move |ctx, _| {
            let mut guard = ctx.borrow_mut();
            let c = &mut *guard;
            let tray_id = c.trays.new_tray(TrayOptions::default());
            c.trays.set_render(&tray_id, "$renderTray".to_string());
            *entry_store.lock().unwrap() = tray_id;
        })
        .on("$renderTray", move |ctx, args| {
            let tray_id = args[0].as_str().unwrap();
            let tree: UiNode = serde_json::from_value(json!({
                "type": "flex",
                "props": {"direction": "column"},
                "children": [
                    {"type": "text", "props": {"text": "Up next"}},
                    {"type": "button", "props": {"label": "Play", "onClick": "h1"}},
                ],
            }))
            .unwrap();
            let mut guard = ctx.borrow_mut();
            let c = &mut *guard;
            c.trays.flush(&c.out, tray_id, tree).unwrap();
        });

    let mut fx = fixture(&["acme.tray"]);
    let mut out = fx.bus.outbound();
    fx.host
        .load_with_engine("acme.tray", script.into_factory())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        !tray_store.lock().unwrap().is_empty()
    }));

    // Two render requests from the client, no state change in between.
    for _ in 0..2 {
        fx.bus
            .push_client_event(ClientPluginEvent::new(client::RENDER_TRAYS, "", json!({})));
    }

    let first = wait_for_event(&mut out, "tray:updated", Duration::from_secs(2)).unwrap();
    let second = wait_for_event(&mut out, "tray:updated", Duration::from_secs(2)).unwrap();
    assert_eq!(first.payload["tree"], second.payload["tree"]);
    assert_eq!(first.payload["tree"]["children"][1]["props"]["onClick"], "h1");

    // Exactly two snapshots.
    std::thread::sleep(Duration::from_millis(100));
    assert!(drain(&mut out).iter().all(|e| e.event_type != "tray:updated"));
    fx.host.unload_all();
}

// ── Scenario 6: permission gate ─────────────────────────────────────────

#[test]
fn os_read_without_filesystem_scope_is_denied() {
    let temp = tempfile::tempdir().unwrap();
    let secret = temp.path().join("x");
    std::fs::write(&secret, "do not read").unwrap();

    // A plugin with storage only: no filesystem:read scope.
    let permissions = PermissionSet::from_grants(
        &PermissionGrants {
            scopes: vec!["storage".to_string()],
            allowed_paths: vec![temp.path().to_string_lossy().into_owned()],
            allowed_binaries: vec![],
        },
        temp.path().join("data"),
    );

    let err = permissions.check_path(&secret, false).unwrap_err();
    assert_eq!(err.kind(), "PermissionDenied");

    // The gate rejects before any filesystem access: the file is intact.
    assert_eq!(std::fs::read_to_string(&secret).unwrap(), "do not read");

    // The same plugin passes once the scope is declared.
    let granted = PermissionSet::from_grants(
        &PermissionGrants {
            scopes: vec!["filesystem:read".to_string()],
            allowed_paths: vec![temp.path().to_string_lossy().into_owned()],
            allowed_binaries: vec![],
        },
        temp.path().join("data"),
    );
    assert!(granted.check_path(&secret, false).is_ok());
    assert!(granted.check_path(Path::new("/etc/passwd"), false).is_err());
}

// ── Exception budget ────────────────────────────────────────────────────

#[test]
fn exception_budget_interrupts_the_plugin() {
    let script = Script::default().throws("boom");

    let mut fx = fixture(&["acme.thrower"]);
    let mut out = fx.bus.outbound();
    fx.host
        .load_with_engine("acme.thrower", script.into_factory())
        .unwrap();
    let scheduler = fx.host.scheduler("acme.thrower").unwrap();

    for _ in 0..MAX_EXCEPTIONS {
        scheduler.schedule(Task::Invoke {
            handler: "boom".to_string(),
            args: vec![],
        });
    }

    assert!(wait_until(Duration::from_secs(2), || scheduler.is_stopped()));
    assert_eq!(scheduler.exception_count(), MAX_EXCEPTIONS);

    let events = {
        // Give the worker a moment to finish publishing.
        std::thread::sleep(Duration::from_millis(100));
        drain(&mut out)
    };
    let script_errors = events
        .iter()
        .filter(|e| e.event_type == "plugin:error" && e.payload["kind"] == "ScriptException")
        .count();
    let interrupted = events
        .iter()
        .any(|e| e.event_type == "plugin:error" && e.payload["kind"] == "Interrupted");
    assert_eq!(script_errors, MAX_EXCEPTIONS as usize);
    assert!(interrupted);
    fx.host.unload_all();
}

// ── Unload releases client-side resources ───────────────────────────────

#[test]
fn unload_stops_observers_and_is_idempotent() {
    let script = Script::default().on("$runEntry", move |ctx, _| {
        let mut guard = ctx.borrow_mut();
        let c = &mut *guard;
        c.dom.observe(&c.out, ".episode", "obs".to_string());
    });

    let mut fx = fixture(&["acme.cleanup"]);
    let mut out = fx.bus.outbound();
    fx.host
        .load_with_engine("acme.cleanup", script.into_factory())
        .unwrap();
    assert!(wait_for_event(&mut out, "dom:observe", Duration::from_secs(2)).is_some());

    fx.host.unload("acme.cleanup");
    let events = drain(&mut out);
    assert!(events.iter().any(|e| e.event_type == "dom:stopObserve"));
    assert!(events.iter().any(|e| e.event_type == "plugin:unloaded"));

    // A second unload emits nothing further.
    fx.host.unload("acme.cleanup");
    assert!(drain(&mut out).is_empty());
}

// ── Bus ordering per plugin ─────────────────────────────────────────────

#[test]
fn client_events_are_delivered_in_arrival_order() {
    let ready = Arc::new(AtomicUsize::new(0));
    let signal = ready.clone();
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = order.clone();

    let script = Script::default()
        .on("$runEntry", move |ctx, _| {
            let mut guard = ctx.borrow_mut();
            let c = &mut *guard;
            c.listeners
                .register(vec!["custom:episode-watched".to_string()], "onEvt".to_string());
            signal.store(1, Ordering::SeqCst);
        })
        .on("onEvt", move |_, args| {
            let n = args[0]["payload"]["n"].as_i64().unwrap();
            record.lock().unwrap().push(n);
        });

    let mut fx = fixture(&["acme.order"]);
    fx.host
        .load_with_engine("acme.order", script.into_factory())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        ready.load(Ordering::SeqCst) == 1
    }));

    for n in 0..5 {
        fx.bus.push_client_event(ClientPluginEvent::new(
            "custom:episode-watched",
            "acme.order",
            json!({ "n": n }),
        ));
    }

    assert!(wait_until(Duration::from_secs(2), || {
        order.lock().unwrap().len() == 5
    }));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    fx.host.unload_all();
}
