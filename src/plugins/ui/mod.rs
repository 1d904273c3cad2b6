//! Per-plugin UI context.
//!
//! The [`Context`] is the root object behind the `ctx` handle a plugin's
//! entry point receives: state cells, timers, effects, the listener table
//! and the managed surfaces (trays, forms, actions, palettes, screen, DOM
//! proxy, cron). It lives on the scheduler worker thread inside an
//! `Rc<RefCell<_>>` shared between the worker loop and the VM ops; nothing
//! else ever touches it.
//!
//! Client events are routed here: [`plan_client_event`] performs the
//! bookkeeping side of dispatch (reply correlation, observer re-issue,
//! listener matching) and returns the script invocations to run, which the
//! worker executes one by one so each callback gets its own exception
//! accounting.

pub mod actions;
pub mod dom;
pub mod forms;
pub mod node;
pub mod palette;
pub mod screen;
pub mod state;
pub mod tray;

use std::collections::HashMap;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use super::cron::CronManager;
use super::events::{client, ClientPluginEvent, EventInbox, Outbound};
use super::scheduler::{HookSignal, Scheduler};
use super::Plugin;

use actions::ActionManager;
use dom::{DomManager, PendingKind};
use forms::FormManager;
use palette::PaletteManager;
use screen::ScreenManager;
use state::StateCells;
use tray::{TrayEvent, TrayManager};

/// A registered bus event listener. An empty filter receives every event
/// not consumed by a managed surface.
#[derive(Debug, Clone)]
pub struct EventListener {
    pub id: String,
    pub listen_to: Vec<String>,
    pub handler: String,
}

#[derive(Default)]
pub struct ListenerTable {
    listeners: Vec<EventListener>,
}

impl ListenerTable {
    pub fn register(&mut self, listen_to: Vec<String>, handler: String) -> String {
        let id = Uuid::new_v4().to_string();
        self.listeners.push(EventListener {
            id: id.clone(),
            listen_to,
            handler,
        });
        id
    }

    pub fn unregister(&mut self, id: &str) {
        self.listeners.retain(|l| l.id != id);
    }

    pub fn matching(&self, event_type: &str) -> Vec<String> {
        self.listeners
            .iter()
            .filter(|l| l.listen_to.is_empty() || l.listen_to.iter().any(|t| t == event_type))
            .map(|l| l.handler.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

#[derive(Debug, Clone)]
pub struct TimerRecord {
    pub handler: String,
    /// `Some` for intervals (re-armed after each fire), `None` for one-shots.
    pub interval: Option<Duration>,
}

#[derive(Default)]
pub struct TimerTable {
    next_id: u32,
    timers: HashMap<u32, TimerRecord>,
}

impl TimerTable {
    pub fn register(&mut self, handler: String, interval: Option<Duration>) -> u32 {
        self.next_id += 1;
        self.timers.insert(self.next_id, TimerRecord { handler, interval });
        self.next_id
    }

    /// Cancellation is idempotent.
    pub fn cancel(&mut self, id: u32) {
        self.timers.remove(&id);
    }

    pub fn get(&self, id: u32) -> Option<TimerRecord> {
        self.timers.get(&id).cloned()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

/// The per-plugin context owning every scripted surface.
pub struct Context {
    pub plugin: Arc<Plugin>,
    pub scheduler: Scheduler,
    pub out: Outbound,
    pub inbox: Arc<EventInbox>,

    /// Set once the script has called `$ui.register`.
    pub entry_registered: bool,

    pub listeners: ListenerTable,
    pub state: StateCells,
    pub timers: TimerTable,
    pub trays: TrayManager,
    pub forms: FormManager,
    pub actions: ActionManager,
    pub palettes: PaletteManager,
    pub screen: ScreenManager,
    pub dom: DomManager,
    pub cron: CronManager,

    /// Backing map for the in-memory `$store` binding.
    pub store: HashMap<String, Value>,

    /// Hook dispatches waiting for `event.next()` from this VM.
    pub hook_waiters: HashMap<u32, SyncSender<HookSignal>>,
}

impl Context {
    pub fn new(
        plugin: Arc<Plugin>,
        scheduler: Scheduler,
        out: Outbound,
        inbox: Arc<EventInbox>,
    ) -> Self {
        Self {
            plugin,
            scheduler,
            out,
            inbox,
            entry_registered: false,
            listeners: ListenerTable::default(),
            state: StateCells::default(),
            timers: TimerTable::default(),
            trays: TrayManager::default(),
            forms: FormManager::default(),
            actions: ActionManager::default(),
            palettes: PaletteManager::default(),
            screen: ScreenManager::default(),
            dom: DomManager::default(),
            cron: CronManager::default(),
            store: HashMap::new(),
            hook_waiters: HashMap::new(),
        }
    }

    /// Tear down every scripted surface. Used when `$ui.register` is called
    /// again (the new Context replaces the prior one) and during unload.
    pub fn reset_surfaces(&mut self) {
        self.dom.stop_all_observers(&self.out);
        self.listeners.clear();
        self.state.clear();
        self.timers.clear();
        self.trays.clear();
        self.forms.clear();
        self.actions.clear();
        self.palettes.clear();
        self.screen.clear();
        self.dom.clear();
        self.cron.clear();
    }
}

/// A script invocation produced by event routing: (handler id, arguments).
pub type Invocation = (String, Vec<Value>);

/// Route one client event. Performs the non-VM side of dispatch and returns
/// the callbacks to invoke, in order.
pub fn plan_client_event(ctx: &mut Context, evt: &ClientPluginEvent) -> Vec<Invocation> {
    let payload = &evt.payload;
    let mut calls: Vec<Invocation> = Vec::new();

    match evt.event_type.as_str() {
        client::RENDER_TRAYS | client::RENDER_TRAY => {
            for tray_id in ctx.trays.renderable() {
                calls.push(("$renderTray".to_string(), vec![json!(tray_id)]));
            }
        }

        client::TRAY_OPENED | client::TRAY_CLOSED | client::TRAY_CLICKED => {
            let event = match evt.event_type.as_str() {
                client::TRAY_OPENED => TrayEvent::Open,
                client::TRAY_CLOSED => TrayEvent::Close,
                _ => TrayEvent::Click,
            };
            if let Some(tray_id) = payload.get("trayId").and_then(Value::as_str) {
                if let Some(handler) = ctx.trays.lifecycle_handler(tray_id, event) {
                    calls.push((handler, vec![payload.clone()]));
                }
            }
        }

        client::FORM_SUBMIT => {
            if let Some(form_id) = payload.get("formId").and_then(Value::as_str) {
                if let Some(handler) = ctx.forms.submit_handler(form_id) {
                    let values = payload.get("values").cloned().unwrap_or(json!({}));
                    calls.push((handler, vec![values]));
                }
            }
        }

        client::HANDLER_INVOKE => {
            if let Some(handler) = payload.get("handlerId").and_then(Value::as_str) {
                let event = payload.get("event").cloned().unwrap_or(Value::Null);
                calls.push((handler.to_string(), vec![event]));
            }
        }

        client::ACTION_CLICK => {
            if let Some(action_id) = payload.get("actionId").and_then(Value::as_str) {
                if let Some(handler) = ctx.actions.click_handler(action_id) {
                    let event = payload.get("event").cloned().unwrap_or(Value::Null);
                    calls.push((handler, vec![event]));
                }
            }
        }

        client::PALETTE_SELECT => {
            let palette_id = payload.get("paletteId").and_then(Value::as_str);
            let value = payload.get("value").and_then(Value::as_str);
            if let (Some(palette_id), Some(value)) = (palette_id, value) {
                if let Some(handler) = ctx.palettes.select_handler(palette_id, value) {
                    calls.push((handler, vec![]));
                }
            }
        }

        client::SCREEN_CHANGED => {
            for handler in ctx.screen.navigate_handlers() {
                calls.push((handler.clone(), vec![payload.clone()]));
            }
        }

        client::DOM_QUERY_RESULT => {
            settle_dom_reply(ctx, payload, PendingKind::DomQuery, "elements", &mut calls);
        }
        client::DOM_QUERY_ONE_RESULT => {
            settle_dom_reply(ctx, payload, PendingKind::DomQueryOne, "element", &mut calls);
        }
        client::DOM_CREATE_RESULT => {
            settle_dom_reply(ctx, payload, PendingKind::DomCreate, "element", &mut calls);
        }

        client::DOM_ELEMENT_UPDATED => {
            let request_id = payload.get("requestId").and_then(Value::as_str);
            let element_id = payload.get("elementId").and_then(Value::as_str);
            let action = payload.get("action").and_then(Value::as_str);
            if let (Some(request_id), Some(element_id), Some(action)) =
                (request_id, element_id, action)
            {
                let kind = PendingKind::DomManipulate {
                    element_id: element_id.to_string(),
                    action: action.to_string(),
                };
                match ctx.dom.pending.settle(request_id, &kind) {
                    Ok(true) => {
                        let result = payload.get("result").cloned().unwrap_or(Value::Null);
                        calls.push((
                            "$settle".to_string(),
                            vec![json!(request_id), json!(true), result],
                        ));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(plugin = %ctx.plugin.id, error = %e, "discarding DOM reply");
                    }
                }
            }
        }

        client::DOM_OBSERVE_RESULT => {
            let observer_id = payload.get("observerId").and_then(Value::as_str);
            if let Some(observer_id) = observer_id {
                if let Some(handler) = ctx.dom.observer_handler(observer_id) {
                    let elements = payload.get("elements").cloned().unwrap_or(json!([]));
                    calls.push((handler, vec![elements]));
                }
            }
        }

        client::DOM_EVENT => {
            let element_id = payload.get("elementId").and_then(Value::as_str);
            let event_type = payload.get("eventType").and_then(Value::as_str);
            if let (Some(element_id), Some(event_type)) = (element_id, event_type) {
                let event = payload.get("event").cloned().unwrap_or(Value::Null);
                for handler in ctx.dom.event_handlers(element_id, event_type) {
                    calls.push((handler, vec![event.clone()]));
                }
            }
        }

        client::DOM_READY => {
            ctx.dom.reissue_observers(&ctx.out);
            for handler in ctx.dom.take_ready_handlers() {
                calls.push((handler, vec![payload.clone()]));
            }
        }

        other => {
            for handler in ctx.listeners.matching(other) {
                calls.push((
                    handler,
                    vec![json!({ "type": other, "payload": payload })],
                ));
            }
        }
    }

    calls
}

fn settle_dom_reply(
    ctx: &mut Context,
    payload: &Value,
    kind: PendingKind,
    result_key: &str,
    calls: &mut Vec<Invocation>,
) {
    let Some(request_id) = payload.get("requestId").and_then(Value::as_str) else {
        return;
    };
    match ctx.dom.pending.settle(request_id, &kind) {
        Ok(true) => {
            let result = payload.get(result_key).cloned().unwrap_or(Value::Null);
            calls.push((
                "$settle".to_string(),
                vec![json!(request_id), json!(true), result],
            ));
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(plugin = %ctx.plugin.id, error = %e, "discarding DOM reply");
        }
    }
}
