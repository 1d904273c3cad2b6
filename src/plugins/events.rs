//! WebSocket event bus integration.
//!
//! All plugin traffic rides the host's WebSocket connection as envelopes of
//! the shape `{ type, payload, extensionId }`. Envelope types are namespaced
//! by direction:
//!
//! - `plugin:client:<name>`: client to server (e.g. `plugin:client:dom:ready`)
//! - `plugin:server:<name>`: server to client (e.g. `plugin:server:tray:updated`)
//! - `plugin:custom:<name>`: client to server custom events targeted at
//!   `ctx.registerEventHandler`; routed with inner type `custom:<name>`
//!
//! The adapter strips the direction prefix before per-plugin routing, so the
//! rest of the runtime works with the inner names in [`client`] and
//! [`server`]. An empty `extensionId` broadcasts to every loaded plugin.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Inner event types sent by the client.
pub mod client {
    pub const RENDER_TRAYS: &str = "render_trays";
    pub const RENDER_TRAY: &str = "render_tray";
    pub const TRAY_OPENED: &str = "tray:opened";
    pub const TRAY_CLOSED: &str = "tray:closed";
    pub const TRAY_CLICKED: &str = "tray:clicked";
    pub const FORM_SUBMIT: &str = "form:submit";
    pub const HANDLER_INVOKE: &str = "handler:invoke";
    pub const SCREEN_CHANGED: &str = "screen:changed";
    pub const ACTION_CLICK: &str = "action:click";
    pub const PALETTE_SELECT: &str = "commandPalette:select";
    pub const PALETTE_OPENED: &str = "commandPalette:opened";
    pub const PALETTE_CLOSED: &str = "commandPalette:closed";
    pub const DOM_QUERY_RESULT: &str = "dom:queryResult";
    pub const DOM_QUERY_ONE_RESULT: &str = "dom:queryOneResult";
    pub const DOM_CREATE_RESULT: &str = "dom:createResult";
    pub const DOM_ELEMENT_UPDATED: &str = "dom:elementUpdated";
    pub const DOM_OBSERVE_RESULT: &str = "dom:observeResult";
    pub const DOM_EVENT: &str = "dom:event";
    pub const DOM_READY: &str = "dom:ready";
}

/// Inner event types sent by the server.
pub mod server {
    pub const TRAY_UPDATED: &str = "tray:updated";
    pub const TRAY_OPEN: &str = "tray:open";
    pub const TRAY_CLOSE: &str = "tray:close";
    pub const TRAY_BADGE: &str = "tray:badge";
    pub const TRAY_ICON: &str = "tray:icon";
    pub const FORM_UPDATED: &str = "form:updated";
    pub const FORM_RESET: &str = "form:reset";
    pub const TOAST: &str = "toast";
    pub const SCREEN_NAVIGATE: &str = "screen:navigate";
    pub const SCREEN_RELOAD: &str = "screen:reload";
    pub const ACTION_MOUNT: &str = "action:mount";
    pub const ACTION_UNMOUNT: &str = "action:unmount";
    pub const PALETTE_SET: &str = "commandPalette:set";
    pub const PALETTE_OPEN: &str = "commandPalette:open";
    pub const PALETTE_CLOSE: &str = "commandPalette:close";
    pub const DOM_QUERY: &str = "dom:query";
    pub const DOM_QUERY_ONE: &str = "dom:queryOne";
    pub const DOM_CREATE: &str = "dom:create";
    pub const DOM_MANIPULATE: &str = "dom:manipulate";
    pub const DOM_OBSERVE: &str = "dom:observe";
    pub const DOM_STOP_OBSERVE: &str = "dom:stopObserve";
    pub const PLUGIN_ERROR: &str = "plugin:error";
    pub const PLUGIN_UNLOADED: &str = "plugin:unloaded";
}

const CLIENT_PREFIX: &str = "plugin:client:";
const SERVER_PREFIX: &str = "plugin:server:";
const CUSTOM_PREFIX: &str = "plugin:custom:";

/// A client → server envelope, after direction-prefix stripping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientPluginEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    /// Empty string = broadcast to every plugin.
    #[serde(default)]
    pub extension_id: String,

    #[serde(default)]
    pub payload: Value,
}

impl ClientPluginEvent {
    pub fn new(event_type: &str, extension_id: &str, payload: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            extension_id: extension_id.to_string(),
            payload,
        }
    }

    /// Parse a raw wire envelope. Returns `None` for non-plugin traffic.
    pub fn from_wire(wire_type: &str, extension_id: String, payload: Value) -> Option<Self> {
        let event_type = if let Some(name) = wire_type.strip_prefix(CLIENT_PREFIX) {
            name.to_string()
        } else if let Some(name) = wire_type.strip_prefix(CUSTOM_PREFIX) {
            format!("custom:{name}")
        } else {
            return None;
        };

        Some(Self {
            event_type,
            extension_id,
            payload,
        })
    }

    /// Whether this envelope targets the given plugin.
    pub fn targets(&self, plugin_id: &str) -> bool {
        self.extension_id.is_empty() || self.extension_id == plugin_id
    }

    /// Typed view of the payload.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// A server → client envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerPluginEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    pub extension_id: String,

    #[serde(default)]
    pub payload: Value,
}

impl ServerPluginEvent {
    pub fn new(extension_id: &str, event_type: &str, payload: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            extension_id: extension_id.to_string(),
            payload,
        }
    }

    /// The namespaced type string put on the wire.
    pub fn wire_type(&self) -> String {
        format!("{SERVER_PREFIX}{}", self.event_type)
    }
}

/// Interface to the host's WebSocket event manager.
///
/// The production implementation lives with the HTTP layer; the runtime only
/// depends on this trait. Receivers are broadcast so each plugin pump gets
/// its own cursor into the client event stream.
pub trait EventBus: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ClientPluginEvent>;
    fn publish(&self, event: ServerPluginEvent);
}

/// In-memory bus used in tests and headless operation.
pub struct InMemoryEventBus {
    inbound: broadcast::Sender<ClientPluginEvent>,
    outbound: broadcast::Sender<ServerPluginEvent>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(256);
        let (outbound, _) = broadcast::channel(256);
        Self { inbound, outbound }
    }

    /// Inject a client event, as the WebSocket handler would.
    pub fn push_client_event(&self, event: ClientPluginEvent) {
        let _ = self.inbound.send(event);
    }

    /// Subscribe to everything published toward the client.
    pub fn outbound(&self) -> broadcast::Receiver<ServerPluginEvent> {
        self.outbound.subscribe()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self) -> broadcast::Receiver<ClientPluginEvent> {
        self.inbound.subscribe()
    }

    fn publish(&self, event: ServerPluginEvent) {
        let _ = self.outbound.send(event);
    }
}

/// Per-plugin outbound sender: wraps payloads into `ServerPluginEvent`
/// envelopes for this plugin and publishes them on the bus.
#[derive(Clone)]
pub struct Outbound {
    bus: std::sync::Arc<dyn EventBus>,
    plugin_id: String,
}

impl Outbound {
    pub fn new(bus: std::sync::Arc<dyn EventBus>, plugin_id: &str) -> Self {
        Self {
            bus,
            plugin_id: plugin_id.to_string(),
        }
    }

    pub fn send(&self, event_type: &str, payload: Value) {
        self.bus
            .publish(ServerPluginEvent::new(&self.plugin_id, event_type, payload));
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

/// Bounded per-plugin inbox between the bus pump and the scheduler worker.
///
/// Holds events in arrival order; on overflow the oldest event is dropped
/// and a warning emitted.
pub struct EventInbox {
    queue: Mutex<VecDeque<ClientPluginEvent>>,
    capacity: usize,
}

/// Default inbox bound per plugin.
pub const EVENT_INBOX_CAPACITY: usize = 64;

impl EventInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push an event, dropping the oldest on overflow. Returns whether an
    /// event was dropped.
    pub fn push(&self, plugin_id: &str, event: ClientPluginEvent) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let mut dropped = false;
        if queue.len() >= self.capacity {
            if let Some(old) = queue.pop_front() {
                tracing::warn!(
                    plugin = plugin_id,
                    event = %old.event_type,
                    "plugin event inbox full, dropping oldest event"
                );
                dropped = true;
            }
        }
        queue.push_back(event);
        dropped
    }

    pub fn pop(&self) -> Option<ClientPluginEvent> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }
}
