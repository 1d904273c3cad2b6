//! DOM proxy: request/reply correlation and observer bookkeeping.
//!
//! Scripts hold element handles materialized in the VM by the prelude; every
//! read crosses the bus as a request keyed by a fresh requestId and resolves
//! when the client's reply comes back. This module owns the pending-request
//! table (one entry per request, resolved or timed out exactly once),
//! observer subscriptions (re-issued on `dom:ready` so client reloads
//! reattach cleanly), and element event listeners.
//!
//! Writes (`setText`, `addClass`, ...) are fire-and-forget `dom:manipulate`
//! events with no pending entry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use uuid::Uuid;

use super::super::error::PluginError;
use super::super::events::{server, Outbound};

/// How long a pending request may wait for its reply before the promise is
/// rejected by the sweep.
pub const DOM_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What a pending entry is waiting for; replies must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    DomQuery,
    DomQueryOne,
    DomCreate,
    DomManipulate { element_id: String, action: String },
    Fetch,
    Sleep,
    Command,
    Download,
}

impl PendingKind {
    fn describe(&self) -> String {
        match self {
            PendingKind::DomManipulate { element_id, action } => {
                format!("manipulate {action} on {element_id}")
            }
            other => format!("{other:?}"),
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    kind: PendingKind,
    expires_at: Instant,
}

/// Table of in-flight request/reply pairs keyed by requestId.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    pub fn register(&mut self, id: &str, kind: PendingKind, ttl: Duration) {
        self.entries.insert(
            id.to_string(),
            PendingRequest {
                kind,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Consume a pending entry whose reply arrived. A reply for an unknown
    /// id returns `Ok(false)` (already settled or swept); a reply that does
    /// not match the recorded kind leaves the entry pending and reports a
    /// protocol mismatch.
    pub fn settle(&mut self, id: &str, got: &PendingKind) -> Result<bool, PluginError> {
        match self.entries.get(id) {
            None => Ok(false),
            Some(entry) if entry.kind == *got => {
                self.entries.remove(id);
                Ok(true)
            }
            Some(entry) => Err(PluginError::ProtocolMismatch {
                request_id: id.to_string(),
                expected: entry.kind.describe(),
                got: got.describe(),
            }),
        }
    }

    /// Remove an entry by id regardless of kind, for host-side settlement
    /// (fetch, sleep, command, download). Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Remove and return the ids of entries past their deadline.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    /// Drain every entry, for unload and client-disconnect handling.
    pub fn drain(&mut self) -> Vec<String> {
        self.entries.drain().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ObserverRecord {
    pub selector: String,
    pub handler: String,
}

#[derive(Debug, Clone)]
pub struct DomListenerRecord {
    pub element_id: String,
    pub event_type: String,
    pub handler: String,
}

/// DOM proxy state for one plugin.
#[derive(Default)]
pub struct DomManager {
    pub pending: PendingTable,
    observers: HashMap<String, ObserverRecord>,
    listeners: HashMap<String, DomListenerRecord>,
    ready_handlers: Vec<String>,
}

impl DomManager {
    // ── Request/reply family ─────────────────────────────────────────────

    pub fn query(&mut self, out: &Outbound, request_id: &str, selector: &str) {
        self.pending
            .register(request_id, PendingKind::DomQuery, DOM_REQUEST_TIMEOUT);
        out.send(
            server::DOM_QUERY,
            json!({ "selector": selector, "requestId": request_id }),
        );
    }

    pub fn query_one(&mut self, out: &Outbound, request_id: &str, selector: &str) {
        self.pending
            .register(request_id, PendingKind::DomQueryOne, DOM_REQUEST_TIMEOUT);
        out.send(
            server::DOM_QUERY_ONE,
            json!({ "selector": selector, "requestId": request_id }),
        );
    }

    pub fn create(&mut self, out: &Outbound, request_id: &str, tag_name: &str) {
        self.pending
            .register(request_id, PendingKind::DomCreate, DOM_REQUEST_TIMEOUT);
        out.send(
            server::DOM_CREATE,
            json!({ "tagName": tag_name, "requestId": request_id }),
        );
    }

    /// A manipulation that expects a reply (`getText`, `getAttribute`, ...).
    pub fn manipulate_with_reply(
        &mut self,
        out: &Outbound,
        request_id: &str,
        element_id: &str,
        action: &str,
        params: Value,
    ) {
        self.pending.register(
            request_id,
            PendingKind::DomManipulate {
                element_id: element_id.to_string(),
                action: action.to_string(),
            },
            DOM_REQUEST_TIMEOUT,
        );
        out.send(
            server::DOM_MANIPULATE,
            json!({
                "elementId": element_id,
                "action": action,
                "params": params,
                "requestId": request_id,
            }),
        );
    }

    /// A fire-and-forget manipulation (`setText`, `addClass`, ...).
    pub fn manipulate(&self, out: &Outbound, element_id: &str, action: &str, params: Value) {
        out.send(
            server::DOM_MANIPULATE,
            json!({ "elementId": element_id, "action": action, "params": params }),
        );
    }

    // ── Observer family ──────────────────────────────────────────────────

    pub fn observe(&mut self, out: &Outbound, selector: &str, handler: String) -> String {
        let observer_id = Uuid::new_v4().to_string();
        self.observers.insert(
            observer_id.clone(),
            ObserverRecord {
                selector: selector.to_string(),
                handler,
            },
        );
        out.send(
            server::DOM_OBSERVE,
            json!({ "selector": selector, "observerId": observer_id }),
        );
        observer_id
    }

    pub fn stop_observe(&mut self, out: &Outbound, observer_id: &str) {
        if self.observers.remove(observer_id).is_some() {
            out.send(server::DOM_STOP_OBSERVE, json!({ "observerId": observer_id }));
        }
    }

    pub fn observer_handler(&self, observer_id: &str) -> Option<String> {
        self.observers.get(observer_id).map(|o| o.handler.clone())
    }

    /// Re-issue a single observer on script request, forcing the client to
    /// report the current matches again.
    pub fn refetch(&self, out: &Outbound, observer_id: &str) {
        if let Some(rec) = self.observers.get(observer_id) {
            out.send(
                server::DOM_OBSERVE,
                json!({ "selector": rec.selector, "observerId": observer_id }),
            );
        }
    }

    /// Re-issue every live observer, called on `dom:ready` so a reloaded
    /// client re-reports current matches without script action.
    pub fn reissue_observers(&self, out: &Outbound) {
        for (observer_id, rec) in &self.observers {
            out.send(
                server::DOM_OBSERVE,
                json!({ "selector": rec.selector, "observerId": observer_id }),
            );
        }
    }

    /// Emit `dom:stopObserve` for every observer, used during unload.
    pub fn stop_all_observers(&mut self, out: &Outbound) {
        for observer_id in self.observers.keys() {
            out.send(server::DOM_STOP_OBSERVE, json!({ "observerId": observer_id }));
        }
        self.observers.clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    // ── Element event listeners ──────────────────────────────────────────

    pub fn add_event_listener(
        &mut self,
        out: &Outbound,
        element_id: &str,
        event_type: &str,
        handler: String,
    ) -> String {
        let listener_id = Uuid::new_v4().to_string();
        self.listeners.insert(
            listener_id.clone(),
            DomListenerRecord {
                element_id: element_id.to_string(),
                event_type: event_type.to_string(),
                handler,
            },
        );
        self.manipulate(
            out,
            element_id,
            "addEventListener",
            json!({ "event": event_type, "listenerId": listener_id }),
        );
        listener_id
    }

    pub fn remove_event_listener(&mut self, out: &Outbound, listener_id: &str) {
        if let Some(rec) = self.listeners.remove(listener_id) {
            self.manipulate(
                out,
                &rec.element_id,
                "removeEventListener",
                json!({ "event": rec.event_type, "listenerId": listener_id }),
            );
        }
    }

    /// Handlers for a `dom:event` from the client, matched by element and
    /// event type.
    pub fn event_handlers(&self, element_id: &str, event_type: &str) -> Vec<String> {
        self.listeners
            .values()
            .filter(|l| l.element_id == element_id && l.event_type == event_type)
            .map(|l| l.handler.clone())
            .collect()
    }

    // ── Ready handlers ───────────────────────────────────────────────────

    /// One-shot `dom.onReady` subscription.
    pub fn on_ready(&mut self, handler: String) {
        self.ready_handlers.push(handler);
    }

    pub fn take_ready_handlers(&mut self) -> Vec<String> {
        std::mem::take(&mut self.ready_handlers)
    }

    pub fn clear(&mut self) {
        self.pending = PendingTable::default();
        self.observers.clear();
        self.listeners.clear();
        self.ready_handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::events::{EventBus, InMemoryEventBus};
    use std::sync::Arc;

    fn setup() -> (
        DomManager,
        Outbound,
        tokio::sync::broadcast::Receiver<crate::plugins::events::ServerPluginEvent>,
    ) {
        let bus = Arc::new(InMemoryEventBus::new());
        let rx = bus.outbound();
        let out = Outbound::new(bus.clone() as Arc<dyn EventBus>, "acme.test");
        (DomManager::default(), out, rx)
    }

    #[test]
    fn test_reply_settles_exactly_once() {
        let (mut dom, out, _rx) = setup();
        dom.query(&out, "req-1", ".card");

        let settled = dom.pending.settle("req-1", &PendingKind::DomQuery).unwrap();
        assert!(settled);

        // A duplicate reply for the same id is ignored.
        let settled = dom.pending.settle("req-1", &PendingKind::DomQuery).unwrap();
        assert!(!settled);
    }

    #[test]
    fn test_mismatched_reply_leaves_entry_pending() {
        let (mut dom, out, _rx) = setup();
        dom.manipulate_with_reply(&out, "req-2", "plugin-element-1", "getText", json!({}));

        let err = dom
            .pending
            .settle(
                "req-2",
                &PendingKind::DomManipulate {
                    element_id: "plugin-element-1".into(),
                    action: "getAttribute".into(),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), "ProtocolMismatch");
        assert_eq!(dom.pending.len(), 1);
    }

    #[test]
    fn test_sweep_rejects_expired_entries() {
        let (mut dom, _out, _rx) = setup();
        dom.pending
            .register("req-3", PendingKind::Fetch, Duration::from_secs(0));
        dom.pending
            .register("req-4", PendingKind::Fetch, Duration::from_secs(60));

        let expired = dom.pending.sweep_expired(Instant::now());
        assert_eq!(expired, vec!["req-3".to_string()]);
        assert_eq!(dom.pending.len(), 1);
    }

    #[test]
    fn test_observers_reissue_on_ready() {
        let (mut dom, out, mut rx) = setup();
        let observer_id = dom.observe(&out, ".card", "h-obs".into());

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type, "dom:observe");
        assert_eq!(first.payload["observerId"], observer_id.as_str());

        dom.reissue_observers(&out);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.event_type, "dom:observe");
        assert_eq!(second.payload["observerId"], observer_id.as_str());
        assert_eq!(second.payload["selector"], ".card");
    }

    #[test]
    fn test_stop_all_observers_on_unload() {
        let (mut dom, out, mut rx) = setup();
        dom.observe(&out, ".a", "h1".into());
        dom.observe(&out, ".b", "h2".into());
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        dom.stop_all_observers(&out);
        assert_eq!(dom.observer_count(), 0);
        assert_eq!(rx.try_recv().unwrap().event_type, "dom:stopObserve");
        assert_eq!(rx.try_recv().unwrap().event_type, "dom:stopObserve");
    }

    #[test]
    fn test_event_listener_matching() {
        let (mut dom, out, _rx) = setup();
        let id = dom.add_event_listener(&out, "plugin-element-1", "click", "h-click".into());
        dom.add_event_listener(&out, "plugin-element-2", "click", "h-other".into());

        assert_eq!(
            dom.event_handlers("plugin-element-1", "click"),
            vec!["h-click".to_string()]
        );
        assert!(dom.event_handlers("plugin-element-1", "keydown").is_empty());

        dom.remove_event_listener(&out, &id);
        assert!(dom.event_handlers("plugin-element-1", "click").is_empty());
    }
}
