//! Tray manager: retained-mode tray icons mirrored to the client.
//!
//! Each tray stores a render handler registered by the script. `update()`
//! schedules a render task; the prelude runs the render function inside a
//! fresh builder, assigns handler ids to callback props, and flushes the
//! resulting tree here. Every flush publishes one `tray:updated` event
//! carrying the complete tree; the snapshot is authoritative, diffing
//! happens in the client.

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::super::events::{server, Outbound};
use super::node::UiNode;

/// Options accepted by `ctx.newTray(...)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrayOptions {
    #[serde(default)]
    pub icon_url: String,

    /// Whether the tray opens a content panel (as opposed to a bare icon).
    #[serde(default)]
    pub with_content: bool,

    #[serde(default)]
    pub tooltip_text: Option<String>,

    #[serde(default)]
    pub width: Option<String>,

    #[serde(default)]
    pub min_height: Option<String>,
}

/// Badge shown on the tray icon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrayBadge {
    pub number: i64,
    #[serde(default)]
    pub intent: Option<String>,
}

/// Lifecycle callbacks a script can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayEvent {
    Open,
    Close,
    Click,
}

impl TrayEvent {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "open" => Some(TrayEvent::Open),
            "close" => Some(TrayEvent::Close),
            "click" => Some(TrayEvent::Click),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TrayRecord {
    pub options: TrayOptions,
    pub render_handler: Option<String>,
    pub on_open: Option<String>,
    pub on_close: Option<String>,
    pub on_click: Option<String>,
    /// Set on the first `onOpen` subscription; included in snapshots so the
    /// client lists the tray as openable.
    pub openable: bool,
    pub badge: Option<TrayBadge>,
}

/// All trays of one plugin, in creation order.
#[derive(Default)]
pub struct TrayManager {
    trays: Vec<(String, TrayRecord)>,
}

impl TrayManager {
    pub fn new_tray(&mut self, options: TrayOptions) -> String {
        let id = Uuid::new_v4().to_string();
        self.trays.push((
            id.clone(),
            TrayRecord {
                options,
                ..Default::default()
            },
        ));
        id
    }

    pub fn get_mut(&mut self, tray_id: &str) -> Option<&mut TrayRecord> {
        self.trays
            .iter_mut()
            .find(|(id, _)| id == tray_id)
            .map(|(_, rec)| rec)
    }

    /// Tray ids that have a render handler, for re-render requests.
    pub fn renderable(&self) -> Vec<String> {
        self.trays
            .iter()
            .filter(|(_, rec)| rec.render_handler.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn set_render(&mut self, tray_id: &str, handler: String) {
        if let Some(rec) = self.get_mut(tray_id) {
            rec.render_handler = Some(handler);
        }
    }

    /// Subscribe a lifecycle callback. The first `onOpen` marks the tray
    /// openable.
    pub fn subscribe(&mut self, tray_id: &str, event: TrayEvent, handler: String) {
        if let Some(rec) = self.get_mut(tray_id) {
            match event {
                TrayEvent::Open => {
                    rec.on_open = Some(handler);
                    rec.openable = true;
                }
                TrayEvent::Close => rec.on_close = Some(handler),
                TrayEvent::Click => rec.on_click = Some(handler),
            }
        }
    }

    /// Publish the authoritative snapshot for one render pass.
    pub fn flush(&mut self, out: &Outbound, tray_id: &str, tree: UiNode) -> Result<(), String> {
        tree.validate()?;

        let Some(rec) = self.get_mut(tray_id) else {
            return Err(format!("unknown tray {tray_id}"));
        };

        out.send(
            server::TRAY_UPDATED,
            json!({
                "trayId": tray_id,
                "iconUrl": rec.options.icon_url,
                "withContent": rec.options.with_content,
                "tooltipText": rec.options.tooltip_text,
                "width": rec.options.width,
                "minHeight": rec.options.min_height,
                "openable": rec.openable,
                "badge": rec.badge,
                "tree": tree,
            }),
        );
        Ok(())
    }

    pub fn open(&self, out: &Outbound, tray_id: &str) {
        out.send(server::TRAY_OPEN, json!({ "trayId": tray_id }));
    }

    pub fn close(&self, out: &Outbound, tray_id: &str) {
        out.send(server::TRAY_CLOSE, json!({ "trayId": tray_id }));
    }

    pub fn set_badge(&mut self, out: &Outbound, tray_id: &str, badge: Option<TrayBadge>) {
        if let Some(rec) = self.get_mut(tray_id) {
            rec.badge = badge.clone();
        }
        out.send(server::TRAY_BADGE, json!({ "trayId": tray_id, "badge": badge }));
    }

    pub fn set_icon(&mut self, out: &Outbound, tray_id: &str, icon_url: String) {
        if let Some(rec) = self.get_mut(tray_id) {
            rec.options.icon_url = icon_url.clone();
        }
        out.send(server::TRAY_ICON, json!({ "trayId": tray_id, "iconUrl": icon_url }));
    }

    /// Resolve the callback for a client lifecycle event, if subscribed.
    pub fn lifecycle_handler(&self, tray_id: &str, event: TrayEvent) -> Option<String> {
        self.trays
            .iter()
            .find(|(id, _)| id == tray_id)
            .and_then(|(_, rec)| match event {
                TrayEvent::Open => rec.on_open.clone(),
                TrayEvent::Close => rec.on_close.clone(),
                TrayEvent::Click => rec.on_click.clone(),
            })
    }

    pub fn clear(&mut self) {
        self.trays.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::events::{EventBus, InMemoryEventBus};
    use std::sync::Arc;

    fn setup() -> (TrayManager, Outbound, tokio::sync::broadcast::Receiver<crate::plugins::events::ServerPluginEvent>) {
        let bus = Arc::new(InMemoryEventBus::new());
        let rx = bus.outbound();
        let out = Outbound::new(bus.clone() as Arc<dyn EventBus>, "acme.test");
        (TrayManager::default(), out, rx)
    }

    fn sample_tree() -> UiNode {
        serde_json::from_value(serde_json::json!({
            "type": "div",
            "props": {},
            "children": [{"type": "text", "props": {"text": "hello", "onClick": "h1"}}]
        }))
        .unwrap()
    }

    #[test]
    fn test_flush_publishes_full_snapshot() {
        let (mut trays, out, mut rx) = setup();
        let id = trays.new_tray(TrayOptions {
            icon_url: "https://example.com/i.png".into(),
            with_content: true,
            ..Default::default()
        });
        trays.set_render(&id, "render1".into());

        trays.flush(&out, &id, sample_tree()).unwrap();

        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.event_type, "tray:updated");
        assert_eq!(evt.payload["trayId"], id.as_str());
        assert_eq!(evt.payload["withContent"], true);
        assert_eq!(evt.payload["tree"]["children"][0]["props"]["onClick"], "h1");
    }

    #[test]
    fn test_flush_is_idempotent_per_snapshot() {
        let (mut trays, out, mut rx) = setup();
        let id = trays.new_tray(TrayOptions::default());

        trays.flush(&out, &id, sample_tree()).unwrap();
        trays.flush(&out, &id, sample_tree()).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.payload["tree"], second.payload["tree"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_first_on_open_marks_openable() {
        let (mut trays, out, mut rx) = setup();
        let id = trays.new_tray(TrayOptions::default());
        assert!(!trays.get_mut(&id).unwrap().openable);

        trays.subscribe(&id, TrayEvent::Open, "h-open".into());
        assert!(trays.get_mut(&id).unwrap().openable);
        assert_eq!(
            trays.lifecycle_handler(&id, TrayEvent::Open),
            Some("h-open".to_string())
        );

        trays.flush(&out, &id, sample_tree()).unwrap();
        assert_eq!(rx.try_recv().unwrap().payload["openable"], true);
    }

    #[test]
    fn test_badge_update() {
        let (mut trays, out, mut rx) = setup();
        let id = trays.new_tray(TrayOptions::default());

        trays.set_badge(
            &out,
            &id,
            Some(TrayBadge {
                number: 3,
                intent: Some("alert".into()),
            }),
        );

        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.event_type, "tray:badge");
        assert_eq!(evt.payload["badge"]["number"], 3);
    }
}
