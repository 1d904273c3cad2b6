//! Action manager.
//!
//! Actions are UI affordances the plugin attaches to host surfaces (anime
//! page, manga page, media cards, the library dropdown). Mounting publishes
//! the action definition to the client; clicks come back as `action:click`
//! events carrying the surface context (e.g. the media the card shows).

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::super::events::{server, Outbound};

/// Host surfaces an action can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionSurface {
    AnimePageButton,
    MangaPageButton,
    MediaCardContextMenu,
    LibraryDropdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionProps {
    pub label: String,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug)]
pub struct ActionRecord {
    pub surface: ActionSurface,
    pub props: ActionProps,
    pub on_click: Option<String>,
    pub mounted: bool,
}

#[derive(Default)]
pub struct ActionManager {
    actions: Vec<(String, ActionRecord)>,
}

impl ActionManager {
    pub fn new_action(&mut self, surface: ActionSurface, props: ActionProps) -> String {
        let id = Uuid::new_v4().to_string();
        self.actions.push((
            id.clone(),
            ActionRecord {
                surface,
                props,
                on_click: None,
                mounted: false,
            },
        ));
        id
    }

    pub fn get_mut(&mut self, action_id: &str) -> Option<&mut ActionRecord> {
        self.actions
            .iter_mut()
            .find(|(id, _)| id == action_id)
            .map(|(_, rec)| rec)
    }

    pub fn on_click(&mut self, action_id: &str, handler: String) {
        if let Some(rec) = self.get_mut(action_id) {
            rec.on_click = Some(handler);
        }
    }

    pub fn mount(&mut self, out: &Outbound, action_id: &str) {
        if let Some(rec) = self.get_mut(action_id) {
            rec.mounted = true;
            let payload = json!({
                "actionId": action_id,
                "surface": rec.surface,
                "label": rec.props.label,
                "style": rec.props.style,
            });
            out.send(server::ACTION_MOUNT, payload);
        }
    }

    pub fn unmount(&mut self, out: &Outbound, action_id: &str) {
        if let Some(rec) = self.get_mut(action_id) {
            rec.mounted = false;
            out.send(server::ACTION_UNMOUNT, json!({ "actionId": action_id }));
        }
    }

    pub fn set_label(&mut self, out: &Outbound, action_id: &str, label: String) {
        if let Some(rec) = self.get_mut(action_id) {
            rec.props.label = label;
            if rec.mounted {
                let payload = json!({
                    "actionId": action_id,
                    "surface": rec.surface,
                    "label": rec.props.label,
                    "style": rec.props.style,
                });
                out.send(server::ACTION_MOUNT, payload);
            }
        }
    }

    /// Resolve the click callback for an `action:click` event; only mounted
    /// actions receive clicks.
    pub fn click_handler(&self, action_id: &str) -> Option<String> {
        self.actions
            .iter()
            .find(|(id, rec)| id == action_id && rec.mounted)
            .and_then(|(_, rec)| rec.on_click.clone())
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::events::{EventBus, InMemoryEventBus};
    use std::sync::Arc;

    fn setup() -> (
        ActionManager,
        Outbound,
        tokio::sync::broadcast::Receiver<crate::plugins::events::ServerPluginEvent>,
    ) {
        let bus = Arc::new(InMemoryEventBus::new());
        let rx = bus.outbound();
        let out = Outbound::new(bus.clone() as Arc<dyn EventBus>, "acme.test");
        (ActionManager::default(), out, rx)
    }

    #[test]
    fn test_mount_unmount_events() {
        let (mut actions, out, mut rx) = setup();
        let id = actions.new_action(
            ActionSurface::AnimePageButton,
            ActionProps {
                label: "Track".into(),
                style: Some("primary".into()),
            },
        );

        actions.mount(&out, &id);
        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.event_type, "action:mount");
        assert_eq!(evt.payload["surface"], "animePageButton");
        assert_eq!(evt.payload["label"], "Track");

        actions.unmount(&out, &id);
        assert_eq!(rx.try_recv().unwrap().event_type, "action:unmount");
    }

    #[test]
    fn test_click_only_routes_when_mounted() {
        let (mut actions, out, _rx) = setup();
        let id = actions.new_action(
            ActionSurface::MediaCardContextMenu,
            ActionProps {
                label: "Open".into(),
                style: None,
            },
        );
        actions.on_click(&id, "h-click".into());

        assert_eq!(actions.click_handler(&id), None);
        actions.mount(&out, &id);
        assert_eq!(actions.click_handler(&id), Some("h-click".to_string()));
        actions.unmount(&out, &id);
        assert_eq!(actions.click_handler(&id), None);
    }
}
