//! Command palette manager.
//!
//! A palette is a set of selectable items pushed to the client with filter
//! semantics per item (`includes` or `startsWith` against the typed query).
//! Selection comes back as a `commandPalette:select` event carrying the
//! item's handler id.

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::super::events::{server, Outbound};

/// How the client matches the typed query against an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterMode {
    #[default]
    Includes,
    StartsWith,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaletteItem {
    pub label: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub filter_mode: FilterMode,
    /// Handler id assigned by the prelude for the item's `onSelect`.
    #[serde(default)]
    pub on_select: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaletteOptions {
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub keyboard_shortcut: Option<String>,
}

#[derive(Debug, Default)]
pub struct PaletteRecord {
    pub options: PaletteOptions,
    pub items: Vec<PaletteItem>,
}

#[derive(Default)]
pub struct PaletteManager {
    palettes: Vec<(String, PaletteRecord)>,
}

impl PaletteManager {
    pub fn new_palette(&mut self, options: PaletteOptions) -> String {
        let id = Uuid::new_v4().to_string();
        self.palettes.push((
            id.clone(),
            PaletteRecord {
                options,
                items: Vec::new(),
            },
        ));
        id
    }

    pub fn get_mut(&mut self, palette_id: &str) -> Option<&mut PaletteRecord> {
        self.palettes
            .iter_mut()
            .find(|(id, _)| id == palette_id)
            .map(|(_, rec)| rec)
    }

    /// Replace the item set and publish the new snapshot.
    pub fn set_items(&mut self, out: &Outbound, palette_id: &str, items: Vec<PaletteItem>) {
        if let Some(rec) = self.get_mut(palette_id) {
            rec.items = items;
            let payload = json!({
                "paletteId": palette_id,
                "placeholder": rec.options.placeholder,
                "keyboardShortcut": rec.options.keyboard_shortcut,
                "items": rec.items,
            });
            out.send(server::PALETTE_SET, payload);
        }
    }

    pub fn open(&self, out: &Outbound, palette_id: &str) {
        out.send(server::PALETTE_OPEN, json!({ "paletteId": palette_id }));
    }

    pub fn close(&self, out: &Outbound, palette_id: &str) {
        out.send(server::PALETTE_CLOSE, json!({ "paletteId": palette_id }));
    }

    /// Resolve the `onSelect` handler for a `commandPalette:select` event.
    pub fn select_handler(&self, palette_id: &str, item_value: &str) -> Option<String> {
        self.palettes
            .iter()
            .find(|(id, _)| id == palette_id)
            .and_then(|(_, rec)| {
                rec.items
                    .iter()
                    .find(|item| item.value == item_value)
                    .and_then(|item| item.on_select.clone())
            })
    }

    pub fn clear(&mut self) {
        self.palettes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::events::{EventBus, InMemoryEventBus};
    use std::sync::Arc;

    #[test]
    fn test_set_items_publishes_snapshot() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut rx = bus.outbound();
        let out = Outbound::new(bus.clone() as Arc<dyn EventBus>, "acme.test");

        let mut palettes = PaletteManager::default();
        let id = palettes.new_palette(PaletteOptions {
            placeholder: Some("Jump to...".into()),
            keyboard_shortcut: Some("meta+k".into()),
        });

        palettes.set_items(
            &out,
            &id,
            vec![
                PaletteItem {
                    label: "Open library".into(),
                    value: "library".into(),
                    filter_mode: FilterMode::StartsWith,
                    on_select: Some("h1".into()),
                },
                PaletteItem {
                    label: "Scan files".into(),
                    value: "scan".into(),
                    filter_mode: FilterMode::Includes,
                    on_select: Some("h2".into()),
                },
            ],
        );

        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.event_type, "commandPalette:set");
        assert_eq!(evt.payload["items"][0]["filterMode"], "startsWith");

        assert_eq!(palettes.select_handler(&id, "scan"), Some("h2".to_string()));
        assert_eq!(palettes.select_handler(&id, "missing"), None);
    }
}
