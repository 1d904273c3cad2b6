//! Form manager.
//!
//! Forms share the tray render protocol: the script registers a render
//! handler, field factories carry `fieldRef` props that accumulate values in
//! the client, and a `form:submit` event delivers the keyed value bag to the
//! `onSubmit` callback. `reset()` clears client-side field state via a
//! `form:reset` event.

use serde_json::json;
use uuid::Uuid;

use super::super::events::{server, Outbound};
use super::node::UiNode;

#[derive(Debug, Default)]
pub struct FormRecord {
    pub name: String,
    pub render_handler: Option<String>,
    pub on_submit: Option<String>,
}

#[derive(Default)]
pub struct FormManager {
    forms: Vec<(String, FormRecord)>,
}

impl FormManager {
    pub fn new_form(&mut self, name: String) -> String {
        let id = Uuid::new_v4().to_string();
        self.forms.push((
            id.clone(),
            FormRecord {
                name,
                ..Default::default()
            },
        ));
        id
    }

    pub fn get_mut(&mut self, form_id: &str) -> Option<&mut FormRecord> {
        self.forms
            .iter_mut()
            .find(|(id, _)| id == form_id)
            .map(|(_, rec)| rec)
    }

    pub fn set_render(&mut self, form_id: &str, handler: String) {
        if let Some(rec) = self.get_mut(form_id) {
            rec.render_handler = Some(handler);
        }
    }

    pub fn on_submit(&mut self, form_id: &str, handler: String) {
        if let Some(rec) = self.get_mut(form_id) {
            rec.on_submit = Some(handler);
        }
    }

    /// Publish the full form tree, same shape as tray snapshots.
    pub fn flush(&mut self, out: &Outbound, form_id: &str, tree: UiNode) -> Result<(), String> {
        tree.validate()?;

        let Some(rec) = self.get_mut(form_id) else {
            return Err(format!("unknown form {form_id}"));
        };

        out.send(
            server::FORM_UPDATED,
            json!({
                "formId": form_id,
                "name": rec.name,
                "tree": tree,
            }),
        );
        Ok(())
    }

    pub fn reset(&self, out: &Outbound, form_id: &str) {
        out.send(server::FORM_RESET, json!({ "formId": form_id }));
    }

    /// Resolve the submit callback for a `form:submit` event.
    pub fn submit_handler(&self, form_id: &str) -> Option<String> {
        self.forms
            .iter()
            .find(|(id, _)| id == form_id)
            .and_then(|(_, rec)| rec.on_submit.clone())
    }

    pub fn renderable(&self) -> Vec<String> {
        self.forms
            .iter()
            .filter(|(_, rec)| rec.render_handler.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.forms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::events::{EventBus, InMemoryEventBus};
    use std::sync::Arc;

    #[test]
    fn test_submit_handler_lookup() {
        let mut forms = FormManager::default();
        let id = forms.new_form("settings".into());
        assert_eq!(forms.submit_handler(&id), None);

        forms.on_submit(&id, "h-submit".into());
        assert_eq!(forms.submit_handler(&id), Some("h-submit".to_string()));
        assert_eq!(forms.submit_handler("other"), None);
    }

    #[test]
    fn test_flush_publishes_form_snapshot() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut rx = bus.outbound();
        let out = Outbound::new(bus.clone() as Arc<dyn EventBus>, "acme.test");

        let mut forms = FormManager::default();
        let id = forms.new_form("settings".into());
        forms.set_render(&id, "render1".into());
        assert_eq!(forms.renderable(), vec![id.clone()]);

        let tree: UiNode = serde_json::from_value(serde_json::json!({
            "type": "stack",
            "props": {},
            "children": [
                {"type": "input", "props": {"fieldRef": "title", "onChange": "h1"}}
            ]
        }))
        .unwrap();
        forms.flush(&out, &id, tree).unwrap();

        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.event_type, "form:updated");
        assert_eq!(evt.payload["formId"], id.as_str());
        assert_eq!(evt.payload["tree"]["children"][0]["props"]["fieldRef"], "title");
    }

    #[test]
    fn test_reset_emits_event() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut rx = bus.outbound();
        let out = Outbound::new(bus.clone() as Arc<dyn EventBus>, "acme.test");

        let mut forms = FormManager::default();
        let id = forms.new_form("settings".into());
        forms.reset(&out, &id);

        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.event_type, "form:reset");
        assert_eq!(evt.payload["formId"], id.as_str());
    }
}
