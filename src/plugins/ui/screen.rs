//! Screen navigation and toasts.
//!
//! Navigation requests and toasts flow outward; `screen:changed` events from
//! the client fan out to `onNavigate` subscribers.

use serde_json::json;

use super::super::events::{server, Outbound};

#[derive(Default)]
pub struct ScreenManager {
    navigate_handlers: Vec<String>,
}

impl ScreenManager {
    pub fn navigate_to(&self, out: &Outbound, path: &str) {
        out.send(server::SCREEN_NAVIGATE, json!({ "path": path }));
    }

    pub fn reload(&self, out: &Outbound) {
        out.send(server::SCREEN_RELOAD, json!({}));
    }

    pub fn on_navigate(&mut self, handler: String) {
        self.navigate_handlers.push(handler);
    }

    pub fn navigate_handlers(&self) -> &[String] {
        &self.navigate_handlers
    }

    pub fn clear(&mut self) {
        self.navigate_handlers.clear();
    }
}

/// Toast severity levels mirrored by the client.
pub fn send_toast(out: &Outbound, level: &str, message: &str) {
    let level = match level {
        "info" | "success" | "warning" | "error" => level,
        _ => "info",
    };
    out.send(server::TOAST, json!({ "level": level, "message": message }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::events::{EventBus, InMemoryEventBus};
    use std::sync::Arc;

    #[test]
    fn test_navigate_and_toast_events() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut rx = bus.outbound();
        let out = Outbound::new(bus.clone() as Arc<dyn EventBus>, "acme.test");

        let screen = ScreenManager::default();
        screen.navigate_to(&out, "/anime/21");
        send_toast(&out, "success", "Episode tracked");
        send_toast(&out, "bogus", "Defaults to info");

        assert_eq!(rx.try_recv().unwrap().payload["path"], "/anime/21");
        assert_eq!(rx.try_recv().unwrap().payload["level"], "success");
        assert_eq!(rx.try_recv().unwrap().payload["level"], "info");
    }
}
