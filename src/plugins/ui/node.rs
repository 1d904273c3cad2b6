//! Virtual UI nodes for retained-mode surfaces.
//!
//! Trays and forms render full trees of these nodes on every update; the
//! client diffs against its previous snapshot. Node kinds are a closed set;
//! props are an open JSON map so new styling knobs do not require a protocol
//! change. Callback props never reach this layer: the prelude replaces
//! functions with handler-id strings before the tree crosses the op
//! boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of node kinds the client knows how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Div,
    Flex,
    Stack,
    Text,
    Button,
    Input,
    Select,
    Checkbox,
    RadioGroup,
    Switch,
}

/// A node in a rendered tree: (kind, props, children).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiNode {
    #[serde(rename = "type")]
    pub kind: NodeKind,

    #[serde(default)]
    pub props: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<UiNode>,
}

impl UiNode {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            props: Map::new(),
            children: Vec::new(),
        }
    }

    /// Validate a tree received from the VM: interactive nodes must carry
    /// ids so the client can address field values and handler invocations.
    pub fn validate(&self) -> Result<(), String> {
        match self.kind {
            NodeKind::Input
            | NodeKind::Select
            | NodeKind::Checkbox
            | NodeKind::RadioGroup
            | NodeKind::Switch => {
                if !self.props.get("fieldRef").map_or(false, |v| v.is_string()) {
                    return Err(format!("{:?} node requires a fieldRef prop", self.kind));
                }
            }
            _ => {}
        }

        for child in &self.children {
            child.validate()?;
        }
        Ok(())
    }

    /// Collect every handler id referenced by this tree, used to retire
    /// stale handlers after a re-render.
    pub fn handler_ids(&self, out: &mut Vec<String>) {
        for (key, value) in &self.props {
            if key.starts_with("on") {
                if let Some(id) = value.as_str() {
                    out.push(id.to_string());
                }
            }
        }
        for child in &self.children {
            child.handler_ids(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> UiNode {
        serde_json::from_value(json!({
            "type": "flex",
            "props": {"direction": "column", "gap": 2},
            "children": [
                {"type": "text", "props": {"text": "Up next"}},
                {
                    "type": "button",
                    "props": {"label": "Play", "intent": "primary", "onClick": "h1"}
                },
                {
                    "type": "input",
                    "props": {"fieldRef": "search", "placeholder": "Filter...", "onChange": "h2"}
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_structure() {
        let node = tree();
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "flex");
        assert_eq!(json["children"][1]["props"]["onClick"], "h1");

        let back: UiNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_validate_requires_field_ref() {
        let node = tree();
        assert!(node.validate().is_ok());

        let bad: UiNode = serde_json::from_value(json!({
            "type": "checkbox",
            "props": {"label": "Enabled"}
        }))
        .unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_handler_id_collection() {
        let node = tree();
        let mut ids = Vec::new();
        node.handler_ids(&mut ids);
        assert_eq!(ids, vec!["h1", "h2"]);
    }
}
