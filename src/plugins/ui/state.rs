//! State cells and the effect engine.
//!
//! Cells hold a JSON value and a monotonic version counter. `set` applies
//! synchronously (a following `get` observes the new value) but effect
//! execution is deferred: each applied set appends a *batch*, and at the end
//! of the current scheduler task every batch runs its dependent effects at
//! most once. Sets whose value is structurally equal to the current one are
//! skipped entirely. Sets issued from inside an effect land in a fresh batch
//! list picked up by a follow-up tick, so cascades never run synchronously.

use std::collections::HashMap;

use serde_json::Value;

/// A single observable cell.
#[derive(Debug)]
pub struct Cell {
    pub value: Value,
    pub version: u32,
}

/// A registered effect: re-runs whenever a dependency cell changes.
#[derive(Debug, Clone)]
pub struct EffectRecord {
    pub id: u32,
    pub handler: String,
    pub deps: Vec<u32>,
}

/// One applied set: the cells whose versions advanced together.
pub type Batch = Vec<u32>;

/// Cell table + effect registry for one plugin context.
#[derive(Default)]
pub struct StateCells {
    cells: HashMap<u32, Cell>,
    effects: Vec<EffectRecord>,
    batches: Vec<Batch>,
    next_cell_id: u32,
    next_effect_id: u32,
}

impl StateCells {
    pub fn create(&mut self, initial: Value) -> u32 {
        self.next_cell_id += 1;
        let id = self.next_cell_id;
        self.cells.insert(
            id,
            Cell {
                value: initial,
                version: 0,
            },
        );
        id
    }

    pub fn get(&self, id: u32) -> Option<Value> {
        self.cells.get(&id).map(|c| c.value.clone())
    }

    pub fn version(&self, id: u32) -> Option<u32> {
        self.cells.get(&id).map(|c| c.version)
    }

    /// Apply a set. Structurally equal values are skipped; otherwise the
    /// value and version advance immediately and a batch is recorded.
    /// Returns whether the cell changed.
    pub fn set(&mut self, id: u32, value: Value) -> bool {
        let Some(cell) = self.cells.get_mut(&id) else {
            return false;
        };
        if cell.value == value {
            return false;
        }
        cell.value = value;
        cell.version += 1;
        self.batches.push(vec![id]);
        true
    }

    /// Register an effect over the given dependency cells.
    pub fn register_effect(&mut self, handler: String, deps: Vec<u32>) -> u32 {
        self.next_effect_id += 1;
        let id = self.next_effect_id;
        self.effects.push(EffectRecord { id, handler, deps });
        id
    }

    /// Take the batches accumulated so far. Sets applied after this call
    /// (e.g. from inside an effect) start a new list.
    pub fn take_batches(&mut self) -> Vec<Batch> {
        std::mem::take(&mut self.batches)
    }

    pub fn has_pending_batches(&self) -> bool {
        !self.batches.is_empty()
    }

    /// Effects dirtied by a batch, deduplicated, in registration order.
    pub fn dirty_effects(&self, batch: &Batch) -> Vec<EffectRecord> {
        self.effects
            .iter()
            .filter(|e| e.deps.iter().any(|d| batch.contains(d)))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.effects.clear();
        self.batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_is_synchronous_for_get() {
        let mut state = StateCells::default();
        let n = state.create(json!(0));

        assert!(state.set(n, json!(1)));
        assert_eq!(state.get(n), Some(json!(1)));
        assert_eq!(state.version(n), Some(1));
    }

    #[test]
    fn test_equal_set_is_skipped() {
        let mut state = StateCells::default();
        let n = state.create(json!({"a": [1, 2]}));

        assert!(!state.set(n, json!({"a": [1, 2]})));
        assert_eq!(state.version(n), Some(0));
        assert!(state.take_batches().is_empty());
    }

    #[test]
    fn test_each_set_forms_a_batch() {
        let mut state = StateCells::default();
        let n = state.create(json!(0));
        let eff = state.register_effect("h1".to_string(), vec![n]);

        for i in 1..=5 {
            state.set(n, json!(i));
        }

        let batches = state.take_batches();
        assert_eq!(batches.len(), 5);
        for batch in &batches {
            let dirty = state.dirty_effects(batch);
            assert_eq!(dirty.len(), 1);
            assert_eq!(dirty[0].id, eff);
        }
        // Taking drains the list.
        assert!(state.take_batches().is_empty());
    }

    #[test]
    fn test_dirty_effects_deduped_per_batch() {
        let mut state = StateCells::default();
        let a = state.create(json!(0));
        let b = state.create(json!(0));
        state.register_effect("h1".to_string(), vec![a, b]);
        state.register_effect("h2".to_string(), vec![b]);

        // A batch containing both deps still yields each effect once.
        let dirty = state.dirty_effects(&vec![a, b]);
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty[0].handler, "h1");
        assert_eq!(dirty[1].handler, "h2");

        let dirty = state.dirty_effects(&vec![a]);
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].handler, "h1");
    }
}
