//! Cron entries backing the `$cron` binding.
//!
//! Entries are keyed by a plugin-chosen id. Parsing and next-fire
//! computation live here; actual dispatch goes through the plugin's
//! scheduler so fires are serialized with every other VM task. `stop()`
//! pauses dispatch per plugin: paused entries keep re-arming (so `start()`
//! resumes cleanly) but their callbacks are suppressed, and a fire already
//! on the scheduler queue completes.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;

use super::error::{PluginError, PluginResult};

#[derive(Debug)]
pub struct CronEntry {
    pub expr: String,
    pub schedule: Schedule,
    pub handler: String,
}

/// Cron state for one plugin.
#[derive(Default)]
pub struct CronManager {
    entries: HashMap<String, CronEntry>,
    paused: bool,
}

impl CronManager {
    /// Parse and register an entry. Five-field expressions are accepted by
    /// normalizing to the six-field form (seconds pinned to 0).
    pub fn add(&mut self, id: &str, expr: &str, handler: String) -> PluginResult<()> {
        let normalized = normalize_expression(expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| PluginError::CronInvalid {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;

        self.entries.insert(
            id.to_string(),
            CronEntry {
                expr: expr.to_string(),
                schedule,
                handler,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn handler(&self, id: &str) -> Option<String> {
        self.entries.get(id).map(|e| e.handler.clone())
    }

    /// Time until the entry's next fire, or `None` if the entry is gone or
    /// the schedule is exhausted.
    pub fn next_fire(&self, id: &str) -> Option<Duration> {
        let entry = self.entries.get(id)?;
        let next = entry.schedule.upcoming(Utc).next()?;
        (next - Utc::now()).to_std().ok().or(Some(Duration::ZERO))
    }

    pub fn start(&mut self) {
        self.paused = false;
    }

    pub fn stop(&mut self) {
        self.paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn normalize_expression(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accepts_five_and_six_field_expressions() {
        let mut cron = CronManager::default();
        cron.add("hourly", "0 * * * *", "h1".into()).unwrap();
        cron.add("every-second", "* * * * * *", "h2".into()).unwrap();

        assert!(cron.contains("hourly"));
        assert_eq!(cron.handler("every-second"), Some("h2".to_string()));
    }

    #[test]
    fn test_add_rejects_garbage() {
        let mut cron = CronManager::default();
        let err = cron.add("bad", "not a cron expr", "h".into()).unwrap_err();
        assert_eq!(err.kind(), "CronInvalid");
        assert!(!cron.contains("bad"));
    }

    #[test]
    fn test_next_fire_is_in_the_future() {
        let mut cron = CronManager::default();
        cron.add("tick", "* * * * * *", "h".into()).unwrap();

        let next = cron.next_fire("tick").unwrap();
        assert!(next <= Duration::from_secs(1));
        assert_eq!(cron.next_fire("missing"), None);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut cron = CronManager::default();
        assert!(!cron.is_paused());
        cron.stop();
        assert!(cron.is_paused());

        // Entries added while stopped register but stay suppressed.
        cron.add("tick", "* * * * * *", "h".into()).unwrap();
        assert!(cron.is_paused());

        cron.start();
        assert!(!cron.is_paused());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut cron = CronManager::default();
        cron.add("tick", "* * * * * *", "h".into()).unwrap();
        assert!(cron.remove("tick"));
        assert!(!cron.remove("tick"));
    }
}
