//! Hook manager: named host extension points plugins can intercept.
//!
//! Host subsystems call [`HookManager::dispatch`] with a mutable event
//! object before acting on it. For each registration, in registration
//! order, a task is enqueued on the owning plugin's scheduler; the
//! dispatcher blocks until the callback acknowledges with `event.next()`
//! (carrying its mutations) or the per-hook deadline passes. Mutations are
//! visible to subsequent plugins and, finally, to the caller. A callback
//! that never acknowledges is skipped, logged, and charged against the
//! plugin's exception budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use super::scheduler::{HookSignal, Scheduler, Task};

/// Default time a hook callback has to call `event.next()`.
pub const HOOK_DISPATCH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct HookRegistration {
    pub id: u32,
    pub plugin_id: String,
    pub handler: String,
    pub scheduler: Scheduler,
}

/// Process-wide registry of hook subscriptions.
pub struct HookManager {
    hooks: Mutex<HashMap<String, Vec<HookRegistration>>>,
    next_registration: AtomicU32,
    next_dispatch: AtomicU32,
    timeout: Duration,
}

impl HookManager {
    pub fn new() -> Self {
        Self::with_timeout(HOOK_DISPATCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            hooks: Mutex::new(HashMap::new()),
            next_registration: AtomicU32::new(1),
            next_dispatch: AtomicU32::new(1),
            timeout,
        }
    }

    /// Subscribe a plugin callback to a named hook. Returns a cancel id.
    pub fn register(
        &self,
        hook_name: &str,
        plugin_id: &str,
        handler: &str,
        scheduler: Scheduler,
    ) -> u32 {
        let id = self.next_registration.fetch_add(1, Ordering::SeqCst);
        let mut hooks = self.hooks.lock().unwrap();
        hooks.entry(hook_name.to_string()).or_default().push(HookRegistration {
            id,
            plugin_id: plugin_id.to_string(),
            handler: handler.to_string(),
            scheduler,
        });
        id
    }

    /// Remove one registration by cancel id.
    pub fn unregister(&self, registration_id: u32) {
        let mut hooks = self.hooks.lock().unwrap();
        for regs in hooks.values_mut() {
            regs.retain(|r| r.id != registration_id);
        }
    }

    /// Remove every registration owned by a plugin, used on unload.
    pub fn unregister_plugin(&self, plugin_id: &str) {
        let mut hooks = self.hooks.lock().unwrap();
        for regs in hooks.values_mut() {
            regs.retain(|r| r.plugin_id != plugin_id);
        }
    }

    pub fn registration_count(&self, hook_name: &str) -> usize {
        self.hooks
            .lock()
            .unwrap()
            .get(hook_name)
            .map_or(0, |regs| regs.len())
    }

    /// Dispatch an event through every subscriber, in registration order.
    /// Synchronous with respect to the caller: returns the final event once
    /// every callback has acknowledged, failed, or timed out.
    pub fn dispatch(&self, hook_name: &str, event: Value) -> Value {
        let registrations: Vec<HookRegistration> = {
            let hooks = self.hooks.lock().unwrap();
            hooks.get(hook_name).cloned().unwrap_or_default()
        };

        let mut event = event;

        for reg in registrations {
            let dispatch_id = self.next_dispatch.fetch_add(1, Ordering::SeqCst);
            let (done, ack) = mpsc::sync_channel(1);

            let scheduled = reg.scheduler.schedule(Task::InvokeHook {
                handler: reg.handler.clone(),
                dispatch_id,
                event: event.clone(),
                done,
            });
            if !scheduled {
                continue;
            }

            match ack.recv_timeout(self.timeout) {
                Ok(HookSignal::Next(mutated)) => {
                    event = mutated;
                }
                Ok(HookSignal::NoAck) => {
                    tracing::warn!(
                        hook = hook_name,
                        plugin = %reg.plugin_id,
                        "hook callback returned without calling next(), skipping"
                    );
                    reg.scheduler.note_exception();
                }
                Ok(HookSignal::Failed) => {
                    // The worker already logged and counted the exception;
                    // the callback's mutations are dropped.
                    tracing::warn!(
                        hook = hook_name,
                        plugin = %reg.plugin_id,
                        "hook callback failed, mutations dropped"
                    );
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!(
                        hook = hook_name,
                        plugin = %reg.plugin_id,
                        "hook callback deadline passed, skipping"
                    );
                    reg.scheduler.note_exception();
                }
            }
        }

        event
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}
