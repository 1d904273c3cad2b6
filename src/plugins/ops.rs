//! VM ops for the plugin host API.
//!
//! Every `$`-global the prelude installs bottoms out in one of these ops.
//! Ops run on the scheduler worker thread (inside a VM invocation) and are
//! registered with deno_core via the `aozora_plugin` extension together
//! with the JS prelude. Host bindings check the plugin's permission scopes
//! before doing anything; missing scope throws PermissionDenied into the
//! script, missing host module throws Unavailable.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use deno_core::{error::AnyError, op2, OpState};
use serde_json::json;

use super::app_context::AppContext;
use super::error::PluginError;
use super::fetch::{FetchPool, FetchRequest, IoTaskSet};
use super::hooks::HookManager;
use super::permissions::normalize_path;
use super::scheduler::{HookSignal, Task};
use super::storage::PluginStorage;
use super::ui::actions::{ActionProps, ActionSurface};
use super::ui::dom::PendingKind;
use super::ui::node::UiNode;
use super::ui::palette::{PaletteItem, PaletteOptions};
use super::ui::screen::send_toast;
use super::ui::tray::{TrayBadge, TrayEvent, TrayOptions};
use super::ui::Context;

/// Host-side facilities reachable from ops, stored in the VM's OpState next
/// to the `Rc<RefCell<Context>>`.
pub struct OpCtx {
    pub app: Arc<AppContext>,
    pub hooks: Arc<HookManager>,
    pub storage: RefCell<PluginStorage>,
    pub io: tokio::runtime::Handle,
    pub fetch: FetchPool,
    pub io_tasks: Arc<IoTaskSet>,
}

fn plugin_ctx(state: &OpState) -> Rc<RefCell<Context>> {
    state.borrow::<Rc<RefCell<Context>>>().clone()
}

/// Timeout applied to host-side async work resolved through `Settle`.
const IO_PENDING_TTL: Duration = Duration::from_secs(120);

// ─── UI registration ─────────────────────────────────────────────────────

/// `$ui.register(fn)`. Calling it again tears the prior Context down and
/// re-runs the entry point with a fresh one.
#[op2(fast)]
fn op_ui_register(state: &mut OpState) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut ctx = ctx_rc.borrow_mut();
    if ctx.entry_registered {
        ctx.reset_surfaces();
        ctx.scheduler.schedule(Task::Invoke {
            handler: "$runEntry".to_string(),
            args: vec![],
        });
    }
    ctx.entry_registered = true;
    Ok(())
}

/// Fresh uuid for request/pending ids generated in the prelude.
#[op2]
#[string]
fn op_new_id(_state: &mut OpState) -> Result<String, AnyError> {
    Ok(uuid::Uuid::new_v4().to_string())
}

#[op2(fast)]
fn op_log(state: &mut OpState, #[string] level: String, #[string] message: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let plugin_id = ctx_rc.borrow().plugin.id.clone();
    match level.as_str() {
        "error" => tracing::error!(plugin = %plugin_id, "{message}"),
        "warn" => tracing::warn!(plugin = %plugin_id, "{message}"),
        "debug" => tracing::debug!(plugin = %plugin_id, "{message}"),
        _ => tracing::info!(plugin = %plugin_id, "{message}"),
    }
    Ok(())
}

// ─── State cells & effects ───────────────────────────────────────────────

#[op2]
fn op_state_create(state: &mut OpState, #[serde] initial: serde_json::Value) -> Result<u32, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let id = ctx_rc.borrow_mut().state.create(initial);
    Ok(id)
}

#[op2]
#[serde]
fn op_state_get(state: &mut OpState, cell_id: u32) -> Result<serde_json::Value, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let value = ctx_rc.borrow().state.get(cell_id);
    value.ok_or_else(|| anyhow::anyhow!("unknown state cell {cell_id}"))
}

#[op2]
fn op_state_set(state: &mut OpState, cell_id: u32, #[serde] value: serde_json::Value) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().state.set(cell_id, value);
    Ok(())
}

#[op2]
fn op_effect_register(
    state: &mut OpState,
    #[string] handler: String,
    #[serde] deps: Vec<u32>,
) -> Result<u32, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let id = ctx_rc.borrow_mut().state.register_effect(handler, deps);
    Ok(id)
}

// ─── Timers & sleep ──────────────────────────────────────────────────────

#[op2(fast)]
fn op_timer_start(
    state: &mut OpState,
    #[string] handler: String,
    delay_ms: u32,
    repeating: bool,
) -> Result<u32, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut ctx = ctx_rc.borrow_mut();
    let delay = Duration::from_millis(delay_ms as u64);
    let interval = repeating.then_some(delay);
    let timer_id = ctx.timers.register(handler, interval);
    ctx.scheduler
        .schedule_delayed(Task::TimerFire { timer_id }, delay);
    Ok(timer_id)
}

#[op2(fast)]
fn op_timer_cancel(state: &mut OpState, timer_id: u32) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().timers.cancel(timer_id);
    Ok(())
}

/// `$sleep(ms)`: a pending promise settled by a delayed task.
#[op2(fast)]
fn op_sleep(state: &mut OpState, #[string] pending_id: String, delay_ms: u32) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut ctx = ctx_rc.borrow_mut();
    let delay = Duration::from_millis(delay_ms as u64);
    ctx.dom
        .pending
        .register(&pending_id, PendingKind::Sleep, delay + IO_PENDING_TTL);
    ctx.scheduler.schedule_delayed(
        Task::Settle {
            pending_id,
            ok: true,
            value: serde_json::Value::Null,
        },
        delay,
    );
    Ok(())
}

// ─── Fetch ───────────────────────────────────────────────────────────────

#[op2]
fn op_fetch(
    state: &mut OpState,
    #[string] pending_id: String,
    #[serde] request: FetchRequest,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let op = state.borrow::<OpCtx>();

    let scheduler = {
        let mut ctx = ctx_rc.borrow_mut();
        ctx.dom
            .pending
            .register(&pending_id, PendingKind::Fetch, IO_PENDING_TTL);
        ctx.scheduler.clone()
    };

    op.fetch
        .spawn(&op.io, scheduler, &op.io_tasks, pending_id, request);
    Ok(())
}

// ─── Event listeners ─────────────────────────────────────────────────────

#[op2]
#[string]
fn op_listener_add(
    state: &mut OpState,
    #[serde] listen_to: Vec<String>,
    #[string] handler: String,
) -> Result<String, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let result = ctx_rc.borrow_mut().listeners.register(listen_to, handler);
    Ok(result)
}

#[op2(fast)]
fn op_listener_remove(state: &mut OpState, #[string] listener_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().listeners.unregister(&listener_id);
    Ok(())
}

// ─── Trays ───────────────────────────────────────────────────────────────

#[op2]
#[string]
fn op_tray_new(state: &mut OpState, #[serde] options: TrayOptions) -> Result<String, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let result = ctx_rc.borrow_mut().trays.new_tray(options);
    Ok(result)
}

#[op2(fast)]
fn op_tray_set_render(
    state: &mut OpState,
    #[string] tray_id: String,
    #[string] handler: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().trays.set_render(&tray_id, handler);
    Ok(())
}

/// `tray.update()`: enqueue a render pass on the scheduler.
#[op2(fast)]
fn op_tray_update(state: &mut OpState, #[string] tray_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.scheduler.schedule(Task::Invoke {
        handler: "$renderTray".to_string(),
        args: vec![json!(tray_id)],
    });
    Ok(())
}

/// Receives the tree produced by one render pass and publishes the snapshot.
#[op2]
fn op_tray_flush(
    state: &mut OpState,
    #[string] tray_id: String,
    #[serde] tree: UiNode,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.trays
        .flush(&ctx.out, &tray_id, tree)
        .map_err(|e| anyhow::anyhow!(e))
}

#[op2(fast)]
fn op_tray_open(state: &mut OpState, #[string] tray_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.trays.open(&ctx.out, &tray_id);
    Ok(())
}

#[op2(fast)]
fn op_tray_close(state: &mut OpState, #[string] tray_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.trays.close(&ctx.out, &tray_id);
    Ok(())
}

#[op2]
fn op_tray_badge(
    state: &mut OpState,
    #[string] tray_id: String,
    #[serde] badge: Option<TrayBadge>,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.trays.set_badge(&ctx.out, &tray_id, badge);
    Ok(())
}

#[op2(fast)]
fn op_tray_set_icon(
    state: &mut OpState,
    #[string] tray_id: String,
    #[string] icon_url: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.trays.set_icon(&ctx.out, &tray_id, icon_url);
    Ok(())
}

#[op2(fast)]
fn op_tray_on(
    state: &mut OpState,
    #[string] tray_id: String,
    #[string] event: String,
    #[string] handler: String,
) -> Result<(), AnyError> {
    let event = TrayEvent::parse(&event)
        .ok_or_else(|| anyhow::anyhow!("unknown tray event '{event}'"))?;
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().trays.subscribe(&tray_id, event, handler);
    Ok(())
}

// ─── Forms ───────────────────────────────────────────────────────────────

#[op2]
#[string]
fn op_form_new(state: &mut OpState, #[string] name: String) -> Result<String, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let result = ctx_rc.borrow_mut().forms.new_form(name);
    Ok(result)
}

#[op2(fast)]
fn op_form_set_render(
    state: &mut OpState,
    #[string] form_id: String,
    #[string] handler: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().forms.set_render(&form_id, handler);
    Ok(())
}

#[op2(fast)]
fn op_form_update(state: &mut OpState, #[string] form_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.scheduler.schedule(Task::Invoke {
        handler: "$renderForm".to_string(),
        args: vec![json!(form_id)],
    });
    Ok(())
}

#[op2]
fn op_form_flush(
    state: &mut OpState,
    #[string] form_id: String,
    #[serde] tree: UiNode,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.forms
        .flush(&ctx.out, &form_id, tree)
        .map_err(|e| anyhow::anyhow!(e))
}

#[op2(fast)]
fn op_form_on_submit(
    state: &mut OpState,
    #[string] form_id: String,
    #[string] handler: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().forms.on_submit(&form_id, handler);
    Ok(())
}

#[op2(fast)]
fn op_form_reset(state: &mut OpState, #[string] form_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.forms.reset(&ctx.out, &form_id);
    Ok(())
}

// ─── Actions ─────────────────────────────────────────────────────────────

#[op2]
#[string]
fn op_action_new(
    state: &mut OpState,
    #[serde] surface: ActionSurface,
    #[serde] props: ActionProps,
) -> Result<String, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let result = ctx_rc.borrow_mut().actions.new_action(surface, props);
    Ok(result)
}

#[op2(fast)]
fn op_action_on_click(
    state: &mut OpState,
    #[string] action_id: String,
    #[string] handler: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().actions.on_click(&action_id, handler);
    Ok(())
}

#[op2(fast)]
fn op_action_mount(state: &mut OpState, #[string] action_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.actions.mount(&ctx.out, &action_id);
    Ok(())
}

#[op2(fast)]
fn op_action_unmount(state: &mut OpState, #[string] action_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.actions.unmount(&ctx.out, &action_id);
    Ok(())
}

#[op2(fast)]
fn op_action_set_label(
    state: &mut OpState,
    #[string] action_id: String,
    #[string] label: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.actions.set_label(&ctx.out, &action_id, label);
    Ok(())
}

// ─── Command palette ─────────────────────────────────────────────────────

#[op2]
#[string]
fn op_palette_new(state: &mut OpState, #[serde] options: PaletteOptions) -> Result<String, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let result = ctx_rc.borrow_mut().palettes.new_palette(options);
    Ok(result)
}

#[op2]
fn op_palette_set_items(
    state: &mut OpState,
    #[string] palette_id: String,
    #[serde] items: Vec<PaletteItem>,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.palettes.set_items(&ctx.out, &palette_id, items);
    Ok(())
}

#[op2(fast)]
fn op_palette_open(state: &mut OpState, #[string] palette_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.palettes.open(&ctx.out, &palette_id);
    Ok(())
}

#[op2(fast)]
fn op_palette_close(state: &mut OpState, #[string] palette_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.palettes.close(&ctx.out, &palette_id);
    Ok(())
}

// ─── Screen & toast ──────────────────────────────────────────────────────

#[op2(fast)]
fn op_screen_navigate(state: &mut OpState, #[string] path: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.screen.navigate_to(&ctx.out, &path);
    Ok(())
}

#[op2(fast)]
fn op_screen_reload(state: &mut OpState) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.screen.reload(&ctx.out);
    Ok(())
}

#[op2(fast)]
fn op_screen_on_navigate(state: &mut OpState, #[string] handler: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().screen.on_navigate(handler);
    Ok(())
}

#[op2(fast)]
fn op_toast(state: &mut OpState, #[string] level: String, #[string] message: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    send_toast(&ctx.out, &level, &message);
    Ok(())
}

// ─── DOM proxy ───────────────────────────────────────────────────────────

#[op2(fast)]
fn op_dom_query(
    state: &mut OpState,
    #[string] pending_id: String,
    #[string] selector: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.dom.query(&ctx.out, &pending_id, &selector);
    Ok(())
}

#[op2(fast)]
fn op_dom_query_one(
    state: &mut OpState,
    #[string] pending_id: String,
    #[string] selector: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.dom.query_one(&ctx.out, &pending_id, &selector);
    Ok(())
}

#[op2(fast)]
fn op_dom_create(
    state: &mut OpState,
    #[string] pending_id: String,
    #[string] tag_name: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.dom.create(&ctx.out, &pending_id, &tag_name);
    Ok(())
}

#[op2]
#[string]
fn op_dom_observe(
    state: &mut OpState,
    #[string] selector: String,
    #[string] handler: String,
) -> Result<String, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    Ok(ctx.dom.observe(&ctx.out, &selector, handler))
}

#[op2(fast)]
fn op_dom_stop_observe(state: &mut OpState, #[string] observer_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.dom.stop_observe(&ctx.out, &observer_id);
    Ok(())
}

#[op2(fast)]
fn op_dom_refetch_observer(state: &mut OpState, #[string] observer_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.dom.refetch(&ctx.out, &observer_id);
    Ok(())
}

/// A manipulation expecting a reply.
#[op2]
fn op_dom_request(
    state: &mut OpState,
    #[string] pending_id: String,
    #[string] element_id: String,
    #[string] action: String,
    #[serde] params: serde_json::Value,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.dom
        .manipulate_with_reply(&ctx.out, &pending_id, &element_id, &action, params);
    Ok(())
}

/// A fire-and-forget manipulation.
#[op2]
fn op_dom_send(
    state: &mut OpState,
    #[string] element_id: String,
    #[string] action: String,
    #[serde] params: serde_json::Value,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let ctx = ctx_rc.borrow();
    ctx.dom.manipulate(&ctx.out, &element_id, &action, params);
    Ok(())
}

#[op2]
#[string]
fn op_dom_add_listener(
    state: &mut OpState,
    #[string] element_id: String,
    #[string] event_type: String,
    #[string] handler: String,
) -> Result<String, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    Ok(ctx
        .dom
        .add_event_listener(&ctx.out, &element_id, &event_type, handler))
}

#[op2(fast)]
fn op_dom_remove_listener(state: &mut OpState, #[string] listener_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut guard = ctx_rc.borrow_mut();
    let ctx = &mut *guard;
    ctx.dom.remove_event_listener(&ctx.out, &listener_id);
    Ok(())
}

#[op2(fast)]
fn op_dom_on_ready(state: &mut OpState, #[string] handler: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().dom.on_ready(handler);
    Ok(())
}

// ─── Hooks ───────────────────────────────────────────────────────────────

#[op2(fast)]
fn op_hook_register(
    state: &mut OpState,
    #[string] hook_name: String,
    #[string] handler: String,
) -> Result<u32, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let op = state.borrow::<OpCtx>();
    let ctx = ctx_rc.borrow();
    let id = op.hooks.register(
        &hook_name,
        &ctx.plugin.id,
        &handler,
        ctx.scheduler.clone(),
    );
    Ok(id)
}

#[op2(fast)]
fn op_hook_unregister(state: &mut OpState, registration_id: u32) -> Result<(), AnyError> {
    let op = state.borrow::<OpCtx>();
    op.hooks.unregister(registration_id);
    Ok(())
}

/// `event.next()` inside a hook callback: release the blocked dispatcher
/// with the (possibly mutated) event.
#[op2]
fn op_hook_next(state: &mut OpState, dispatch_id: u32, #[serde] event: serde_json::Value) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let waiter = ctx_rc.borrow_mut().hook_waiters.remove(&dispatch_id);
    if let Some(waiter) = waiter {
        let _ = waiter.send(HookSignal::Next(event));
    }
    Ok(())
}

// ─── Cron ────────────────────────────────────────────────────────────────

#[op2(fast)]
fn op_cron_add(
    state: &mut OpState,
    #[string] entry_id: String,
    #[string] expr: String,
    #[string] handler: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let mut ctx = ctx_rc.borrow_mut();
    ctx.plugin.permissions.check("cron")?;
    ctx.cron.add(&entry_id, &expr, handler)?;
    if let Some(delay) = ctx.cron.next_fire(&entry_id) {
        ctx.scheduler
            .schedule_delayed(Task::CronFire { entry_id }, delay);
    }
    Ok(())
}

#[op2(fast)]
fn op_cron_remove(state: &mut OpState, #[string] entry_id: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().cron.remove(&entry_id);
    Ok(())
}

#[op2(fast)]
fn op_cron_start(state: &mut OpState) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().cron.start();
    Ok(())
}

#[op2(fast)]
fn op_cron_stop(state: &mut OpState) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().cron.stop();
    Ok(())
}

// ─── Storage ($storage) ──────────────────────────────────────────────────

fn check_scope(state: &OpState, scope: &str) -> Result<(), AnyError> {
    let ctx_rc = state.borrow::<Rc<RefCell<Context>>>();
    ctx_rc.borrow().plugin.permissions.check(scope)?;
    Ok(())
}

#[op2]
#[serde]
fn op_storage_get(state: &mut OpState, #[string] key: String) -> Result<Option<serde_json::Value>, AnyError> {
    check_scope(state, "storage")?;
    let op = state.borrow::<OpCtx>();
    Ok(op.storage.borrow().get(&key))
}

#[op2]
fn op_storage_set(state: &mut OpState, #[string] key: String, #[serde] value: serde_json::Value) -> Result<(), AnyError> {
    check_scope(state, "storage")?;
    let op = state.borrow::<OpCtx>();
    op.storage.borrow_mut().set(&key, value)?;
    Ok(())
}

#[op2(fast)]
fn op_storage_remove(state: &mut OpState, #[string] key: String) -> Result<(), AnyError> {
    check_scope(state, "storage")?;
    let op = state.borrow::<OpCtx>();
    op.storage.borrow_mut().remove(&key)?;
    Ok(())
}

#[op2]
#[serde]
fn op_storage_keys(state: &mut OpState) -> Result<Vec<String>, AnyError> {
    check_scope(state, "storage")?;
    let op = state.borrow::<OpCtx>();
    Ok(op.storage.borrow().keys())
}

#[op2(fast)]
fn op_storage_has(state: &mut OpState, #[string] key: String) -> Result<bool, AnyError> {
    check_scope(state, "storage")?;
    let op = state.borrow::<OpCtx>();
    Ok(op.storage.borrow().has(&key))
}

#[op2(fast)]
fn op_storage_clear(state: &mut OpState) -> Result<(), AnyError> {
    check_scope(state, "storage")?;
    let op = state.borrow::<OpCtx>();
    op.storage.borrow_mut().clear()?;
    Ok(())
}

// ─── In-memory store ($store) ────────────────────────────────────────────

#[op2]
#[serde]
fn op_store_get(state: &mut OpState, #[string] key: String) -> Result<Option<serde_json::Value>, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let value = ctx_rc.borrow().store.get(&key).cloned();
    Ok(value)
}

#[op2]
fn op_store_set(state: &mut OpState, #[string] key: String, #[serde] value: serde_json::Value) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().store.insert(key, value);
    Ok(())
}

#[op2(fast)]
fn op_store_has(state: &mut OpState, #[string] key: String) -> Result<bool, AnyError> {
    let ctx_rc = plugin_ctx(state);
    let result = ctx_rc.borrow().store.contains_key(&key);
    Ok(result)
}

#[op2(fast)]
fn op_store_delete(state: &mut OpState, #[string] key: String) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().store.remove(&key);
    Ok(())
}

#[op2(fast)]
fn op_store_clear(state: &mut OpState) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    ctx_rc.borrow_mut().store.clear();
    Ok(())
}

// ─── Anilist ($anilist) ──────────────────────────────────────────────────

#[op2]
#[serde]
fn op_anilist_anime(state: &mut OpState, media_id: i32) -> Result<serde_json::Value, AnyError> {
    check_scope(state, "anilist")?;
    let op = state.borrow::<OpCtx>();
    let platform = AppContext::require(op.app.anilist_platform(), "anilist")?;
    Ok(platform.anime(media_id as i64)?)
}

#[op2]
#[serde]
fn op_anilist_anime_collection(state: &mut OpState) -> Result<serde_json::Value, AnyError> {
    check_scope(state, "anilist")?;
    let op = state.borrow::<OpCtx>();
    let platform = AppContext::require(op.app.anilist_platform(), "anilist")?;
    Ok(platform.anime_collection()?)
}

#[op2]
#[serde]
fn op_anilist_manga_collection(state: &mut OpState) -> Result<serde_json::Value, AnyError> {
    check_scope(state, "anilist")?;
    let op = state.borrow::<OpCtx>();
    let platform = AppContext::require(op.app.anilist_platform(), "anilist")?;
    Ok(platform.manga_collection()?)
}

#[op2]
#[serde]
fn op_anilist_update_entry(state: &mut OpState, #[serde] payload: serde_json::Value) -> Result<serde_json::Value, AnyError> {
    check_scope(state, "anilist")?;
    let op = state.borrow::<OpCtx>();
    let platform = AppContext::require(op.app.anilist_platform(), "anilist")?;
    Ok(platform.update_entry(payload)?)
}

// ─── Database ($database) ────────────────────────────────────────────────

#[op2]
#[serde]
fn op_db_local_files(state: &mut OpState) -> Result<serde_json::Value, AnyError> {
    check_scope(state, "database")?;
    let op = state.borrow::<OpCtx>();
    let db = AppContext::require(op.app.database(), "database")?;
    Ok(db.local_files()?)
}

#[op2]
#[serde]
fn op_db_anime_entry(state: &mut OpState, media_id: i32) -> Result<serde_json::Value, AnyError> {
    check_scope(state, "database")?;
    let op = state.borrow::<OpCtx>();
    let db = AppContext::require(op.app.database(), "database")?;
    Ok(db.anime_entry(media_id as i64)?)
}

// ─── Playback (ctx.playback) ─────────────────────────────────────────────

#[op2(fast)]
fn op_playback_play(state: &mut OpState, #[string] path: String) -> Result<(), AnyError> {
    check_scope(state, "playback")?;
    let op = state.borrow::<OpCtx>();
    let playback = AppContext::require(op.app.playback_manager(), "playback")?;
    playback.play(&path)?;
    Ok(())
}

#[op2]
#[serde]
fn op_playback_status(state: &mut OpState) -> Result<serde_json::Value, AnyError> {
    check_scope(state, "playback")?;
    let op = state.borrow::<OpCtx>();
    let playback = AppContext::require(op.app.playback_manager(), "playback")?;
    Ok(playback.status()?)
}

// ─── App ($app) ──────────────────────────────────────────────────────────

#[op2]
#[string]
fn op_app_version(_state: &mut OpState) -> Result<String, AnyError> {
    Ok(env!("CARGO_PKG_VERSION").to_string())
}

#[op2(fast)]
fn op_app_refresh_anime_collection(state: &mut OpState) -> Result<(), AnyError> {
    let op = state.borrow::<OpCtx>();
    let refresh = AppContext::require(op.app.on_refresh_anime_collection(), "anime collection")?;
    refresh();
    Ok(())
}

#[op2(fast)]
fn op_app_refresh_manga_collection(state: &mut OpState) -> Result<(), AnyError> {
    let op = state.borrow::<OpCtx>();
    let refresh = AppContext::require(op.app.on_refresh_manga_collection(), "manga collection")?;
    refresh();
    Ok(())
}

#[op2]
#[serde]
fn op_app_library_paths(state: &mut OpState) -> Result<Vec<String>, AnyError> {
    let op = state.borrow::<OpCtx>();
    let paths = AppContext::require(op.app.library_paths(), "library paths")?;
    Ok(paths
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect())
}

// ─── OS ($os / $osExtra) ─────────────────────────────────────────────────

#[op2]
#[string]
fn op_os_platform(_state: &mut OpState) -> Result<String, AnyError> {
    Ok(std::env::consts::OS.to_string())
}

#[op2]
#[string]
fn op_os_home_dir(_state: &mut OpState) -> Result<Option<String>, AnyError> {
    Ok(dirs::home_dir().map(|p| p.to_string_lossy().into_owned()))
}

#[op2]
#[string]
fn op_os_temp_dir(_state: &mut OpState) -> Result<String, AnyError> {
    Ok(std::env::temp_dir().to_string_lossy().into_owned())
}

fn checked_path(state: &OpState, path: &str, write: bool) -> Result<PathBuf, AnyError> {
    let ctx_rc = state.borrow::<Rc<RefCell<Context>>>();
    let ctx = ctx_rc.borrow();
    let path = PathBuf::from(path);
    ctx.plugin.permissions.check_path(&path, write)?;
    Ok(path)
}

#[op2]
#[string]
fn op_os_read_file(state: &mut OpState, #[string] path: String) -> Result<String, AnyError> {
    let path = checked_path(state, &path, false)?;
    Ok(std::fs::read_to_string(path)?)
}

#[op2(fast)]
fn op_os_write_file(
    state: &mut OpState,
    #[string] path: String,
    #[string] contents: String,
) -> Result<(), AnyError> {
    let path = checked_path(state, &path, true)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

#[op2]
#[serde]
fn op_os_read_dir(state: &mut OpState, #[string] path: String) -> Result<Vec<serde_json::Value>, AnyError> {
    let path = checked_path(state, &path, false)?;
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "isDir": meta.is_dir(),
            "size": meta.len(),
        }));
    }
    Ok(entries)
}

#[op2]
#[serde]
fn op_os_stat(state: &mut OpState, #[string] path: String) -> Result<serde_json::Value, AnyError> {
    let path = checked_path(state, &path, false)?;
    let meta = std::fs::metadata(&path)?;
    Ok(json!({
        "isDir": meta.is_dir(),
        "isFile": meta.is_file(),
        "size": meta.len(),
        "readonly": meta.permissions().readonly(),
    }))
}

#[op2(fast)]
fn op_os_remove(state: &mut OpState, #[string] path: String) -> Result<(), AnyError> {
    let path = checked_path(state, &path, true)?;
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[op2(fast)]
fn op_os_mkdir(state: &mut OpState, #[string] path: String) -> Result<(), AnyError> {
    let path = checked_path(state, &path, true)?;
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// `$os.cmd(bin, args)`: allowlisted binaries only, output resolved through
/// a pending promise.
#[op2]
fn op_os_cmd(
    state: &mut OpState,
    #[string] pending_id: String,
    #[string] bin: String,
    #[serde] args: Vec<String>,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let op = state.borrow::<OpCtx>();

    let scheduler = {
        let mut ctx = ctx_rc.borrow_mut();
        ctx.plugin.permissions.check_binary(&bin)?;
        ctx.dom
            .pending
            .register(&pending_id, PendingKind::Command, IO_PENDING_TTL);
        ctx.scheduler.clone()
    };

    let handle = op.io.spawn(async move {
        let result = tokio::process::Command::new(&bin).args(&args).output().await;
        let (ok, value) = match result {
            Ok(output) => (
                true,
                json!({
                    "status": output.status.code(),
                    "stdout": String::from_utf8_lossy(&output.stdout),
                    "stderr": String::from_utf8_lossy(&output.stderr),
                }),
            ),
            Err(e) => (false, json!(e.to_string())),
        };
        scheduler.schedule(Task::Settle {
            pending_id,
            ok,
            value,
        });
    });
    op.io_tasks.track(handle.abort_handle());
    Ok(())
}

#[op2(fast)]
fn op_osextra_open_url(state: &mut OpState, #[string] url: String) -> Result<(), AnyError> {
    check_scope(state, "os")?;
    let parsed = url::Url::parse(&url).map_err(|e| anyhow::anyhow!("invalid URL: {e}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(anyhow::anyhow!("only http(s) URLs can be opened"));
    }
    open_with_system(&url)
}

#[op2(fast)]
fn op_osextra_open_path(state: &mut OpState, #[string] path: String) -> Result<(), AnyError> {
    let path = checked_path(state, &path, false)?;
    open_with_system(&path.to_string_lossy())
}

#[op2(fast)]
fn op_osextra_notify(
    state: &mut OpState,
    #[string] title: String,
    #[string] body: String,
) -> Result<(), AnyError> {
    check_scope(state, "notifications")?;
    notify_with_system(&title, &body)
}

#[cfg(target_os = "linux")]
fn open_with_system(target: &str) -> Result<(), AnyError> {
    std::process::Command::new("xdg-open").arg(target).spawn()?;
    Ok(())
}

#[cfg(target_os = "macos")]
fn open_with_system(target: &str) -> Result<(), AnyError> {
    std::process::Command::new("open").arg(target).spawn()?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_with_system(_target: &str) -> Result<(), AnyError> {
    Err(anyhow::anyhow!("open is not supported on this platform"))
}

#[cfg(target_os = "linux")]
fn notify_with_system(title: &str, body: &str) -> Result<(), AnyError> {
    std::process::Command::new("notify-send")
        .arg(title)
        .arg(body)
        .spawn()?;
    Ok(())
}

#[cfg(target_os = "macos")]
fn notify_with_system(title: &str, body: &str) -> Result<(), AnyError> {
    let script = format!("display notification \"{body}\" with title \"{title}\"");
    std::process::Command::new("osascript")
        .arg("-e")
        .arg(script)
        .spawn()?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn notify_with_system(_title: &str, _body: &str) -> Result<(), AnyError> {
    Err(anyhow::anyhow!("notifications are not supported on this platform"))
}

// ─── Filepath ($filepath) ────────────────────────────────────────────────

#[op2]
#[string]
fn op_filepath_join(_state: &mut OpState, #[serde] parts: Vec<String>) -> Result<String, AnyError> {
    let mut path = PathBuf::new();
    for part in parts {
        path.push(part);
    }
    Ok(path.to_string_lossy().into_owned())
}

#[op2]
#[string]
fn op_filepath_base(_state: &mut OpState, #[string] path: String) -> Result<String, AnyError> {
    Ok(Path::new(&path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default())
}

#[op2]
#[string]
fn op_filepath_dir(_state: &mut OpState, #[string] path: String) -> Result<String, AnyError> {
    Ok(Path::new(&path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default())
}

#[op2]
#[string]
fn op_filepath_ext(_state: &mut OpState, #[string] path: String) -> Result<String, AnyError> {
    Ok(Path::new(&path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default())
}

#[op2]
#[string]
fn op_filepath_clean(_state: &mut OpState, #[string] path: String) -> Result<String, AnyError> {
    Ok(normalize_path(Path::new(&path)).to_string_lossy().into_owned())
}

// ─── Downloader ($downloader) ────────────────────────────────────────────

#[op2(fast)]
fn op_download(
    state: &mut OpState,
    #[string] pending_id: String,
    #[string] url: String,
    #[string] destination: String,
) -> Result<(), AnyError> {
    let ctx_rc = plugin_ctx(state);
    let op = state.borrow::<OpCtx>();

    let scheduler = {
        let mut ctx = ctx_rc.borrow_mut();
        ctx.plugin.permissions.check("downloads")?;
        let dest = Path::new(&destination);
        if !ctx.plugin.permissions.path_allowed(dest) {
            return Err(PluginError::PermissionDenied {
                scope: format!("downloads ({destination})"),
            }
            .into());
        }
        ctx.dom
            .pending
            .register(&pending_id, PendingKind::Download, IO_PENDING_TTL);
        ctx.scheduler.clone()
    };

    let handle = op.io.spawn(async move {
        let (ok, value) = match download(&url, &destination).await {
            Ok(bytes) => (true, json!({ "path": destination, "bytes": bytes })),
            Err(message) => (false, json!(message)),
        };
        scheduler.schedule(Task::Settle {
            pending_id,
            ok,
            value,
        });
    });
    op.io_tasks.track(handle.abort_handle());
    Ok(())
}

async fn download(url: &str, destination: &str) -> Result<u64, String> {
    let response = reqwest::Client::new()
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("download failed with status {}", response.status()));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("failed to read body: {e}"))?;
    if let Some(parent) = Path::new(destination).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("failed to create directory: {e}"))?;
    }
    tokio::fs::write(destination, &bytes)
        .await
        .map_err(|e| format!("failed to write file: {e}"))?;
    Ok(bytes.len() as u64)
}

// ─── Mime & filename ($mime / $habari) ───────────────────────────────────

#[op2]
#[string]
fn op_mime_lookup(_state: &mut OpState, #[string] path: String) -> Result<String, AnyError> {
    Ok(mime_guess::from_path(&path)
        .first_or_octet_stream()
        .essence_str()
        .to_string())
}

#[op2]
#[serde]
fn op_filename_parse(_state: &mut OpState, #[string] name: String) -> Result<serde_json::Value, AnyError> {
    Ok(serde_json::to_value(super::filename::parse(&name))?)
}

// ─── Extension registration ──────────────────────────────────────────────

deno_core::extension!(
    aozora_plugin,
    ops = [
        // UI registration
        op_ui_register,
        op_new_id,
        op_log,
        // State & effects
        op_state_create,
        op_state_get,
        op_state_set,
        op_effect_register,
        // Timers
        op_timer_start,
        op_timer_cancel,
        op_sleep,
        // Fetch
        op_fetch,
        // Listeners
        op_listener_add,
        op_listener_remove,
        // Trays
        op_tray_new,
        op_tray_set_render,
        op_tray_update,
        op_tray_flush,
        op_tray_open,
        op_tray_close,
        op_tray_badge,
        op_tray_set_icon,
        op_tray_on,
        // Forms
        op_form_new,
        op_form_set_render,
        op_form_update,
        op_form_flush,
        op_form_on_submit,
        op_form_reset,
        // Actions
        op_action_new,
        op_action_on_click,
        op_action_mount,
        op_action_unmount,
        op_action_set_label,
        // Command palette
        op_palette_new,
        op_palette_set_items,
        op_palette_open,
        op_palette_close,
        // Screen & toast
        op_screen_navigate,
        op_screen_reload,
        op_screen_on_navigate,
        op_toast,
        // DOM proxy
        op_dom_query,
        op_dom_query_one,
        op_dom_create,
        op_dom_observe,
        op_dom_stop_observe,
        op_dom_refetch_observer,
        op_dom_request,
        op_dom_send,
        op_dom_add_listener,
        op_dom_remove_listener,
        op_dom_on_ready,
        // Hooks
        op_hook_register,
        op_hook_unregister,
        op_hook_next,
        // Cron
        op_cron_add,
        op_cron_remove,
        op_cron_start,
        op_cron_stop,
        // Storage
        op_storage_get,
        op_storage_set,
        op_storage_remove,
        op_storage_keys,
        op_storage_has,
        op_storage_clear,
        // Store
        op_store_get,
        op_store_set,
        op_store_has,
        op_store_delete,
        op_store_clear,
        // Anilist
        op_anilist_anime,
        op_anilist_anime_collection,
        op_anilist_manga_collection,
        op_anilist_update_entry,
        // Database
        op_db_local_files,
        op_db_anime_entry,
        // Playback
        op_playback_play,
        op_playback_status,
        // App
        op_app_version,
        op_app_refresh_anime_collection,
        op_app_refresh_manga_collection,
        op_app_library_paths,
        // OS
        op_os_platform,
        op_os_home_dir,
        op_os_temp_dir,
        op_os_read_file,
        op_os_write_file,
        op_os_read_dir,
        op_os_stat,
        op_os_remove,
        op_os_mkdir,
        op_os_cmd,
        op_osextra_open_url,
        op_osextra_open_path,
        op_osextra_notify,
        // Filepath
        op_filepath_join,
        op_filepath_base,
        op_filepath_dir,
        op_filepath_ext,
        op_filepath_clean,
        // Downloader
        op_download,
        // Mime & filename
        op_mime_lookup,
        op_filename_parse,
    ],
    esm_entry_point = "ext:aozora_plugin/runtime.js",
    esm = [dir "src/plugins/js", "runtime.js"],
);
