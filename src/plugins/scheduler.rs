//! Per-plugin scheduler: one cooperative execution lane per VM.
//!
//! Every piece of script execution (the payload eval, callback
//! invocations, promise settlements, hook callbacks, timer and cron fires,
//! effect runs) goes through a single worker thread that exclusively owns
//! the plugin's VM. Host subsystems communicate with the lane only by
//! enqueuing tasks on the [`Scheduler`] handle.
//!
//! Tasks never suspend inside the VM. Anything that looks asynchronous to
//! the script completes by scheduling a follow-up [`Task::Settle`] once the
//! host finishes the I/O, which keeps the VM free of reentrancy while
//! requests are in flight.
//!
//! The worker enforces two budgets: MAX_EXCEPTIONS uncaught exceptions over
//! the plugin's lifetime, and MAX_EFFECT_CALLBACKS effect executions per
//! reset window. Exceeding either interrupts the VM: the lane stops, queued
//! work is drained unexecuted, and a `plugin:error` event is published.

use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::ops::ControlFlow;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::events::server;
use super::ui::{plan_client_event, Context};
use super::vm::{Interrupter, ScriptEngine, ScriptError};

/// Maximum uncaught exceptions before the VM is interrupted.
pub const MAX_EXCEPTIONS: u32 = 5;

/// Maximum effect executions per reset window before the VM is interrupted.
pub const MAX_EFFECT_CALLBACKS: u32 = 100;

/// Window after which the effect execution counter resets.
pub const RESET_EFFECT_CALLBACK_INTERVAL: Duration = Duration::from_secs(1);

const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_WAIT: Duration = Duration::from_millis(200);

/// Acknowledgment of a hook callback, sent back to the blocked dispatcher.
#[derive(Debug)]
pub enum HookSignal {
    /// The callback called `event.next()`; carries the (possibly mutated)
    /// event object.
    Next(Value),
    /// The callback threw before acknowledging.
    Failed,
    /// The callback returned without calling `event.next()`.
    NoAck,
}

/// A unit of VM work.
#[derive(Debug)]
pub enum Task {
    /// Evaluate the plugin payload (top-level source).
    Eval { source: String },
    /// Invoke a registered handler or prelude builtin.
    Invoke { handler: String, args: Vec<Value> },
    /// Resolve or reject a pending script promise.
    Settle {
        pending_id: String,
        ok: bool,
        value: Value,
    },
    /// Invoke a hook callback and report back to the blocked dispatcher.
    InvokeHook {
        handler: String,
        dispatch_id: u32,
        event: Value,
        done: SyncSender<HookSignal>,
    },
    /// Drain the plugin's client-event inbox.
    PumpEvents,
    /// Fire a timer created by setTimeout/setInterval.
    TimerFire { timer_id: u32 },
    /// Fire a cron entry and re-arm it.
    CronFire { entry_id: String },
    /// Flush state batches (scheduled by effect-time sets).
    Tick,
}

/// Messages on the scheduler channel.
#[derive(Debug)]
pub enum Control {
    Now(Task),
    At(Task, Instant),
    Stop,
}

/// Counters and flags shared between the worker and the rest of the host.
#[derive(Default)]
pub struct SchedulerShared {
    stopped: AtomicBool,
    exceptions: AtomicU32,
    effect_calls: AtomicU32,
    interrupter: Mutex<Option<Interrupter>>,
}

/// Cloneable handle to a plugin's execution lane.
#[derive(Clone)]
pub struct Scheduler {
    tx: Sender<Control>,
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Create the lane: the handle plus the receiver the worker consumes.
    pub fn channel() -> (Self, Receiver<Control>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                tx,
                shared: Arc::new(SchedulerShared::default()),
            },
            rx,
        )
    }

    /// Enqueue a task. Tasks scheduled on a stopped lane are dropped.
    pub fn schedule(&self, task: Task) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.tx.send(Control::Now(task)).is_ok()
    }

    /// Enqueue a task to run after a delay.
    pub fn schedule_delayed(&self, task: Task, delay: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.tx
            .send(Control::At(task, Instant::now() + delay))
            .is_ok()
    }

    /// Stop the lane: queued work is drained without running, the in-flight
    /// task observes termination, and further schedules are no-ops.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Control::Stop);
        if let Some(interrupter) = self.shared.interrupter.lock().unwrap().as_ref() {
            interrupter();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn exception_count(&self) -> u32 {
        self.shared.exceptions.load(Ordering::SeqCst)
    }

    /// Record an exception observed outside the worker (e.g. a hook
    /// callback that never acknowledged). Returns the new count.
    pub fn note_exception(&self) -> u32 {
        self.shared.exceptions.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn effect_count(&self) -> u32 {
        self.shared.effect_calls.load(Ordering::SeqCst)
    }

    fn set_interrupter(&self, interrupter: Interrupter) {
        *self.shared.interrupter.lock().unwrap() = Some(interrupter);
    }
}

struct DelayedEntry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

// BinaryHeap is a max-heap; order reversed so the earliest deadline pops
// first, ties broken by enqueue order.
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

/// The worker owning a plugin's VM. Runs until stopped or interrupted.
pub struct Worker {
    rx: Receiver<Control>,
    scheduler: Scheduler,
    engine: Box<dyn ScriptEngine>,
    ctx: Rc<RefCell<Context>>,
    delayed: BinaryHeap<DelayedEntry>,
    seq: u64,
    entry_started: bool,
    effect_window_start: Instant,
    last_sweep: Instant,
}

impl Worker {
    pub fn new(
        rx: Receiver<Control>,
        scheduler: Scheduler,
        mut engine: Box<dyn ScriptEngine>,
        ctx: Rc<RefCell<Context>>,
    ) -> Self {
        scheduler.set_interrupter(engine.interrupter());
        Self {
            rx,
            scheduler,
            engine,
            ctx,
            delayed: BinaryHeap::new(),
            seq: 0,
            entry_started: false,
            effect_window_start: Instant::now(),
            last_sweep: Instant::now(),
        }
    }

    /// Run the lane to completion.
    pub fn run(mut self) {
        loop {
            if self.scheduler.is_stopped() {
                break;
            }

            if self.effect_window_start.elapsed() >= RESET_EFFECT_CALLBACK_INTERVAL {
                self.scheduler.shared.effect_calls.store(0, Ordering::SeqCst);
                self.effect_window_start = Instant::now();
            }

            if self.last_sweep.elapsed() >= PENDING_SWEEP_INTERVAL {
                if self.sweep_pending().is_break() {
                    break;
                }
                self.last_sweep = Instant::now();
            }

            if self.run_due_delayed().is_break() {
                break;
            }

            let wait = self
                .delayed
                .peek()
                .map(|e| e.deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_WAIT)
                .min(IDLE_WAIT);

            match self.rx.recv_timeout(wait) {
                Ok(Control::Now(task)) => {
                    if self.run_task(task).is_break() {
                        break;
                    }
                }
                Ok(Control::At(task, deadline)) => self.push_delayed(task, deadline),
                Ok(Control::Stop) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shutdown();
    }

    fn push_delayed(&mut self, task: Task, deadline: Instant) {
        self.seq += 1;
        self.delayed.push(DelayedEntry {
            deadline,
            seq: self.seq,
            task,
        });
    }

    fn run_due_delayed(&mut self) -> ControlFlow<()> {
        loop {
            let due = self
                .delayed
                .peek()
                .map_or(false, |e| e.deadline <= Instant::now());
            if !due {
                return ControlFlow::Continue(());
            }
            let entry = self.delayed.pop().expect("peeked entry");
            self.run_task(entry.task)?;
        }
    }

    fn run_task(&mut self, task: Task) -> ControlFlow<()> {
        match task {
            Task::Eval { source } => {
                match self.engine.eval("<plugin>", source) {
                    Ok(()) => {}
                    Err(err) => self.handle_script_error(err)?,
                }
                let registered = self.ctx.borrow().entry_registered;
                if registered && !self.entry_started {
                    self.entry_started = true;
                    self.invoke("$runEntry", &[])?;
                }
            }

            Task::Invoke { handler, args } => {
                self.invoke(&handler, &args)?;
            }

            Task::Settle {
                pending_id,
                ok,
                value,
            } => {
                let present = self.ctx.borrow_mut().dom.pending.remove(&pending_id);
                if present {
                    self.invoke("$settle", &[json!(pending_id), json!(ok), value])?;
                }
            }

            Task::InvokeHook {
                handler,
                dispatch_id,
                event,
                done,
            } => {
                self.ctx
                    .borrow_mut()
                    .hook_waiters
                    .insert(dispatch_id, done);
                let result =
                    self.engine
                        .invoke("$invokeHook", &[json!(handler), json!(dispatch_id), event]);
                // If the callback never called event.next(), release the
                // dispatcher immediately instead of letting it hit the
                // deadline.
                if let Some(waiter) = self.ctx.borrow_mut().hook_waiters.remove(&dispatch_id) {
                    let signal = if result.is_ok() {
                        HookSignal::NoAck
                    } else {
                        HookSignal::Failed
                    };
                    let _ = waiter.send(signal);
                }
                if let Err(err) = result {
                    self.handle_script_error(err)?;
                }
            }

            Task::PumpEvents => loop {
                let Some(evt) = self.ctx.borrow().inbox.pop() else {
                    break;
                };
                let calls = plan_client_event(&mut self.ctx.borrow_mut(), &evt);
                for (handler, args) in calls {
                    self.invoke(&handler, &args)?;
                }
            },

            Task::TimerFire { timer_id } => {
                let record = self.ctx.borrow().timers.get(timer_id);
                if let Some(record) = record {
                    if let Some(interval) = record.interval {
                        self.push_delayed(
                            Task::TimerFire { timer_id },
                            Instant::now() + interval,
                        );
                    } else {
                        self.ctx.borrow_mut().timers.cancel(timer_id);
                    }
                    self.invoke(&record.handler, &[])?;
                }
            }

            Task::CronFire { entry_id } => {
                let (handler, next) = {
                    let ctx = self.ctx.borrow();
                    if !ctx.cron.contains(&entry_id) {
                        (None, None)
                    } else {
                        let handler = if ctx.cron.is_paused() {
                            None
                        } else {
                            ctx.cron.handler(&entry_id)
                        };
                        (handler, ctx.cron.next_fire(&entry_id))
                    }
                };
                if let Some(delay) = next {
                    self.push_delayed(
                        Task::CronFire { entry_id },
                        Instant::now() + delay.max(Duration::from_millis(1)),
                    );
                }
                if let Some(handler) = handler {
                    self.invoke(&handler, &[])?;
                }
            }

            Task::Tick => {}
        }

        self.flush_tick()
    }

    /// Apply buffered state batches and run dirtied effects. Effects run at
    /// most once per batch; sets applied during effects land in a fresh
    /// batch list picked up by a follow-up tick.
    fn flush_tick(&mut self) -> ControlFlow<()> {
        let batches = self.ctx.borrow_mut().state.take_batches();
        if batches.is_empty() {
            return ControlFlow::Continue(());
        }

        for batch in batches {
            let dirty = self.ctx.borrow().state.dirty_effects(&batch);
            for effect in dirty {
                let calls = self
                    .scheduler
                    .shared
                    .effect_calls
                    .fetch_add(1, Ordering::SeqCst)
                    + 1;
                if calls > MAX_EFFECT_CALLBACKS {
                    return self.interrupt("effect budget exceeded");
                }
                self.invoke(&effect.handler, &[])?;
            }
        }

        if self.ctx.borrow().state.has_pending_batches() {
            self.scheduler.schedule(Task::Tick);
        }
        ControlFlow::Continue(())
    }

    fn sweep_pending(&mut self) -> ControlFlow<()> {
        let expired = self
            .ctx
            .borrow_mut()
            .dom
            .pending
            .sweep_expired(Instant::now());
        for id in expired {
            tracing::warn!(
                plugin = %self.ctx.borrow().plugin.id,
                request = %id,
                "pending request timed out"
            );
            self.invoke("$settle", &[json!(id), json!(false), json!("RequestTimeout")])?;
        }
        ControlFlow::Continue(())
    }

    fn invoke(&mut self, handler: &str, args: &[Value]) -> ControlFlow<()> {
        match self.engine.invoke(handler, args) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => self.handle_script_error(err),
        }
    }

    fn handle_script_error(&mut self, err: ScriptError) -> ControlFlow<()> {
        if let ScriptError::Terminated = err {
            return ControlFlow::Break(());
        }

        let message = err.to_string();
        let count = self.scheduler.note_exception();
        let plugin_id = self.ctx.borrow().plugin.id.clone();
        tracing::error!(
            plugin = %plugin_id,
            exceptions = count,
            error = %message,
            "uncaught plugin exception"
        );
        self.ctx.borrow().out.send(
            server::PLUGIN_ERROR,
            json!({ "kind": "ScriptException", "error": message }),
        );

        if count >= MAX_EXCEPTIONS {
            self.interrupt("exception budget exceeded")
        } else {
            ControlFlow::Continue(())
        }
    }

    fn interrupt(&mut self, reason: &str) -> ControlFlow<()> {
        self.scheduler.shared.stopped.store(true, Ordering::SeqCst);
        let plugin_id = self.ctx.borrow().plugin.id.clone();
        tracing::error!(plugin = %plugin_id, reason, "plugin interrupted");
        self.ctx.borrow().out.send(
            server::PLUGIN_ERROR,
            json!({ "kind": "Interrupted", "error": reason }),
        );
        ControlFlow::Break(())
    }

    /// Drain queues without running them and release resources owned by the
    /// lane.
    fn shutdown(mut self) {
        self.scheduler.shared.stopped.store(true, Ordering::SeqCst);

        // Queued hook dispatches must not leave their dispatcher blocked
        // until the deadline.
        while let Ok(control) = self.rx.try_recv() {
            if let Control::Now(Task::InvokeHook { done, .. })
            | Control::At(Task::InvokeHook { done, .. }, _) = control
            {
                let _ = done.send(HookSignal::Failed);
            }
        }
        while let Some(entry) = self.delayed.pop() {
            if let Task::InvokeHook { done, .. } = entry.task {
                let _ = done.send(HookSignal::Failed);
            }
        }

        let mut ctx = self.ctx.borrow_mut();
        for (_, waiter) in ctx.hook_waiters.drain() {
            let _ = waiter.send(HookSignal::Failed);
        }

        let out = ctx.out.clone();
        ctx.dom.stop_all_observers(&out);
        ctx.inbox.clear();
        out.send(server::PLUGIN_UNLOADED, json!({}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_on_stopped_lane_is_dropped() {
        let (scheduler, rx) = Scheduler::channel();
        scheduler.stop();

        assert!(!scheduler.schedule(Task::Tick));
        assert!(!scheduler.schedule_delayed(Task::Tick, Duration::from_millis(1)));

        // Only the Stop control is on the channel.
        assert!(matches!(rx.try_recv(), Ok(Control::Stop)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_delayed_entry_ordering() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(DelayedEntry {
            deadline: now + Duration::from_millis(50),
            seq: 2,
            task: Task::Tick,
        });
        heap.push(DelayedEntry {
            deadline: now + Duration::from_millis(10),
            seq: 3,
            task: Task::Tick,
        });
        heap.push(DelayedEntry {
            deadline: now + Duration::from_millis(50),
            seq: 1,
            task: Task::Tick,
        });

        // Earliest deadline first; FIFO within equal deadlines.
        assert_eq!(heap.pop().unwrap().seq, 3);
        assert_eq!(heap.pop().unwrap().seq, 1);
        assert_eq!(heap.pop().unwrap().seq, 2);
    }

    #[test]
    fn test_exception_counter() {
        let (scheduler, _rx) = Scheduler::channel();
        assert_eq!(scheduler.exception_count(), 0);
        assert_eq!(scheduler.note_exception(), 1);
        assert_eq!(scheduler.exception_count(), 1);
    }
}
