//! Script VM host.
//!
//! One V8 isolate per plugin, wrapped behind the [`ScriptEngine`] trait so
//! the scheduler and managers can be exercised without booting V8. The
//! engine lives on the plugin's scheduler worker thread and is never touched
//! from anywhere else; the only cross-thread surface is the interrupter,
//! which asks the isolate to terminate the running script.
//!
//! All host → script entry points funnel through `__plugin.invoke(id, args)`
//! in the JS prelude: registered callbacks, builtins (`$runEntry`,
//! `$renderTray`, `$settle`, `$invokeHook`) and effect handlers alike. Keeping
//! a single door into the VM means no JS function handles cross the FFI
//! boundary.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::{JsRuntime, RuntimeOptions};
use serde_json::Value;

use super::error::{PluginError, PluginResult};
use super::ops::{aozora_plugin, OpCtx};
use super::ui::Context;

/// Failure of a script evaluation or callback invocation.
#[derive(Debug)]
pub enum ScriptError {
    /// The script threw; carries the stringified exception.
    Exception(String),
    /// Execution was terminated by the interrupter.
    Terminated,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Exception(msg) => write!(f, "{msg}"),
            ScriptError::Terminated => write!(f, "execution terminated"),
        }
    }
}

/// Cross-thread handle that forces the VM to stop executing.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// The VM seam: evaluate plugin source, invoke registered handlers, and
/// expose an interrupt handle.
pub trait ScriptEngine {
    /// Evaluate top-level script source (the plugin payload).
    fn eval(&mut self, name: &'static str, source: String) -> Result<(), ScriptError>;

    /// Invoke a handler (or prelude builtin) registered in the VM.
    fn invoke(&mut self, handler: &str, args: &[Value]) -> Result<(), ScriptError>;

    /// Handle that terminates in-flight execution from another thread.
    fn interrupter(&mut self) -> Interrupter;
}

/// Factory invoked on the worker thread to build the engine, after the
/// per-plugin [`Context`] exists.
pub type EngineFactory =
    Box<dyn FnOnce(Rc<RefCell<Context>>, OpCtx) -> PluginResult<Box<dyn ScriptEngine>> + Send>;

/// `ScriptEngine` backed by a deno_core `JsRuntime`.
pub struct JsEngine {
    runtime: JsRuntime,
}

impl JsEngine {
    /// Create the runtime with the plugin ops and the JS prelude, and seed
    /// the op state with the per-plugin context.
    pub fn new(ctx: Rc<RefCell<Context>>, op_ctx: OpCtx) -> PluginResult<Self> {
        let options = RuntimeOptions {
            extensions: vec![aozora_plugin::init_ops_and_esm()],
            ..Default::default()
        };

        let mut runtime = JsRuntime::new(options);

        {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(op_ctx);
            op_state.put(ctx);
        }

        Ok(Self { runtime })
    }

    /// The default factory used by the plugin host.
    pub fn factory() -> EngineFactory {
        Box::new(|ctx, op_ctx| Ok(Box::new(JsEngine::new(ctx, op_ctx)?) as Box<dyn ScriptEngine>))
    }

    fn map_error(&mut self, err: anyhow::Error) -> ScriptError {
        let isolate = self.runtime.v8_isolate();
        if isolate.is_execution_terminating() {
            return ScriptError::Terminated;
        }
        ScriptError::Exception(err.to_string())
    }
}

impl ScriptEngine for JsEngine {
    fn eval(&mut self, name: &'static str, source: String) -> Result<(), ScriptError> {
        self.runtime
            .execute_script(name, source.into())
            .map(|_| ())
            .map_err(|e| self.map_error(e))
    }

    fn invoke(&mut self, handler: &str, args: &[Value]) -> Result<(), ScriptError> {
        // Both operands serialize to JSON, which is valid JS source; the
        // prelude looks the handler up and applies the arguments.
        let handler_json =
            serde_json::to_string(handler).map_err(|e| ScriptError::Exception(e.to_string()))?;
        let args_json =
            serde_json::to_string(args).map_err(|e| ScriptError::Exception(e.to_string()))?;
        let source = format!("__plugin.invoke({handler_json}, {args_json});");

        self.runtime
            .execute_script("<invoke>", source.into())
            .map(|_| ())
            .map_err(|e| self.map_error(e))
    }

    fn interrupter(&mut self) -> Interrupter {
        let handle = self.runtime.v8_isolate().thread_safe_handle();
        Arc::new(move || {
            handle.terminate_execution();
        })
    }
}

/// Convert a script failure into the crate error, for logging paths.
impl From<ScriptError> for PluginError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Exception(msg) => PluginError::Script(msg),
            ScriptError::Terminated => PluginError::Interrupted {
                reason: "execution terminated".to_string(),
            },
        }
    }
}
