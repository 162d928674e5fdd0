// Engine abstraction - the VM a runtime drives
//
// A runtime only needs a handful of primitives from its VM: bootstrap the
// worklet API, evaluate source, call a worklet, and call back into functions
// registered earlier. Everything else about the engine's object model stays
// behind this trait.

mod native;
#[cfg(feature = "js-runtime")]
pub mod quickjs;

pub use native::{NativeEngine, NativeEngineFactory};
#[cfg(feature = "js-runtime")]
pub use quickjs::{QuickJsEngine, QuickJsEngineFactory};

use crate::config::RuntimeConfig;
use crate::dispatch::PendingResult;
use crate::error::{EngineError, WorkletError};
use crate::runtime::RuntimeHandle;
use crate::worklet::{WorkletClosure, WorkletValue};
use std::fmt;
use std::sync::Arc;

/// Identifier of a function registered with one engine instance
pub type CallbackId = u64;

/// Rust function registered with an engine; runs on the engine's thread
pub type NativeCallback = Box<dyn FnMut(&[WorkletValue]) -> Result<WorkletValue, WorkletError>>;

/// One VM instance, owned by exactly one thread
///
/// Not `Send`: an engine is created on its runtime's thread and never leaves it.
pub trait JsEngine {
    /// Short engine name for logs
    fn kind(&self) -> &'static str;

    /// Install the worklet API (and, for worker runtimes, the decorators)
    fn bootstrap(
        &mut self,
        runtime: &RuntimeHandle,
        config: &RuntimeConfig,
    ) -> Result<(), EngineError>;

    fn evaluate(&mut self, source: &str, location: &str) -> Result<WorkletValue, EngineError>;

    /// Execute a script worklet with its captured variables in scope
    fn call_worklet(
        &mut self,
        worklet: &Arc<WorkletClosure>,
        args: &[WorkletValue],
    ) -> Result<WorkletValue, EngineError>;

    fn register_callback(&mut self, callback: NativeCallback) -> Result<CallbackId, EngineError>;

    fn invoke_callback(
        &mut self,
        id: CallbackId,
        args: &[WorkletValue],
    ) -> Result<WorkletValue, EngineError>;

    fn release_callback(&mut self, id: CallbackId);

    /// Define (or replace) a global visible to later evaluations and worklets
    fn set_global(&mut self, name: &str, _value: &WorkletValue) -> Result<(), EngineError> {
        Err(EngineError::Unsupported(format!("global '{name}'")))
    }

    fn global(&mut self, name: &str) -> Result<WorkletValue, EngineError> {
        Err(EngineError::Unsupported(format!("global '{name}'")))
    }

    /// Drain microtasks queued by the last task
    fn run_pending_jobs(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Creates engines on the thread that will own them
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        runtime_name: &str,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn JsEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&str, &RuntimeConfig) -> Result<Box<dyn JsEngine>, EngineError> + Send + Sync,
{
    fn create(
        &self,
        runtime_name: &str,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn JsEngine>, EngineError> {
        self(runtime_name, config)
    }
}

/// QuickJS when built with `js-runtime`, the native engine otherwise
pub fn default_factory() -> Arc<dyn EngineFactory> {
    #[cfg(feature = "js-runtime")]
    {
        Arc::new(QuickJsEngineFactory)
    }
    #[cfg(not(feature = "js-runtime"))]
    {
        Arc::new(NativeEngineFactory)
    }
}

/// Reference to a function that lives on another runtime
///
/// Transferable like any other [`WorkletValue`]; calling it schedules the
/// function on its owning runtime's thread.
#[derive(Clone)]
pub struct RemoteCallback {
    runtime: RuntimeHandle,
    id: CallbackId,
    name: Arc<str>,
}

impl RemoteCallback {
    pub fn new(runtime: &RuntimeHandle, id: CallbackId, name: &str) -> Self {
        Self {
            runtime: runtime.clone(),
            id,
            name: Arc::from(name),
        }
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule the function on its runtime with `args`
    pub fn call(&self, args: Vec<WorkletValue>) -> PendingResult {
        match self.runtime.context() {
            Some(context) => context.dispatcher().call_remote(self, args),
            None => PendingResult::ready(
                &self.runtime,
                Err(WorkletError::RuntimeUnavailable(self.runtime.name().to_string())),
            ),
        }
    }
}

impl PartialEq for RemoteCallback {
    fn eq(&self, other: &Self) -> bool {
        self.runtime == other.runtime && self.id == other.id
    }
}

impl fmt::Debug for RemoteCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCallback")
            .field("runtime", &self.runtime.name())
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Errors from Rust callbacks surface as exceptions at the engine boundary
pub(crate) fn callback_error(err: WorkletError) -> EngineError {
    match err {
        WorkletError::Execution { message, stack } => EngineError::Exception { message, stack },
        other => EngineError::Exception {
            message: other.to_string(),
            stack: None,
        },
    }
}
