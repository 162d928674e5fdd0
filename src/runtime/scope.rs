// Runtime scope - borrowed view of a runtime while one of its tasks runs

use super::RuntimeHandle;
use crate::context::WorkletsContext;
use crate::engine::{JsEngine, RemoteCallback};
use crate::error::WorkletError;
use crate::worklet::WorkletValue;

/// Everything a task can touch on the thread that owns the runtime
///
/// Only ever constructed on the owning thread, which is what makes handing
/// out `&mut` access to the engine sound.
pub struct RuntimeScope<'a> {
    runtime: &'a RuntimeHandle,
    context: &'a WorkletsContext,
    engine: &'a mut dyn JsEngine,
}

impl<'a> RuntimeScope<'a> {
    pub(crate) fn new(
        runtime: &'a RuntimeHandle,
        context: &'a WorkletsContext,
        engine: &'a mut dyn JsEngine,
    ) -> Self {
        Self {
            runtime,
            context,
            engine,
        }
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        self.runtime
    }

    pub fn context(&self) -> &WorkletsContext {
        self.context
    }

    pub fn engine(&mut self) -> &mut dyn JsEngine {
        &mut *self.engine
    }

    pub fn evaluate(
        &mut self,
        source: &str,
        location: &str,
    ) -> Result<WorkletValue, WorkletError> {
        Ok(self.engine.evaluate(source, location)?)
    }

    /// Register a Rust function on this runtime that other runtimes can call
    pub fn create_callback<F>(
        &mut self,
        name: &str,
        callback: F,
    ) -> Result<RemoteCallback, WorkletError>
    where
        F: FnMut(&[WorkletValue]) -> Result<WorkletValue, WorkletError> + 'static,
    {
        let id = self.engine.register_callback(Box::new(callback))?;
        Ok(RemoteCallback::new(self.runtime, id, name))
    }
}
