// Worklet scope - what a native worklet body can reach while it runs

use super::{WorkletClosure, WorkletValue};
use crate::context::WorkletsContext;
use crate::dispatch::PendingResult;
use crate::engine::RemoteCallback;
use crate::error::WorkletError;
use crate::runtime::{self, RuntimeHandle};
use crate::shared::SharedValue;
use std::sync::Arc;

/// Execution environment handed to a [`WorkletCode::Native`](super::WorkletCode) body
///
/// Captured variables are looked up by name, mirroring how a script worklet
/// sees them as lexical bindings.
pub struct WorkletScope<'a> {
    runtime: &'a RuntimeHandle,
    context: &'a WorkletsContext,
    closure: &'a WorkletClosure,
}

impl<'a> WorkletScope<'a> {
    pub(crate) fn new(
        runtime: &'a RuntimeHandle,
        context: &'a WorkletsContext,
        closure: &'a WorkletClosure,
    ) -> Self {
        Self {
            runtime,
            context,
            closure,
        }
    }

    /// Runtime the worklet is executing on
    pub fn runtime(&self) -> &RuntimeHandle {
        self.runtime
    }

    pub fn context(&self) -> &WorkletsContext {
        self.context
    }

    pub fn worklet_name(&self) -> &str {
        self.closure.name()
    }

    /// Captured variable, or an execution error like a JS `ReferenceError`
    pub fn captured(&self, name: &str) -> Result<&WorkletValue, WorkletError> {
        self.closure
            .captured(name)
            .ok_or_else(|| WorkletError::execution(format!("ReferenceError: {name} is not defined")))
    }

    pub fn shared(&self, name: &str) -> Result<&SharedValue, WorkletError> {
        let value = self.captured(name)?;
        value.as_shared().ok_or_else(|| type_error(name, "a shared value", value))
    }

    pub fn worklet(&self, name: &str) -> Result<&Arc<WorkletClosure>, WorkletError> {
        let value = self.captured(name)?;
        value.as_worklet().ok_or_else(|| type_error(name, "a worklet", value))
    }

    pub fn callback(&self, name: &str) -> Result<&RemoteCallback, WorkletError> {
        let value = self.captured(name)?;
        value.as_callback().ok_or_else(|| type_error(name, "a remote function", value))
    }

    /// Schedule `worklet` on the main runtime ("runOnJS")
    pub fn run_on_main(
        &self,
        worklet: &Arc<WorkletClosure>,
        args: Vec<WorkletValue>,
    ) -> PendingResult {
        self.context.run_on_main(worklet.clone(), args)
    }

    /// Schedule `worklet` on another runtime
    pub fn run_on(
        &self,
        runtime: &RuntimeHandle,
        worklet: &Arc<WorkletClosure>,
        args: Vec<WorkletValue>,
    ) -> PendingResult {
        self.context
            .dispatcher()
            .run_async(worklet.clone(), runtime, args)
    }

    /// Invoke a function that lives on another runtime
    pub fn call(&self, callback: &RemoteCallback, args: Vec<WorkletValue>) -> PendingResult {
        self.context.dispatcher().call_remote(callback, args)
    }

    /// Run `worklet` on this runtime after the current task finishes
    pub fn set_immediate(
        &self,
        worklet: &Arc<WorkletClosure>,
        args: Vec<WorkletValue>,
    ) -> Result<(), WorkletError> {
        self.context
            .dispatcher()
            .run_detached(worklet.clone(), self.runtime, args)
    }

    pub fn create_shared_value(&self, initial: impl Into<WorkletValue>) -> SharedValue {
        self.context.store().create(initial)
    }

    /// Stable index of the executing thread
    pub fn thread_index(&self) -> usize {
        runtime::current_thread_index()
    }
}

fn type_error(name: &str, expected: &str, found: &WorkletValue) -> WorkletError {
    WorkletError::execution(format!(
        "TypeError: {name} is {}, expected {expected}",
        found.type_name()
    ))
}
