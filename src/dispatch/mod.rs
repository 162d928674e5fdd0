// Worklet dispatcher - run a closure on a target runtime's thread

mod continuation;

pub use continuation::{Continuation, PendingResult};

use crate::engine::RemoteCallback;
use crate::error::WorkletError;
use crate::invoker::Task;
use crate::runtime::{RuntimeHandle, RuntimeScope};
use crate::worklet::{WorkletClosure, WorkletCode, WorkletScope, WorkletValue};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of running a worklet
pub type WorkletResult = Result<WorkletValue, WorkletError>;

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record(&self, result: &WorkletResult) {
        match result {
            Ok(_) => self.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Point-in-time copy of the dispatcher's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Scheduling facade: given a worklet and a target runtime, arranges
/// execution on that runtime's thread and delivers the result to a
/// [`Continuation`]
#[derive(Clone, Default)]
pub struct WorkletDispatcher {
    counters: Arc<Counters>,
}

impl WorkletDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch `closure` to `runtime`
    ///
    /// If the runtime does not accept work the continuation receives
    /// `RuntimeUnavailable`; if it is destroyed before the task runs the
    /// continuation receives `Cancelled`.
    pub fn run(
        &self,
        closure: Arc<WorkletClosure>,
        runtime: &RuntimeHandle,
        args: Vec<WorkletValue>,
        continuation: Continuation,
    ) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(worklet = closure.name(), runtime = runtime.name(), "dispatching worklet");

        let counters = self.counters.clone();
        let on_result = continuation.clone();
        let task = Task::new("worklet", move |scope| {
            let result = execute(scope, &closure, &args);
            counters.record(&result);
            on_result.resolve(result);
        });

        let counters = self.counters.clone();
        let task = task.on_cancel(move |reason| {
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
            continuation.resolve(Err(reason));
        });

        // A rejected task has already resolved its continuation
        let _ = runtime.schedule(task);
    }

    /// Dispatch and obtain the result as a [`PendingResult`]
    pub fn run_async(
        &self,
        closure: Arc<WorkletClosure>,
        runtime: &RuntimeHandle,
        args: Vec<WorkletValue>,
    ) -> PendingResult {
        let (continuation, pending) = Continuation::channel(runtime);
        self.run(closure, runtime, args, continuation);
        pending
    }

    /// Dispatch and park the caller until the result arrives
    ///
    /// Fails fast with `Deadlock`, without scheduling anything, when called
    /// from `runtime`'s own thread.
    pub fn run_blocking(
        &self,
        closure: Arc<WorkletClosure>,
        runtime: &RuntimeHandle,
        args: Vec<WorkletValue>,
    ) -> WorkletResult {
        if runtime.is_current_thread() {
            return Err(WorkletError::Deadlock(runtime.name().to_string()));
        }
        self.run_async(closure, runtime, args).wait()
    }

    /// Dispatch without waiting for the result; failures are logged
    pub fn run_detached(
        &self,
        closure: Arc<WorkletClosure>,
        runtime: &RuntimeHandle,
        args: Vec<WorkletValue>,
    ) -> Result<(), WorkletError> {
        if !runtime.is_accepting() {
            return Err(WorkletError::RuntimeUnavailable(runtime.name().to_string()));
        }
        self.run(closure, runtime, args, Continuation::detached("worklet"));
        Ok(())
    }

    /// Invoke a function owned by another runtime on that runtime's thread
    pub fn call_remote(&self, callback: &RemoteCallback, args: Vec<WorkletValue>) -> PendingResult {
        let (continuation, pending) = Continuation::channel(callback.runtime());
        self.call_remote_with(callback, args, continuation);
        pending
    }

    /// Like [`call_remote`](Self::call_remote), delivering to `continuation`
    pub fn call_remote_with(
        &self,
        callback: &RemoteCallback,
        args: Vec<WorkletValue>,
        continuation: Continuation,
    ) {
        let id = callback.id();
        let on_result = continuation.clone();
        let task = Task::new("remote-call", move |scope| {
            let result = scope
                .engine()
                .invoke_callback(id, &args)
                .map_err(WorkletError::from);
            on_result.resolve(result);
        })
        .on_cancel(move |reason| continuation.resolve(Err(reason)));

        let _ = callback.runtime().schedule(task);
    }

    /// Evaluate script source on `runtime`
    pub fn evaluate(
        &self,
        runtime: &RuntimeHandle,
        source: impl Into<String>,
        location: impl Into<String>,
    ) -> PendingResult {
        let (continuation, pending) = Continuation::channel(runtime);
        let (source, location) = (source.into(), location.into());

        let on_result = continuation.clone();
        let task = Task::new("evaluate", move |scope| {
            let result = scope
                .engine()
                .evaluate(&source, &location)
                .map_err(WorkletError::from);
            on_result.resolve(result);
        })
        .on_cancel(move |reason| continuation.resolve(Err(reason)));

        let _ = runtime.schedule(task);
        pending
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Run a worklet on the current runtime's thread
///
/// Native bodies run directly; a panic is converted into an execution error
/// so the runtime stays usable. Script bodies go through the engine.
pub(crate) fn execute(
    scope: &mut RuntimeScope<'_>,
    closure: &Arc<WorkletClosure>,
    args: &[WorkletValue],
) -> WorkletResult {
    let result = match closure.code() {
        WorkletCode::Native(body) => {
            let mut worklet_scope = WorkletScope::new(scope.runtime(), scope.context(), closure);
            panic::catch_unwind(AssertUnwindSafe(|| body(&mut worklet_scope, args)))
                .unwrap_or_else(|payload| {
                    Err(WorkletError::execution(format!(
                        "worklet '{}' panicked: {}",
                        closure.name(),
                        panic_message(payload.as_ref())
                    )))
                })
        }
        WorkletCode::Script { .. } => scope
            .engine()
            .call_worklet(closure, args)
            .map_err(WorkletError::from),
    };

    if let Err(err) = &result {
        tracing::debug!(
            worklet = closure.name(),
            runtime = scope.runtime().name(),
            error = %err,
            "worklet failed"
        );
    }
    result
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
