// Runtime threads - the task loop of worker runtimes and the host-side runner
// for the main runtime

use super::{set_current, RuntimeHandle, RuntimeId, RuntimeInner, RuntimeScope};
use crate::config::{RuntimeConfig, ShutdownMode};
use crate::context::WorkletsContext;
use crate::dispatch::panic_message;
use crate::engine::{EngineFactory, JsEngine};
use crate::error::{EngineError, WorkletError};
use crate::invoker::{Message, Task};
use crate::worklet::WorkletValue;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

pub(crate) struct WorkerParams {
    pub handle: RuntimeHandle,
    pub receiver: UnboundedReceiver<Message>,
    pub factory: Arc<dyn EngineFactory>,
    pub config: RuntimeConfig,
    pub shutdown: ShutdownMode,
    pub decorators: Vec<(String, WorkletValue)>,
    pub ready: oneshot::Sender<Result<(), WorkletError>>,
}

/// Body of a worker runtime's thread; returns the number of cancelled tasks
///
/// The engine is created and bootstrapped here, on the thread that will own it
/// for its whole life. `ready` reports the bootstrap outcome back to the
/// registry before any task is accepted.
pub(crate) fn run(params: WorkerParams) -> usize {
    let WorkerParams {
        handle,
        mut receiver,
        factory,
        config,
        shutdown,
        decorators,
        ready,
    } = params;

    handle.bind_thread();
    set_current(Some(handle.clone()));

    let mut engine = match boot(&handle, factory.as_ref(), &config, &decorators) {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!(runtime = handle.name(), error = %err, "runtime bootstrap failed");
            let _ = ready.send(Err(err));
            set_current(None);
            return 0;
        }
    };
    let _ = ready.send(Ok(()));
    drop(decorators);

    tracing::debug!(runtime = handle.name(), engine = engine.kind(), "runtime thread started");

    let mut executed = 0usize;
    let mut cancelled = 0usize;

    while let Some(message) = receiver.blocking_recv() {
        let task = match message {
            Message::Run(task) => task,
            Message::Stop => break,
        };

        if handle.bridge().is_closed() && shutdown == ShutdownMode::Cancel {
            task.cancel(WorkletError::Cancelled);
            cancelled += 1;
            continue;
        }

        match handle.context() {
            Some(context) => {
                run_task(&handle, &context, engine.as_mut(), task);
                executed += 1;
            }
            None => {
                task.cancel(WorkletError::RuntimeUnavailable(handle.name().to_string()));
                cancelled += 1;
            }
        }
    }

    // Everything sent before the stop marker was handled above
    receiver.close();
    while let Ok(message) = receiver.try_recv() {
        if let Message::Run(task) = message {
            task.cancel(WorkletError::Cancelled);
            cancelled += 1;
        }
    }

    drop(engine);
    set_current(None);
    tracing::info!(runtime = handle.name(), executed, cancelled, "runtime thread exited");
    cancelled
}

fn boot(
    handle: &RuntimeHandle,
    factory: &dyn EngineFactory,
    config: &RuntimeConfig,
    decorators: &[(String, WorkletValue)],
) -> Result<Box<dyn JsEngine>, WorkletError> {
    let init_error = |err: EngineError| WorkletError::RuntimeInit {
        name: handle.name().to_string(),
        reason: err.to_string(),
    };

    let mut engine = factory.create(handle.name(), config).map_err(init_error)?;
    engine.bootstrap(handle, config).map_err(init_error)?;
    for (name, value) in decorators {
        engine.set_global(name, value).map_err(init_error)?;
    }

    if let Some(source) = &config.bootstrap {
        engine.evaluate(source, "bootstrap.js").map_err(init_error)?;
        engine.run_pending_jobs().map_err(init_error)?;
    }
    Ok(engine)
}

/// Run one task to completion, then flush the engine's job queue
///
/// A panicking task is logged and swallowed so the runtime keeps serving.
fn run_task(
    handle: &RuntimeHandle,
    context: &WorkletsContext,
    engine: &mut dyn JsEngine,
    task: Task,
) {
    let label = task.label();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut scope = RuntimeScope::new(handle, context, &mut *engine);
        task.run(&mut scope);
    }));

    if let Err(payload) = outcome {
        tracing::error!(
            runtime = handle.name(),
            task = label,
            panic = %panic_message(payload.as_ref()),
            "task panicked"
        );
    }

    if let Err(err) = engine.run_pending_jobs() {
        tracing::warn!(runtime = handle.name(), error = %err, "pending job failed");
    }
}

struct HostedEngine {
    runtime: RuntimeId,
    // None while lent to a running task
    engine: Option<Box<dyn JsEngine>>,
}

thread_local! {
    static HOSTED: RefCell<Option<HostedEngine>> = const { RefCell::new(None) };
}

/// Park the main runtime's engine on the calling (host) thread
pub(crate) fn host_engine(
    handle: &RuntimeHandle,
    engine: Box<dyn JsEngine>,
) -> Result<(), WorkletError> {
    let occupied = HOSTED.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Some(engine);
        }
        *slot = Some(HostedEngine {
            runtime: handle.id(),
            engine: Some(engine),
        });
        None
    });

    if occupied.is_some() {
        return Err(WorkletError::RuntimeInit {
            name: handle.name().to_string(),
            reason: "this thread already hosts a main runtime".to_string(),
        });
    }

    handle.bind_thread();
    set_current(Some(handle.clone()));
    Ok(())
}

/// Drop the main runtime's engine if it is parked on the calling thread
pub(crate) fn release_hosted(runtime: RuntimeId) -> bool {
    let released = HOSTED.with(|slot| {
        let mut slot = slot.borrow_mut();
        let ours = slot.as_ref().is_some_and(|hosted| hosted.runtime == runtime);
        if ours {
            slot.take()
        } else {
            None
        }
    });

    let was_hosted = released.is_some();
    if was_hosted {
        set_current(None);
        tracing::debug!(runtime = %runtime, "released hosted engine");
    }
    drop(released);
    was_hosted
}

/// Execute a task forwarded through the host's call invoker
pub(crate) fn run_hosted_task(runtime: &Weak<RuntimeInner>, task: Task) {
    let Some(inner) = runtime.upgrade() else {
        task.cancel(WorkletError::RuntimeUnavailable("main".to_string()));
        return;
    };
    let handle = RuntimeHandle::from_inner(inner);

    let Some(context) = handle.context() else {
        task.cancel(WorkletError::RuntimeUnavailable(handle.name().to_string()));
        return;
    };
    // Under Drain the engine is released by work posted after the close, so
    // everything forwarded before it still finds the engine parked
    if handle.bridge().is_closed() && context.config().shutdown == ShutdownMode::Cancel {
        task.cancel(WorkletError::Cancelled);
        return;
    }

    let lent = HOSTED.with(|slot| match slot.borrow_mut().as_mut() {
        Some(hosted) if hosted.runtime == handle.id() => hosted.engine.take(),
        _ => None,
    });
    let Some(mut engine) = lent else {
        tracing::warn!(
            runtime = handle.name(),
            "main runtime engine is not available on this thread"
        );
        task.cancel(WorkletError::RuntimeUnavailable(handle.name().to_string()));
        return;
    };

    run_task(&handle, &context, engine.as_mut(), task);

    // Give the engine back unless the runtime was released meanwhile
    let leftover = HOSTED.with(|slot| match slot.borrow_mut().as_mut() {
        Some(hosted) if hosted.runtime == handle.id() => {
            hosted.engine = Some(engine);
            None
        }
        _ => Some(engine),
    });
    drop(leftover);
}
