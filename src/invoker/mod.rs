// Call invoker bridge - schedule work onto a specific runtime's thread

pub mod host_loop;

pub use host_loop::{HostEventLoop, HostInvoker};

use crate::error::WorkletError;
use crate::runtime::{RuntimeInner, RuntimeScope};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Host binding used to run work on the host's JS thread
///
/// The host guarantees that work is executed on its thread, in the order
/// `invoke_async` was called from any single producer.
pub trait CallInvoker: Send + Sync {
    fn invoke_async(&self, work: Box<dyn FnOnce() + Send>);
}

impl<F> CallInvoker for F
where
    F: Fn(Box<dyn FnOnce() + Send>) + Send + Sync,
{
    fn invoke_async(&self, work: Box<dyn FnOnce() + Send>) {
        self(work)
    }
}

type RunFn = Box<dyn FnOnce(&mut RuntimeScope<'_>) + Send>;
type CancelFn = Box<dyn FnOnce(WorkletError) + Send>;

/// Unit of work executed on a runtime's thread
pub struct Task {
    label: &'static str,
    run: RunFn,
    cancel: Option<CancelFn>,
}

impl Task {
    pub fn new(
        label: &'static str,
        run: impl FnOnce(&mut RuntimeScope<'_>) + Send + 'static,
    ) -> Self {
        Self {
            label,
            run: Box::new(run),
            cancel: None,
        }
    }

    /// Callback invoked instead of `run` when the task is discarded
    pub fn on_cancel(mut self, cancel: impl FnOnce(WorkletError) + Send + 'static) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn run(self, scope: &mut RuntimeScope<'_>) {
        (self.run)(scope)
    }

    pub(crate) fn cancel(self, reason: WorkletError) {
        tracing::debug!(task = self.label, %reason, "task discarded");
        if let Some(cancel) = self.cancel {
            cancel(reason);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Messages consumed by a worker thread's loop
pub(crate) enum Message {
    Run(Task),
    Stop,
}

enum Sink {
    /// Queue drained by a registry-owned worker thread
    Queue(mpsc::UnboundedSender<Message>),
    /// Forward into the host's own call invoker
    Host {
        invoker: Arc<dyn CallInvoker>,
        runtime: Weak<RuntimeInner>,
    },
}

/// Per-runtime handle for enqueuing tasks from any thread
///
/// Closing the bridge and enqueuing happen under one lock, so a task is either
/// queued before the close (and drained by the worker) or rejected.
#[derive(Clone)]
pub struct CallInvokerBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    runtime_name: String,
    sink: Sink,
    closed: Mutex<bool>,
    scheduled: AtomicU64,
}

impl CallInvokerBridge {
    /// Bridge backed by an owned queue
    pub(crate) fn queued(runtime_name: &str) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_sink(runtime_name, Sink::Queue(tx)), rx)
    }

    /// Bridge forwarding to a host call invoker
    pub(crate) fn hosted(
        runtime_name: &str,
        invoker: Arc<dyn CallInvoker>,
        runtime: Weak<RuntimeInner>,
    ) -> Self {
        Self::with_sink(runtime_name, Sink::Host { invoker, runtime })
    }

    fn with_sink(runtime_name: &str, sink: Sink) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                runtime_name: runtime_name.to_string(),
                sink,
                closed: Mutex::new(false),
                scheduled: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue a task; callable from any thread, including the owning one
    ///
    /// On failure the task's cancellation callback has already been invoked
    /// with the returned error.
    pub fn schedule(&self, task: Task) -> Result<(), WorkletError> {
        let rejected = match &self.inner.sink {
            Sink::Queue(tx) => {
                let closed = self.inner.closed.lock();
                if *closed {
                    Some(task)
                } else {
                    match tx.send(Message::Run(task)) {
                        Ok(()) => None,
                        Err(mpsc::error::SendError(Message::Run(task))) => Some(task),
                        Err(mpsc::error::SendError(Message::Stop)) => None,
                    }
                }
            }
            Sink::Host { invoker, runtime } => {
                if self.is_closed() {
                    Some(task)
                } else {
                    // The host may run work inline, so no lock is held here.
                    // A close that races with this is settled when the task
                    // runs, per the shutdown mode.
                    let runtime = runtime.clone();
                    invoker.invoke_async(Box::new(move || {
                        crate::runtime::worker::run_hosted_task(&runtime, task)
                    }));
                    None
                }
            }
        };

        match rejected {
            None => {
                self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Some(task) => {
                let err = WorkletError::RuntimeUnavailable(self.inner.runtime_name.clone());
                task.cancel(err.clone());
                Err(err)
            }
        }
    }

    /// Close the bridge; returns false if it was already closed
    pub fn shutdown(&self) -> bool {
        let mut closed = self.inner.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        if let Sink::Queue(tx) = &self.inner.sink {
            let _ = tx.send(Message::Stop);
        }
        true
    }

    /// The host's invoker, for work that must reach the host thread even
    /// after the bridge is closed
    pub(crate) fn host_invoker(&self) -> Option<Arc<dyn CallInvoker>> {
        match &self.inner.sink {
            Sink::Host { invoker, .. } => Some(invoker.clone()),
            Sink::Queue(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    /// Total number of tasks accepted since creation
    pub fn scheduled_count(&self) -> u64 {
        self.inner.scheduled.load(Ordering::Relaxed)
    }

    pub fn runtime_name(&self) -> &str {
        &self.inner.runtime_name
    }
}

impl fmt::Debug for CallInvokerBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInvokerBridge")
            .field("runtime", &self.inner.runtime_name)
            .field("closed", &self.is_closed())
            .field("scheduled", &self.scheduled_count())
            .finish()
    }
}
