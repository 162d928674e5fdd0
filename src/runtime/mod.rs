// Runtime handles - one engine instance bound to one thread

pub mod registry;
pub mod scope;
pub(crate) mod worker;

pub use registry::RuntimeRegistry;
pub use scope::RuntimeScope;

use crate::context::{ContextInner, WorkletsContext};
use crate::error::WorkletError;
use crate::invoker::{CallInvokerBridge, Task};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{JoinHandle, ThreadId};

/// Unique identifier of a runtime, allocated monotonically per context
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeId(pub u64);

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// The host-supplied runtime; its thread belongs to the host
    Main,
    /// A runtime created by the registry on its own thread
    Worklet,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Destroyed,
}

/// Cheap, cloneable reference to a runtime
///
/// A handle stays a valid value after its runtime is destroyed; scheduling on
/// it then fails with [`WorkletError::RuntimeUnavailable`].
#[derive(Clone)]
pub struct RuntimeHandle {
    pub(crate) inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    id: RuntimeId,
    name: String,
    kind: RuntimeKind,
    bridge: CallInvokerBridge,
    state: Mutex<LifecycleState>,
    thread_id: OnceLock<ThreadId>,
    thread: Mutex<Option<JoinHandle<usize>>>,
    context: Weak<ContextInner>,
}

impl RuntimeHandle {
    pub(crate) fn new(
        id: RuntimeId,
        name: String,
        kind: RuntimeKind,
        bridge: CallInvokerBridge,
        context: Weak<ContextInner>,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                id,
                name,
                kind,
                bridge,
                state: Mutex::new(LifecycleState::Starting),
                thread_id: OnceLock::new(),
                thread: Mutex::new(None),
                context,
            }),
        }
    }

    /// Build a handle whose bridge needs a back-reference to the runtime
    pub(crate) fn new_cyclic(
        id: RuntimeId,
        name: String,
        kind: RuntimeKind,
        context: Weak<ContextInner>,
        bridge: impl FnOnce(Weak<RuntimeInner>) -> CallInvokerBridge,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak| RuntimeInner {
                id,
                name,
                kind,
                bridge: bridge(weak.clone()),
                state: Mutex::new(LifecycleState::Starting),
                thread_id: OnceLock::new(),
                thread: Mutex::new(None),
                context,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> RuntimeId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> RuntimeKind {
        self.inner.kind
    }

    pub fn is_main(&self) -> bool {
        self.inner.kind == RuntimeKind::Main
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    /// True while the runtime is running and its bridge is open
    pub fn is_accepting(&self) -> bool {
        self.state() == LifecycleState::Running && !self.inner.bridge.is_closed()
    }

    /// Identity of the thread that executes this runtime's tasks
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.inner.thread_id.get().copied()
    }

    /// True when called from the thread that executes this runtime's tasks
    pub fn is_current_thread(&self) -> bool {
        self.thread_id() == Some(std::thread::current().id())
    }

    pub fn bridge(&self) -> &CallInvokerBridge {
        &self.inner.bridge
    }

    /// Enqueue a task for execution on this runtime's thread
    pub fn schedule(&self, task: Task) -> Result<(), WorkletError> {
        self.inner.bridge.schedule(task)
    }

    /// The context this runtime belongs to, unless it has been dropped
    pub fn context(&self) -> Option<WorkletsContext> {
        self.inner.context.upgrade().map(WorkletsContext::from_inner)
    }

    pub(crate) fn belongs_to(&self, context: &Weak<ContextInner>) -> bool {
        Weak::ptr_eq(&self.inner.context, context)
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        *self.inner.state.lock() = state;
    }

    /// Move to `ShuttingDown`; false if shutdown already started
    pub(crate) fn begin_shutdown(&self) -> bool {
        let mut state = self.inner.state.lock();
        match *state {
            LifecycleState::ShuttingDown | LifecycleState::Destroyed => false,
            _ => {
                *state = LifecycleState::ShuttingDown;
                true
            }
        }
    }

    pub(crate) fn bind_thread(&self) {
        let _ = self.inner.thread_id.set(std::thread::current().id());
    }

    pub(crate) fn set_join_handle(&self, handle: JoinHandle<usize>) {
        *self.inner.thread.lock() = Some(handle);
    }

    pub(crate) fn take_join_handle(&self) -> Option<JoinHandle<usize>> {
        self.inner.thread.lock().take()
    }
}

impl PartialEq for RuntimeHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RuntimeHandle {}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<RuntimeHandle>> = const { RefCell::new(None) };
    static THREAD_INDEX: usize = next_thread_index();
}

fn next_thread_index() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The runtime whose task is executing on this thread, if any
pub fn current() -> Option<RuntimeHandle> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn set_current(handle: Option<RuntimeHandle>) {
    CURRENT.with(|current| *current.borrow_mut() = handle);
}

/// Small stable number identifying the calling thread
///
/// Used by `getCurrentThreadId()` so scripts can assert which thread they run
/// on without exposing OS thread ids.
pub fn current_thread_index() -> usize {
    THREAD_INDEX.with(|index| *index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{CallInvoker, CallInvokerBridge};

    struct Discard;

    impl CallInvoker for Discard {
        fn invoke_async(&self, _work: Box<dyn FnOnce() + Send>) {}
    }

    fn handle(name: &str) -> RuntimeHandle {
        RuntimeHandle::new_cyclic(
            RuntimeId(1),
            name.to_string(),
            RuntimeKind::Main,
            Weak::new(),
            |runtime| CallInvokerBridge::hosted(name, Arc::new(Discard), runtime),
        )
    }

    #[test]
    fn runtime_id_display() {
        assert_eq!(RuntimeId(12).to_string(), "#12");
    }

    #[test]
    fn new_handle_is_starting_and_not_accepting() {
        let handle = handle("main");
        assert_eq!(handle.state(), LifecycleState::Starting);
        assert!(!handle.is_accepting());
        assert!(handle.is_main());
        assert!(handle.thread_id().is_none());
        assert!(!handle.is_current_thread());
    }

    #[test]
    fn shutdown_starts_once() {
        let handle = handle("main");
        handle.set_state(LifecycleState::Running);
        assert!(handle.begin_shutdown());
        assert!(!handle.begin_shutdown());
        assert_eq!(handle.state(), LifecycleState::ShuttingDown);
    }

    #[test]
    fn bind_thread_records_caller() {
        let handle = handle("main");
        handle.bind_thread();
        assert!(handle.is_current_thread());

        let other = handle.clone();
        let on_other = std::thread::spawn(move || other.is_current_thread())
            .join()
            .unwrap();
        assert!(!on_other);
    }

    #[test]
    fn thread_index_differs_between_threads() {
        let here = current_thread_index();
        assert_eq!(here, current_thread_index());
        let there = std::thread::spawn(current_thread_index).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = handle("a");
        let b = handle("a");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
