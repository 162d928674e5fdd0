// Runtime registry - owns the main runtime and every worker runtime

use super::worker::{self, WorkerParams};
use super::{LifecycleState, RuntimeHandle, RuntimeId, RuntimeKind};
use crate::config::{ShutdownMode, WorkletsConfig};
use crate::context::ContextInner;
use crate::engine::EngineFactory;
use crate::error::WorkletError;
use crate::events::{EventBus, RuntimeEvent};
use crate::invoker::{CallInvoker, CallInvokerBridge, Task};
use crate::shared::SharedValueStore;
use crate::worklet::WorkletValue;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Globals installed into every worker runtime, in insertion order
#[derive(Default)]
struct Decorators {
    entries: Vec<(String, WorkletValue)>,
    generation: u64,
}

impl Decorators {
    fn snapshot(&self) -> Vec<(String, WorkletValue)> {
        self.entries.clone()
    }
}

/// A worker thread that has been spawned but not yet reported its bootstrap
struct Spawned {
    handle: RuntimeHandle,
    thread: JoinHandle<usize>,
    ready: oneshot::Receiver<Result<(), WorkletError>>,
    // Decorator generation the thread was given
    generation: u64,
}

/// Owns the set of runtimes of one installed bridge
///
/// Each worker runtime is paired with a dedicated thread and a task queue.
/// The main runtime wraps the host's engine and thread; the registry never
/// spawns or joins that thread.
pub struct RuntimeRegistry {
    context: Weak<ContextInner>,
    factory: Arc<dyn EngineFactory>,
    config: WorkletsConfig,
    store: SharedValueStore,
    events: EventBus,
    runtimes: RwLock<BTreeMap<RuntimeId, RuntimeHandle>>,
    main: RwLock<Option<RuntimeHandle>>,
    next_id: AtomicU64,
    decorators: RwLock<Decorators>,
    // Default runtime between spawn and bootstrap completion
    default_slot: Mutex<Option<RuntimeHandle>>,
}

impl RuntimeRegistry {
    pub(crate) fn new(
        context: Weak<ContextInner>,
        factory: Arc<dyn EngineFactory>,
        config: WorkletsConfig,
        store: SharedValueStore,
        events: EventBus,
    ) -> Self {
        Self {
            context,
            factory,
            config,
            store,
            events,
            runtimes: RwLock::new(BTreeMap::new()),
            main: RwLock::new(None),
            next_id: AtomicU64::new(1),
            decorators: RwLock::new(Decorators::default()),
            default_slot: Mutex::new(None),
        }
    }

    fn allocate_id(&self) -> RuntimeId {
        RuntimeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Spin up a worker runtime on a new thread
    ///
    /// Returns once the engine has finished bootstrap. On failure no handle is
    /// returned and no thread is left running. Blocks the caller, so async
    /// code calls it through `spawn_blocking`.
    pub fn create_runtime(&self, name: &str) -> Result<RuntimeHandle, WorkletError> {
        let spawned = self.spawn_runtime(name)?;
        self.finish_runtime(spawned)
    }

    fn spawn_runtime(&self, name: &str) -> Result<Spawned, WorkletError> {
        let id = self.allocate_id();
        let (bridge, receiver) = CallInvokerBridge::queued(name);
        let handle = RuntimeHandle::new(
            id,
            name.to_string(),
            RuntimeKind::Worklet,
            bridge,
            self.context.clone(),
        );

        let (decorators, generation) = {
            let decorators = self.decorators.read();
            (decorators.snapshot(), decorators.generation)
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let params = WorkerParams {
            handle: handle.clone(),
            receiver,
            factory: self.factory.clone(),
            config: self.config.runtime.clone(),
            shutdown: self.config.shutdown,
            decorators,
            ready: ready_tx,
        };

        let thread = std::thread::Builder::new()
            .name(format!("worklets-{}", name.replace('\0', "")))
            .spawn(move || worker::run(params))
            .map_err(|err| WorkletError::RuntimeInit {
                name: name.to_string(),
                reason: format!("failed to spawn thread: {err}"),
            })?;

        Ok(Spawned {
            handle,
            thread,
            ready: ready_rx,
            generation,
        })
    }

    /// Wait for a spawned runtime's bootstrap and register it
    fn finish_runtime(&self, spawned: Spawned) -> Result<RuntimeHandle, WorkletError> {
        let Spawned {
            handle,
            thread,
            ready,
            generation,
        } = spawned;
        let name = handle.name().to_string();

        let failure = match ready.blocking_recv() {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(WorkletError::RuntimeInit {
                name: name.clone(),
                reason: "runtime thread exited during bootstrap".to_string(),
            }),
        };
        if let Some(err) = failure {
            // Anything queued on the handle meanwhile is rejected from now on
            handle.bridge().shutdown();
            handle.set_state(LifecycleState::Destroyed);
            let _ = thread.join();
            return Err(err);
        }

        handle.set_join_handle(thread);
        handle.set_state(LifecycleState::Running);
        self.runtimes.write().insert(handle.id(), handle.clone());

        // A decorator added while the thread booted has missed both the
        // snapshot and the broadcast
        {
            let decorators = self.decorators.read();
            if decorators.generation != generation {
                for (name, value) in &decorators.entries {
                    let _ = handle.schedule(decorate_task(name, value));
                }
            }
        }

        tracing::info!(runtime = %name, id = %handle.id(), "runtime created");
        self.events.emit(RuntimeEvent::RuntimeCreated {
            runtime_id: handle.id(),
            name,
            kind: RuntimeKind::Worklet,
        });
        Ok(handle)
    }

    /// Handle for the host's runtime, bridged through its call invoker
    pub(crate) fn register_main(
        &self,
        name: &str,
        invoker: Arc<dyn CallInvoker>,
    ) -> RuntimeHandle {
        RuntimeHandle::new_cyclic(
            self.allocate_id(),
            name.to_string(),
            RuntimeKind::Main,
            self.context.clone(),
            |runtime| CallInvokerBridge::hosted(name, invoker, runtime),
        )
    }

    /// Record a bootstrapped main runtime as live
    pub(crate) fn activate_main(&self, handle: &RuntimeHandle) {
        handle.set_state(LifecycleState::Running);
        self.runtimes.write().insert(handle.id(), handle.clone());
        *self.main.write() = Some(handle.clone());

        tracing::info!(runtime = handle.name(), id = %handle.id(), "main runtime installed");
        self.events.emit(RuntimeEvent::Installed {
            runtime_id: handle.id(),
            name: handle.name().to_string(),
        });
    }

    /// Shut a runtime down and release everything it owns
    ///
    /// Closes the bridge, cancels (or drains, per [`ShutdownMode`]) queued
    /// tasks, joins the thread unless called from it, and removes the
    /// runtime's shared value listeners. Returns the number of cancelled
    /// tasks. Destroying an already destroyed runtime is a no-op.
    ///
    /// [`ShutdownMode`]: crate::config::ShutdownMode
    pub fn destroy_runtime(&self, handle: &RuntimeHandle) -> Result<usize, WorkletError> {
        if !handle.belongs_to(&self.context) {
            return Err(WorkletError::RuntimeUnavailable(handle.name().to_string()));
        }
        if !handle.begin_shutdown() {
            return Ok(0);
        }

        handle.bridge().shutdown();
        let cancelled = match handle.kind() {
            RuntimeKind::Worklet => join_worker(handle),
            RuntimeKind::Main => {
                release_main(handle, self.config.shutdown);
                0
            }
        };

        let listeners = self.store.remove_listeners_for(handle.id());
        handle.set_state(LifecycleState::Destroyed);
        self.runtimes.write().remove(&handle.id());
        {
            let mut main = self.main.write();
            if main.as_ref() == Some(handle) {
                *main = None;
            }
        }

        tracing::info!(
            runtime = handle.name(),
            id = %handle.id(),
            cancelled,
            listeners,
            "runtime destroyed"
        );
        self.events.emit(RuntimeEvent::RuntimeDestroyed {
            runtime_id: handle.id(),
            name: handle.name().to_string(),
            cancelled_tasks: cancelled,
        });
        Ok(cancelled)
    }

    pub fn main_runtime(&self) -> Option<RuntimeHandle> {
        self.main.read().clone()
    }

    /// Live runtime by id, main included
    ///
    /// A default runtime still running its bootstrap is found too, so its own
    /// bootstrap script can address it.
    pub fn runtime(&self, id: RuntimeId) -> Option<RuntimeHandle> {
        if let Some(handle) = self.runtimes.read().get(&id) {
            return Some(handle.clone());
        }
        self.default_slot
            .lock()
            .as_ref()
            .filter(|handle| handle.id() == id)
            .cloned()
    }

    /// Oldest live runtime with this name
    pub fn runtime_by_name(&self, name: &str) -> Option<RuntimeHandle> {
        self.runtimes
            .read()
            .values()
            .find(|handle| handle.name() == name)
            .cloned()
    }

    /// Live worker runtimes in creation order
    pub fn runtimes(&self) -> Vec<RuntimeHandle> {
        self.runtimes
            .read()
            .values()
            .filter(|handle| handle.kind() == RuntimeKind::Worklet)
            .cloned()
            .collect()
    }

    /// The shared background runtime, created on first use
    ///
    /// Concurrent first calls share one runtime. While it boots, further
    /// calls get the starting handle; tasks scheduled on it run once the
    /// bootstrap finishes.
    pub fn default_runtime(&self) -> Result<RuntimeHandle, WorkletError> {
        let name = &self.config.default_runtime_name;
        let spawned = {
            let mut slot = self.default_slot.lock();
            let existing = self
                .runtimes
                .read()
                .values()
                .find(|handle| {
                    handle.kind() == RuntimeKind::Worklet
                        && handle.name() == name
                        && handle.is_accepting()
                })
                .cloned();
            if let Some(handle) = existing {
                return Ok(handle);
            }
            if let Some(starting) = slot.as_ref() {
                return Ok(starting.clone());
            }
            let spawned = self.spawn_runtime(name)?;
            *slot = Some(spawned.handle.clone());
            spawned
        };

        // The slot lock is released here: the new thread's bootstrap may
        // itself ask for the default runtime
        let result = self.finish_runtime(spawned);
        *self.default_slot.lock() = None;
        result
    }

    /// Install `value` as the global `name` in every worker runtime, current
    /// and future
    ///
    /// Live runtimes receive the global through a task, so it is visible to
    /// every task scheduled after this call returns. Re-adding a name
    /// replaces its value.
    pub fn add_decorator(&self, name: &str, value: WorkletValue) -> Result<(), WorkletError> {
        if name.is_empty() {
            return Err(WorkletError::execution("decorator name must not be empty"));
        }

        let mut decorators = self.decorators.write();
        match decorators.entries.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => *slot = value.clone(),
            None => decorators.entries.push((name.to_string(), value.clone())),
        }
        decorators.generation += 1;

        // Still under the write lock: a runtime registered after this point
        // sees the new generation in `finish_runtime`
        let live = self.runtimes();
        for runtime in &live {
            let _ = runtime.schedule(decorate_task(name, &value));
        }
        tracing::debug!(decorator = name, runtimes = live.len(), "decorator added");
        Ok(())
    }

    /// Names of the installed decorators, in insertion order
    pub fn decorator_names(&self) -> Vec<String> {
        self.decorators
            .read()
            .entries
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Destroy every worker runtime, then the main runtime; returns the total
    /// number of cancelled tasks
    pub fn shutdown_all(&self) -> usize {
        let mut cancelled = 0;
        for handle in self.runtimes() {
            cancelled += self.destroy_runtime(&handle).unwrap_or(0);
        }
        if let Some(main) = self.main_runtime() {
            cancelled += self.destroy_runtime(&main).unwrap_or(0);
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.runtimes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RuntimeRegistry {
    fn drop(&mut self) {
        // Let worker threads run out instead of parking forever
        for handle in self.runtimes.get_mut().values() {
            handle.bridge().shutdown();
        }
    }
}

fn join_worker(handle: &RuntimeHandle) -> usize {
    let Some(thread) = handle.take_join_handle() else {
        return 0;
    };
    if handle.is_current_thread() {
        // The loop exits after the current task; the thread detaches
        tracing::debug!(runtime = handle.name(), "runtime destroyed from its own thread");
        return 0;
    }
    match thread.join() {
        Ok(cancelled) => cancelled,
        Err(_) => {
            tracing::error!(runtime = handle.name(), "runtime thread panicked");
            0
        }
    }
}

fn decorate_task(name: &str, value: &WorkletValue) -> Task {
    let (name, value) = (name.to_string(), value.clone());
    Task::new("decorate", move |scope| {
        if let Err(err) = scope.engine().set_global(&name, &value) {
            tracing::warn!(
                runtime = scope.runtime().name(),
                decorator = %name,
                error = %err,
                "failed to install decorator"
            );
        }
    })
}

fn release_main(handle: &RuntimeHandle, shutdown: ShutdownMode) {
    let id = handle.id();
    let invoker = handle.bridge().host_invoker();
    match invoker {
        // Tasks forwarded before the close are ahead of this in the host's
        // queue and still find the engine
        Some(invoker) if shutdown == ShutdownMode::Drain => {
            invoker.invoke_async(Box::new(move || {
                worker::release_hosted(id);
            }));
        }
        _ if handle.is_current_thread() => {
            worker::release_hosted(id);
        }
        Some(invoker) => {
            invoker.invoke_async(Box::new(move || {
                worker::release_hosted(id);
            }));
        }
        None => {}
    }
}
