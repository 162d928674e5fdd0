// Worklets context - one installed bridge: registry, store, dispatcher, events

use crate::config::WorkletsConfig;
use crate::dispatch::{PendingResult, WorkletDispatcher};
use crate::engine::{default_factory, EngineFactory, JsEngine};
use crate::error::WorkletError;
use crate::events::{EventBus, RuntimeEvent};
use crate::invoker::CallInvoker;
use crate::runtime::{self, worker, RuntimeHandle, RuntimeKind, RuntimeRegistry};
use crate::shared::{SharedValue, SharedValueStore};
use crate::worklet::{WorkletClosure, WorkletValue};
use std::sync::Arc;

/// Name given to the host-supplied runtime
pub const MAIN_RUNTIME_NAME: &str = "main";

/// Handle to an installed worklet bridge
///
/// Cheap to clone. Every runtime created through it keeps a weak reference
/// back, so dropping the last context shuts the worker threads down.
#[derive(Clone)]
pub struct WorkletsContext {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    config: WorkletsConfig,
    events: EventBus,
    store: SharedValueStore,
    dispatcher: WorkletDispatcher,
    registry: RuntimeRegistry,
}

impl WorkletsContext {
    pub fn new(config: WorkletsConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let events = EventBus::new();
        let store = SharedValueStore::new(config.notify);

        let inner = Arc::new_cyclic(|context| ContextInner {
            registry: RuntimeRegistry::new(
                context.clone(),
                factory,
                config.clone(),
                store.clone(),
                events.clone(),
            ),
            config,
            events,
            store,
            dispatcher: WorkletDispatcher::new(),
        });
        Self { inner }
    }

    /// Default configuration and the default engine factory
    pub fn with_defaults() -> Self {
        Self::new(WorkletsConfig::default(), default_factory())
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &WorkletsConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &SharedValueStore {
        &self.inner.store
    }

    pub fn dispatcher(&self) -> &WorkletDispatcher {
        &self.inner.dispatcher
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register the host's engine as the main runtime
    ///
    /// Must be called on the host thread: the engine stays parked on it and
    /// every task for the main runtime arrives there through `invoker`. If
    /// bootstrap fails nothing is registered.
    pub fn install_main(
        &self,
        mut engine: Box<dyn JsEngine>,
        invoker: Arc<dyn CallInvoker>,
    ) -> Result<RuntimeHandle, WorkletError> {
        if let Some(main) = self.main_runtime() {
            return Err(WorkletError::RuntimeInit {
                name: main.name().to_string(),
                reason: "a main runtime is already installed".to_string(),
            });
        }

        let registry = &self.inner.registry;
        let handle = registry.register_main(MAIN_RUNTIME_NAME, invoker);
        engine
            .bootstrap(&handle, &self.inner.config.runtime)
            .map_err(|err| WorkletError::RuntimeInit {
                name: MAIN_RUNTIME_NAME.to_string(),
                reason: err.to_string(),
            })?;

        worker::host_engine(&handle, engine)?;
        registry.activate_main(&handle);
        Ok(handle)
    }

    pub fn main_runtime(&self) -> Option<RuntimeHandle> {
        self.inner.registry.main_runtime()
    }

    pub fn create_runtime(&self, name: &str) -> Result<RuntimeHandle, WorkletError> {
        self.inner.registry.create_runtime(name)
    }

    pub fn destroy_runtime(&self, runtime: &RuntimeHandle) -> Result<usize, WorkletError> {
        self.inner.registry.destroy_runtime(runtime)
    }

    pub fn default_runtime(&self) -> Result<RuntimeHandle, WorkletError> {
        self.inner.registry.default_runtime()
    }

    pub fn create_shared_value(&self, initial: impl Into<WorkletValue>) -> SharedValue {
        self.inner.store.create(initial)
    }

    /// Install `value` as a global in every worker runtime, current and future
    ///
    /// Only the host side may decorate: calling this from a worker runtime's
    /// thread fails.
    pub fn add_decorator(
        &self,
        name: &str,
        value: impl Into<WorkletValue>,
    ) -> Result<(), WorkletError> {
        if runtime::current().is_some_and(|current| current.kind() == RuntimeKind::Worklet) {
            return Err(WorkletError::execution(
                "addDecorator should only be called from the javascript runtime",
            ));
        }
        self.inner.registry.add_decorator(name, value.into())
    }

    /// Run `worklet` on the main runtime
    pub fn run_on_main(
        &self,
        worklet: Arc<WorkletClosure>,
        args: Vec<WorkletValue>,
    ) -> PendingResult {
        match self.main_runtime() {
            Some(main) => self.inner.dispatcher.run_async(worklet, &main, args),
            None => PendingResult::failed(WorkletError::RuntimeUnavailable(
                MAIN_RUNTIME_NAME.to_string(),
            )),
        }
    }

    /// Destroy every runtime; returns the number of cancelled tasks
    pub fn teardown(&self) -> usize {
        let cancelled = self.inner.registry.shutdown_all();
        tracing::info!(cancelled, "worklets torn down");
        self.inner.events.emit(RuntimeEvent::TornDown);
        cancelled
    }
}

impl std::fmt::Debug for WorkletsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkletsContext")
            .field("runtimes", &self.inner.registry.len())
            .field("shared_values", &self.inner.store.len())
            .finish()
    }
}
