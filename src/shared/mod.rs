// Shared values - versioned mutable boxes visible from every runtime

mod listener;

pub use listener::{ListenerFn, ListenerId};

use crate::config::NotifyPolicy;
use crate::invoker::Task;
use crate::runtime::{RuntimeHandle, RuntimeId, RuntimeScope};
use crate::worklet::WorkletValue;
use listener::Listener;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier of a shared value
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedValueId(pub u64);

impl SharedValueId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SharedValueId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SharedValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shared#{}", self.0)
    }
}

struct Versioned {
    value: WorkletValue,
    version: u64,
}

/// Reference-counted, version-tracked box readable and writable from any
/// runtime
///
/// Writers are serialized; a reader always sees a value together with the
/// version of the write that produced it. Each write bumps the version and
/// queues a notification for every listener on that listener's own runtime.
#[derive(Clone)]
pub struct SharedValue {
    inner: Arc<SharedInner>,
}

pub(crate) struct SharedInner {
    id: SharedValueId,
    policy: NotifyPolicy,
    cell: RwLock<Versioned>,
    // Held across version bump and enqueue so notifications keep version order
    listeners: Mutex<Vec<Arc<Listener>>>,
    outbox: Mutex<Outbox>,
    store: Weak<StoreInner>,
}

/// Notifications built under the listener lock, scheduled after it is
/// released. One flushing thread at a time keeps them in version order.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<(Arc<Listener>, Task)>,
    flushing: bool,
}

impl SharedInner {
    pub(crate) fn snapshot(&self) -> (WorkletValue, u64) {
        let cell = self.cell.read();
        (cell.value.clone(), cell.version)
    }
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.values.lock().remove(&self.id);
        }
    }
}

impl SharedValue {
    /// Standalone shared value, not tracked by any store
    pub fn new(initial: impl Into<WorkletValue>) -> Self {
        Self::with_policy(initial.into(), NotifyPolicy::default(), Weak::new())
    }

    fn with_policy(initial: WorkletValue, policy: NotifyPolicy, store: Weak<StoreInner>) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                id: SharedValueId::next(),
                policy,
                cell: RwLock::new(Versioned {
                    value: initial,
                    version: 0,
                }),
                listeners: Mutex::new(Vec::new()),
                outbox: Mutex::new(Outbox::default()),
                store,
            }),
        }
    }

    pub fn id(&self) -> SharedValueId {
        self.inner.id
    }

    pub fn policy(&self) -> NotifyPolicy {
        self.inner.policy
    }

    pub fn get(&self) -> WorkletValue {
        self.inner.cell.read().value.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.cell.read().version
    }

    /// Value and the version that wrote it, read atomically
    pub fn snapshot(&self) -> (WorkletValue, u64) {
        self.inner.snapshot()
    }

    /// Replace the value; returns the new version
    ///
    /// Listener notifications are scheduled after every lock is released, so
    /// a host invoker that runs work inline may call back into this value.
    pub fn set(&self, value: impl Into<WorkletValue>) -> u64 {
        let value = value.into();
        let version = {
            let listeners = self.inner.listeners.lock();
            let notify_value = self.wants_value(&listeners).then(|| value.clone());

            let version = {
                let mut cell = self.inner.cell.write();
                cell.value = value;
                cell.version += 1;
                cell.version
            };
            self.enqueue(&listeners, version, notify_value);
            version
        };
        self.flush();
        version
    }

    /// Atomic read-modify-write; returns the new version
    ///
    /// `f` runs under the write lock and must not access this shared value.
    pub fn update(&self, f: impl FnOnce(&WorkletValue) -> WorkletValue) -> u64 {
        let version = {
            let listeners = self.inner.listeners.lock();
            let wants_value = self.wants_value(&listeners);

            let (version, notify_value) = {
                let mut cell = self.inner.cell.write();
                let next = f(&cell.value);
                let notify_value = wants_value.then(|| next.clone());
                cell.value = next;
                cell.version += 1;
                (cell.version, notify_value)
            };
            self.enqueue(&listeners, version, notify_value);
            version
        };
        self.flush();
        version
    }

    /// Observe changes from `runtime`; the callback always runs on that
    /// runtime's thread, never inline in `set`
    pub fn add_listener<F>(&self, runtime: &RuntimeHandle, callback: F) -> ListenerId
    where
        F: Fn(&mut RuntimeScope<'_>, &WorkletValue, u64) + Send + Sync + 'static,
    {
        let listener = Listener::new(runtime.clone(), Arc::new(callback));
        let id = listener.id;
        self.inner.listeners.lock().push(listener);
        tracing::trace!(shared = %self.id(), listener = %id, runtime = runtime.name(), "listener added");
        id
    }

    /// Returns false if no such listener was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| {
            if listener.id == id {
                listener.detach();
                false
            } else {
                true
            }
        });
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn remove_listeners_for(&self, runtime: RuntimeId) -> usize {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| {
            if listener.runtime.id() == runtime {
                listener.detach();
                false
            } else {
                true
            }
        });
        before - listeners.len()
    }

    fn wants_value(&self, listeners: &[Arc<Listener>]) -> bool {
        !listeners.is_empty() && self.inner.policy == NotifyPolicy::EveryVersion
    }

    fn enqueue(&self, listeners: &[Arc<Listener>], version: u64, value: Option<WorkletValue>) {
        let mut outbox = self.inner.outbox.lock();
        for listener in listeners {
            let task = match (self.inner.policy, &value) {
                (NotifyPolicy::EveryVersion, Some(value)) => {
                    listener.version_task(value.clone(), version)
                }
                _ => {
                    if !listener.try_mark_pending() {
                        continue;
                    }
                    listener.latest_task(Arc::downgrade(&self.inner))
                }
            };
            outbox.queue.push_back((listener.clone(), task));
        }
    }

    /// Schedule queued notifications with no lock held
    ///
    /// Returns at once if another call is already flushing; that call picks up
    /// whatever was queued here.
    fn flush(&self) {
        {
            let mut outbox = self.inner.outbox.lock();
            if outbox.flushing || outbox.queue.is_empty() {
                return;
            }
            outbox.flushing = true;
        }

        loop {
            let next = {
                let mut outbox = self.inner.outbox.lock();
                let next = outbox.queue.pop_front();
                if next.is_none() {
                    outbox.flushing = false;
                }
                next
            };
            let Some((listener, task)) = next else {
                return;
            };

            if listener.runtime.schedule(task).is_err() {
                tracing::debug!(
                    shared = %self.inner.id,
                    listener = %listener.id,
                    runtime = listener.runtime.name(),
                    "dropping listener of unavailable runtime"
                );
                listener.detach();
                self.inner
                    .listeners
                    .lock()
                    .retain(|registered| registered.id != listener.id);
            }
        }
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, version) = self.snapshot();
        f.debug_struct("SharedValue")
            .field("id", &self.inner.id)
            .field("version", &version)
            .field("value", &value)
            .finish()
    }
}

/// Registry of live shared values
///
/// Entries are weak: a shared value lives as long as some runtime or closure
/// holds it, and removes itself from the store when dropped.
#[derive(Clone)]
pub struct SharedValueStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    policy: NotifyPolicy,
    values: Mutex<HashMap<SharedValueId, Weak<SharedInner>>>,
}

impl SharedValueStore {
    pub fn new(policy: NotifyPolicy) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                policy,
                values: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn policy(&self) -> NotifyPolicy {
        self.inner.policy
    }

    pub fn create(&self, initial: impl Into<WorkletValue>) -> SharedValue {
        let shared = SharedValue::with_policy(
            initial.into(),
            self.inner.policy,
            Arc::downgrade(&self.inner),
        );
        self.inner
            .values
            .lock()
            .insert(shared.id(), Arc::downgrade(&shared.inner));
        shared
    }

    pub fn get(&self, id: SharedValueId) -> Option<SharedValue> {
        let inner = self.inner.values.lock().get(&id).and_then(Weak::upgrade);
        inner.map(|inner| SharedValue { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach every listener owned by `runtime`; returns how many were removed
    pub fn remove_listeners_for(&self, runtime: RuntimeId) -> usize {
        // Upgrade under the lock, drop outside it: a last reference dropping
        // here re-enters the store to unregister itself.
        let live: Vec<SharedValue> = self
            .inner
            .values
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .map(|inner| SharedValue { inner })
            .collect();

        live.iter()
            .map(|shared| shared.remove_listeners_for(runtime))
            .sum()
    }
}

impl Default for SharedValueStore {
    fn default() -> Self {
        Self::new(NotifyPolicy::default())
    }
}
