// Change listeners for shared values

use super::SharedInner;
use crate::invoker::Task;
use crate::runtime::{RuntimeHandle, RuntimeScope};
use crate::worklet::WorkletValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Identifier returned by `add_listener`
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(pub u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Callback run on the listener's runtime with `(value, version)`
pub type ListenerFn = dyn Fn(&mut RuntimeScope<'_>, &WorkletValue, u64) + Send + Sync;

pub(crate) struct Listener {
    pub(crate) id: ListenerId,
    pub(crate) runtime: RuntimeHandle,
    callback: Arc<ListenerFn>,
    last_delivered: AtomicU64,
    pending: AtomicBool,
    detached: AtomicBool,
}

impl Listener {
    pub(crate) fn new(runtime: RuntimeHandle, callback: Arc<ListenerFn>) -> Arc<Self> {
        Arc::new(Self {
            id: ListenerId::next(),
            runtime,
            callback,
            last_delivered: AtomicU64::new(0),
            pending: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        })
    }

    /// Stop delivering; notifications already queued become no-ops
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Claim the single pending slot used by the `Latest` policy
    pub(crate) fn try_mark_pending(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    /// Notification carrying exactly `version`
    pub(crate) fn version_task(self: &Arc<Self>, value: WorkletValue, version: u64) -> Task {
        let listener = self.clone();
        Task::new("shared-value-notify", move |scope| {
            listener.deliver(scope, &value, version);
        })
    }

    /// Notification reading the newest value when it runs
    pub(crate) fn latest_task(self: &Arc<Self>, source: Weak<SharedInner>) -> Task {
        let listener = self.clone();
        Task::new("shared-value-notify", move |scope| {
            listener.pending.store(false, Ordering::Release);
            if let Some(source) = source.upgrade() {
                let (value, version) = source.snapshot();
                listener.deliver(scope, &value, version);
            }
        })
    }

    fn deliver(&self, scope: &mut RuntimeScope<'_>, value: &WorkletValue, version: u64) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        // Versions only move forward per listener
        if self.last_delivered.fetch_max(version, Ordering::AcqRel) >= version {
            return;
        }
        (self.callback)(scope, value, version);
    }
}
