// Continuations - where a worklet's result is delivered

use super::WorkletResult;
use crate::error::WorkletError;
use crate::invoker::Task;
use crate::runtime::{RuntimeHandle, RuntimeScope};
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Deliver = Box<dyn FnOnce(WorkletResult) + Send>;

/// Receiver of a dispatched worklet's result
///
/// Resolves at most once; later calls to [`resolve`](Self::resolve) are
/// ignored. A continuation dropped without being resolved delivers
/// [`WorkletError::Cancelled`], so no caller waits forever on a task that was
/// discarded.
#[derive(Clone)]
pub struct Continuation {
    slot: Arc<Slot>,
}

struct Slot {
    deliver: Mutex<Option<Deliver>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.get_mut().take() {
            deliver(Err(WorkletError::Cancelled));
        }
    }
}

impl Continuation {
    /// Deliver inline on whichever thread resolves
    pub fn new(deliver: impl FnOnce(WorkletResult) + Send + 'static) -> Self {
        Self {
            slot: Arc::new(Slot {
                deliver: Mutex::new(Some(Box::new(deliver))),
            }),
        }
    }

    /// Discard the result, logging failures
    pub fn detached(label: &'static str) -> Self {
        Self::new(move |result| {
            if let Err(err) = result {
                tracing::warn!(task = label, error = %err, "detached worklet failed");
            }
        })
    }

    /// Deliver as a task on `runtime` ("runOnJS" when `runtime` is main)
    pub fn on_runtime<F>(runtime: &RuntimeHandle, deliver: F) -> Self
    where
        F: FnOnce(&mut RuntimeScope<'_>, WorkletResult) + Send + 'static,
    {
        let runtime = runtime.clone();
        Self::new(move |result| {
            let task = Task::new("continuation", move |scope| deliver(scope, result));
            if let Err(err) = runtime.schedule(task) {
                tracing::warn!(runtime = runtime.name(), error = %err, "dropping continuation");
            }
        })
    }

    /// Deliver through a slot read by the returned [`PendingResult`]
    ///
    /// `target` is the runtime whose thread produces the result; blocking on
    /// it from that same thread is reported as a deadlock.
    pub fn channel(target: &RuntimeHandle) -> (Self, PendingResult) {
        let (completer, pending) = PendingResult::pair(Some(target.clone()));
        let continuation = Self::new(move |result| completer.complete(result));
        (continuation, pending)
    }

    pub fn resolve(&self, result: WorkletResult) {
        let deliver = self.slot.deliver.lock().take();
        if let Some(deliver) = deliver {
            deliver(result);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.deliver.lock().is_none()
    }
}

#[derive(Default)]
struct SlotState {
    result: Option<WorkletResult>,
    completed: bool,
    waker: Option<Waker>,
}

impl SlotState {
    /// The result once completed; a second take reads as cancelled
    fn take(&mut self) -> Option<WorkletResult> {
        if !self.completed {
            return None;
        }
        Some(self.result.take().unwrap_or(Err(WorkletError::Cancelled)))
    }
}

/// Single-assignment cell shared by a [`PendingResult`] and its producer
#[derive(Default)]
struct ResultSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ResultSlot {
    fn fill(&self, result: WorkletResult) {
        let waker = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.result = Some(result);
            state.completed = true;
            state.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Producer side of a [`PendingResult`]; dropping it uncompleted delivers
/// `Cancelled`
struct Completer {
    slot: Option<Arc<ResultSlot>>,
}

impl Completer {
    fn complete(mut self, result: WorkletResult) {
        if let Some(slot) = self.slot.take() {
            slot.fill(result);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Err(WorkletError::Cancelled));
        }
    }
}

/// Result of a dispatch that has not necessarily arrived yet
///
/// Await it from async code, or block with [`wait`](Self::wait) from a thread
/// that is not the producing runtime's thread. Blocking waits park the thread
/// on a condition variable and never need an async runtime, so they are also
/// safe (if wasteful) inside one.
pub struct PendingResult {
    slot: Arc<ResultSlot>,
    target: Option<RuntimeHandle>,
}

impl PendingResult {
    fn pair(target: Option<RuntimeHandle>) -> (Completer, Self) {
        let slot = Arc::new(ResultSlot::default());
        let completer = Completer {
            slot: Some(slot.clone()),
        };
        (completer, Self { slot, target })
    }

    /// Already-resolved result
    pub fn ready(target: &RuntimeHandle, result: WorkletResult) -> Self {
        let (completer, pending) = Self::pair(Some(target.clone()));
        completer.complete(result);
        pending
    }

    /// Already-failed result with no producing runtime
    pub fn failed(err: WorkletError) -> Self {
        let (completer, pending) = Self::pair(None);
        completer.complete(Err(err));
        pending
    }

    pub fn target(&self) -> Option<&RuntimeHandle> {
        self.target.as_ref()
    }

    fn deadlock(&self) -> Option<WorkletError> {
        self.target
            .as_ref()
            .filter(|target| target.is_current_thread())
            .map(|target| WorkletError::Deadlock(target.name().to_string()))
    }

    /// Block until the result arrives
    ///
    /// Fails with [`WorkletError::Deadlock`] when called on the producing
    /// runtime's own thread.
    pub fn wait(mut self) -> WorkletResult {
        if let Some(result) = self.try_take() {
            return result;
        }
        if let Some(err) = self.deadlock() {
            return Err(err);
        }

        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = state.take() {
                return result;
            }
            self.slot.ready.wait(&mut state);
        }
    }

    /// Block for at most `timeout`; `None` if the result has not arrived
    ///
    /// Same deadlock rule as [`wait`](Self::wait).
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<WorkletResult> {
        if let Some(result) = self.try_take() {
            return Some(result);
        }
        if let Some(err) = self.deadlock() {
            return Some(Err(err));
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = state.take() {
                return Some(result);
            }
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                return state.take();
            }
        }
    }

    /// Non-blocking poll for the result
    pub fn try_take(&mut self) -> Option<WorkletResult> {
        self.slot.state.lock().take()
    }
}

impl Future for PendingResult {
    type Output = WorkletResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        match state.take() {
            Some(result) => Poll::Ready(result),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl std::fmt::Debug for PendingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResult")
            .field("target", &self.target.as_ref().map(RuntimeHandle::name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worklet::WorkletValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn resolves_only_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let continuation = Continuation::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        continuation.resolve(Ok(WorkletValue::from(1)));
        continuation.clone().resolve(Ok(WorkletValue::from(2)));
        assert!(continuation.is_resolved());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_unresolved_delivers_cancelled() {
        let result = Arc::new(Mutex::new(None));
        let seen = result.clone();
        let continuation = Continuation::new(move |r| *seen.lock() = Some(r));
        let clone = continuation.clone();

        drop(continuation);
        assert!(result.lock().is_none());
        drop(clone);
        assert_eq!(*result.lock(), Some(Err(WorkletError::Cancelled)));
    }

    #[test]
    fn failed_result_is_immediate() {
        let mut pending = PendingResult::failed(WorkletError::Cancelled);
        assert_eq!(pending.try_take(), Some(Err(WorkletError::Cancelled)));
    }

    #[test]
    fn wait_timeout_returns_none_when_nothing_arrives() {
        let (_completer, mut pending) = PendingResult::pair(None);
        assert!(pending.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn wait_timeout_wakes_on_completion() {
        let (completer, mut pending) = PendingResult::pair(None);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            completer.complete(Ok(WorkletValue::from(7)));
        });
        assert_eq!(
            pending.wait_timeout(Duration::from_secs(5)),
            Some(Ok(WorkletValue::from(7)))
        );
    }

    #[test]
    fn dropped_completer_reads_as_cancelled() {
        let (completer, pending) = PendingResult::pair(None);
        drop(completer);
        assert_eq!(pending.wait(), Err(WorkletError::Cancelled));
    }

    #[tokio::test]
    async fn pending_result_is_a_future() {
        let (completer, pending) = PendingResult::pair(None);
        std::thread::spawn(move || {
            completer.complete(Ok(WorkletValue::from("done")));
        });
        assert_eq!(pending.await, Ok(WorkletValue::from("done")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_timeout_inside_async_code() {
        let (completer, mut pending) = PendingResult::pair(None);
        assert!(pending.wait_timeout(Duration::from_millis(5)).is_none());

        completer.complete(Ok(WorkletValue::from(1)));
        assert_eq!(
            pending.wait_timeout(Duration::from_millis(5)),
            Some(Ok(WorkletValue::from(1)))
        );
    }
}
