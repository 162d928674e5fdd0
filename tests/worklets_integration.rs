// Integration tests for cross-runtime worklet execution
//
// These tests play the host application: a dedicated thread runs a
// `HostEventLoop` and owns the main runtime, worker runtimes run on their own
// threads, and every scenario checks where and in which order things ran.
//
// Run with: cargo test --test worklets_integration

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use worklets::engine::{CallbackId, EngineFactory, JsEngine, NativeCallback};
use worklets::{
    Continuation, EngineError, HostEventLoop, HostInvoker, ListenerId, NativeEngine,
    NativeEngineFactory, NotifyPolicy, RuntimeConfig, RuntimeEvent, RuntimeHandle, ShutdownMode,
    Task, WorkletClosure, WorkletCode, WorkletError, WorkletValue, WorkletsConfig,
    WorkletsContext,
};

/// A bridge installed on a host thread that runs a `HostEventLoop`
struct Host {
    context: WorkletsContext,
    main: RuntimeHandle,
    invoker: HostInvoker,
    thread: Option<JoinHandle<()>>,
}

impl Host {
    fn start() -> Self {
        Self::with_config(WorkletsConfig::default())
    }

    fn with_config(config: WorkletsConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("host-main".to_string())
            .spawn(move || {
                let host = HostEventLoop::new();
                let context = WorkletsContext::new(config, Arc::new(NativeEngineFactory));
                let main = context
                    .install_main(Box::new(NativeEngine::new("main")), Arc::new(host.invoker()))
                    .expect("install main runtime");
                tx.send((context, main, host.invoker())).unwrap();
                host.run();
            })
            .unwrap();

        let (context, main, invoker) = rx.recv().unwrap();
        Self {
            context,
            main,
            invoker,
            thread: Some(thread),
        }
    }

    fn main_thread(&self) -> ThreadId {
        self.main.thread_id().unwrap()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.context.teardown();
        self.invoker.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn noop() -> Arc<WorkletClosure> {
    WorkletClosure::native("noop", |_, _| Ok(WorkletValue::Undefined))
}

/// Worklet that parks its runtime until `release` is dropped or sent to,
/// reporting on `started` once it is running
fn gate() -> (Arc<WorkletClosure>, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let release_rx = Mutex::new(release_rx);

    let worklet = WorkletClosure::native("gate", move |_, _| {
        let _ = started_tx.lock().send(());
        let _ = release_rx.lock().recv();
        Ok(WorkletValue::Undefined)
    });
    (worklet, started_rx, release_tx)
}

/// Read a global of `runtime`'s engine from a task on its thread
fn global_on(runtime: &RuntimeHandle, name: &'static str) -> WorkletValue {
    let (tx, rx) = mpsc::channel();
    runtime
        .schedule(Task::new("read-global", move |scope| {
            let _ = tx.send(scope.engine().global(name));
        }))
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn worklet_runs_on_target_runtime_thread() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();

    let whoami = WorkletClosure::native("whoami", |scope, _| {
        assert!(scope.runtime().is_current_thread());
        let name = thread::current().name().unwrap_or_default().to_string();
        Ok(WorkletValue::from(name))
    });

    let result = host
        .context
        .dispatcher()
        .run_blocking(whoami, &worker, Vec::new())
        .unwrap();
    assert_eq!(result.as_str(), Some("worklets-w1"));
    assert_ne!(worker.thread_id(), Some(thread::current().id()));
    assert_ne!(worker.thread_id(), Some(host.main_thread()));
}

#[test]
fn run_on_main_preserves_submission_order() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();
    let main_thread = host.main_thread();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let record = {
        let seen = seen.clone();
        WorkletClosure::native("record", move |scope, args| {
            assert!(scope.runtime().is_main());
            assert_eq!(thread::current().id(), main_thread);
            seen.lock().push(args[0].as_f64().unwrap() as u32);
            Ok(WorkletValue::Undefined)
        })
    };

    let producer = WorkletClosure::capture(
        "producer",
        WorkletCode::native(|scope, _| {
            let record = scope.worklet("record")?;
            for i in 0..20 {
                drop(scope.run_on_main(record, vec![WorkletValue::from(i)]));
            }
            Ok(WorkletValue::Undefined)
        }),
        [("record", record)],
    )
    .unwrap();

    host.context
        .dispatcher()
        .run_blocking(producer, &worker, Vec::new())
        .unwrap();
    host.context.run_on_main(noop(), Vec::new()).wait().unwrap();

    assert_eq!(*seen.lock(), (0..20).collect::<Vec<u32>>());
}

#[test]
fn hundred_increments_from_main_reach_hundred() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();
    let counter = host.context.create_shared_value(0);

    let increment = WorkletClosure::capture(
        "increment",
        WorkletCode::native(|scope, _| {
            let s = scope.shared("s")?;
            let next = s.get().as_f64().unwrap_or(0.0) + 1.0;
            s.set(next);
            Ok(WorkletValue::Undefined)
        }),
        [("s", counter.clone())],
    )
    .unwrap();

    let target = worker.clone();
    let fan_out = WorkletClosure::capture(
        "fan-out",
        WorkletCode::native(move |scope, _| {
            let increment = scope.worklet("increment")?;
            for _ in 0..100 {
                drop(scope.run_on(&target, increment, Vec::new()));
            }
            Ok(WorkletValue::Undefined)
        }),
        [("increment", increment)],
    )
    .unwrap();

    host.context
        .dispatcher()
        .run_blocking(fan_out, &host.main, Vec::new())
        .unwrap();
    // Queued behind the hundred increments
    host.context
        .dispatcher()
        .run_blocking(noop(), &worker, Vec::new())
        .unwrap();

    assert_eq!(counter.get(), WorkletValue::from(100));
    assert_eq!(counter.version(), 100);
}

#[test]
fn destroy_cancels_queued_tasks() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();
    let (gate, started, release) = gate();
    let ran = Arc::new(AtomicUsize::new(0));

    let blocked = host.context.dispatcher().run_async(gate, &worker, Vec::new());
    started.recv().unwrap();

    let counting = {
        let ran = ran.clone();
        WorkletClosure::native("counting", move |_, _| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(WorkletValue::Undefined)
        })
    };
    let queued: Vec<_> = (0..5)
        .map(|_| {
            host.context
                .dispatcher()
                .run_async(counting.clone(), &worker, Vec::new())
        })
        .collect();

    let destroyer = {
        let context = host.context.clone();
        let worker = worker.clone();
        thread::spawn(move || context.destroy_runtime(&worker))
    };
    wait_until(|| worker.bridge().is_closed());
    release.send(()).unwrap();

    assert_eq!(destroyer.join().unwrap().unwrap(), 5);
    assert!(blocked.wait().is_ok());
    for result in queued {
        assert_eq!(result.wait().unwrap_err(), WorkletError::Cancelled);
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let late = host.context.dispatcher().run_async(noop(), &worker, Vec::new());
    assert!(matches!(late.wait(), Err(WorkletError::RuntimeUnavailable(_))));
    assert_eq!(host.context.destroy_runtime(&worker).unwrap(), 0);
}

#[test]
fn drain_mode_runs_queued_tasks() {
    let config = WorkletsConfig {
        shutdown: ShutdownMode::Drain,
        ..WorkletsConfig::default()
    };
    let host = Host::with_config(config);
    let worker = host.context.create_runtime("w1").unwrap();
    let (gate, started, release) = gate();

    let _blocked = host.context.dispatcher().run_async(gate, &worker, Vec::new());
    started.recv().unwrap();
    let queued: Vec<_> = (0..3)
        .map(|i| {
            let value = WorkletClosure::native("value", move |_, _| Ok(WorkletValue::from(i)));
            host.context.dispatcher().run_async(value, &worker, Vec::new())
        })
        .collect();

    let destroyer = {
        let context = host.context.clone();
        let worker = worker.clone();
        thread::spawn(move || context.destroy_runtime(&worker))
    };
    wait_until(|| worker.bridge().is_closed());
    release.send(()).unwrap();

    assert_eq!(destroyer.join().unwrap().unwrap(), 0);
    let values: Vec<_> = queued.into_iter().map(|p| p.wait().unwrap()).collect();
    assert_eq!(
        values,
        vec![WorkletValue::from(0), WorkletValue::from(1), WorkletValue::from(2)]
    );
}

#[test]
fn drain_mode_runs_tasks_forwarded_to_main_before_destroy() {
    let config = WorkletsConfig {
        shutdown: ShutdownMode::Drain,
        ..WorkletsConfig::default()
    };
    // This thread is the host; nothing it is sent runs until the loop is pumped
    let host = HostEventLoop::new();
    let context = WorkletsContext::new(config, Arc::new(NativeEngineFactory));
    let main = context
        .install_main(Box::new(NativeEngine::new("main")), Arc::new(host.invoker()))
        .unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let counting = {
        let ran = ran.clone();
        WorkletClosure::native("counting", move |_, _| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(WorkletValue::Undefined)
        })
    };
    let queued: Vec<_> = (0..3)
        .map(|_| context.run_on_main(counting.clone(), Vec::new()))
        .collect();

    assert_eq!(context.destroy_runtime(&main).unwrap(), 0);
    host.run_until_idle();

    for result in queued {
        assert_eq!(result.wait(), Ok(WorkletValue::Undefined));
    }
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert!(context.main_runtime().is_none());
    let late = context.run_on_main(noop(), Vec::new());
    assert!(matches!(late.wait(), Err(WorkletError::RuntimeUnavailable(_))));
}

#[test]
fn failing_worklet_reports_to_main_and_runtime_survives() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();
    let main_thread = host.main_thread();

    let failing = WorkletClosure::native("failing", |_, _| Err(WorkletError::execution("boom")));
    let (tx, rx) = mpsc::channel();
    let continuation = Continuation::on_runtime(&host.main, move |scope, result| {
        let on_main = scope.runtime().is_main() && thread::current().id() == main_thread;
        tx.send((on_main, result)).unwrap();
    });
    host.context
        .dispatcher()
        .run(failing, &worker, Vec::new(), continuation);

    let (on_main, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(on_main);
    match result {
        Err(WorkletError::Execution { message, .. }) => assert_eq!(message, "boom"),
        other => panic!("expected execution error, got {other:?}"),
    }

    let panicking = WorkletClosure::native("panicking", |_, _| panic!("kaboom"));
    let err = host
        .context
        .dispatcher()
        .run_blocking(panicking, &worker, Vec::new())
        .unwrap_err();
    assert!(err.to_string().contains("kaboom"));

    let ok = WorkletClosure::native("ok", |_, _| Ok(WorkletValue::from("still here")));
    let value = host
        .context
        .dispatcher()
        .run_blocking(ok, &worker, Vec::new())
        .unwrap();
    assert_eq!(value.as_str(), Some("still here"));

    let stats = host.context.dispatcher().stats();
    assert_eq!(stats.failed, 2);
    assert!(stats.completed >= 1);
}

#[test]
fn listeners_see_strictly_increasing_versions() {
    let host = Host::start();
    let w1 = host.context.create_runtime("w1").unwrap();
    let w2 = host.context.create_runtime("w2").unwrap();
    let shared = host.context.create_shared_value(0);

    let observed: Vec<Arc<Mutex<Vec<u64>>>> = [&w1, &w2]
        .iter()
        .map(|runtime| {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            let expected = runtime.id();
            shared.add_listener(runtime, move |scope, value, version| {
                assert_eq!(scope.runtime().id(), expected);
                assert_eq!(value.as_f64(), Some(version as f64));
                sink.lock().push(version);
            });
            seen
        })
        .collect();

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    shared.update(|value| WorkletValue::from(value.as_f64().unwrap_or(0.0) + 1.0));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    for runtime in [&w1, &w2] {
        host.context
            .dispatcher()
            .run_blocking(noop(), runtime, Vec::new())
            .unwrap();
    }

    for seen in observed {
        let seen = seen.lock();
        assert_eq!(seen.len(), 50);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(seen.last(), Some(&50));
    }
}

#[test]
fn latest_policy_coalesces_pending_notifications() {
    let config = WorkletsConfig {
        notify: NotifyPolicy::Latest,
        ..WorkletsConfig::default()
    };
    let host = Host::with_config(config);
    let worker = host.context.create_runtime("w1").unwrap();
    let shared = host.context.create_shared_value(0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    shared.add_listener(&worker, move |_, value, version| {
        sink.lock().push((value.as_f64().unwrap(), version));
    });

    let (gate, started, release) = gate();
    let _blocked = host.context.dispatcher().run_async(gate, &worker, Vec::new());
    started.recv().unwrap();
    for i in 1..=10 {
        shared.set(i);
    }
    release.send(()).unwrap();
    host.context
        .dispatcher()
        .run_blocking(noop(), &worker, Vec::new())
        .unwrap();

    assert_eq!(*seen.lock(), vec![(10.0, 10)]);
}

#[test]
fn inline_host_invoker_can_reenter_shared_value() {
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let context = WorkletsContext::new(WorkletsConfig::default(), Arc::new(NativeEngineFactory));
        let inline = Arc::new(|work: Box<dyn FnOnce() + Send>| work());
        let main = context
            .install_main(Box::new(NativeEngine::new("main")), inline)
            .unwrap();
        let shared = context.create_shared_value(0);

        // One-shot listener that unsubscribes itself and writes again
        let own_id: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let once_seen = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let (shared, own_id, once_seen) = (shared.clone(), own_id.clone(), once_seen.clone());
            shared.clone().add_listener(&main, move |_, _, version| {
                once_seen.lock().push(version);
                if let Some(id) = own_id.lock().take() {
                    shared.remove_listener(id);
                }
                if version == 1 {
                    shared.set(2);
                }
            })
        };
        *own_id.lock() = Some(id);

        let all_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = all_seen.clone();
        shared.add_listener(&main, move |_, _, version| sink.lock().push(version));

        shared.set(1);
        let outcome = (
            once_seen.lock().clone(),
            all_seen.lock().clone(),
            shared.listener_count(),
            shared.get(),
        );
        context.teardown();
        let _ = done_tx.send(outcome);
    });

    let (once_seen, all_seen, listeners, value) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("set() with an inline invoker never returned");
    assert_eq!(once_seen, vec![1]);
    assert_eq!(all_seen, vec![1, 2]);
    assert_eq!(listeners, 1);
    assert_eq!(value, WorkletValue::from(2));
}

#[test]
fn destroying_a_runtime_removes_its_listeners() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();
    let shared = host.context.create_shared_value("x");

    shared.add_listener(&worker, |_, _, _| {});
    shared.add_listener(&host.main, |_, _, _| {});
    assert_eq!(shared.listener_count(), 2);

    host.context.destroy_runtime(&worker).unwrap();
    assert_eq!(shared.listener_count(), 1);

    // Writes after destruction only reach the surviving listener
    shared.set("y");
    assert_eq!(shared.listener_count(), 1);
}

#[test]
fn blocking_on_own_runtime_is_a_deadlock() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();

    let nested = WorkletClosure::native("nested", |scope, _| {
        let dispatcher = scope.context().dispatcher().clone();
        let direct = dispatcher.run_blocking(noop(), scope.runtime(), Vec::new());
        let waited = dispatcher.run_async(noop(), scope.runtime(), Vec::new()).wait();
        let is_deadlock = |result: &Result<WorkletValue, WorkletError>| {
            matches!(result, Err(WorkletError::Deadlock(_)))
        };
        Ok(WorkletValue::from(is_deadlock(&direct) && is_deadlock(&waited)))
    });

    let result = host
        .context
        .dispatcher()
        .run_blocking(nested, &worker, Vec::new())
        .unwrap();
    assert_eq!(result, WorkletValue::from(true));
}

#[test]
fn failing_factory_leaves_no_runtime() {
    let factory: Arc<dyn EngineFactory> = Arc::new(
        |_: &str, _: &RuntimeConfig| -> Result<Box<dyn JsEngine>, EngineError> {
            Err(EngineError::Internal("no memory for you".to_string()))
        },
    );
    let context = WorkletsContext::new(WorkletsConfig::default(), factory);
    let mut events = context.events().subscribe();

    let err = context.create_runtime("doomed").unwrap_err();
    match err {
        WorkletError::RuntimeInit { name, reason } => {
            assert_eq!(name, "doomed");
            assert!(reason.contains("no memory for you"));
        }
        other => panic!("expected RuntimeInit, got {other:?}"),
    }
    assert!(context.registry().is_empty());
    assert!(events.try_recv().is_err());
}

#[test]
fn bootstrap_script_needs_a_script_engine() {
    let mut config = WorkletsConfig::default();
    config.runtime = config.runtime.with_bootstrap("globalThis.ready = true;");
    let context = WorkletsContext::new(config, Arc::new(NativeEngineFactory));

    let err = context.create_runtime("scripted").unwrap_err();
    assert!(matches!(err, WorkletError::RuntimeInit { .. }));
    assert!(context.registry().runtime_by_name("scripted").is_none());
}

#[test]
fn live_references_cannot_be_captured() {
    let err = WorkletClosure::capture(
        "bad-name",
        WorkletCode::script("() => 1", "w.js"),
        [("not an identifier", 1)],
    )
    .unwrap_err();
    assert!(matches!(err, WorkletError::UnsupportedCapture { .. }));

    let err = WorkletClosure::capture(
        "empty",
        WorkletCode::script("   ", "w.js"),
        Vec::<(String, WorkletValue)>::new(),
    )
    .unwrap_err();
    assert!(matches!(err, WorkletError::UnsupportedCapture { .. }));

    let mut deep = WorkletValue::Null;
    for _ in 0..100 {
        deep = WorkletValue::Array(vec![deep]);
    }
    let err = WorkletClosure::capture("deep", WorkletCode::script("() => 1", "w.js"), [("deep", deep)])
        .unwrap_err();
    assert!(matches!(err, WorkletError::UnsupportedCapture { .. }));
}

#[test]
fn default_runtime_is_created_once() {
    let host = Host::start();
    let first = host.context.default_runtime().unwrap();
    let second = host.context.default_runtime().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.name(), "default");
    assert_eq!(host.context.registry().runtimes().len(), 1);

    host.context.destroy_runtime(&first).unwrap();
    let third = host.context.default_runtime().unwrap();
    assert_ne!(first, third);
}

/// Engine whose bootstrap asks for the default runtime
struct DefaultSeeking {
    inner: NativeEngine,
    found: Arc<Mutex<Vec<(String, String)>>>,
}

impl JsEngine for DefaultSeeking {
    fn kind(&self) -> &'static str {
        "default-seeking"
    }

    fn bootstrap(&mut self, runtime: &RuntimeHandle, config: &RuntimeConfig) -> Result<(), EngineError> {
        self.inner.bootstrap(runtime, config)?;
        let context = runtime
            .context()
            .ok_or_else(|| EngineError::Internal("no context".to_string()))?;
        let default = context
            .default_runtime()
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        self.found
            .lock()
            .push((runtime.name().to_string(), default.name().to_string()));
        Ok(())
    }

    fn evaluate(&mut self, source: &str, location: &str) -> Result<WorkletValue, EngineError> {
        self.inner.evaluate(source, location)
    }

    fn call_worklet(
        &mut self,
        worklet: &Arc<WorkletClosure>,
        args: &[WorkletValue],
    ) -> Result<WorkletValue, EngineError> {
        self.inner.call_worklet(worklet, args)
    }

    fn register_callback(&mut self, callback: NativeCallback) -> Result<CallbackId, EngineError> {
        self.inner.register_callback(callback)
    }

    fn invoke_callback(
        &mut self,
        id: CallbackId,
        args: &[WorkletValue],
    ) -> Result<WorkletValue, EngineError> {
        self.inner.invoke_callback(id, args)
    }

    fn release_callback(&mut self, id: CallbackId) {
        self.inner.release_callback(id)
    }
}

#[test]
fn bootstrap_may_ask_for_the_default_runtime() {
    let found = Arc::new(Mutex::new(Vec::new()));
    let factory: Arc<dyn EngineFactory> = {
        let found = found.clone();
        Arc::new(
            move |name: &str, _: &RuntimeConfig| -> Result<Box<dyn JsEngine>, EngineError> {
                Ok(Box::new(DefaultSeeking {
                    inner: NativeEngine::new(name),
                    found: found.clone(),
                }))
            },
        )
    };
    let context = WorkletsContext::new(WorkletsConfig::default(), factory);

    let (tx, rx) = mpsc::channel();
    {
        let context = context.clone();
        thread::spawn(move || {
            let default = context.default_runtime();
            let other = context.create_runtime("other");
            let _ = tx.send((default, other));
        });
    }
    let (default, other) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("default runtime bootstrap never finished");
    let default = default.unwrap();
    other.unwrap();

    assert_eq!(default.name(), "default");
    assert_eq!(
        *found.lock(),
        vec![
            ("default".to_string(), "default".to_string()),
            ("other".to_string(), "default".to_string()),
        ]
    );
    assert_eq!(context.registry().runtimes().len(), 2);
    assert_eq!(context.default_runtime().unwrap(), default);
    context.teardown();
}

#[test]
fn decorators_reach_current_and_future_runtimes() {
    let host = Host::start();
    let before = host.context.create_runtime("before").unwrap();

    host.context.add_decorator("scale", 2).unwrap();
    host.context.add_decorator("scale", 3).unwrap();
    host.context.add_decorator("label", "decorated").unwrap();
    let after = host.context.create_runtime("after").unwrap();

    for runtime in [&before, &after] {
        assert_eq!(global_on(runtime, "scale"), WorkletValue::from(3));
        assert_eq!(global_on(runtime, "label").as_str(), Some("decorated"));
    }
    // The host runtime is not decorated
    assert!(global_on(&host.main, "scale").is_undefined());
    assert_eq!(host.context.registry().decorator_names(), vec!["scale", "label"]);

    let from_worker = WorkletClosure::native("decorate", |scope, _| {
        let refused = scope.context().add_decorator("sneaky", 1).is_err();
        Ok(WorkletValue::from(refused))
    });
    let refused = host
        .context
        .dispatcher()
        .run_blocking(from_worker, &before, Vec::new())
        .unwrap();
    assert_eq!(refused, WorkletValue::from(true));
    assert!(host.context.add_decorator("", 1).is_err());
}

#[test]
fn remote_callbacks_run_on_their_owning_runtime() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();
    let main_thread = host.main_thread();

    let (tx, rx) = mpsc::channel();
    let register = Task::new("register-callback", move |scope| {
        let callback = scope
            .create_callback("add", move |args| {
                assert_eq!(thread::current().id(), main_thread);
                let sum: f64 = args.iter().filter_map(WorkletValue::as_f64).sum();
                Ok(WorkletValue::from(sum))
            })
            .unwrap();
        tx.send(callback).unwrap();
    });
    host.main.schedule(register).unwrap();
    let add = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(add.runtime(), &host.main);

    let caller = WorkletClosure::capture(
        "caller",
        WorkletCode::native(|scope, _| {
            let add = scope.callback("add")?;
            scope
                .call(add, vec![WorkletValue::from(2), WorkletValue::from(40)])
                .wait()
        }),
        [("add", add)],
    )
    .unwrap();

    let result = host
        .context
        .dispatcher()
        .run_blocking(caller, &worker, Vec::new())
        .unwrap();
    assert_eq!(result, WorkletValue::from(42));
}

#[test]
fn lifecycle_events_are_published() {
    let host = Host::start();
    let mut events = host.context.events().subscribe();

    let worker = host.context.create_runtime("observed").unwrap();
    host.context.destroy_runtime(&worker).unwrap();

    let created = events.try_recv().unwrap();
    assert_eq!(created.name(), "runtime.created");
    match events.try_recv().unwrap() {
        RuntimeEvent::RuntimeDestroyed {
            runtime_id,
            name,
            cancelled_tasks,
        } => {
            assert_eq!(runtime_id, worker.id());
            assert_eq!(name, "observed");
            assert_eq!(cancelled_tasks, 0);
        }
        other => panic!("expected RuntimeDestroyed, got {other:?}"),
    }
}

/// Host plus one worker, built off the async runtime: runtime creation blocks
async fn host_with_worker() -> (Host, RuntimeHandle) {
    tokio::task::spawn_blocking(|| {
        let host = Host::start();
        let worker = host.context.create_runtime("w1").unwrap();
        (host, worker)
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn pending_results_can_be_awaited() {
    let (host, worker) = host_with_worker().await;
    let square = WorkletClosure::native("square", |_, args| {
        let x = args.first().and_then(WorkletValue::as_f64).unwrap_or(0.0);
        Ok(WorkletValue::from(x * x))
    });

    let result = host
        .context
        .dispatcher()
        .run_async(square, &worker, vec![WorkletValue::from(7)])
        .await
        .unwrap();
    assert_eq!(result, WorkletValue::from(49));
    tokio::task::spawn_blocking(move || drop(host)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_timeout_works_inside_async_code() {
    let (host, worker) = host_with_worker().await;
    let (gate, _started, release) = gate();

    let _blocked = host.context.dispatcher().run_async(gate, &worker, Vec::new());
    let mut queued = host.context.dispatcher().run_async(noop(), &worker, Vec::new());
    assert!(queued.wait_timeout(Duration::from_millis(5)).is_none());

    release.send(()).unwrap();
    assert_eq!(queued.await, Ok(WorkletValue::Undefined));
    tokio::task::spawn_blocking(move || drop(host)).await.unwrap();
}

#[test]
fn teardown_from_another_thread_releases_main() {
    let host = Host::start();
    let worker = host.context.create_runtime("w1").unwrap();
    let main = host.main.clone();

    let cancelled = host.context.teardown();
    assert_eq!(cancelled, 0);
    assert!(host.context.registry().is_empty());
    assert!(!main.is_accepting());
    assert!(!worker.is_accepting());

    let late = host.context.run_on_main(noop(), Vec::new());
    assert!(matches!(late.wait(), Err(WorkletError::RuntimeUnavailable(_))));
}
