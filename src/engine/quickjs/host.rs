// Native functions behind the JS prelude
//
// Installed as `__worklets_native`; the prelude captures the object and
// removes the global before any user code runs.

use super::{wire, Tables};
use crate::dispatch::{panic_message, Continuation, WorkletResult};
use crate::engine::{CallbackId, RemoteCallback};
use crate::error::WorkletError;
use crate::invoker::Task;
use crate::runtime::{self, RuntimeId, RuntimeScope};
use crate::shared::ListenerId;
use crate::worklet::{WorkletClosure, WorkletCode, WorkletScope, WorkletValue};
use rquickjs::function::Func;
use rquickjs::{Ctx, Exception, Object};
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

type Shared = Rc<RefCell<Tables>>;

fn throw(ctx: &Ctx<'_>, err: impl fmt::Display) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

/// Message without the Rust-side prefix, as a JS `Error` would carry it
fn error_message(err: &WorkletError) -> String {
    match err {
        WorkletError::Execution { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Continuation body that settles a JS promise registered as `resolver`
fn settle(resolver: CallbackId) -> impl FnOnce(&mut RuntimeScope<'_>, WorkletResult) + Send + 'static {
    move |scope: &mut RuntimeScope<'_>, result: WorkletResult| {
        let args = match result {
            Ok(value) => vec![WorkletValue::Bool(true), value],
            Err(err) => vec![
                WorkletValue::Bool(false),
                WorkletValue::String(error_message(&err)),
                WorkletValue::from(err.kind()),
            ],
        };
        let runtime = scope.runtime().name().to_string();
        let engine = scope.engine();
        if let Err(err) = engine.invoke_callback(resolver, &args) {
            tracing::warn!(runtime = %runtime, error = %err, "failed to settle promise");
        }
        engine.release_callback(resolver);
    }
}

pub(super) fn install(ctx: &Ctx<'_>, tables: &Shared) -> rquickjs::Result<()> {
    let native = Object::new(ctx.clone())?;
    install_worklets(&native, tables)?;
    install_shared(&native, tables)?;
    install_runtimes(&native, tables)?;
    install_decorators(&native, tables)?;
    ctx.globals().set("__worklets_native", native)?;
    Ok(())
}

fn install_worklets(native: &Object<'_>, tables: &Shared) -> rquickjs::Result<()> {
    native.set(
        "allocateCallbackId",
        Func::from({
            let tables = tables.clone();
            move || -> rquickjs::Result<u64> { Ok(tables.borrow_mut().allocate_callback()) }
        }),
    )?;

    native.set(
        "registerWorklet",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>,
                  name: String,
                  source: String,
                  location: String,
                  captures: String|
                  -> rquickjs::Result<u64> {
                let mut tables = tables.borrow_mut();
                let environment =
                    wire::decode_fields(&captures, &mut tables).map_err(|err| throw(&ctx, err))?;
                let worklet =
                    WorkletClosure::capture(name, WorkletCode::script(source, location), environment)
                        .map_err(|err| throw(&ctx, err))?;
                Ok(tables.pin_worklet(&worklet))
            }
        }),
    )?;

    native.set(
        "describeWorklet",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64| -> rquickjs::Result<String> {
                let mut tables = tables.borrow_mut();
                let worklet = tables.worklet(id).map_err(|err| throw(&ctx, err))?;
                let captures: serde_json::Map<String, serde_json::Value> = worklet
                    .captures()
                    .iter()
                    .map(|(name, value)| (name.clone(), wire::encode(value, &mut tables)))
                    .collect();
                let (is_native, source) = match worklet.code() {
                    WorkletCode::Native(_) => (true, ""),
                    WorkletCode::Script { source, .. } => (false, source.as_ref()),
                };
                Ok(serde_json::json!({
                    "name": worklet.name(),
                    "native": is_native,
                    "hash": worklet.hash().to_string(),
                    "source": source,
                    "captures": captures,
                })
                .to_string())
            }
        }),
    )?;

    native.set(
        "callNativeWorklet",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64, args: String| -> rquickjs::Result<String> {
                let (worklet, args, runtime, context) = {
                    let mut tables = tables.borrow_mut();
                    let worklet = tables.worklet(id).map_err(|err| throw(&ctx, err))?;
                    let args = wire::decode_list(&args, &mut tables).map_err(|err| throw(&ctx, err))?;
                    let (runtime, context) = tables.host().map_err(|err| throw(&ctx, err))?;
                    (worklet, args, runtime, context)
                };
                let WorkletCode::Native(body) = worklet.code() else {
                    return Err(throw(&ctx, format!("'{}' is not a native worklet", worklet.name())));
                };

                let mut scope = WorkletScope::new(&runtime, &context, &worklet);
                let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut scope, &args)))
                    .unwrap_or_else(|payload| {
                        Err(WorkletError::execution(format!(
                            "worklet '{}' panicked: {}",
                            worklet.name(),
                            panic_message(payload.as_ref())
                        )))
                    });
                let value = result.map_err(|err| throw(&ctx, error_message(&err)))?;
                Ok(wire::encode_text(&value, &mut tables.borrow_mut()))
            }
        }),
    )?;

    Ok(())
}

fn install_shared(native: &Object<'_>, tables: &Shared) -> rquickjs::Result<()> {
    native.set(
        "sharedCreate",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, initial: String| -> rquickjs::Result<u64> {
                let mut tables = tables.borrow_mut();
                let initial = wire::decode_text(&initial, &mut tables).map_err(|err| throw(&ctx, err))?;
                let (_, context) = tables.host().map_err(|err| throw(&ctx, err))?;
                let shared = context.create_shared_value(initial);
                Ok(tables.pin_shared(&shared))
            }
        }),
    )?;

    native.set(
        "sharedGet",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64| -> rquickjs::Result<String> {
                let mut tables = tables.borrow_mut();
                let shared = tables.shared_value(id).map_err(|err| throw(&ctx, err))?;
                Ok(wire::encode_text(&shared.get(), &mut tables))
            }
        }),
    )?;

    native.set(
        "sharedSet",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64, value: String| -> rquickjs::Result<u64> {
                let mut tables = tables.borrow_mut();
                let shared = tables.shared_value(id).map_err(|err| throw(&ctx, err))?;
                let value = wire::decode_text(&value, &mut tables).map_err(|err| throw(&ctx, err))?;
                Ok(shared.set(value))
            }
        }),
    )?;

    native.set(
        "sharedToString",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64| -> rquickjs::Result<String> {
                let shared = tables
                    .borrow_mut()
                    .shared_value(id)
                    .map_err(|err| throw(&ctx, err))?;
                Ok(format!("SharedValue({})", shared.get()))
            }
        }),
    )?;

    native.set(
        "sharedAddListener",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64, callback: u64| -> rquickjs::Result<u64> {
                let mut tables = tables.borrow_mut();
                let shared = tables.shared_value(id).map_err(|err| throw(&ctx, err))?;
                let (runtime, _) = tables.host().map_err(|err| throw(&ctx, err))?;

                let listener = shared.add_listener(&runtime, move |scope, value, version| {
                    let args = [value.clone(), WorkletValue::Number(version as f64)];
                    if let Err(err) = scope.engine().invoke_callback(callback, &args) {
                        tracing::warn!(
                            runtime = scope.runtime().name(),
                            error = %err,
                            "shared value listener failed"
                        );
                    }
                });
                Ok(listener.0)
            }
        }),
    )?;

    native.set(
        "sharedRemoveListener",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64, listener: u64| -> rquickjs::Result<bool> {
                let shared = tables
                    .borrow_mut()
                    .shared_value(id)
                    .map_err(|err| throw(&ctx, err))?;
                Ok(shared.remove_listener(ListenerId(listener)))
            }
        }),
    )?;

    Ok(())
}

fn install_runtimes(native: &Object<'_>, tables: &Shared) -> rquickjs::Result<()> {
    native.set(
        "createRuntime",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, name: String| -> rquickjs::Result<u64> {
                let (_, context) = tables.borrow().host().map_err(|err| throw(&ctx, err))?;
                let runtime = context.create_runtime(&name).map_err(|err| throw(&ctx, err))?;
                Ok(runtime.id().0)
            }
        }),
    )?;

    native.set(
        "defaultRuntime",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>| -> rquickjs::Result<u64> {
                let (_, context) = tables.borrow().host().map_err(|err| throw(&ctx, err))?;
                let runtime = context.default_runtime().map_err(|err| throw(&ctx, err))?;
                Ok(runtime.id().0)
            }
        }),
    )?;

    native.set(
        "currentRuntime",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>| -> rquickjs::Result<u64> {
                let (runtime, _) = tables.borrow().host().map_err(|err| throw(&ctx, err))?;
                Ok(runtime.id().0)
            }
        }),
    )?;

    native.set(
        "runtimeName",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64| -> rquickjs::Result<Option<String>> {
                let (this, context) = tables.borrow().host().map_err(|err| throw(&ctx, err))?;
                if this.id() == RuntimeId(id) {
                    return Ok(Some(this.name().to_string()));
                }
                Ok(context
                    .registry()
                    .runtime(RuntimeId(id))
                    .map(|runtime| runtime.name().to_string()))
            }
        }),
    )?;

    native.set(
        "runOnRuntime",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>,
                  target: u64,
                  worklet: u64,
                  args: String,
                  resolver: u64|
                  -> rquickjs::Result<()> {
                let (this, context, worklet, args) = {
                    let mut tables = tables.borrow_mut();
                    let worklet = tables.worklet(worklet).map_err(|err| throw(&ctx, err))?;
                    let args = wire::decode_list(&args, &mut tables).map_err(|err| throw(&ctx, err))?;
                    let (this, context) = tables.host().map_err(|err| throw(&ctx, err))?;
                    (this, context, worklet, args)
                };

                let continuation = Continuation::on_runtime(&this, settle(resolver));
                match context.registry().runtime(RuntimeId(target)) {
                    Some(target) => context.dispatcher().run(worklet, &target, args, continuation),
                    None => continuation.resolve(Err(WorkletError::RuntimeUnavailable(
                        RuntimeId(target).to_string(),
                    ))),
                }
                Ok(())
            }
        }),
    )?;

    native.set(
        "exportCallback",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, id: u64, name: String| -> rquickjs::Result<u64> {
                let mut tables = tables.borrow_mut();
                let (this, _) = tables.host().map_err(|err| throw(&ctx, err))?;
                let callback = RemoteCallback::new(&this, id, &name);
                Ok(tables.pin_remote(&callback))
            }
        }),
    )?;

    native.set(
        "callRemote",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, key: u64, args: String, resolver: u64| -> rquickjs::Result<()> {
                let (this, context, callback, args) = {
                    let mut tables = tables.borrow_mut();
                    let callback = tables.remote(key).map_err(|err| throw(&ctx, err))?;
                    let args = wire::decode_list(&args, &mut tables).map_err(|err| throw(&ctx, err))?;
                    let (this, context) = tables.host().map_err(|err| throw(&ctx, err))?;
                    (this, context, callback, args)
                };

                let continuation = Continuation::on_runtime(&this, settle(resolver));
                context
                    .dispatcher()
                    .call_remote_with(&callback, args, continuation);
                Ok(())
            }
        }),
    )?;

    native.set(
        "addDecorator",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, name: String, value: String| -> rquickjs::Result<()> {
                let (this, context, value) = {
                    let mut tables = tables.borrow_mut();
                    let value = wire::decode_text(&value, &mut tables).map_err(|err| throw(&ctx, err))?;
                    let (this, context) = tables.host().map_err(|err| throw(&ctx, err))?;
                    (this, context, value)
                };
                if !this.is_main() {
                    return Err(throw(
                        &ctx,
                        "addDecorator should only be called from the javascript runtime",
                    ));
                }
                context
                    .add_decorator(&name, value)
                    .map_err(|err| throw(&ctx, error_message(&err)))
            }
        }),
    )?;

    native.set(
        "threadIndex",
        Func::from(|| -> rquickjs::Result<u64> { Ok(runtime::current_thread_index() as u64) }),
    )?;

    Ok(())
}

fn install_decorators(native: &Object<'_>, tables: &Shared) -> rquickjs::Result<()> {
    native.set(
        "log",
        Func::from({
            let tables = tables.clone();
            move |level: String, message: String| -> rquickjs::Result<()> {
                let runtime = tables.borrow().runtime_name();
                match level.as_str() {
                    "error" => tracing::error!(target: "worklets::console", runtime = %runtime, "{message}"),
                    "warn" => tracing::warn!(target: "worklets::console", runtime = %runtime, "{message}"),
                    "debug" => tracing::debug!(target: "worklets::console", runtime = %runtime, "{message}"),
                    _ => tracing::info!(target: "worklets::console", runtime = %runtime, "{message}"),
                }
                Ok(())
            }
        }),
    )?;

    native.set(
        "now",
        Func::from({
            let tables = tables.clone();
            move || -> rquickjs::Result<f64> {
                Ok(tables.borrow().started.elapsed().as_secs_f64() * 1000.0)
            }
        }),
    )?;

    native.set(
        "setImmediate",
        Func::from({
            let tables = tables.clone();
            move |ctx: Ctx<'_>, callback: u64| -> rquickjs::Result<()> {
                let (this, _) = tables.borrow().host().map_err(|err| throw(&ctx, err))?;
                let task = Task::new("set-immediate", move |scope| {
                    let engine = scope.engine();
                    if let Err(err) = engine.invoke_callback(callback, &[]) {
                        tracing::warn!(error = %err, "setImmediate callback failed");
                    }
                    engine.release_callback(callback);
                });
                this.schedule(task).map_err(|err| throw(&ctx, err))
            }
        }),
    )?;

    Ok(())
}
