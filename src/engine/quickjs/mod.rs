// QuickJS engine - script worklets on an embedded JavaScript VM
//
// Each runtime thread owns one `rquickjs::Runtime` with a single context.
// Values cross the boundary as JSON text (see `wire`); handles to shared
// values, worklets and remote callbacks live in per-engine tables and travel
// as ids. The worklet API itself is the JS prelude in `prelude.js`, driven by
// the native functions installed from `host`.

mod host;
mod wire;

use super::{callback_error, CallbackId, EngineFactory, JsEngine, NativeCallback, RemoteCallback};
use crate::config::RuntimeConfig;
use crate::context::WorkletsContext;
use crate::error::{EngineError, WorkletError};
use crate::runtime::{RuntimeHandle, RuntimeId};
use crate::shared::{SharedValue, SharedValueId};
use crate::worklet::{WorkletClosure, WorkletValue};
use rquickjs::{Coerced, Context, Ctx, Exception, FromJs, Function, Object, Runtime};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

const PRELUDE: &str = include_str!("prelude.js");

/// Handles known to one engine, shared with its native functions
pub(super) struct Tables {
    runtime: Option<RuntimeHandle>,
    started: Instant,
    natives: HashMap<CallbackId, NativeCallback>,
    next_callback: CallbackId,
    // Shared values stay pinned once seen by this heap; JS keeps only their ids
    shared: HashMap<u64, SharedValue>,
    worklets: HashMap<u64, Arc<WorkletClosure>>,
    worklet_ids: HashMap<usize, u64>,
    remotes: HashMap<u64, RemoteCallback>,
    remote_ids: HashMap<(RuntimeId, CallbackId), u64>,
    next_handle: u64,
}

impl Tables {
    pub(super) fn new() -> Self {
        Self {
            runtime: None,
            started: Instant::now(),
            natives: HashMap::new(),
            next_callback: 1,
            shared: HashMap::new(),
            worklets: HashMap::new(),
            worklet_ids: HashMap::new(),
            remotes: HashMap::new(),
            remote_ids: HashMap::new(),
            next_handle: 1,
        }
    }

    fn allocate_callback(&mut self) -> CallbackId {
        let id = self.next_callback;
        self.next_callback += 1;
        id
    }

    fn allocate_handle(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn pin_shared(&mut self, shared: &SharedValue) -> u64 {
        let id = shared.id().0;
        self.shared.entry(id).or_insert_with(|| shared.clone());
        id
    }

    fn pin_worklet(&mut self, worklet: &Arc<WorkletClosure>) -> u64 {
        let address = Arc::as_ptr(worklet) as usize;
        if let Some(id) = self.worklet_ids.get(&address) {
            return *id;
        }
        let id = self.allocate_handle();
        self.worklet_ids.insert(address, id);
        self.worklets.insert(id, worklet.clone());
        id
    }

    fn pin_remote(&mut self, callback: &RemoteCallback) -> u64 {
        let key = (callback.runtime().id(), callback.id());
        if let Some(id) = self.remote_ids.get(&key) {
            return *id;
        }
        let id = self.allocate_handle();
        self.remote_ids.insert(key, id);
        self.remotes.insert(id, callback.clone());
        id
    }

    fn shared_value(&mut self, id: u64) -> Result<SharedValue, EngineError> {
        if let Some(shared) = self.shared.get(&id) {
            return Ok(shared.clone());
        }
        let shared = self
            .runtime
            .as_ref()
            .and_then(RuntimeHandle::context)
            .and_then(|context| context.store().get(SharedValueId(id)))
            .ok_or_else(|| EngineError::Conversion(format!("shared value {id} no longer exists")))?;
        self.pin_shared(&shared);
        Ok(shared)
    }

    fn worklet(&self, id: u64) -> Result<Arc<WorkletClosure>, EngineError> {
        self.worklets
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::Conversion(format!("unknown worklet {id}")))
    }

    fn remote(&self, id: u64) -> Result<RemoteCallback, EngineError> {
        self.remotes
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::Conversion(format!("unknown remote function {id}")))
    }

    /// The runtime this engine serves and its installed context
    fn host(&self) -> Result<(RuntimeHandle, WorkletsContext), WorkletError> {
        let runtime = self
            .runtime
            .clone()
            .ok_or_else(|| WorkletError::RuntimeUnavailable("unbound".to_string()))?;
        let context = runtime
            .context()
            .ok_or_else(|| WorkletError::RuntimeUnavailable(runtime.name().to_string()))?;
        Ok((runtime, context))
    }

    fn runtime_name(&self) -> String {
        self.runtime
            .as_ref()
            .map_or_else(|| "unbound".to_string(), |runtime| runtime.name().to_string())
    }
}

/// JavaScript engine backed by QuickJS
pub struct QuickJsEngine {
    tables: Rc<RefCell<Tables>>,
    context: Context,
    // Declared last: the context must be freed before its runtime
    runtime: Runtime,
}

impl QuickJsEngine {
    pub fn new(config: &RuntimeConfig) -> Result<Self, EngineError> {
        let runtime = Runtime::new().map_err(|err| EngineError::Internal(err.to_string()))?;
        if config.memory_limit > 0 {
            runtime.set_memory_limit(config.memory_limit);
        }
        runtime.set_max_stack_size(config.max_stack_size);
        let context = Context::full(&runtime).map_err(|err| EngineError::Internal(err.to_string()))?;

        Ok(Self {
            tables: Rc::new(RefCell::new(Tables::new())),
            context,
            runtime,
        })
    }

    /// Call one of the prelude's internal entry points with string-encoded
    /// arguments; returns its string-encoded result
    fn call_internal(&self, name: &str, id: Option<u64>, payload: String) -> Result<String, EngineError> {
        self.context.with(|ctx| {
            let call = || -> rquickjs::Result<String> {
                let internals: Object = ctx.globals().get("__worklets")?;
                let function: Function = internals.get(name)?;
                match id {
                    Some(id) => function.call((id, payload)),
                    None => function.call((payload,)),
                }
            };
            call().map_err(|err| exception(&ctx, err))
        })
    }
}

impl JsEngine for QuickJsEngine {
    fn kind(&self) -> &'static str {
        "quickjs"
    }

    fn bootstrap(
        &mut self,
        runtime: &RuntimeHandle,
        config: &RuntimeConfig,
    ) -> Result<(), EngineError> {
        self.tables.borrow_mut().runtime = Some(runtime.clone());

        let options = serde_json::json!({
            "runtime": runtime.name(),
            "console": config.decorators.console,
            "performance": config.decorators.performance,
            "setImmediate": config.decorators.set_immediate,
        })
        .to_string();

        let tables = self.tables.clone();
        self.context.with(|ctx| {
            let install = || -> rquickjs::Result<()> {
                host::install(&ctx, &tables)?;
                let init: Function = ctx.eval(PRELUDE)?;
                init.call::<_, ()>((options,))
            };
            install().map_err(|err| exception(&ctx, err))
        })?;

        tracing::debug!(runtime = runtime.name(), "quickjs engine bootstrapped");
        Ok(())
    }

    fn evaluate(&mut self, source: &str, location: &str) -> Result<WorkletValue, EngineError> {
        tracing::trace!(location, "evaluating script");
        let result = self.call_internal("evaluate", None, source.to_string())?;
        wire::decode_text(&result, &mut self.tables.borrow_mut())
    }

    fn call_worklet(
        &mut self,
        worklet: &Arc<WorkletClosure>,
        args: &[WorkletValue],
    ) -> Result<WorkletValue, EngineError> {
        let (id, args) = {
            let mut tables = self.tables.borrow_mut();
            let id = tables.pin_worklet(worklet);
            (id, wire::encode_list(args, &mut tables))
        };
        let result = self.call_internal("invokeWorklet", Some(id), args)?;
        wire::decode_text(&result, &mut self.tables.borrow_mut())
    }

    fn register_callback(&mut self, callback: NativeCallback) -> Result<CallbackId, EngineError> {
        let mut tables = self.tables.borrow_mut();
        let id = tables.allocate_callback();
        tables.natives.insert(id, callback);
        Ok(id)
    }

    fn invoke_callback(
        &mut self,
        id: CallbackId,
        args: &[WorkletValue],
    ) -> Result<WorkletValue, EngineError> {
        // Taken out while it runs so the table is free for nested calls
        let native = self.tables.borrow_mut().natives.remove(&id);
        if let Some(mut callback) = native {
            let result = callback(args).map_err(callback_error);
            self.tables.borrow_mut().natives.insert(id, callback);
            return result;
        }

        let args = wire::encode_list(args, &mut self.tables.borrow_mut());
        let result = self.call_internal("invokeCallback", Some(id), args)?;
        wire::decode_text(&result, &mut self.tables.borrow_mut())
    }

    fn release_callback(&mut self, id: CallbackId) {
        if self.tables.borrow_mut().natives.remove(&id).is_some() {
            return;
        }
        if let Err(err) = self.call_internal("releaseCallback", Some(id), String::new()) {
            tracing::debug!(callback = id, error = %err, "failed to release callback");
        }
    }

    fn set_global(&mut self, name: &str, value: &WorkletValue) -> Result<(), EngineError> {
        let payload = {
            let mut tables = self.tables.borrow_mut();
            serde_json::json!({ "name": name, "value": wire::encode(value, &mut tables) }).to_string()
        };
        self.call_internal("setGlobal", None, payload)?;
        Ok(())
    }

    fn global(&mut self, name: &str) -> Result<WorkletValue, EngineError> {
        let result = self.call_internal("getGlobal", None, name.to_string())?;
        wire::decode_text(&result, &mut self.tables.borrow_mut())
    }

    fn run_pending_jobs(&mut self) -> Result<(), EngineError> {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(_) => {
                    return Err(self
                        .context
                        .with(|ctx| exception(&ctx, rquickjs::Error::Exception)))
                }
            }
        }
    }
}

/// Factory producing [`QuickJsEngine`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct QuickJsEngineFactory;

impl EngineFactory for QuickJsEngineFactory {
    fn create(
        &self,
        _runtime_name: &str,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn JsEngine>, EngineError> {
        Ok(Box::new(QuickJsEngine::new(config)?))
    }
}

/// Turn a QuickJS error into an [`EngineError`], pulling the pending
/// exception out of the context when there is one
fn exception(ctx: &Ctx<'_>, err: rquickjs::Error) -> EngineError {
    if !matches!(err, rquickjs::Error::Exception) {
        return EngineError::Internal(err.to_string());
    }

    let caught = ctx.catch();
    if let Some(exception) = caught.as_object().cloned().and_then(Exception::from_object) {
        let message = exception.message().unwrap_or_default();
        let name: Option<String> = exception.get("name").ok();
        let message = match name {
            Some(name) if name != "Error" && !name.is_empty() => format!("{name}: {message}"),
            _ => message,
        };
        return EngineError::Exception {
            message,
            stack: exception.stack().filter(|stack| !stack.is_empty()),
        };
    }

    let message = match Coerced::<String>::from_js(ctx, caught) {
        Ok(value) => value.0,
        Err(err) => format!("(failed to stringify exception: {err})"),
    };
    EngineError::Exception {
        message,
        stack: None,
    }
}
