// Native engine - a VM without a script language
//
// Runs worklets whose body is a Rust closure. Those never reach the engine
// (the dispatcher calls them directly), so this engine mostly keeps the
// callback table that lets other runtimes call back into this one.

use super::{callback_error, CallbackId, EngineFactory, JsEngine, NativeCallback};
use crate::config::RuntimeConfig;
use crate::error::EngineError;
use crate::runtime::RuntimeHandle;
use crate::worklet::{WorkletClosure, WorkletValue};
use std::collections::HashMap;
use std::sync::Arc;

pub struct NativeEngine {
    runtime_name: String,
    callbacks: HashMap<CallbackId, NativeCallback>,
    next_callback: CallbackId,
    globals: HashMap<String, WorkletValue>,
}

impl NativeEngine {
    pub fn new(runtime_name: &str) -> Self {
        Self {
            runtime_name: runtime_name.to_string(),
            callbacks: HashMap::new(),
            next_callback: 1,
            globals: HashMap::new(),
        }
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }
}

impl JsEngine for NativeEngine {
    fn kind(&self) -> &'static str {
        "native"
    }

    fn bootstrap(
        &mut self,
        runtime: &RuntimeHandle,
        _config: &RuntimeConfig,
    ) -> Result<(), EngineError> {
        self.runtime_name = runtime.name().to_string();
        tracing::debug!(runtime = %self.runtime_name, "native engine ready");
        Ok(())
    }

    fn evaluate(&mut self, _source: &str, _location: &str) -> Result<WorkletValue, EngineError> {
        Err(EngineError::Unsupported("script evaluation".to_string()))
    }

    fn call_worklet(
        &mut self,
        worklet: &Arc<WorkletClosure>,
        _args: &[WorkletValue],
    ) -> Result<WorkletValue, EngineError> {
        Err(EngineError::Unsupported(format!(
            "script worklet '{}' (build with the js-runtime feature)",
            worklet.name()
        )))
    }

    fn register_callback(&mut self, callback: NativeCallback) -> Result<CallbackId, EngineError> {
        let id = self.next_callback;
        self.next_callback += 1;
        self.callbacks.insert(id, callback);
        Ok(id)
    }

    fn invoke_callback(
        &mut self,
        id: CallbackId,
        args: &[WorkletValue],
    ) -> Result<WorkletValue, EngineError> {
        let callback = self.callbacks.get_mut(&id).ok_or_else(|| EngineError::Exception {
            message: format!("callback {id} is not registered on '{}'", self.runtime_name),
            stack: None,
        })?;
        callback(args).map_err(callback_error)
    }

    fn release_callback(&mut self, id: CallbackId) {
        self.callbacks.remove(&id);
    }

    fn set_global(&mut self, name: &str, value: &WorkletValue) -> Result<(), EngineError> {
        self.globals.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn global(&mut self, name: &str) -> Result<WorkletValue, EngineError> {
        Ok(self.globals.get(name).cloned().unwrap_or_default())
    }
}

/// Factory producing [`NativeEngine`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEngineFactory;

impl EngineFactory for NativeEngineFactory {
    fn create(
        &self,
        runtime_name: &str,
        _config: &RuntimeConfig,
    ) -> Result<Box<dyn JsEngine>, EngineError> {
        Ok(Box::new(NativeEngine::new(runtime_name)))
    }
}
