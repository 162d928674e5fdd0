// Process-wide install entry point
//
// Hosts call `install` once on their JS thread with their engine and call
// invoker. The installed context is global so native glue without a handle can
// still reach it through `installed()`.

use crate::config::WorkletsConfig;
use crate::context::WorkletsContext;
use crate::engine::{default_factory, EngineFactory, JsEngine};
use crate::invoker::CallInvoker;
use parking_lot::Mutex;
use std::sync::Arc;

static INSTALLED: Mutex<Option<WorkletsContext>> = parking_lot::const_mutex(None);

/// Install with the default configuration and engine factory
///
/// Returns `true` once installed. Calling it again while installed is a no-op
/// that returns `true`; the extra engine is dropped untouched.
pub fn install(engine: Box<dyn JsEngine>, call_invoker: Arc<dyn CallInvoker>) -> bool {
    install_with(
        engine,
        call_invoker,
        WorkletsConfig::default(),
        default_factory(),
    )
}

/// Install with an explicit configuration and engine factory
pub fn install_with(
    engine: Box<dyn JsEngine>,
    call_invoker: Arc<dyn CallInvoker>,
    config: WorkletsConfig,
    factory: Arc<dyn EngineFactory>,
) -> bool {
    let mut installed = INSTALLED.lock();
    if installed.is_some() {
        tracing::debug!("worklets already installed");
        return true;
    }

    let context = WorkletsContext::new(config, factory);
    match context.install_main(engine, call_invoker) {
        Ok(main) => {
            tracing::info!(runtime = main.name(), "worklets installed");
            *installed = Some(context);
            true
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to install worklets");
            false
        }
    }
}

/// The installed context, if any
pub fn installed() -> Option<WorkletsContext> {
    INSTALLED.lock().clone()
}

/// Destroy every runtime and forget the installed context
///
/// Safe to call when nothing is installed.
pub fn teardown() {
    let context = INSTALLED.lock().take();
    if let Some(context) = context {
        context.teardown();
    }
}
