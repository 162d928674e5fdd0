// Worklets - run JavaScript closures on dedicated runtime threads
//
// A host installs the bridge on its main runtime. Worklets (closures with a
// frozen snapshot of their captured variables) are then dispatched to worker
// runtimes, each owning one engine on one thread. Shared values are the only
// state mutated from several threads; everything else moves by message.

pub mod cli;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod install;
pub mod invoker;
pub mod runtime;
pub mod shared;
pub mod worklet;

pub use config::{NotifyPolicy, RuntimeConfig, ShutdownMode, WorkletsConfig};
pub use context::WorkletsContext;
pub use dispatch::{Continuation, DispatchStats, PendingResult, WorkletDispatcher, WorkletResult};
pub use engine::{
    default_factory, EngineFactory, JsEngine, NativeEngine, NativeEngineFactory, RemoteCallback,
};
pub use error::{ConfigError, EngineError, WorkletError};
pub use events::{EventBus, RuntimeEvent};
pub use install::{install, install_with, installed, teardown};
pub use invoker::{CallInvoker, CallInvokerBridge, HostEventLoop, HostInvoker, Task};
pub use runtime::{LifecycleState, RuntimeHandle, RuntimeId, RuntimeKind, RuntimeRegistry, RuntimeScope};
pub use shared::{ListenerId, SharedValue, SharedValueId, SharedValueStore};
pub use worklet::{WorkletClosure, WorkletCode, WorkletScope, WorkletValue};

#[cfg(feature = "js-runtime")]
pub use engine::{QuickJsEngine, QuickJsEngineFactory};
