// Worklet closures - code plus a frozen snapshot of captured variables

pub mod scope;
pub mod value;

pub use scope::WorkletScope;
pub use value::WorkletValue;

use crate::dispatch::PendingResult;
use crate::error::WorkletError;
use crate::runtime::RuntimeHandle;
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Signature of a worklet body written in Rust
pub type NativeWorkletFn = dyn Fn(&mut WorkletScope<'_>, &[WorkletValue]) -> Result<WorkletValue, WorkletError>
    + Send
    + Sync;

/// Captured variables by name
pub type Environment = BTreeMap<String, WorkletValue>;

/// Nesting deeper than this is rejected at capture time
const MAX_CAPTURE_DEPTH: usize = 64;

/// Names a capture may not use: they would shadow the calling convention or
/// are not valid binding identifiers
const RESERVED: &[&str] = &[
    "__closure", "arguments", "await", "break", "case", "catch", "class", "const",
    "continue", "debugger", "default", "delete", "do", "else", "enum", "eval", "export",
    "extends", "false", "finally", "for", "function", "if", "implements", "import", "in",
    "instanceof", "interface", "let", "new", "null", "package", "private", "protected",
    "public", "return", "static", "super", "switch", "this", "throw", "true", "try",
    "typeof", "var", "void", "while", "with", "yield",
];

/// The executable part of a worklet
#[derive(Clone)]
pub enum WorkletCode {
    /// Rust closure; runs on any engine
    Native(Arc<NativeWorkletFn>),
    /// JavaScript function source, evaluated as `(source)` on the target
    Script { source: Arc<str>, location: Arc<str> },
}

impl WorkletCode {
    pub fn native<F>(body: F) -> Self
    where
        F: Fn(&mut WorkletScope<'_>, &[WorkletValue]) -> Result<WorkletValue, WorkletError>
            + Send
            + Sync
            + 'static,
    {
        WorkletCode::Native(Arc::new(body))
    }

    pub fn script(source: impl Into<String>, location: impl Into<String>) -> Self {
        WorkletCode::Script {
            source: Arc::from(source.into()),
            location: Arc::from(location.into()),
        }
    }

    pub fn is_script(&self) -> bool {
        matches!(self, WorkletCode::Script { .. })
    }

    fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match self {
            WorkletCode::Native(body) => {
                "native".hash(&mut hasher);
                (Arc::as_ptr(body) as *const () as usize).hash(&mut hasher);
            }
            WorkletCode::Script { source, .. } => {
                "script".hash(&mut hasher);
                source.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

impl fmt::Debug for WorkletCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkletCode::Native(_) => write!(f, "Native(..)"),
            WorkletCode::Script { location, .. } => write!(f, "Script({location})"),
        }
    }
}

/// A worklet: code reference plus the variables captured when it was created
///
/// Immutable after construction and shared as `Arc<WorkletClosure>`, so it
/// can be handed to any number of runtimes at once without locking.
pub struct WorkletClosure {
    name: String,
    code: WorkletCode,
    hash: u64,
    captures: Environment,
}

impl WorkletClosure {
    /// Snapshot `environment` into a new worklet
    ///
    /// Plain data is copied, shared values and nested worklets are kept as
    /// handles. Fails with [`WorkletError::UnsupportedCapture`] for names that
    /// cannot be bound or values nested too deeply.
    pub fn capture<I, K, V>(
        name: impl Into<String>,
        code: WorkletCode,
        environment: I,
    ) -> Result<Arc<Self>, WorkletError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<WorkletValue>,
    {
        let name = name.into();

        if let WorkletCode::Script { source, .. } = &code {
            if source.trim().is_empty() {
                return Err(WorkletError::UnsupportedCapture {
                    name,
                    reason: "the provided code is empty".to_string(),
                });
            }
        }

        let mut captures = Environment::new();
        for (key, value) in environment {
            let key = key.into();
            validate_identifier(&key)?;
            let value = value.into();
            check_depth(&key, &value, 0)?;
            captures.insert(key, value);
        }

        let hash = code.content_hash();
        tracing::trace!(worklet = %name, captures = captures.len(), "captured worklet");

        Ok(Arc::new(Self {
            name,
            code,
            hash,
            captures,
        }))
    }

    /// Worklet from a Rust closure with no captured variables
    pub fn native<F>(name: impl Into<String>, body: F) -> Arc<Self>
    where
        F: Fn(&mut WorkletScope<'_>, &[WorkletValue]) -> Result<WorkletValue, WorkletError>
            + Send
            + Sync
            + 'static,
    {
        let code = WorkletCode::native(body);
        let hash = code.content_hash();
        Arc::new(Self {
            name: name.into(),
            code,
            hash,
            captures: Environment::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &WorkletCode {
        &self.code
    }

    /// Hash of the code; identical sources share a hash
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn captures(&self) -> &Environment {
        &self.captures
    }

    pub fn captured(&self, name: &str) -> Option<&WorkletValue> {
        self.captures.get(name)
    }

    /// Run this worklet on `runtime`; the result arrives asynchronously
    pub fn invoke_on(
        self: &Arc<Self>,
        runtime: &RuntimeHandle,
        args: Vec<WorkletValue>,
    ) -> PendingResult {
        match runtime.context() {
            Some(context) => context.dispatcher().run_async(self.clone(), runtime, args),
            None => PendingResult::ready(
                runtime,
                Err(WorkletError::RuntimeUnavailable(runtime.name().to_string())),
            ),
        }
    }
}

impl fmt::Debug for WorkletClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkletClosure")
            .field("name", &self.name)
            .field("code", &self.code)
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("captures", &self.captures.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn validate_identifier(name: &str) -> Result<(), WorkletError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$');
    let valid_rest = chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$');

    if !valid_start || !valid_rest {
        return Err(WorkletError::UnsupportedCapture {
            name: name.to_string(),
            reason: "not a valid identifier".to_string(),
        });
    }
    if RESERVED.contains(&name) {
        return Err(WorkletError::UnsupportedCapture {
            name: name.to_string(),
            reason: "reserved name".to_string(),
        });
    }
    Ok(())
}

fn check_depth(name: &str, value: &WorkletValue, depth: usize) -> Result<(), WorkletError> {
    if depth > MAX_CAPTURE_DEPTH {
        return Err(WorkletError::UnsupportedCapture {
            name: name.to_string(),
            reason: format!("value is nested deeper than {MAX_CAPTURE_DEPTH} levels"),
        });
    }
    match value {
        WorkletValue::Array(items) => items
            .iter()
            .try_for_each(|item| check_depth(name, item, depth + 1)),
        WorkletValue::Object(map) => map
            .values()
            .try_for_each(|item| check_depth(name, item, depth + 1)),
        _ => Ok(()),
    }
}
