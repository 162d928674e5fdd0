// Transferable values - what may cross a runtime boundary

use super::WorkletClosure;
use crate::engine::RemoteCallback;
use crate::error::WorkletError;
use crate::shared::SharedValue;
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value that can be copied or referenced across runtimes
///
/// Plain data is copied. Shared values, worklets and remote callbacks are
/// handles: the receiving runtime gets a reference to the same underlying
/// object, never a pointer into another engine's heap.
#[derive(Clone, Default)]
pub enum WorkletValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<WorkletValue>),
    Object(BTreeMap<String, WorkletValue>),
    SharedValue(SharedValue),
    Worklet(Arc<WorkletClosure>),
    Callback(RemoteCallback),
}

impl WorkletValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            WorkletValue::Undefined => "undefined",
            WorkletValue::Null => "null",
            WorkletValue::Bool(_) => "boolean",
            WorkletValue::Number(_) => "number",
            WorkletValue::String(_) => "string",
            WorkletValue::Array(_) => "array",
            WorkletValue::Object(_) => "object",
            WorkletValue::SharedValue(_) => "shared value",
            WorkletValue::Worklet(_) => "worklet",
            WorkletValue::Callback(_) => "remote function",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, WorkletValue::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, WorkletValue::Undefined | WorkletValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WorkletValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WorkletValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WorkletValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[WorkletValue]> {
        match self {
            WorkletValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, WorkletValue>> {
        match self {
            WorkletValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_shared(&self) -> Option<&SharedValue> {
        match self {
            WorkletValue::SharedValue(shared) => Some(shared),
            _ => None,
        }
    }

    pub fn as_worklet(&self) -> Option<&Arc<WorkletClosure>> {
        match self {
            WorkletValue::Worklet(worklet) => Some(worklet),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&RemoteCallback> {
        match self {
            WorkletValue::Callback(callback) => Some(callback),
            _ => None,
        }
    }

    /// Property lookup on objects, `undefined` otherwise
    pub fn get(&self, key: &str) -> &WorkletValue {
        static UNDEFINED: WorkletValue = WorkletValue::Undefined;
        match self {
            WorkletValue::Object(map) => map.get(key).unwrap_or(&UNDEFINED),
            _ => &UNDEFINED,
        }
    }

    /// Copy of plain data; fails on handles that have no JSON form
    pub fn to_json(&self) -> Result<JsonValue, WorkletError> {
        Ok(match self {
            WorkletValue::Undefined | WorkletValue::Null => JsonValue::Null,
            WorkletValue::Bool(b) => JsonValue::Bool(*b),
            WorkletValue::Number(n) => number_to_json(*n),
            WorkletValue::String(s) => JsonValue::String(s.clone()),
            WorkletValue::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .map(WorkletValue::to_json)
                    .collect::<Result<_, _>>()?,
            ),
            WorkletValue::Object(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), value.to_json()?);
                }
                JsonValue::Object(out)
            }
            WorkletValue::SharedValue(shared) => shared.get().to_json()?,
            other => {
                return Err(WorkletError::UnsupportedCapture {
                    name: other.type_name().to_string(),
                    reason: "value has no JSON representation".to_string(),
                })
            }
        })
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => WorkletValue::Null,
            JsonValue::Bool(b) => WorkletValue::Bool(*b),
            JsonValue::Number(n) => WorkletValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => WorkletValue::String(s.clone()),
            JsonValue::Array(items) => {
                WorkletValue::Array(items.iter().map(WorkletValue::from_json).collect())
            }
            JsonValue::Object(map) => WorkletValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), WorkletValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

fn number_to_json(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n.abs() < (1u64 << 53) as f64 {
        JsonValue::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number)
    }
}

fn format_number(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if n.is_nan() {
        write!(f, "NaN")
    } else if n.is_infinite() {
        write!(f, "{}Infinity", if n < 0.0 { "-" } else { "" })
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{n}")
    }
}

/// JavaScript-flavoured rendering, as `String(value)` would show it
impl fmt::Display for WorkletValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkletValue::Undefined => write!(f, "undefined"),
            WorkletValue::Null => write!(f, "null"),
            WorkletValue::Bool(b) => write!(f, "{b}"),
            WorkletValue::Number(n) => format_number(*n, f),
            WorkletValue::String(s) => write!(f, "{s}"),
            WorkletValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    if !item.is_nullish() {
                        write!(f, "{item}")?;
                    }
                }
                Ok(())
            }
            WorkletValue::Object(_) => write!(f, "[object Object]"),
            WorkletValue::SharedValue(shared) => write!(f, "{}", shared.get()),
            WorkletValue::Worklet(worklet) => write!(f, "[worklet {}]", worklet.name()),
            WorkletValue::Callback(callback) => write!(f, "[remote function {}]", callback.name()),
        }
    }
}

impl fmt::Debug for WorkletValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkletValue::Undefined => write!(f, "Undefined"),
            WorkletValue::Null => write!(f, "Null"),
            WorkletValue::Bool(b) => write!(f, "Bool({b})"),
            WorkletValue::Number(n) => write!(f, "Number({n})"),
            WorkletValue::String(s) => write!(f, "String({s:?})"),
            WorkletValue::Array(items) => f.debug_list().entries(items).finish(),
            WorkletValue::Object(map) => f.debug_map().entries(map).finish(),
            WorkletValue::SharedValue(shared) => write!(f, "SharedValue({})", shared.id()),
            WorkletValue::Worklet(worklet) => write!(f, "Worklet({})", worklet.name()),
            WorkletValue::Callback(callback) => write!(f, "Callback({})", callback.name()),
        }
    }
}

/// Structural equality for data, identity for handles
impl PartialEq for WorkletValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (WorkletValue::Undefined, WorkletValue::Undefined) => true,
            (WorkletValue::Null, WorkletValue::Null) => true,
            (WorkletValue::Bool(a), WorkletValue::Bool(b)) => a == b,
            (WorkletValue::Number(a), WorkletValue::Number(b)) => a == b,
            (WorkletValue::String(a), WorkletValue::String(b)) => a == b,
            (WorkletValue::Array(a), WorkletValue::Array(b)) => a == b,
            (WorkletValue::Object(a), WorkletValue::Object(b)) => a == b,
            (WorkletValue::SharedValue(a), WorkletValue::SharedValue(b)) => a.id() == b.id(),
            (WorkletValue::Worklet(a), WorkletValue::Worklet(b)) => Arc::ptr_eq(a, b),
            (WorkletValue::Callback(a), WorkletValue::Callback(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for WorkletValue {
    fn from(value: bool) -> Self {
        WorkletValue::Bool(value)
    }
}

impl From<f64> for WorkletValue {
    fn from(value: f64) -> Self {
        WorkletValue::Number(value)
    }
}

impl From<i32> for WorkletValue {
    fn from(value: i32) -> Self {
        WorkletValue::Number(value.into())
    }
}

impl From<u32> for WorkletValue {
    fn from(value: u32) -> Self {
        WorkletValue::Number(value.into())
    }
}

impl From<i64> for WorkletValue {
    fn from(value: i64) -> Self {
        WorkletValue::Number(value as f64)
    }
}

impl From<usize> for WorkletValue {
    fn from(value: usize) -> Self {
        WorkletValue::Number(value as f64)
    }
}

impl From<&str> for WorkletValue {
    fn from(value: &str) -> Self {
        WorkletValue::String(value.to_string())
    }
}

impl From<String> for WorkletValue {
    fn from(value: String) -> Self {
        WorkletValue::String(value)
    }
}

impl<T: Into<WorkletValue>> From<Vec<T>> for WorkletValue {
    fn from(items: Vec<T>) -> Self {
        WorkletValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<WorkletValue>> From<Option<T>> for WorkletValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(WorkletValue::Null, Into::into)
    }
}

impl From<SharedValue> for WorkletValue {
    fn from(value: SharedValue) -> Self {
        WorkletValue::SharedValue(value)
    }
}

impl From<&SharedValue> for WorkletValue {
    fn from(value: &SharedValue) -> Self {
        WorkletValue::SharedValue(value.clone())
    }
}

impl From<Arc<WorkletClosure>> for WorkletValue {
    fn from(value: Arc<WorkletClosure>) -> Self {
        WorkletValue::Worklet(value)
    }
}

impl From<RemoteCallback> for WorkletValue {
    fn from(value: RemoteCallback) -> Self {
        WorkletValue::Callback(value)
    }
}

impl From<JsonValue> for WorkletValue {
    fn from(value: JsonValue) -> Self {
        WorkletValue::from_json(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion_keeps_structure() {
        let value = WorkletValue::from_json(&json!({
            "name": "counter",
            "steps": [1, 2.5, null],
            "enabled": true
        }));

        assert_eq!(value.get("name").as_str(), Some("counter"));
        assert_eq!(value.get("enabled").as_bool(), Some(true));
        assert_eq!(
            value.get("steps").as_array().map(|s| s.len()),
            Some(3)
        );
        assert!(value.get("missing").is_undefined());

        let back = value.to_json().unwrap();
        assert_eq!(back["steps"][0], json!(1));
        assert_eq!(back["steps"][1], json!(2.5));
    }

    #[test]
    fn shared_values_serialize_as_their_contents() {
        let shared = SharedValue::new(41);
        let value = WorkletValue::from(vec![WorkletValue::from(&shared)]);
        shared.set(42);
        assert_eq!(value.to_json().unwrap(), json!([42]));
    }

    #[test]
    fn worklets_have_no_json_form() {
        let worklet = WorkletClosure::native("noop", |_, _| Ok(WorkletValue::Undefined));
        let err = WorkletValue::from(worklet).to_json().unwrap_err();
        assert!(matches!(err, WorkletError::UnsupportedCapture { .. }));
    }

    #[test]
    fn display_matches_javascript() {
        assert_eq!(WorkletValue::from(3.0).to_string(), "3");
        assert_eq!(WorkletValue::from(0.5).to_string(), "0.5");
        assert_eq!(WorkletValue::Number(f64::NAN).to_string(), "NaN");
        assert_eq!(WorkletValue::Undefined.to_string(), "undefined");
        assert_eq!(
            WorkletValue::from(vec![WorkletValue::from(1), WorkletValue::Null]).to_string(),
            "1,"
        );
        assert_eq!(
            WorkletValue::Object(BTreeMap::new()).to_string(),
            "[object Object]"
        );
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = SharedValue::new(1);
        let b = SharedValue::new(1);
        assert_eq!(WorkletValue::from(&a), WorkletValue::from(a.clone()));
        assert_ne!(WorkletValue::from(&a), WorkletValue::from(&b));
    }

    #[test]
    fn option_maps_to_null() {
        assert_eq!(WorkletValue::from(None::<i32>), WorkletValue::Null);
        assert_eq!(WorkletValue::from(Some("x")), WorkletValue::from("x"));
    }
}
