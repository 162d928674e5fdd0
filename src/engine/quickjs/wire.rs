// Wire format - WorkletValue <-> JSON text crossing into a QuickJS heap
//
// Plain data maps onto JSON directly. Everything JSON cannot express is an
// object tagged with `$type`: `undefined`, non-finite numbers, and handles
// (shared values, worklets, remote callbacks) which travel as ids into the
// engine's handle tables. A plain object that itself owns a `$type` key is
// wrapped as `{"$type": "object", "value": ...}`.

use super::Tables;
use crate::error::EngineError;
use crate::worklet::WorkletValue;
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::BTreeMap;

const TAG: &str = "$type";

fn tagged(kind: &str, field: &str, value: JsonValue) -> JsonValue {
    let mut map = Map::new();
    map.insert(TAG.to_string(), JsonValue::from(kind));
    if !field.is_empty() {
        map.insert(field.to_string(), value);
    }
    JsonValue::Object(map)
}

pub(super) fn encode(value: &WorkletValue, tables: &mut Tables) -> JsonValue {
    match value {
        WorkletValue::Undefined => tagged("undefined", "", JsonValue::Null),
        WorkletValue::Null => JsonValue::Null,
        WorkletValue::Bool(b) => JsonValue::Bool(*b),
        WorkletValue::Number(n) => match Number::from_f64(*n) {
            Some(number) => JsonValue::Number(number),
            None => {
                let text = if n.is_nan() {
                    "NaN"
                } else if *n > 0.0 {
                    "Infinity"
                } else {
                    "-Infinity"
                };
                tagged("number", "value", JsonValue::from(text))
            }
        },
        WorkletValue::String(s) => JsonValue::String(s.clone()),
        WorkletValue::Array(items) => {
            JsonValue::Array(items.iter().map(|item| encode(item, tables)).collect())
        }
        WorkletValue::Object(fields) => {
            let map: Map<String, JsonValue> = fields
                .iter()
                .map(|(key, item)| (key.clone(), encode(item, tables)))
                .collect();
            if map.contains_key(TAG) {
                tagged("object", "value", JsonValue::Object(map))
            } else {
                JsonValue::Object(map)
            }
        }
        WorkletValue::SharedValue(shared) => {
            let id = tables.pin_shared(shared);
            tagged("shared", "id", JsonValue::from(id))
        }
        WorkletValue::Worklet(worklet) => {
            let id = tables.pin_worklet(worklet);
            tagged("worklet", "id", JsonValue::from(id))
        }
        WorkletValue::Callback(callback) => {
            let id = tables.pin_remote(callback);
            tagged("callback", "id", JsonValue::from(id))
        }
    }
}

pub(super) fn encode_text(value: &WorkletValue, tables: &mut Tables) -> String {
    encode(value, tables).to_string()
}

pub(super) fn encode_list(values: &[WorkletValue], tables: &mut Tables) -> String {
    JsonValue::Array(values.iter().map(|value| encode(value, tables)).collect()).to_string()
}

pub(super) fn decode(wire: &JsonValue, tables: &mut Tables) -> Result<WorkletValue, EngineError> {
    Ok(match wire {
        JsonValue::Null => WorkletValue::Null,
        JsonValue::Bool(b) => WorkletValue::Bool(*b),
        JsonValue::Number(n) => WorkletValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        JsonValue::String(s) => WorkletValue::String(s.clone()),
        JsonValue::Array(items) => WorkletValue::Array(
            items
                .iter()
                .map(|item| decode(item, tables))
                .collect::<Result<_, _>>()?,
        ),
        JsonValue::Object(map) => match map.get(TAG) {
            None => WorkletValue::Object(decode_map(map, tables)?),
            Some(kind) => decode_tagged(kind.as_str().unwrap_or_default(), map, tables)?,
        },
    })
}

fn decode_tagged(
    kind: &str,
    map: &Map<String, JsonValue>,
    tables: &mut Tables,
) -> Result<WorkletValue, EngineError> {
    let id = || {
        map.get("id")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| EngineError::Conversion(format!("{kind} handle without an id")))
    };

    match kind {
        "undefined" => Ok(WorkletValue::Undefined),
        "number" => match map.get("value").and_then(JsonValue::as_str) {
            Some("Infinity") => Ok(WorkletValue::Number(f64::INFINITY)),
            Some("-Infinity") => Ok(WorkletValue::Number(f64::NEG_INFINITY)),
            _ => Ok(WorkletValue::Number(f64::NAN)),
        },
        "object" => match map.get("value") {
            Some(JsonValue::Object(fields)) => Ok(WorkletValue::Object(decode_map(fields, tables)?)),
            _ => Err(EngineError::Conversion("malformed object wrapper".to_string())),
        },
        "shared" => Ok(WorkletValue::SharedValue(tables.shared_value(id()?)?)),
        "worklet" => Ok(WorkletValue::Worklet(tables.worklet(id()?)?)),
        "callback" => Ok(WorkletValue::Callback(tables.remote(id()?)?)),
        other => Err(EngineError::Conversion(format!("unknown value tag '{other}'"))),
    }
}

fn decode_map(
    map: &Map<String, JsonValue>,
    tables: &mut Tables,
) -> Result<BTreeMap<String, WorkletValue>, EngineError> {
    map.iter()
        .map(|(key, item)| Ok((key.clone(), decode(item, tables)?)))
        .collect()
}

fn parse(text: &str) -> Result<JsonValue, EngineError> {
    serde_json::from_str(text).map_err(|err| EngineError::Conversion(err.to_string()))
}

pub(super) fn decode_text(text: &str, tables: &mut Tables) -> Result<WorkletValue, EngineError> {
    decode(&parse(text)?, tables)
}

pub(super) fn decode_list(text: &str, tables: &mut Tables) -> Result<Vec<WorkletValue>, EngineError> {
    match parse(text)? {
        JsonValue::Array(items) => items.iter().map(|item| decode(item, tables)).collect(),
        _ => Err(EngineError::Conversion("expected an argument list".to_string())),
    }
}

/// Captured variables: a plain map from binding name to encoded value
pub(super) fn decode_fields(
    text: &str,
    tables: &mut Tables,
) -> Result<BTreeMap<String, WorkletValue>, EngineError> {
    match parse(text)? {
        JsonValue::Object(map) => decode_map(&map, tables),
        _ => Err(EngineError::Conversion("expected an object of captures".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedValue;
    use crate::worklet::WorkletClosure;
    use serde_json::json;

    #[test]
    fn plain_data_is_plain_json() {
        let mut tables = Tables::new();
        let value = WorkletValue::from(json!({"a": [1, "two", null, true]}));
        assert_eq!(encode(&value, &mut tables), json!({"a": [1.0, "two", null, true]}));
    }

    #[test]
    fn non_json_values_are_tagged() {
        let mut tables = Tables::new();
        let value = WorkletValue::Array(vec![
            WorkletValue::Undefined,
            WorkletValue::Number(f64::NEG_INFINITY),
        ]);
        let text = encode_text(&value, &mut tables);
        assert_eq!(
            serde_json::from_str::<JsonValue>(&text).unwrap(),
            json!([{"$type": "undefined"}, {"$type": "number", "value": "-Infinity"}])
        );

        let decoded = decode_text(&text, &mut tables).unwrap();
        let items = decoded.as_array().unwrap();
        assert!(items[0].is_undefined());
        assert_eq!(items[1].as_f64(), Some(f64::NEG_INFINITY));
    }

    #[test]
    fn objects_owning_the_tag_key_are_wrapped() {
        let mut tables = Tables::new();
        let value = WorkletValue::from(json!({"$type": "shared", "id": 1}));
        let wire = encode(&value, &mut tables);
        assert_eq!(wire["$type"], "object");

        let decoded = decode(&wire, &mut tables).unwrap();
        assert_eq!(decoded.get("$type").as_str(), Some("shared"));
    }

    #[test]
    fn handles_resolve_through_tables() {
        let mut tables = Tables::new();
        let shared = SharedValue::new(3);
        let worklet = WorkletClosure::native("noop", |_, _| Ok(WorkletValue::Undefined));

        let value = WorkletValue::Array(vec![shared.clone().into(), worklet.clone().into()]);
        let text = encode_text(&value, &mut tables);
        let decoded = decode_text(&text, &mut tables).unwrap();
        let items = decoded.as_array().unwrap();

        assert_eq!(items[0].as_shared().map(SharedValue::id), Some(shared.id()));
        assert!(std::sync::Arc::ptr_eq(items[1].as_worklet().unwrap(), &worklet));
    }

    #[test]
    fn unknown_handles_are_conversion_errors() {
        let mut tables = Tables::new();
        let err = decode_text(r#"{"$type": "worklet", "id": 99}"#, &mut tables).unwrap_err();
        assert!(matches!(err, EngineError::Conversion(_)));
        assert!(decode_list("{}", &mut tables).is_err());
    }
}
