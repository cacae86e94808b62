//! Rhai expression support.
//!
//! Used for connection transforms (the value in flight is bound as `value`)
//! and for the `function` interface, whose inputs are bound by name.

use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Upper bound on evaluated operations, so a runaway script fails instead of
/// hanging a worker.
const MAX_OPERATIONS: u64 = 1_000_000;

/// Create a configured Rhai engine.
fn create_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);

    engine.register_fn("to_json", |v: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(v)).unwrap_or_default()
    });

    engine.register_fn("from_json", |s: &str| -> Dynamic {
        serde_json::from_str::<Value>(s)
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    });

    engine.register_fn("basename", |s: &str| -> String {
        std::path::Path::new(s)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    engine.register_fn("dirname", |s: &str| -> String {
        std::path::Path::new(s)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    engine
}

/// Evaluate a connection transform with `value` in scope.
pub fn eval_transform(expression: &str, value: Value) -> Result<Value> {
    let engine = create_engine();
    let mut scope = Scope::new();
    scope.push("value", json_to_dynamic(value));

    let result: Dynamic = engine
        .eval_with_scope(&mut scope, expression)
        .map_err(|e| Error::Node(format!("Transform '{}' failed: {}", expression, e)))?;

    Ok(dynamic_to_json(result))
}

/// Evaluate a script with each variable bound by name.
pub fn eval_script(script: &str, variables: &BTreeMap<String, Value>) -> Result<Value> {
    let engine = create_engine();
    let mut scope = Scope::new();
    for (name, value) in variables {
        scope.push(name.clone(), json_to_dynamic(value.clone()));
    }

    let result: Dynamic = engine
        .eval_with_scope(&mut scope, script)
        .map_err(|e| Error::Node(format!("Script error: {}", e)))?;

    Ok(dynamic_to_json(result))
}

/// Convert rhai::Dynamic to serde_json::Value
pub fn dynamic_to_json(v: Dynamic) -> Value {
    if v.is_unit() {
        Value::Null
    } else if v.is_bool() {
        Value::Bool(v.as_bool().unwrap_or(false))
    } else if v.is_int() {
        serde_json::json!(v.as_int().unwrap_or(0))
    } else if v.is_float() {
        serde_json::json!(v.as_float().unwrap_or(0.0))
    } else if v.is_string() {
        Value::String(v.into_string().unwrap_or_default())
    } else if v.is_array() {
        match v.into_array() {
            Ok(arr) => Value::Array(arr.into_iter().map(dynamic_to_json).collect()),
            Err(_) => Value::Null,
        }
    } else if v.is_map() {
        match v.try_cast::<rhai::Map>() {
            Some(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                    .collect(),
            ),
            None => Value::Null,
        }
    } else {
        Value::String(v.to_string())
    }
}

/// Convert serde_json::Value to rhai::Dynamic
pub fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            let vec: Vec<Dynamic> = arr.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}
