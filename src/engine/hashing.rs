//! Cache keys for node runs.
//!
//! A node's key is the SHA-256 of a canonical JSON document holding the
//! interface identity and every hashable input. File inputs contribute a
//! fingerprint instead of the path alone, so touching or rewriting an input
//! file invalidates downstream results.

use ring::digest::{digest, Context, SHA256};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use crate::error::Result;
use crate::interfaces::{FieldKind, InputField, Interface};
use crate::workflow::HashMethod;

/// Result of hashing a node's inputs.
#[derive(Debug, Clone)]
pub struct InputHash {
    /// Hex SHA-256
    pub hash: String,
    /// The document that was hashed, kept for inspection on disk
    pub hashed_inputs: Value,
}

/// Identity string for an interface configured with `config`.
pub fn interface_identity(interface: &dyn Interface, config: &Value) -> String {
    if config.is_null() {
        interface.identity()
    } else {
        format!("{}#{}", interface.identity(), canonical(config))
    }
}

/// Rebuild `value` with object keys in sorted order.
pub fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut ctx = Context::new(&SHA256);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    Ok(hex::encode(ctx.finish()))
}

/// Fingerprint one path. Missing files fingerprint as their path only.
pub fn fingerprint_file(path: &str, method: HashMethod) -> Result<Value> {
    let p = Path::new(path);
    let Ok(meta) = std::fs::metadata(p) else {
        return Ok(json!({ "path": path }));
    };

    if method == HashMethod::Content && meta.is_file() {
        return Ok(json!({ "path": path, "sha256": sha256_file(p)? }));
    }

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| format!("{}.{:09}", d.as_secs(), d.subsec_nanos()))
        .unwrap_or_default();
    Ok(json!({ "path": path, "size": meta.len(), "mtime": mtime }))
}

fn fingerprint_value(value: &Value, method: HashMethod) -> Result<Value> {
    match value {
        Value::String(path) => fingerprint_file(path, method),
        Value::Array(items) => items
            .iter()
            .map(|item| fingerprint_value(item, method))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Hash the inputs of one node run.
///
/// `spec` marks which fields are files and which are excluded; without a
/// spec every input is hashed by value. Null inputs are left out so that an
/// unset field and a field explicitly set to null share a key.
pub fn hash_inputs(
    identity: &str,
    spec: Option<&[InputField]>,
    inputs: &BTreeMap<String, Value>,
    method: HashMethod,
) -> Result<InputHash> {
    let mut hashed = Map::new();

    for (name, value) in inputs {
        if value.is_null() {
            continue;
        }
        let field = spec.and_then(|fields| fields.iter().find(|f| &f.name == name));
        let entry = match field {
            Some(f) if f.nohash => continue,
            Some(f) if f.kind == FieldKind::File && !f.output_name => {
                fingerprint_value(value, method)?
            }
            _ => canonical(value),
        };
        hashed.insert(name.clone(), entry);
    }

    let document = canonical(&json!({
        "interface": identity,
        "inputs": Value::Object(hashed),
    }));
    let hash = hex::encode(digest(&SHA256, document.to_string().as_bytes()));

    Ok(InputHash {
        hash,
        hashed_inputs: document,
    })
}
