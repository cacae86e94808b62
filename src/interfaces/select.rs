//! Select interface - pick elements out of a list.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use super::types::{FieldKind, InputField, Interface, InterfaceResult, RunContext};
use crate::error::{Error, Result};

/// Select interface implementation.
pub struct SelectInterface;

impl SelectInterface {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SelectInterface {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a possibly negative index against `len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let idx = if index < 0 { len as i64 + index } else { index };
    (0..len as i64).contains(&idx).then_some(idx as usize)
}

fn pick(node_id: &str, list: &[Value], index: &Value) -> Result<Value> {
    let at = |i: i64| -> Result<Value> {
        resolve_index(i, list.len())
            .map(|i| list[i].clone())
            .ok_or_else(|| {
                Error::Node(format!(
                    "Node '{}': index {} out of range for list of length {}",
                    node_id,
                    i,
                    list.len()
                ))
            })
    };

    match index {
        Value::Number(n) => at(n
            .as_i64()
            .ok_or_else(|| Error::Node(format!("Node '{}': index must be an integer", node_id)))?),
        Value::Array(indices) => indices
            .iter()
            .map(|i| pick(node_id, list, i))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Err(Error::Node(format!(
            "Node '{}': index must be an integer or list of integers, got {}",
            node_id, other
        ))),
    }
}

#[async_trait]
impl Interface for SelectInterface {
    fn name(&self) -> &str {
        "select"
    }

    fn description(&self) -> &str {
        "Select elements of inlist by index"
    }

    fn input_spec(&self, _config: &Value) -> Result<Option<Vec<InputField>>> {
        Ok(Some(vec![
            InputField::new("inlist", FieldKind::List).mandatory(),
            InputField::new("index", FieldKind::Any).mandatory(),
        ]))
    }

    fn output_names(&self, _config: &Value) -> Result<Option<Vec<String>>> {
        Ok(Some(vec!["out".to_string()]))
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn run(&self, _config: &Value, ctx: &RunContext) -> Result<InterfaceResult> {
        let list = match ctx.input("inlist") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(other) => std::slice::from_ref(other),
            None => {
                return Err(Error::Node(format!(
                    "Node '{}': inlist is not set",
                    ctx.node_id
                )))
            }
        };
        let index = ctx
            .input("index")
            .ok_or_else(|| Error::Node(format!("Node '{}': index is not set", ctx.node_id)))?;

        let mut outputs = BTreeMap::new();
        outputs.insert("out".to_string(), pick(&ctx.node_id, list, index)?);
        Ok(InterfaceResult::new(outputs))
    }
}
