//! Merge interface - combine several inputs into one list.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::types::{FieldKind, InputField, Interface, InterfaceResult, RunContext};
use crate::error::{Error, Result};

/// Merge interface implementation.
pub struct MergeInterface;

impl MergeInterface {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MergeInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct MergeConfig {
    numinputs: usize,
    /// Keep list inputs as single elements instead of extending
    #[serde(default)]
    no_flatten: bool,
}

fn parse_config(config: &Value) -> Result<MergeConfig> {
    let config: MergeConfig = serde_json::from_value(config.clone())
        .map_err(|e| Error::Node(format!("Invalid merge config: {}", e)))?;
    if config.numinputs == 0 {
        return Err(Error::Node("merge requires numinputs >= 1".to_string()));
    }
    Ok(config)
}

fn port_name(i: usize) -> String {
    format!("in{}", i)
}

#[async_trait]
impl Interface for MergeInterface {
    fn name(&self) -> &str {
        "merge"
    }

    fn description(&self) -> &str {
        "Merge inputs in1..inN into a single list"
    }

    fn input_spec(&self, config: &Value) -> Result<Option<Vec<InputField>>> {
        let config = parse_config(config)?;
        Ok(Some(
            (1..=config.numinputs)
                .map(|i| InputField::new(&port_name(i), FieldKind::Any))
                .collect(),
        ))
    }

    fn output_names(&self, _config: &Value) -> Result<Option<Vec<String>>> {
        Ok(Some(vec!["out".to_string()]))
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn run(&self, config: &Value, ctx: &RunContext) -> Result<InterfaceResult> {
        let config = parse_config(config)?;
        let mut out = Vec::new();

        for i in 1..=config.numinputs {
            match ctx.input(&port_name(i)) {
                None => {}
                Some(Value::Array(items)) if !config.no_flatten => out.extend(items.clone()),
                Some(value) => out.push(value.clone()),
            }
        }

        let mut outputs = BTreeMap::new();
        outputs.insert("out".to_string(), Value::Array(out));
        Ok(InterfaceResult::new(outputs).with_runtime(json!({ "numinputs": config.numinputs })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx(inputs: Vec<(&str, Value)>) -> RunContext {
        RunContext::new("merge", PathBuf::from("/tmp")).with_inputs(
            inputs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_merge_extends_lists_and_appends_scalars() {
        let iface = MergeInterface::new();
        let config = json!({ "numinputs": 3 });
        let ctx = ctx(vec![
            ("in1", json!(["a.nii", "b.nii"])),
            ("in3", json!("c.nii")),
        ]);

        let result = iface.run(&config, &ctx).await.unwrap();
        assert_eq!(result.outputs["out"], json!(["a.nii", "b.nii", "c.nii"]));
    }

    #[tokio::test]
    async fn test_merge_no_flatten() {
        let iface = MergeInterface::new();
        let config = json!({ "numinputs": 2, "no_flatten": true });
        let ctx = ctx(vec![("in1", json!([1, 2])), ("in2", json!(3))]);

        let result = iface.run(&config, &ctx).await.unwrap();
        assert_eq!(result.outputs["out"], json!([[1, 2], 3]));
    }

    #[test]
    fn test_merge_spec() {
        let iface = MergeInterface::new();
        let spec = iface.input_spec(&json!({ "numinputs": 2 })).unwrap().unwrap();
        let names: Vec<&str> = spec.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["in1", "in2"]);

        assert!(iface.input_spec(&Value::Null).is_err());
        assert!(iface.input_spec(&json!({ "numinputs": 0 })).is_err());
    }
}
