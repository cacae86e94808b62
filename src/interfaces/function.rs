//! Function interface - compute outputs with a Rhai script.
//!
//! ```yaml
//! - name: compute_duration
//!   interface: function
//!   config:
//!     inputs: [tr, nvols]
//!     outputs: [duration]
//!     script: "tr * nvols"
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::types::{FieldKind, InputField, Interface, InterfaceResult, RunContext};
use crate::error::{Error, Result};
use crate::script::eval_script;

/// Function interface implementation.
pub struct FunctionInterface;

impl FunctionInterface {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FunctionInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct FunctionConfig {
    script: String,
    #[serde(default)]
    inputs: Vec<String>,
    outputs: Vec<String>,
}

fn parse_config(config: &Value) -> Result<FunctionConfig> {
    let config: FunctionConfig = serde_json::from_value(config.clone())
        .map_err(|e| Error::Node(format!("Invalid function config: {}", e)))?;
    if config.outputs.is_empty() {
        return Err(Error::Node(
            "function requires at least one output".to_string(),
        ));
    }
    Ok(config)
}

#[async_trait]
impl Interface for FunctionInterface {
    fn name(&self) -> &str {
        "function"
    }

    fn description(&self) -> &str {
        "Evaluate a script over the inputs; a map result fills outputs by name"
    }

    fn input_spec(&self, config: &Value) -> Result<Option<Vec<InputField>>> {
        let config = parse_config(config)?;
        Ok(Some(
            config
                .inputs
                .iter()
                .map(|f| InputField::new(f, FieldKind::Any))
                .collect(),
        ))
    }

    fn output_names(&self, config: &Value) -> Result<Option<Vec<String>>> {
        Ok(Some(parse_config(config)?.outputs))
    }

    async fn run(&self, config: &Value, ctx: &RunContext) -> Result<InterfaceResult> {
        let config = parse_config(config)?;

        let variables: BTreeMap<String, Value> = config
            .inputs
            .iter()
            .map(|name| (name.clone(), ctx.inputs.get(name).cloned().unwrap_or(Value::Null)))
            .collect();

        let started = std::time::Instant::now();
        let result = eval_script(&config.script, &variables)
            .map_err(|e| Error::Node(format!("Node '{}': {}", ctx.node_id, e)))?;

        let mut outputs = BTreeMap::new();
        match result {
            Value::Object(mut map) if config.outputs.iter().all(|o| map.contains_key(o)) => {
                for name in &config.outputs {
                    outputs.insert(name.clone(), map.remove(name).unwrap_or(Value::Null));
                }
            }
            value if config.outputs.len() == 1 => {
                outputs.insert(config.outputs[0].clone(), value);
            }
            _ => {
                return Err(Error::Node(format!(
                    "Node '{}': script must return a map with keys {:?}",
                    ctx.node_id, config.outputs
                )))
            }
        }

        Ok(InterfaceResult::new(outputs).with_runtime(json!({
            "duration_ms": started.elapsed().as_millis() as u64,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx(inputs: Vec<(&str, Value)>) -> RunContext {
        RunContext::new("compute", PathBuf::from("/tmp")).with_inputs(
            inputs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_function_scalar_result() {
        let iface = FunctionInterface::new();
        let config = json!({
            "script": "tr * nvols",
            "inputs": ["tr", "nvols"],
            "outputs": ["duration"],
        });
        let result = iface
            .run(&config, &ctx(vec![("tr", json!(2.0)), ("nvols", json!(3.0))]))
            .await
            .unwrap();
        assert_eq!(result.outputs["duration"], json!(6.0));
    }

    #[tokio::test]
    async fn test_function_map_result() {
        let iface = FunctionInterface::new();
        let config = json!({
            "script": "#{ first: files[0], count: files.len() }",
            "inputs": ["files"],
            "outputs": ["first", "count"],
        });
        let result = iface
            .run(&config, &ctx(vec![("files", json!(["a.nii", "b.nii"]))]))
            .await
            .unwrap();
        assert_eq!(result.outputs["first"], json!("a.nii"));
        assert_eq!(result.outputs["count"], json!(2));
    }

    #[tokio::test]
    async fn test_function_missing_output_key() {
        let iface = FunctionInterface::new();
        let config = json!({
            "script": "#{ first: 1 }",
            "outputs": ["first", "second"],
        });
        assert!(iface.run(&config, &ctx(vec![])).await.is_err());
    }

    #[test]
    fn test_function_requires_outputs() {
        let iface = FunctionInterface::new();
        assert!(iface
            .output_names(&json!({ "script": "1", "outputs": [] }))
            .is_err());
    }
}
