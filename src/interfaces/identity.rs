//! Identity interface - expose values as named ports.
//!
//! Mostly used as the iterable source of a parameter sweep, or to give a
//! nested workflow a stable set of input ports.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::types::{FieldKind, InputField, Interface, InterfaceResult, RunContext};
use crate::error::{Error, Result};

/// Identity interface implementation.
pub struct IdentityInterface;

impl IdentityInterface {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IdentityInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
struct IdentityConfig {
    #[serde(default)]
    fields: Option<Vec<String>>,
}

fn parse_config(config: &Value) -> Result<IdentityConfig> {
    if config.is_null() {
        return Ok(IdentityConfig::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| Error::Node(format!("Invalid identity config: {}", e)))
}

#[async_trait]
impl Interface for IdentityInterface {
    fn name(&self) -> &str {
        "identity"
    }

    fn description(&self) -> &str {
        "Pass inputs through unchanged (config.fields names the ports)"
    }

    fn input_spec(&self, config: &Value) -> Result<Option<Vec<InputField>>> {
        Ok(parse_config(config)?.fields.map(|fields| {
            fields
                .iter()
                .map(|f| InputField::new(f, FieldKind::Any))
                .collect()
        }))
    }

    fn output_names(&self, config: &Value) -> Result<Option<Vec<String>>> {
        Ok(parse_config(config)?.fields)
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn run(&self, config: &Value, ctx: &RunContext) -> Result<InterfaceResult> {
        let config = parse_config(config)?;
        let outputs: BTreeMap<String, Value> = match config.fields {
            Some(fields) => fields
                .into_iter()
                .map(|f| {
                    let value = ctx.inputs.get(&f).cloned().unwrap_or(Value::Null);
                    (f, value)
                })
                .collect(),
            None => ctx.inputs.clone(),
        };
        Ok(InterfaceResult::new(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_identity_declared_fields() {
        let iface = IdentityInterface::new();
        let config = json!({ "fields": ["fwhm", "subject_id"] });

        let mut inputs = BTreeMap::new();
        inputs.insert("fwhm".to_string(), json!(8));
        inputs.insert("ignored".to_string(), json!(true));
        let ctx = RunContext::new("iter_fwhm", PathBuf::from("/tmp")).with_inputs(inputs);

        let result = iface.run(&config, &ctx).await.unwrap();
        assert_eq!(result.outputs["fwhm"], json!(8));
        assert_eq!(result.outputs["subject_id"], Value::Null);
        assert!(!result.outputs.contains_key("ignored"));

        let names = iface.output_names(&config).unwrap().unwrap();
        assert_eq!(names, vec!["fwhm", "subject_id"]);
    }

    #[tokio::test]
    async fn test_identity_open_ports() {
        let iface = IdentityInterface::new();
        assert!(iface.input_spec(&Value::Null).unwrap().is_none());

        let mut inputs = BTreeMap::new();
        inputs.insert("anything".to_string(), json!("x"));
        let ctx = RunContext::new("pass", PathBuf::from("/tmp")).with_inputs(inputs);
        let result = iface.run(&Value::Null, &ctx).await.unwrap();
        assert_eq!(result.outputs["anything"], json!("x"));
    }

    #[test]
    fn test_identity_invalid_config() {
        let iface = IdentityInterface::new();
        assert!(iface.input_spec(&json!({ "fields": "fwhm" })).is_err());
    }
}
