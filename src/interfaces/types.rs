//! Interface trait and run context types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::workflow::HashMethod;

/// Declared type of an input field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    /// A path; fingerprinted rather than hashed by value
    File,
    List,
    #[default]
    Any,
}

impl FieldKind {
    /// Whether `value` fits this kind. Scalar kinds also take lists of
    /// matching values, as produced by joins and merges.
    pub fn accepts(&self, value: &Value) -> bool {
        let scalar = |v: &Value| match self {
            Self::String | Self::File => v.is_string(),
            Self::Int => v.is_i64() || v.is_u64(),
            Self::Float => v.is_number(),
            Self::Bool => v.is_boolean(),
            Self::List => v.is_array(),
            Self::Any => true,
        };
        match value {
            Value::Array(items) if !matches!(self, Self::List | Self::Any) => {
                items.iter().all(scalar)
            }
            other => scalar(other),
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::File => "file",
            Self::List => "list",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// Metadata for one input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub mandatory: bool,
    /// Excluded from the cache key
    #[serde(default)]
    pub nohash: bool,
    /// Fields that must not be set together with this one
    #[serde(default)]
    pub xor: Vec<String>,
    /// Fields that must be set whenever this one is
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub default: Option<Value>,
    /// Names a file the interface writes; kept relative to the working
    /// directory and hashed by value
    #[serde(default)]
    pub output_name: bool,
}

impl InputField {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            mandatory: false,
            nohash: false,
            xor: Vec::new(),
            requires: Vec::new(),
            default: None,
            output_name: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Everything an interface sees while running one node instance.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Instance id, used in errors and logs
    pub node_id: String,
    /// Working directory; created before `run` is called
    pub workdir: PathBuf,
    /// Resolved input values
    pub inputs: BTreeMap<String, Value>,
    pub hash_method: HashMethod,
    /// Iterable directory segments of this instance, outermost first
    pub param_dirs: Vec<String>,
}

impl RunContext {
    pub fn new(node_id: &str, workdir: PathBuf) -> Self {
        Self {
            node_id: node_id.to_string(),
            workdir,
            inputs: BTreeMap::new(),
            hash_method: HashMethod::default(),
            param_dirs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_param_dirs(mut self, param_dirs: Vec<String>) -> Self {
        self.param_dirs = param_dirs;
        self
    }

    /// Get an input that is present and not null.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).filter(|v| !v.is_null())
    }
}

/// Result of running an interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceResult {
    /// Output port values
    pub outputs: BTreeMap<String, Value>,
    /// Runtime details (command line, return code, duration, log tails)
    #[serde(default)]
    pub runtime: Value,
}

impl InterfaceResult {
    pub fn new(outputs: BTreeMap<String, Value>) -> Self {
        Self {
            outputs,
            runtime: Value::Null,
        }
    }

    pub fn with_runtime(mut self, runtime: Value) -> Self {
        self.runtime = runtime;
        self
    }
}

/// Trait that all interfaces implement.
///
/// An interface is the unit of work a node wraps: an external command or one
/// of the small utility steps used to route values between commands.
#[async_trait]
pub trait Interface: Send + Sync {
    /// Interface name as referenced by `node.interface`.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        "A workflow interface"
    }

    /// Declared input ports for `config`, or `None` to accept any port.
    fn input_spec(&self, _config: &Value) -> Result<Option<Vec<InputField>>> {
        Ok(None)
    }

    /// Declared output ports for `config`, or `None` when open-ended.
    fn output_names(&self, _config: &Value) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// String folded into cache keys; changes whenever behaviour changes.
    fn identity(&self) -> String {
        self.name().to_string()
    }

    /// Whether results are worth caching on disk.
    fn cacheable(&self) -> bool {
        true
    }

    /// Run the interface once.
    async fn run(&self, config: &Value, ctx: &RunContext) -> Result<InterfaceResult>;
}

fn is_set(inputs: &BTreeMap<String, Value>, name: &str) -> bool {
    inputs.get(name).is_some_and(|v| !v.is_null())
}

/// Fill defaults, check value types and enforce mandatory, xor and
/// requires constraints.
pub fn check_inputs(
    node_id: &str,
    spec: &[InputField],
    inputs: &mut BTreeMap<String, Value>,
) -> Result<()> {
    for field in spec {
        if let Some(default) = &field.default {
            let partner_set = field.xor.iter().any(|x| is_set(inputs, x));
            if !is_set(inputs, &field.name) && !partner_set {
                inputs.insert(field.name.clone(), default.clone());
            }
        }
    }

    for field in spec {
        let set = is_set(inputs, &field.name);

        if field.mandatory && !set && !field.xor.iter().any(|x| is_set(inputs, x)) {
            let msg = if field.xor.is_empty() {
                format!("Node '{}': mandatory input '{}' is not set", node_id, field.name)
            } else {
                format!(
                    "Node '{}': one of '{}', '{}' must be set",
                    node_id,
                    field.name,
                    field.xor.join("', '")
                )
            };
            return Err(Error::Validation(msg));
        }

        if !set {
            continue;
        }

        if let Some(value) = inputs.get(&field.name) {
            if !field.kind.accepts(value) {
                return Err(Error::Validation(format!(
                    "Node '{}': input '{}' expects {}, got {}",
                    node_id, field.name, field.kind, value
                )));
            }
        }

        if let Some(other) = field.xor.iter().find(|x| is_set(inputs, x)) {
            return Err(Error::Validation(format!(
                "Node '{}': inputs '{}' and '{}' are mutually exclusive",
                node_id, field.name, other
            )));
        }

        if let Some(missing) = field.requires.iter().find(|r| !is_set(inputs, r)) {
            return Err(Error::Validation(format!(
                "Node '{}': input '{}' requires '{}'",
                node_id, field.name, missing
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tshift_spec() -> Vec<InputField> {
        let mut tpattern = InputField::new("tpattern", FieldKind::String);
        tpattern.default = Some(json!("alt+z"));
        tpattern.xor = vec!["slice_timing".to_string()];

        let mut slice_timing = InputField::new("slice_timing", FieldKind::List);
        slice_timing.xor = vec!["tpattern".to_string()];

        let mut tzero = InputField::new("tzero", FieldKind::Float);
        tzero.requires = vec!["tr".to_string()];

        vec![
            InputField::new("in_file", FieldKind::File).mandatory(),
            tpattern,
            slice_timing,
            tzero,
            InputField::new("tr", FieldKind::String),
        ]
    }

    #[test]
    fn test_defaults_filled() {
        let mut inputs = BTreeMap::new();
        inputs.insert("in_file".to_string(), json!("func.nii"));
        check_inputs("tshift", &tshift_spec(), &mut inputs).unwrap();
        assert_eq!(inputs["tpattern"], json!("alt+z"));
    }

    #[test]
    fn test_default_skipped_when_xor_partner_set() {
        let mut inputs = BTreeMap::new();
        inputs.insert("in_file".to_string(), json!("func.nii"));
        inputs.insert("slice_timing".to_string(), json!([0.0, 1.0]));
        check_inputs("tshift", &tshift_spec(), &mut inputs).unwrap();
        assert!(!inputs.contains_key("tpattern"));
    }

    #[test]
    fn test_mandatory_missing() {
        let mut inputs = BTreeMap::new();
        let err = check_inputs("tshift", &tshift_spec(), &mut inputs).unwrap_err();
        assert!(err.to_string().contains("mandatory input 'in_file'"));
    }

    #[test]
    fn test_null_counts_as_unset() {
        let mut inputs = BTreeMap::new();
        inputs.insert("in_file".to_string(), Value::Null);
        assert!(check_inputs("tshift", &tshift_spec(), &mut inputs).is_err());
    }

    #[test]
    fn test_xor_conflict() {
        let mut inputs = BTreeMap::new();
        inputs.insert("in_file".to_string(), json!("func.nii"));
        inputs.insert("tpattern".to_string(), json!("seq+z"));
        inputs.insert("slice_timing".to_string(), json!([0.0, 1.0]));
        let err = check_inputs("tshift", &tshift_spec(), &mut inputs).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_requires() {
        let mut inputs = BTreeMap::new();
        inputs.insert("in_file".to_string(), json!("func.nii"));
        inputs.insert("tzero".to_string(), json!(0.0));
        let err = check_inputs("tshift", &tshift_spec(), &mut inputs).unwrap_err();
        assert!(err.to_string().contains("requires 'tr'"));

        inputs.insert("tr".to_string(), json!("1.5s"));
        check_inputs("tshift", &tshift_spec(), &mut inputs).unwrap();
    }

    #[test]
    fn test_value_type_checked() {
        let spec = vec![
            InputField::new("fwhm", FieldKind::Float),
            InputField::new("ignore", FieldKind::Int),
            InputField::new("in_file", FieldKind::File),
        ];

        let mut inputs = BTreeMap::from([("fwhm".to_string(), json!("eight"))]);
        let err = check_inputs("smooth", &spec, &mut inputs).unwrap_err();
        assert!(err.to_string().contains("Node 'smooth'"), "{}", err);
        assert!(err.to_string().contains("input 'fwhm' expects float"), "{}", err);

        let mut inputs = BTreeMap::from([
            ("fwhm".to_string(), json!(8)),
            ("ignore".to_string(), json!(4)),
            ("in_file".to_string(), json!(["a.nii", "b.nii"])),
        ]);
        check_inputs("smooth", &spec, &mut inputs).unwrap();

        let mut inputs = BTreeMap::from([("ignore".to_string(), json!(2.5))]);
        assert!(check_inputs("smooth", &spec, &mut inputs).is_err());

        let mut inputs = BTreeMap::from([("in_file".to_string(), json!(["a.nii", 3]))]);
        assert!(check_inputs("smooth", &spec, &mut inputs).is_err());
    }

    #[test]
    fn test_joined_lists_of_scalars_accepted() {
        assert!(FieldKind::Float.accepts(&json!([4, 8.5])));
        assert!(!FieldKind::Bool.accepts(&json!([true, "no"])));
        assert!(FieldKind::List.accepts(&json!([])));
        assert!(!FieldKind::List.accepts(&json!("a.nii")));
        assert!(FieldKind::Any.accepts(&json!({ "k": 1 })));
    }

    #[test]
    fn test_mandatory_satisfied_by_xor_member() {
        let mut a = InputField::new("in_file", FieldKind::File).mandatory();
        a.xor = vec!["in_files".to_string()];
        let mut b = InputField::new("in_files", FieldKind::List);
        b.xor = vec!["in_file".to_string()];

        let mut inputs = BTreeMap::new();
        inputs.insert("in_files".to_string(), json!(["a.nii"]));
        check_inputs("smooth", &[a, b], &mut inputs).unwrap();
    }
}
