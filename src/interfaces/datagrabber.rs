//! DataGrabber interface - find input files from a parameterized template.
//!
//! ```yaml
//! - name: datasource
//!   interface: datagrabber
//!   config:
//!     base_directory: data
//!     template: "%s/%s.nii"
//!     infields: [subject_id]
//!     template_args:
//!       func: [[subject_id, [f3, f5, f7, f10]]]
//!       struct: [[subject_id, struct]]
//!   iterables:
//!     subject_id: [s1, s3]
//! ```
//!
//! Each argument naming an infield is replaced by that input's value; any
//! other argument is used literally. A list argument produces one path per
//! element, and every filled template is matched as a glob.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::types::{FieldKind, InputField, Interface, InterfaceResult, RunContext};
use crate::error::{Error, Result};

/// DataGrabber interface implementation.
pub struct DataGrabberInterface;

impl DataGrabberInterface {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DataGrabberInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct GrabberConfig {
    /// Root the templates are relative to; the launch directory if unset
    #[serde(default)]
    base_directory: Option<PathBuf>,
    template: String,
    /// Per-output templates overriding `template`
    #[serde(default)]
    field_template: BTreeMap<String, String>,
    /// Inputs that parameterize the templates
    #[serde(default)]
    infields: Vec<String>,
    /// Output name -> argument lists, one filled template per list
    #[serde(default)]
    template_args: BTreeMap<String, Vec<Vec<Value>>>,
    #[serde(default = "default_true")]
    sort_filelist: bool,
    #[serde(default = "default_true")]
    raise_on_empty: bool,
}

fn default_true() -> bool {
    true
}

fn parse_config(config: &Value) -> Result<GrabberConfig> {
    let config: GrabberConfig = serde_json::from_value(config.clone())
        .map_err(|e| Error::Node(format!("Invalid datagrabber config: {}", e)))?;
    if config.template_args.is_empty() {
        return Err(Error::Node(
            "datagrabber requires at least one output in template_args".to_string(),
        ));
    }
    Ok(config)
}

fn label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute `args` for the `%s`/`%d` placeholders of `template`, in order.
fn fill_template(template: &str, args: &[Value]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') | Some('d') => {
                let arg = args.next().ok_or_else(|| {
                    Error::Node(format!("Template '{}' has more placeholders than arguments", template))
                })?;
                out.push_str(&label(arg));
            }
            Some(other) => {
                return Err(Error::Node(format!(
                    "Template '{}' has unsupported placeholder '%{}'",
                    template, other
                )))
            }
            None => out.push('%'),
        }
    }

    if args.next().is_some() {
        return Err(Error::Node(format!(
            "Template '{}' has fewer placeholders than arguments",
            template
        )));
    }
    Ok(out)
}

/// Expand one argument list: infields take their input value, and list
/// arguments fan out element by element (scalars repeat).
fn expand_args(
    node_id: &str,
    config: &GrabberConfig,
    args: &[Value],
    ctx: &RunContext,
) -> Result<Vec<Vec<Value>>> {
    let mut resolved = Vec::with_capacity(args.len());
    for arg in args {
        let value = match arg {
            Value::String(name) if config.infields.contains(name) => {
                ctx.input(name).cloned().ok_or_else(|| {
                    Error::Validation(format!(
                        "Node '{}': datagrabber input '{}' is not set",
                        node_id, name
                    ))
                })?
            }
            other => other.clone(),
        };
        resolved.push(value);
    }

    let fan_out = resolved.iter().filter_map(|v| v.as_array().map(Vec::len)).max();
    let Some(len) = fan_out else {
        return Ok(vec![resolved]);
    };
    if resolved
        .iter()
        .any(|v| v.as_array().is_some_and(|items| items.len() != len))
    {
        return Err(Error::Validation(format!(
            "Node '{}': list arguments of one template must have equal lengths",
            node_id
        )));
    }

    Ok((0..len)
        .map(|i| {
            resolved
                .iter()
                .map(|v| match v {
                    Value::Array(items) => items[i].clone(),
                    other => other.clone(),
                })
                .collect()
        })
        .collect())
}

fn grab(pattern: &Path, sort: bool) -> Result<Vec<String>> {
    let pattern = pattern.to_string_lossy();
    let mut matches: Vec<String> = glob::glob(&pattern)
        .map_err(|e| Error::Validation(format!("Invalid glob '{}': {}", pattern, e)))?
        .filter_map(|entry| entry.ok())
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    if sort {
        matches.sort();
    }
    Ok(matches)
}

fn collapse(mut paths: Vec<Value>) -> Value {
    if paths.len() == 1 {
        paths.remove(0)
    } else {
        Value::Array(paths)
    }
}

#[async_trait]
impl Interface for DataGrabberInterface {
    fn name(&self) -> &str {
        "datagrabber"
    }

    fn description(&self) -> &str {
        "Find files by filling a path template from inputs"
    }

    fn input_spec(&self, config: &Value) -> Result<Option<Vec<InputField>>> {
        let config = parse_config(config)?;
        Ok(Some(
            config
                .infields
                .iter()
                .map(|f| InputField::new(f, FieldKind::Any).mandatory())
                .collect(),
        ))
    }

    fn output_names(&self, config: &Value) -> Result<Option<Vec<String>>> {
        let config = parse_config(config)?;
        Ok(Some(config.template_args.keys().cloned().collect()))
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn run(&self, config: &Value, ctx: &RunContext) -> Result<InterfaceResult> {
        let config = parse_config(config)?;
        let base = match &config.base_directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => std::env::current_dir()?.join(dir),
            None => std::env::current_dir()?,
        };

        let mut outputs = BTreeMap::new();
        let mut patterns = Vec::new();
        for (field, arg_lists) in &config.template_args {
            let template = config.field_template.get(field).unwrap_or(&config.template);
            let mut found = Vec::new();

            for args in arg_lists {
                for filled in expand_args(&ctx.node_id, &config, args, ctx)? {
                    let relative = fill_template(template, &filled)?;
                    let pattern = base.join(&relative);
                    let matches = grab(&pattern, config.sort_filelist)?;
                    debug!(node_id = %ctx.node_id, pattern = %pattern.display(), count = matches.len(), "Grabbed files");

                    if matches.is_empty() && config.raise_on_empty {
                        return Err(Error::MissingOutput {
                            node: ctx.node_id.clone(),
                            path: pattern.to_string_lossy().into_owned(),
                        });
                    }
                    patterns.push(relative);
                    found.push(collapse(matches.into_iter().map(Value::String).collect()));
                }
            }

            outputs.insert(field.clone(), collapse(found));
        }

        Ok(InterfaceResult::new(outputs).with_runtime(json!({
            "base_directory": base,
            "patterns": patterns,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for subject in ["s1", "s3"] {
            let sub = dir.path().join(subject);
            std::fs::create_dir_all(&sub).unwrap();
            for run in ["f3", "f5", "struct"] {
                std::fs::write(sub.join(format!("{}.nii", run)), run).unwrap();
            }
        }
        dir
    }

    fn config(base: &Path) -> Value {
        json!({
            "base_directory": base,
            "template": "%s/%s.nii",
            "infields": ["subject_id"],
            "template_args": {
                "func": [["subject_id", ["f3", "f5"]]],
                "struct": [["subject_id", "struct"]],
            },
        })
    }

    fn ctx(subject: &str) -> RunContext {
        RunContext::new("datasource", PathBuf::from("/tmp"))
            .with_inputs(BTreeMap::from([("subject_id".to_string(), json!(subject))]))
    }

    #[test]
    fn test_fill_template() {
        assert_eq!(fill_template("%s/%s.nii", &[json!("s1"), json!("f3")]).unwrap(), "s1/f3.nii");
        assert_eq!(fill_template("run%d_100%%", &[json!(2)]).unwrap(), "run2_100%");
        assert!(fill_template("%s/%s", &[json!("s1")]).is_err());
        assert!(fill_template("%s", &[json!("a"), json!("b")]).is_err());
    }

    #[tokio::test]
    async fn test_grabs_list_and_single_outputs() {
        let data = data_tree();
        let result = DataGrabberInterface::new()
            .run(&config(data.path()), &ctx("s3"))
            .await
            .unwrap();

        let func = result.outputs["func"].as_array().unwrap();
        assert_eq!(func.len(), 2);
        assert!(func[0].as_str().unwrap().ends_with("s3/f3.nii"));
        assert!(func[1].as_str().unwrap().ends_with("s3/f5.nii"));
        assert!(result.outputs["struct"].as_str().unwrap().ends_with("s3/struct.nii"));
    }

    #[tokio::test]
    async fn test_missing_files_raise() {
        let data = data_tree();
        let err = DataGrabberInterface::new()
            .run(&config(data.path()), &ctx("s9"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_OUTPUT");
        assert!(err.to_string().contains("s9"));
    }

    #[tokio::test]
    async fn test_glob_template() {
        let data = data_tree();
        let config = json!({
            "base_directory": data.path(),
            "template": "*/%s.nii",
            "template_args": { "anat": [["struct"]] },
        });
        let result = DataGrabberInterface::new()
            .run(&config, &RunContext::new("grab", PathBuf::from("/tmp")))
            .await
            .unwrap();
        assert_eq!(result.outputs["anat"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_ports_from_config() {
        let data = data_tree();
        let iface = DataGrabberInterface::new();
        let spec = iface.input_spec(&config(data.path())).unwrap().unwrap();
        assert_eq!(spec.len(), 1);
        assert!(spec[0].mandatory);

        let outputs = iface.output_names(&config(data.path())).unwrap().unwrap();
        assert_eq!(outputs, vec!["func", "struct"]);
        assert!(iface.input_spec(&json!({ "template": "%s" })).is_err());
    }
}
