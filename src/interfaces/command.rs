//! Metadata-driven command-line interface.
//!
//! A [`CommandSpec`] describes an external tool: the executable, how each input
//! becomes command-line arguments, and where outputs are found afterwards.
//!
//! ```yaml
//! interfaces:
//!   tshift:
//!     command: 3dTshift
//!     inputs:
//!       in_file: { type: file, argstr: "%s", mandatory: true, position: -1, copyfile: false }
//!       out_file: { type: file, argstr: "-prefix %s", name_source: in_file, name_template: "%s_tshift" }
//!       tr: { type: string, argstr: "-TR %s" }
//!       ignore: { type: int, argstr: "-ignore %s" }
//!     outputs:
//!       out_file: { from_input: out_file }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

use super::types::{FieldKind, InputField, Interface, InterfaceResult, RunContext};
use crate::error::{Error, Result};

/// Extensions treated as a single suffix when deriving file names.
const DOUBLE_EXTENSIONS: &[&str] = &[".nii.gz", ".tar.gz", ".gii.gz"];

/// Lines of stderr kept in errors and runtime records.
const LOG_TAIL_LINES: usize = 20;

/// Implicit input carrying raw extra arguments.
pub const ARGS_INPUT: &str = "args";

/// Declaration of an external command-line tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable, optionally followed by fixed leading arguments
    pub command: String,

    #[serde(default)]
    pub description: String,

    /// Extra environment variables for the process
    #[serde(default)]
    pub environ: BTreeMap<String, String>,

    #[serde(default)]
    pub inputs: BTreeMap<String, CommandInput>,

    #[serde(default)]
    pub outputs: BTreeMap<String, CommandOutput>,
}

/// One command-line input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandInput {
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub nohash: bool,
    #[serde(default)]
    pub xor: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub default: Option<Value>,

    /// Argument template; `%s` is replaced by the value. A trailing `...`
    /// repeats the template for each list element. Inputs without an argstr
    /// never reach the command line.
    #[serde(default)]
    pub argstr: Option<String>,

    /// Ordering: >= 0 from the front, negative from the back
    #[serde(default)]
    pub position: Option<i32>,

    /// Separator for list values
    #[serde(default)]
    pub sep: Option<String>,

    /// Input whose file name seeds this one when unset
    #[serde(default)]
    pub name_source: Option<String>,

    /// Template for the derived name; `%s` is the source's stem
    #[serde(default)]
    pub name_template: Option<String>,

    /// Re-append the source's extension to the derived name
    #[serde(default)]
    pub keep_extension: Option<bool>,

    /// Copy the file into the working directory before running
    #[serde(default)]
    pub copyfile: bool,
}

impl CommandInput {
    /// Field metadata shared with the other interfaces.
    pub fn to_field(&self, name: &str) -> InputField {
        InputField {
            name: name.to_string(),
            kind: self.kind,
            mandatory: self.mandatory,
            nohash: self.nohash,
            xor: self.xor.clone(),
            requires: self.requires.clone(),
            default: self.default.clone(),
            output_name: false,
        }
    }
}

/// Where an output is found once the command has finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Take the (possibly derived) value of this input
    #[serde(default)]
    pub from_input: Option<String>,

    /// Glob relative to the working directory
    #[serde(default)]
    pub glob: Option<String>,

    /// Collect every glob match into a list
    #[serde(default)]
    pub multiple: bool,

    /// A missing output yields null instead of an error
    #[serde(default)]
    pub optional: bool,

    #[serde(default)]
    pub description: String,
}

/// A declared command-line tool usable as a node interface.
pub struct CommandInterface {
    name: String,
    spec: CommandSpec,
}

impl CommandInterface {
    pub fn new(name: &str, spec: CommandSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Whether `input` names a file the command creates: it has a name
    /// template, or an output reads it back and it is not copied in.
    fn is_output_name(&self, name: &str, input: &CommandInput) -> bool {
        if input.name_template.is_some() {
            return true;
        }
        let read_back = self
            .spec
            .outputs
            .values()
            .any(|o| o.from_input.as_deref() == Some(name));
        let is_source = self
            .spec
            .inputs
            .values()
            .any(|i| i.name_source.as_deref() == Some(name));
        read_back && !input.copyfile && !is_source
    }
}

#[async_trait]
impl Interface for CommandInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        if self.spec.description.is_empty() {
            "External command-line tool"
        } else {
            &self.spec.description
        }
    }

    fn input_spec(&self, _config: &Value) -> Result<Option<Vec<InputField>>> {
        let mut fields: Vec<InputField> = self
            .spec
            .inputs
            .iter()
            .map(|(name, input)| {
                let mut field = input.to_field(name);
                field.output_name = self.is_output_name(name, input);
                field
            })
            .collect();
        if !self.spec.inputs.contains_key(ARGS_INPUT) {
            fields.push(InputField::new(ARGS_INPUT, FieldKind::String));
        }
        Ok(Some(fields))
    }

    fn output_names(&self, _config: &Value) -> Result<Option<Vec<String>>> {
        Ok(Some(self.spec.outputs.keys().cloned().collect()))
    }

    fn identity(&self) -> String {
        let spec = serde_json::to_string(&self.spec).unwrap_or_default();
        format!("{}:{}", self.name, spec)
    }

    async fn run(&self, _config: &Value, ctx: &RunContext) -> Result<InterfaceResult> {
        let mut inputs = resolve_inputs(&self.spec, &ctx.inputs);
        copy_inputs(&self.spec, &mut inputs, &ctx.workdir).await?;

        let argv = build_command_line(&self.spec, &inputs)?;
        let command_line = argv.join(" ");
        debug!(node_id = %ctx.node_id, command = %command_line, "Running command");

        let started = Instant::now();
        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&ctx.workdir)
            .envs(&self.spec.environ)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: command_line.clone(),
                code: -1,
                stderr: format!("failed to start: {}", e),
            })?;
        let duration = started.elapsed();

        tokio::fs::write(ctx.workdir.join("stdout.log"), &output.stdout).await?;
        tokio::fs::write(ctx.workdir.join("stderr.log"), &output.stderr).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(Error::Command {
                command: command_line,
                code,
                stderr: tail(&stderr),
            });
        }

        let outputs = collect_outputs(&self.spec, &inputs, &ctx.workdir, &ctx.node_id)?;

        Ok(InterfaceResult::new(outputs).with_runtime(json!({
            "command_line": command_line,
            "returncode": code,
            "duration_ms": duration.as_millis() as u64,
            "stdout": tail(&stdout),
            "stderr": tail(&stderr),
        })))
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].join("\n")
}

fn is_set(inputs: &BTreeMap<String, Value>, name: &str) -> bool {
    inputs.get(name).is_some_and(|v| !v.is_null())
}

/// Split a file name into stem and extension, honouring double extensions.
pub fn split_extension(file_name: &str) -> (&str, &str) {
    for ext in DOUBLE_EXTENSIONS {
        if let Some(stem) = file_name.strip_suffix(ext) {
            if !stem.is_empty() {
                return (stem, &file_name[stem.len()..]);
            }
        }
    }
    match file_name.rfind('.') {
        Some(0) | None => (file_name, ""),
        Some(idx) => (&file_name[..idx], &file_name[idx..]),
    }
}

/// Derive unset inputs from their `name_source`.
///
/// The derived value is a bare file name, so it lands in the working
/// directory the command runs in.
pub fn resolve_inputs(
    spec: &CommandSpec,
    inputs: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    let mut resolved = inputs.clone();

    for (name, input) in &spec.inputs {
        if is_set(&resolved, name) {
            continue;
        }
        let (Some(source), Some(template)) = (&input.name_source, &input.name_template) else {
            continue;
        };
        let source_path = match inputs.get(source) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => match items.first() {
                Some(Value::String(s)) => s.clone(),
                _ => continue,
            },
            _ => continue,
        };

        let file_name = Path::new(&source_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source_path.clone());
        let (stem, ext) = split_extension(&file_name);

        let mut derived = template.replace("%s", stem);
        if input.keep_extension.unwrap_or(true) {
            derived.push_str(ext);
        }
        resolved.insert(name.clone(), Value::String(derived));
    }

    resolved
}

async fn copy_inputs(
    spec: &CommandSpec,
    inputs: &mut BTreeMap<String, Value>,
    workdir: &Path,
) -> Result<()> {
    for (name, input) in &spec.inputs {
        if !input.copyfile {
            continue;
        }
        let Some(Value::String(path)) = inputs.get(name) else {
            continue;
        };
        let src = PathBuf::from(path);
        let Some(file_name) = src.file_name() else {
            continue;
        };
        let dst = workdir.join(file_name);
        if src != dst {
            tokio::fs::copy(&src, &dst).await?;
        }
        inputs.insert(name.clone(), Value::String(dst.to_string_lossy().to_string()));
    }
    Ok(())
}

fn scalar_to_string(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::Validation(format!(
            "Input '{}' cannot be rendered as an argument: {}",
            name, other
        ))),
    }
}

/// Substitute `value` into each token of `template`.
fn render_template(template: &str, name: &str, value: &Value, sep: Option<&str>) -> Result<Vec<String>> {
    let mut args = Vec::new();
    for token in template.split_whitespace() {
        if !token.contains("%s") {
            args.push(token.to_string());
            continue;
        }
        match value {
            Value::Array(items) if sep.is_none() && token == "%s" => {
                for item in items {
                    args.push(scalar_to_string(name, item)?);
                }
            }
            Value::Array(items) => {
                let parts = items
                    .iter()
                    .map(|item| scalar_to_string(name, item))
                    .collect::<Result<Vec<_>>>()?;
                args.push(token.replace("%s", &parts.join(sep.unwrap_or(" "))));
            }
            scalar => args.push(token.replace("%s", &scalar_to_string(name, scalar)?)),
        }
    }
    Ok(args)
}

fn format_argument(name: &str, input: &CommandInput, value: &Value) -> Result<Vec<String>> {
    let Some(argstr) = &input.argstr else {
        return Ok(Vec::new());
    };

    if let Value::Bool(flag) = value {
        return Ok(if *flag {
            argstr.split_whitespace().map(String::from).collect()
        } else {
            Vec::new()
        });
    }

    if let Some(per_item) = argstr.strip_suffix("...") {
        let items = match value {
            Value::Array(items) => items.clone(),
            scalar => vec![scalar.clone()],
        };
        let mut args = Vec::new();
        for item in &items {
            args.extend(render_template(per_item, name, item, None)?);
        }
        return Ok(args);
    }

    render_template(argstr, name, value, input.sep.as_deref())
}

/// Build the argument vector for `inputs`.
///
/// Positioned arguments (>= 0) come first in ascending order, then
/// unpositioned ones sorted by name, then negative positions ascending, so
/// `-1` is always last.
pub fn build_command_line(spec: &CommandSpec, inputs: &BTreeMap<String, Value>) -> Result<Vec<String>> {
    let mut argv: Vec<String> = spec.command.split_whitespace().map(String::from).collect();
    if argv.is_empty() {
        return Err(Error::Validation("Command interface has an empty command".to_string()));
    }

    let mut ordered: Vec<((u8, i32), &str, Vec<String>)> = Vec::new();

    for (name, input) in &spec.inputs {
        let Some(value) = inputs.get(name).filter(|v| !v.is_null()) else {
            continue;
        };
        let args = format_argument(name, input, value)?;
        if args.is_empty() {
            continue;
        }
        let key = match input.position {
            Some(p) if p >= 0 => (0, p),
            None => (1, 0),
            Some(p) => (2, p),
        };
        ordered.push((key, name.as_str(), args));
    }

    if !spec.inputs.contains_key(ARGS_INPUT) {
        if let Some(Value::String(extra)) = inputs.get(ARGS_INPUT) {
            let args: Vec<String> = extra.split_whitespace().map(String::from).collect();
            if !args.is_empty() {
                ordered.push(((1, 0), ARGS_INPUT, args));
            }
        }
    }

    ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    for (_, _, args) in ordered {
        argv.extend(args);
    }
    Ok(argv)
}

fn absolute(workdir: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        workdir.join(p)
    }
}

fn missing(node_id: &str, path: impl Into<String>) -> Error {
    Error::MissingOutput {
        node: node_id.to_string(),
        path: path.into(),
    }
}

/// Locate every declared output after a successful run.
pub fn collect_outputs(
    spec: &CommandSpec,
    inputs: &BTreeMap<String, Value>,
    workdir: &Path,
    node_id: &str,
) -> Result<BTreeMap<String, Value>> {
    let mut outputs = BTreeMap::new();

    for (name, output) in &spec.outputs {
        let value = if let Some(source) = &output.from_input {
            match inputs.get(source).filter(|v| !v.is_null()) {
                Some(Value::String(path)) => {
                    let path = absolute(workdir, path);
                    if path.exists() {
                        Value::String(path.to_string_lossy().to_string())
                    } else if output.optional {
                        Value::Null
                    } else {
                        return Err(missing(node_id, path.to_string_lossy()));
                    }
                }
                Some(Value::Array(items)) => {
                    let mut paths = Vec::with_capacity(items.len());
                    for item in items {
                        let item = scalar_to_string(source, item)?;
                        let path = absolute(workdir, &item);
                        if !path.exists() && !output.optional {
                            return Err(missing(node_id, path.to_string_lossy()));
                        }
                        paths.push(Value::String(path.to_string_lossy().to_string()));
                    }
                    Value::Array(paths)
                }
                Some(other) => other.clone(),
                None if output.optional => Value::Null,
                None => return Err(missing(node_id, format!("<unset input '{}'>", source))),
            }
        } else if let Some(pattern) = &output.glob {
            let full = workdir.join(pattern);
            let mut matches: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
                .map_err(|e| Error::Validation(format!("Invalid glob '{}': {}", pattern, e)))?
                .filter_map(|entry| entry.ok())
                .collect();
            matches.sort();

            if matches.is_empty() {
                if output.optional {
                    Value::Null
                } else {
                    return Err(missing(node_id, full.to_string_lossy()));
                }
            } else if output.multiple {
                Value::Array(
                    matches
                        .iter()
                        .map(|p| Value::String(p.to_string_lossy().to_string()))
                        .collect(),
                )
            } else {
                Value::String(matches[0].to_string_lossy().to_string())
            }
        } else {
            return Err(Error::Validation(format!(
                "Output '{}' needs either from_input or glob",
                name
            )));
        };

        outputs.insert(name.clone(), value);
    }

    Ok(outputs)
}
