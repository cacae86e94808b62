//! Workflow type definitions.
//!
//! A workflow is a set of nodes, nested workflows and connections between
//! their named ports. The same types are produced by the YAML parser and by
//! the programmatic builder methods.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::interfaces::CommandSpec;

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// name: preprocessing
/// interfaces:
///   tshift:
///     command: 3dTshift
///     inputs:
///       in_file: { type: file, argstr: "%s", mandatory: true, position: -1 }
///       out_file: { type: file, argstr: "-prefix %s", name_source: in_file, name_template: "%s_tshift" }
///     outputs:
///       out_file: { from_input: out_file }
/// nodes:
///   - name: iter_fwhm
///     interface: identity
///     config: { fields: [fwhm] }
///     iterables:
///       fwhm: [4, 8]
///   - name: tshift
///     interface: tshift
///     inputs: { in_file: /data/s1/func.nii }
/// connections:
///   - from: tshift.out_file
///     to: smooth.in_file
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name, unique among its siblings
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Command-line interfaces declared for this workflow and its children
    #[serde(default)]
    pub interfaces: HashMap<String, CommandSpec>,

    /// Nodes of this workflow
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Nested workflows, addressed by name in connection paths
    #[serde(default)]
    pub workflows: Vec<Workflow>,

    /// Port-to-port connections
    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Execution settings (only honoured on the root workflow)
    #[serde(default)]
    pub settings: WorkflowSettings,
}

/// A node: one interface invocation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Name, unique within the enclosing workflow
    pub name: String,

    /// Interface name (built-in or declared under `interfaces`)
    pub interface: String,

    /// Static input values
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    /// Interface-specific configuration (built-in interfaces)
    #[serde(default)]
    pub config: Value,

    /// Parameter sweep: input field -> candidate values, in declaration order
    #[serde(default)]
    pub iterables: Iterables,

    /// Zip the iterable lists instead of taking their product
    #[serde(default)]
    pub synchronize: bool,

    /// Inputs holding lists to map the interface over, element by element
    #[serde(default)]
    pub map_over: Vec<String>,

    /// Iterable node whose branches this node collapses
    #[serde(default)]
    pub join_source: Option<String>,

    /// Inputs that receive the joined list of values
    #[serde(default)]
    pub join_fields: Vec<String>,

    /// Retry configuration
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Timeout for a single run of this node, in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Re-run even when a cached result matches
    #[serde(default)]
    pub overwrite: bool,
}

/// A connection from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Source endpoint, `node.port` or `sub.node.port`
    pub from: String,

    /// Destination endpoint
    pub to: String,

    /// Expression applied to the value in flight (bound as `value`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

/// A parsed connection endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Node path relative to the workflow declaring the connection
    pub path: Vec<String>,
    /// Port name
    pub port: String,
}

impl Endpoint {
    /// Parse `a.b.port` into path `[a, b]` and port `port`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut splits = Self::splits(s)?;
        Ok(splits.remove(0))
    }

    /// Every way to read `s` as `<node path>.<port>`, longest path first.
    ///
    /// Ports may contain dots (`datasink.contrasts.@T`); callers take the
    /// first split whose path names a node.
    pub fn splits(s: &str) -> Result<Vec<Self>> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::Parse(format!(
                "Invalid endpoint '{}': expected '<node>.<port>'",
                s
            )));
        }
        Ok((1..parts.len())
            .rev()
            .map(|n| Self {
                path: parts[..n].iter().map(|p| p.to_string()).collect(),
                port: parts[n..].join("."),
            })
            .collect())
    }

    /// Node path joined with dots.
    pub fn node_path(&self) -> String {
        self.path.join(".")
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node_path(), self.port)
    }
}

/// Retry configuration for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts in seconds
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: u64,

    /// Backoff strategy
    #[serde(default)]
    pub backoff: BackoffType,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_seconds() -> u64 {
    5
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// How file-valued inputs contribute to cache keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMethod {
    /// Path, size and modification time
    #[default]
    Timestamp,
    /// SHA-256 of the file contents
    Content,
}

impl std::fmt::Display for HashMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timestamp => write!(f, "timestamp"),
            Self::Content => write!(f, "content"),
        }
    }
}

impl std::str::FromStr for HashMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "timestamp" => Ok(Self::Timestamp),
            "content" => Ok(Self::Content),
            _ => Err(format!("Unknown hash method: {}", s)),
        }
    }
}

/// Workflow execution settings.
///
/// Unset fields fall back to the loaded configuration, then to built-in
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Maximum concurrent node instances
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Maximum execution time in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Abort every branch at the first node failure
    #[serde(default)]
    pub stop_on_first_crash: Option<bool>,

    /// File fingerprinting for cache keys
    #[serde(default)]
    pub hash_method: Option<HashMethod>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            timeout_seconds: default_timeout(),
            stop_on_first_crash: None,
            hash_method: None,
        }
    }
}

fn default_timeout() -> u64 {
    86_400 // 24 hours; recon-style tools run for hours
}

impl Workflow {
    /// Create an empty workflow.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            interfaces: HashMap::new(),
            nodes: Vec::new(),
            workflows: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    /// Add a node.
    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Add a nested workflow.
    pub fn add_workflow(&mut self, workflow: Workflow) -> &mut Self {
        self.workflows.push(workflow);
        self
    }

    /// Declare a command-line interface.
    pub fn add_interface(&mut self, name: &str, spec: CommandSpec) -> &mut Self {
        self.interfaces.insert(name.to_string(), spec);
        self
    }

    /// Connect `src.src_port` to `dst.dst_port`.
    ///
    /// `src` and `dst` may be dotted paths into nested workflows.
    pub fn connect(&mut self, src: &str, src_port: &str, dst: &str, dst_port: &str) -> &mut Self {
        self.connections.push(Connection {
            from: format!("{}.{}", src, src_port),
            to: format!("{}.{}", dst, dst_port),
            transform: None,
        });
        self
    }

    /// Connect through a transform expression.
    pub fn connect_with(
        &mut self,
        src: &str,
        src_port: &str,
        dst: &str,
        dst_port: &str,
        transform: &str,
    ) -> &mut Self {
        self.connections.push(Connection {
            from: format!("{}.{}", src, src_port),
            to: format!("{}.{}", dst, dst_port),
            transform: Some(transform.to_string()),
        });
        self
    }

    /// Get a direct child node by name.
    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Get a direct child workflow by name.
    pub fn get_workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.name == name)
    }

    /// Resolve a node path relative to this workflow.
    pub fn resolve_node(&self, path: &[String]) -> Option<&Node> {
        match path {
            [] => None,
            [name] => self.get_node(name),
            [head, rest @ ..] => self.get_workflow(head)?.resolve_node(rest),
        }
    }

    /// Total number of nodes, including nested workflows.
    pub fn node_count(&self) -> usize {
        self.nodes.len() + self.workflows.iter().map(|w| w.node_count()).sum::<usize>()
    }

    /// Whether any node (at any depth) declares iterables.
    pub fn has_iterables(&self) -> bool {
        self.nodes.iter().any(|n| !n.iterables.is_empty())
            || self.workflows.iter().any(|w| w.has_iterables())
    }

    /// Set a static input on a node addressed by a dotted path.
    pub fn set_input(&mut self, node_path: &str, field: &str, value: Value) -> Result<()> {
        let parts: Vec<&str> = node_path.split('.').collect();
        match self.node_mut(&parts) {
            Some(node) => {
                node.inputs.insert(field.to_string(), value);
                Ok(())
            }
            None => Err(Error::Workflow(format!(
                "No node '{}' in workflow '{}'",
                node_path, self.name
            ))),
        }
    }

    fn node_mut(&mut self, path: &[&str]) -> Option<&mut Node> {
        match path {
            [] => None,
            [name] => self.nodes.iter_mut().find(|n| n.name == *name),
            [head, rest @ ..] => self
                .workflows
                .iter_mut()
                .find(|w| w.name == *head)?
                .node_mut(rest),
        }
    }
}

impl Node {
    /// Create a node running `interface`.
    pub fn new(name: &str, interface: &str) -> Self {
        Self {
            name: name.to_string(),
            interface: interface.to_string(),
            inputs: BTreeMap::new(),
            config: Value::Null,
            iterables: Iterables::default(),
            synchronize: false,
            map_over: Vec::new(),
            join_source: None,
            join_fields: Vec::new(),
            retry: None,
            timeout_seconds: None,
            overwrite: false,
        }
    }

    /// Set a static input.
    pub fn with_input(mut self, field: &str, value: Value) -> Self {
        self.inputs.insert(field.to_string(), value);
        self
    }

    /// Set interface configuration.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Sweep `field` over `values`.
    pub fn with_iterable(mut self, field: &str, values: Vec<Value>) -> Self {
        self.iterables.insert(field, values);
        self
    }

    /// Zip iterables instead of taking their product.
    pub fn synchronized(mut self) -> Self {
        self.synchronize = true;
        self
    }

    /// Map the interface over list-valued `fields`.
    pub fn with_map_over(mut self, fields: &[&str]) -> Self {
        self.map_over = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Collapse the branches of `source` into lists on `fields`.
    pub fn with_join(mut self, source: &str, fields: &[&str]) -> Self {
        self.join_source = Some(source.to_string());
        self.join_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Whether this node sweeps parameters.
    pub fn is_iterable(&self) -> bool {
        !self.iterables.is_empty()
    }

    /// Whether this node is a map node.
    pub fn is_map(&self) -> bool {
        !self.map_over.is_empty()
    }

    /// Assignments produced by this node's iterables, in sweep order.
    ///
    /// Each assignment lists fields in declaration order. Fields are combined
    /// as a product (last field varies fastest), or zipped when `synchronize`
    /// is set.
    pub fn iterable_assignments(&self) -> Result<Vec<Assignment>> {
        if self.iterables.is_empty() {
            return Ok(vec![Vec::new()]);
        }

        if self.synchronize {
            let lengths: Vec<usize> = self.iterables.iter().map(|(_, v)| v.len()).collect();
            let len = lengths[0];
            if lengths.iter().any(|l| *l != len) {
                return Err(Error::Validation(format!(
                    "Node '{}' synchronizes iterables of different lengths",
                    self.name
                )));
            }
            return Ok((0..len)
                .map(|i| {
                    self.iterables
                        .iter()
                        .map(|(field, values)| (field.clone(), values[i].clone()))
                        .collect()
                })
                .collect());
        }

        let mut assignments: Vec<Assignment> = vec![Vec::new()];
        for (field, values) in self.iterables.iter() {
            let mut next = Vec::with_capacity(assignments.len() * values.len());
            for partial in &assignments {
                for value in values {
                    let mut a = partial.clone();
                    a.push((field.clone(), value.clone()));
                    next.push(a);
                }
            }
            assignments = next;
        }
        Ok(assignments)
    }
}

/// One iterable assignment: `(field, value)` pairs in declaration order.
pub type Assignment = Vec<(String, Value)>;

/// Iterable fields and their candidate values, kept in declaration order.
///
/// Serialized as a YAML/JSON map; the sweep and its directory names follow
/// the order the fields were written in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Iterables(Vec<(String, Vec<Value>)>);

impl Iterables {
    /// Set the values of `field`, keeping its original position if present.
    pub fn insert(&mut self, field: &str, values: Vec<Value>) {
        match self.0.iter_mut().find(|(f, _)| f == field) {
            Some(entry) => entry.1 = values,
            None => self.0.push((field.to_string(), values)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Vec<Value>> {
        self.0.iter().find(|(f, _)| f == field).map(|(_, v)| v)
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Value>)> {
        self.0.iter().map(|(f, v)| (f, v))
    }

    /// Field names in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(f, _)| f.as_str())
    }
}

impl std::ops::Index<&str> for Iterables {
    type Output = Vec<Value>;

    fn index(&self, field: &str) -> &Self::Output {
        match self.get(field) {
            Some(values) => values,
            None => panic!("no iterable field '{}'", field),
        }
    }
}

impl Serialize for Iterables {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl<'de> Deserialize<'de> for Iterables {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct IterablesVisitor;

        impl<'de> serde::de::Visitor<'de> for IterablesVisitor {
            type Value = Iterables;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of input field to list of values")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Iterables, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut iterables = Iterables::default();
                while let Some((field, values)) = map.next_entry::<String, Vec<Value>>()? {
                    if iterables.contains_key(&field) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate iterable field '{}'",
                            field
                        )));
                    }
                    iterables.0.push((field, values));
                }
                Ok(iterables)
            }
        }

        deserializer.deserialize_map(IterablesVisitor)
    }
}
