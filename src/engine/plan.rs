//! Execution plans.
//!
//! A plan is everything decided before the first node runs: the validated
//! flat graph, its parameter expansion and the working directory of every
//! instance.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::interfaces::InterfaceRegistry;
use crate::workflow::{
    expand, validate_graph, validate_workflow, ExpandedGraph, FlatGraph, Workflow,
    WorkflowSettings,
};

/// A validated, expanded workflow ready to run.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub graph: FlatGraph,
    pub expanded: ExpandedGraph,
    pub settings: WorkflowSettings,
    pub base_dir: PathBuf,
    node_dirs: HashMap<String, PathBuf>,
}

/// One row of `neuropipe plan` output.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedInstance {
    pub id: String,
    pub interface: String,
    pub node_dir: PathBuf,
    pub depends_on: Vec<String>,
}

impl ExecutionPlan {
    /// Validate, flatten and expand `workflow` under `base_dir`.
    pub fn build(workflow: &Workflow, registry: &InterfaceRegistry, base_dir: &Path) -> Result<Self> {
        validate_workflow(workflow, registry)?;
        let graph = FlatGraph::from_workflow(workflow)?;
        Self::from_graph(graph, workflow.settings.clone(), base_dir)
    }

    /// Plan an already flattened graph.
    pub fn from_graph(graph: FlatGraph, settings: WorkflowSettings, base_dir: &Path) -> Result<Self> {
        let expanded = expand(&graph)?;
        let base_dir = if base_dir.is_absolute() {
            base_dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(base_dir)
        };

        let mut node_dirs = HashMap::with_capacity(expanded.len());
        let mut taken = HashSet::with_capacity(expanded.len());
        for instance in &expanded.instances {
            let flat = graph.get(&instance.node_id).ok_or_else(|| {
                Error::Internal(format!("Instance '{}' has no node", instance.id))
            })?;
            let mut dir = base_dir.join(&graph.name);
            for level in &flat.hierarchy {
                dir.push(level);
            }
            for segment in &instance.param_dirs {
                dir.push(segment);
            }
            dir.push(flat.name());
            if !taken.insert(dir.clone()) {
                return Err(Error::Validation(format!(
                    "Instance '{}' shares its working directory {} with another instance",
                    instance.id,
                    dir.display()
                )));
            }
            node_dirs.insert(instance.id.clone(), dir);
        }

        Ok(Self {
            graph,
            expanded,
            settings,
            base_dir,
            node_dirs,
        })
    }

    /// Re-check the graph against a registry, e.g. after adding interfaces.
    pub fn validate(&self, registry: &InterfaceRegistry) -> Result<()> {
        validate_graph(&self.graph, registry)
    }

    pub fn node_dir(&self, instance_id: &str) -> Option<&Path> {
        self.node_dirs.get(instance_id).map(PathBuf::as_path)
    }

    /// Instances in execution order.
    pub fn instances(&self) -> Vec<PlannedInstance> {
        self.expanded
            .instances
            .iter()
            .map(|instance| PlannedInstance {
                id: instance.id.clone(),
                interface: self
                    .graph
                    .get(&instance.node_id)
                    .map(|n| n.node.interface.clone())
                    .unwrap_or_default(),
                node_dir: self.node_dirs.get(&instance.id).cloned().unwrap_or_default(),
                depends_on: self
                    .expanded
                    .predecessors(&instance.id)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            })
            .collect()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "workflow": self.graph.name,
            "base_dir": self.base_dir,
            "nodes": self.graph.len(),
            "instances": self.instances(),
        })
    }
}
