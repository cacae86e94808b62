//! Workflow definition, parsing, flattening and expansion.
//!
//! Workflows are defined in YAML and consist of:
//! - Interfaces: command-line tools declared for the nodes to use
//! - Nodes: interface invocations, optionally iterated, mapped or joined
//! - Workflows: nested sub-workflows
//! - Connections: output port to input port routes

mod expand;
mod graph;
mod parser;
mod render;
mod types;
mod validator;

pub use expand::{expand, param_dir, ExpandedGraph, InstanceEdge, NodeInstance};
pub use graph::{FlatEdge, FlatGraph, FlatNode};
pub use parser::{parse_workflow, parse_workflow_file};
pub use render::{render_dot, render_expanded_dot, render_text, GraphKind};
pub use types::*;
pub use validator::{validate_graph, validate_workflow};
