//! Graph rendering for `neuropipe graph`.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;

use super::expand::{expand, ExpandedGraph};
use super::graph::FlatGraph;
use crate::error::Result;

/// Which graph to draw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GraphKind {
    /// One vertex per node, nesting ignored
    #[default]
    Flat,
    /// Nested workflows drawn as clusters
    Hierarchical,
    /// One vertex per expanded instance
    Exec,
}

impl std::str::FromStr for GraphKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "flat" => Ok(Self::Flat),
            "hierarchical" => Ok(Self::Hierarchical),
            "exec" => Ok(Self::Exec),
            _ => Err(format!("Unknown graph kind: {}", s)),
        }
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Indented dependency tree, one root per node without inputs.
pub fn render_text(graph: &FlatGraph) -> String {
    let mut lines = vec![graph.name.clone()];
    let mut visited = HashSet::new();

    for node in graph.nodes() {
        if graph.predecessors(&node.id).is_empty() {
            format_node(graph, &node.id, 1, &mut visited, &mut lines);
        }
    }

    lines.join("\n")
}

fn format_node(
    graph: &FlatGraph,
    id: &str,
    depth: usize,
    visited: &mut HashSet<String>,
    lines: &mut Vec<String>,
) {
    let indent = "  ".repeat(depth);
    let interface = graph.get(id).map(|n| n.node.interface.as_str()).unwrap_or("?");

    if visited.contains(id) {
        lines.push(format!("{}└─ {}  (already shown)", indent, id));
        return;
    }

    visited.insert(id.to_string());
    lines.push(format!("{}└─ {} [{}]", indent, id, interface));

    for next in graph.successors(id) {
        format_node(graph, next, depth + 1, visited, lines);
    }
}

/// Graphviz DOT for the requested kind.
pub fn render_dot(graph: &FlatGraph, kind: GraphKind) -> Result<String> {
    if kind == GraphKind::Exec {
        return Ok(render_expanded_dot(&graph.name, &expand(graph)?));
    }

    let mut out = String::new();
    let _ = writeln!(out, "digraph {} {{", quote(&graph.name));
    let _ = writeln!(out, "  rankdir=TB;");

    if kind == GraphKind::Hierarchical {
        write_cluster(graph, &[], 1, &mut out);
    } else {
        for node in graph.nodes() {
            write_vertex(&mut out, &node.id, &node.id, &node.node.interface, 1);
        }
    }

    for edge in &graph.edges {
        let _ = writeln!(
            out,
            "  {} -> {} [label={}];",
            quote(&edge.source),
            quote(&edge.target),
            quote(&format!("{} -> {}", edge.source_port, edge.target_port))
        );
    }
    out.push_str("}\n");
    Ok(out)
}

fn write_vertex(out: &mut String, id: &str, label: &str, interface: &str, depth: usize) {
    let _ = writeln!(
        out,
        "{}{} [label={}];",
        "  ".repeat(depth),
        quote(id),
        quote(&format!("{}\n({})", label, interface))
    );
}

fn write_cluster(graph: &FlatGraph, prefix: &[String], depth: usize, out: &mut String) {
    let mut children = BTreeSet::new();
    for node in graph.nodes() {
        if node.hierarchy.as_slice() == prefix {
            write_vertex(out, &node.id, node.name(), &node.node.interface, depth);
        } else if node.hierarchy.starts_with(prefix) {
            children.insert(node.hierarchy[prefix.len()].clone());
        }
    }

    let indent = "  ".repeat(depth);
    for child in children {
        let mut path = prefix.to_vec();
        path.push(child.clone());
        let _ = writeln!(out, "{}subgraph {} {{", indent, quote(&format!("cluster_{}", path.join("_"))));
        let _ = writeln!(out, "{}  label={};", indent, quote(&child));
        write_cluster(graph, &path, depth + 1, out);
        let _ = writeln!(out, "{}}}", indent);
    }
}

/// Graphviz DOT for the expanded execution graph.
pub fn render_expanded_dot(name: &str, expanded: &ExpandedGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph {} {{", quote(name));
    let _ = writeln!(out, "  rankdir=TB;");
    for instance in &expanded.instances {
        let label = if instance.param_dirs.is_empty() {
            instance.node_id.clone()
        } else {
            format!("{}\n{}", instance.node_id, instance.param_dirs.join("/"))
        };
        let _ = writeln!(out, "  {} [label={}];", quote(&instance.id), quote(&label));
    }
    for edge in &expanded.edges {
        let _ = writeln!(
            out,
            "  {} -> {};",
            quote(&edge.source),
            quote(&edge.target)
        );
    }
    out.push_str("}\n");
    out
}
