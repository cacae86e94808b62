//! Flattened workflow graph.
//!
//! Nested workflows are resolved into a single graph whose node ids are the
//! dotted path below the root workflow (`preprocessing.realign`). Connections
//! become edges between flat node ids.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::types::{Endpoint, Node, Workflow};
use crate::error::{Error, Result};
use crate::interfaces::CommandSpec;

/// A node in the flattened graph.
#[derive(Debug, Clone)]
pub struct FlatNode {
    /// Hierarchical id, root workflow name omitted
    pub id: String,
    /// Enclosing workflow path below the root
    pub hierarchy: Vec<String>,
    /// The node definition
    pub node: Node,
    /// Flat id of the join source, when this is a join node
    pub join_source: Option<String>,
}

impl FlatNode {
    /// Node name without hierarchy.
    pub fn name(&self) -> &str {
        &self.node.name
    }
}

/// An edge between two flat nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatEdge {
    pub source: String,
    pub source_port: String,
    pub target: String,
    pub target_port: String,
    pub transform: Option<String>,
}

/// A workflow with nested workflows resolved away.
#[derive(Debug, Clone)]
pub struct FlatGraph {
    /// Root workflow name
    pub name: String,
    /// Command interfaces declared anywhere in the tree
    pub interfaces: HashMap<String, CommandSpec>,
    pub edges: Vec<FlatEdge>,
    nodes: Vec<FlatNode>,
    index: HashMap<String, usize>,
}

fn join_path(prefix: &[String], rest: &[String]) -> String {
    prefix
        .iter()
        .chain(rest.iter())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(".")
}

impl FlatGraph {
    /// Flatten `workflow` and resolve every connection endpoint.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut graph = Self {
            name: workflow.name.clone(),
            interfaces: HashMap::new(),
            edges: Vec::new(),
            nodes: Vec::new(),
            index: HashMap::new(),
        };

        graph.collect_nodes(workflow, &[])?;
        graph.collect_edges(workflow, &[])?;
        graph.resolve_joins()?;
        Ok(graph)
    }

    fn collect_nodes(&mut self, workflow: &Workflow, hierarchy: &[String]) -> Result<()> {
        let mut names: Vec<&String> = workflow.interfaces.keys().collect();
        names.sort();
        for name in names {
            let spec = &workflow.interfaces[name];
            match self.interfaces.get(name) {
                Some(existing) if existing != spec => {
                    return Err(Error::Validation(format!(
                        "Interface '{}' is declared twice with different definitions",
                        name
                    )));
                }
                Some(_) => {}
                None => {
                    self.interfaces.insert(name.clone(), spec.clone());
                }
            }
        }

        for node in &workflow.nodes {
            let id = join_path(hierarchy, std::slice::from_ref(&node.name));
            if self.index.contains_key(&id) {
                return Err(Error::Validation(format!("Duplicate node id: {}", id)));
            }
            self.index.insert(id.clone(), self.nodes.len());
            self.nodes.push(FlatNode {
                id,
                hierarchy: hierarchy.to_vec(),
                node: node.clone(),
                join_source: None,
            });
        }

        for child in &workflow.workflows {
            let mut path = hierarchy.to_vec();
            path.push(child.name.clone());
            self.collect_nodes(child, &path)?;
        }
        Ok(())
    }

    fn collect_edges(&mut self, workflow: &Workflow, hierarchy: &[String]) -> Result<()> {
        for conn in &workflow.connections {
            let (source, from) = self.resolve_endpoint(hierarchy, &conn.from, &workflow.name)?;
            let (target, to) = self.resolve_endpoint(hierarchy, &conn.to, &workflow.name)?;

            self.edges.push(FlatEdge {
                source,
                source_port: from.port,
                target,
                target_port: to.port,
                transform: conn.transform.clone(),
            });
        }

        for child in &workflow.workflows {
            let mut path = hierarchy.to_vec();
            path.push(child.name.clone());
            self.collect_edges(child, &path)?;
        }
        Ok(())
    }

    /// Split a connection endpoint at the longest prefix naming a node, so
    /// ports may themselves contain dots.
    fn resolve_endpoint(
        &self,
        hierarchy: &[String],
        raw: &str,
        workflow: &str,
    ) -> Result<(String, Endpoint)> {
        for endpoint in Endpoint::splits(raw)? {
            let id = join_path(hierarchy, &endpoint.path);
            if self.index.contains_key(&id) {
                return Ok((id, endpoint));
            }
        }
        Err(Error::Validation(format!(
            "Connection endpoint '{}' in workflow '{}' does not name a node",
            raw, workflow
        )))
    }

    /// Join sources are looked up relative to the join node's workflow, then
    /// from the root.
    fn resolve_joins(&mut self) -> Result<()> {
        for i in 0..self.nodes.len() {
            let Some(source) = self.nodes[i].node.join_source.clone() else {
                continue;
            };
            let relative = join_path(&self.nodes[i].hierarchy, std::slice::from_ref(&source));
            let resolved = if self.index.contains_key(&relative) {
                relative
            } else if self.index.contains_key(&source) {
                source
            } else {
                return Err(Error::Validation(format!(
                    "Node '{}' joins over unknown node '{}'",
                    self.nodes[i].id, source
                )));
            };
            self.nodes[i].join_source = Some(resolved);
        }
        Ok(())
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[FlatNode] {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&FlatNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edges arriving at `id`.
    pub fn incoming(&self, id: &str) -> Vec<&FlatEdge> {
        self.edges.iter().filter(|e| e.target == id).collect()
    }

    /// Direct upstream nodes, each listed once.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.target == id && seen.insert(e.source.as_str()))
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Direct downstream nodes, each listed once.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.source == id && seen.insert(e.target.as_str()))
            .map(|e| e.target.as_str())
            .collect()
    }

    fn reachable(&self, id: &str, forward: bool) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            let next = if forward {
                self.successors(&current)
            } else {
                self.predecessors(&current)
            };
            for n in next {
                if seen.insert(n.to_string()) {
                    queue.push_back(n.to_string());
                }
            }
        }
        seen
    }

    /// Every node upstream of `id`.
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        self.reachable(id, false)
    }

    /// Every node downstream of `id`.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        self.reachable(id, true)
    }

    /// Dependency order, ties broken by declaration order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut adjacency: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.nodes.len()];
        for edge in &self.edges {
            let (Some(&s), Some(&t)) = (self.index.get(&edge.source), self.index.get(&edge.target))
            else {
                continue;
            };
            if adjacency[s].insert(t) {
                in_degree[t] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = ready.pop_first() {
            order.push(self.nodes[i].id.clone());
            for &t in &adjacency[i] {
                in_degree[t] -= 1;
                if in_degree[t] == 0 {
                    ready.insert(t);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = (0..self.nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.nodes[i].id.as_str())
                .collect();
            return Err(Error::Validation(format!(
                "Circular dependency detected involving nodes: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_order().is_err()
    }
}
