//! Iterable expansion.
//!
//! Turns a [`FlatGraph`] into the execution graph: every node downstream of an
//! iterable node is replicated once per combination of the iterables it
//! depends on, and join nodes collapse one iterable back into lists.

use serde::Serialize;
use serde_json::Value;
use ring::digest::{digest, SHA256};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::graph::FlatGraph;
use super::types::Assignment;
use crate::error::{Error, Result};

/// Parameter directory names longer than this are replaced by a hash.
const MAX_PARAM_DIR_LEN: usize = 32;

/// One executable copy of a flat node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInstance {
    /// Unique id, `node` or `node[iter_node=idx,...]`
    pub id: String,
    /// Flat node this instance runs
    pub node_id: String,
    /// Iterable node id -> index of its assignment
    pub assignment: BTreeMap<String, usize>,
    /// Values this instance sets on its own iterable fields
    pub iterable_inputs: BTreeMap<String, Value>,
    /// Directory segments, one per relevant iterable node
    pub param_dirs: Vec<String>,
}

/// A value route between two instances.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceEdge {
    pub source: String,
    pub source_port: String,
    pub target: String,
    pub target_port: String,
    pub transform: Option<String>,
    /// Position within a join, by the join source's assignment index
    pub join_order: Option<usize>,
}

/// The execution graph after parameter expansion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpandedGraph {
    pub instances: Vec<NodeInstance>,
    pub edges: Vec<InstanceEdge>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ExpandedGraph {
    pub fn get(&self, id: &str) -> Option<&NodeInstance> {
        self.index.get(id).map(|&i| &self.instances[i])
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances of one flat node, in sweep order.
    pub fn instances_of(&self, node_id: &str) -> Vec<&NodeInstance> {
        self.instances
            .iter()
            .filter(|i| i.node_id == node_id)
            .collect()
    }

    /// Edges arriving at instance `id`.
    pub fn incoming(&self, id: &str) -> Vec<&InstanceEdge> {
        self.edges.iter().filter(|e| e.target == id).collect()
    }

    /// Direct upstream instances, each listed once.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.target == id && seen.insert(e.source.as_str()))
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Direct downstream instances, each listed once.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.source == id && seen.insert(e.target.as_str()))
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Every instance downstream of `id`.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for next in self.successors(&current) {
                if seen.insert(next.to_string()) {
                    stack.push(next.to_string());
                }
            }
        }
        seen
    }
}

fn value_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Directory segment for one iterable assignment, e.g. `_fwhm_8`.
///
/// Fields appear in declaration order. Long names are replaced by a hash.
pub fn param_dir(assignment: &[(String, Value)]) -> String {
    let raw: String = assignment
        .iter()
        .map(|(field, value)| format!("_{}_{}", field, value_label(value)))
        .collect();
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.len() > MAX_PARAM_DIR_LEN {
        hashed_dir(sanitized.as_bytes())
    } else {
        sanitized
    }
}

fn hashed_dir(bytes: &[u8]) -> String {
    let hash = hex::encode(digest(&SHA256, bytes));
    format!("_0x{}", &hash[..MAX_PARAM_DIR_LEN])
}

/// Directory segments for every assignment of one iterable node.
///
/// Readable names are used unless two assignments clean up to the same
/// name, in which case every segment of the node is a hash of the exact
/// JSON values. Repeated assignments are rejected.
fn sweep_dirs(node_id: &str, assignments: &[Assignment]) -> Result<Vec<String>> {
    let readable: Vec<String> = assignments.iter().map(|a| param_dir(a)).collect();
    if all_distinct(&readable) {
        return Ok(readable);
    }

    let mut hashed = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let canonical = serde_json::to_vec(assignment)?;
        hashed.push(hashed_dir(&canonical));
    }
    if all_distinct(&hashed) {
        Ok(hashed)
    } else {
        Err(Error::Validation(format!(
            "Node '{}' repeats an iterable value",
            node_id
        )))
    }
}

fn all_distinct(dirs: &[String]) -> bool {
    let mut seen = HashSet::with_capacity(dirs.len());
    dirs.iter().all(|d| seen.insert(d.as_str()))
}

fn instance_id(node_id: &str, assignment: &BTreeMap<String, usize>, order: &[String]) -> String {
    if assignment.is_empty() {
        return node_id.to_string();
    }
    let parts: Vec<String> = order
        .iter()
        .filter_map(|k| assignment.get(k).map(|idx| format!("{}={}", k, idx)))
        .collect();
    format!("{}[{}]", node_id, parts.join(","))
}

/// Expand iterables into the execution graph.
pub fn expand(graph: &FlatGraph) -> Result<ExpandedGraph> {
    let order = graph.topological_order()?;
    let position: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut sweeps: HashMap<&str, Vec<Assignment>> = HashMap::new();
    let mut dirs: HashMap<&str, Vec<String>> = HashMap::new();
    for flat in graph.nodes() {
        if flat.node.is_iterable() {
            let assignments = flat.node.iterable_assignments()?;
            if assignments.is_empty() {
                return Err(Error::Validation(format!(
                    "Node '{}' has an empty iterable list",
                    flat.id
                )));
            }
            dirs.insert(flat.id.as_str(), sweep_dirs(&flat.id, &assignments)?);
            sweeps.insert(flat.id.as_str(), assignments);
        }
    }

    // Relevant iterables per node, ordered by topological position.
    let mut relevant: HashMap<&str, Vec<String>> = HashMap::new();
    for id in &order {
        let mut set: HashSet<String> = HashSet::new();
        for pred in graph.predecessors(id) {
            if let Some(r) = relevant.get(pred) {
                set.extend(r.iter().cloned());
            }
        }
        let flat = graph
            .get(id)
            .ok_or_else(|| Error::Internal(format!("Node '{}' vanished during expansion", id)))?;
        if let Some(source) = &flat.join_source {
            set.remove(source);
        }
        if sweeps.contains_key(id.as_str()) {
            set.insert(id.clone());
        }
        let mut list: Vec<String> = set.into_iter().collect();
        list.sort_by_key(|k| position.get(k.as_str()).copied().unwrap_or(usize::MAX));
        relevant.insert(id.as_str(), list);
    }

    let mut expanded = ExpandedGraph::default();
    let empty = Vec::new();

    for id in &order {
        let iterables = relevant.get(id.as_str()).unwrap_or(&empty);

        let mut combos: Vec<BTreeMap<String, usize>> = vec![BTreeMap::new()];
        for it in iterables {
            let count = sweeps.get(it.as_str()).map_or(1, |s| s.len());
            combos = combos
                .into_iter()
                .flat_map(|partial| {
                    (0..count).map(move |idx| {
                        let mut next = partial.clone();
                        next.insert(it.clone(), idx);
                        next
                    })
                })
                .collect();
        }

        for assignment in combos {
            let param_dirs = iterables
                .iter()
                .filter_map(|it| {
                    let idx = assignment.get(it)?;
                    dirs.get(it.as_str()).map(|d| d[*idx].clone())
                })
                .collect();
            let iterable_inputs = match (sweeps.get(id.as_str()), assignment.get(id)) {
                (Some(sweep), Some(&idx)) => sweep[idx].iter().cloned().collect(),
                _ => BTreeMap::new(),
            };
            let instance = NodeInstance {
                id: instance_id(id, &assignment, iterables),
                node_id: id.clone(),
                assignment,
                iterable_inputs,
                param_dirs,
            };
            expanded
                .index
                .insert(instance.id.clone(), expanded.instances.len());
            expanded.instances.push(instance);
        }
    }

    for edge in &graph.edges {
        let target_flat = graph
            .get(&edge.target)
            .ok_or_else(|| Error::Internal(format!("Unknown edge target '{}'", edge.target)))?;
        let join_source = target_flat.join_source.as_deref();

        let sources = expanded.instances_of(&edge.source);
        let targets = expanded.instances_of(&edge.target);
        let mut new_edges = Vec::new();

        for t in &targets {
            for s in &sources {
                let agrees = s
                    .assignment
                    .iter()
                    .all(|(k, idx)| t.assignment.get(k).map_or(true, |tidx| tidx == idx));
                if !agrees {
                    continue;
                }
                let join_order = join_source.and_then(|j| s.assignment.get(j).copied());
                new_edges.push(InstanceEdge {
                    source: s.id.clone(),
                    source_port: edge.source_port.clone(),
                    target: t.id.clone(),
                    target_port: edge.target_port.clone(),
                    transform: edge.transform.clone(),
                    join_order,
                });
            }
        }
        expanded.edges.extend(new_edges);
    }

    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Node, Workflow};
    use serde_json::json;

    fn sweep_workflow() -> Workflow {
        let mut wf = Workflow::new("preprocessing");
        wf.add_node(
            Node::new("iter_subject", "identity")
                .with_iterable("subject_id", vec![json!("s01"), json!("s02")]),
        )
        .add_node(
            Node::new("iter_fwhm", "identity").with_iterable("fwhm", vec![json!(4), json!(8)]),
        )
        .add_node(Node::new("realign", "identity"))
        .add_node(Node::new("smooth", "identity"))
        .add_node(Node::new("datasink", "identity").with_join("iter_fwhm", &["files"]))
        .connect("iter_subject", "subject_id", "realign", "subject_id")
        .connect("realign", "out_file", "smooth", "in_file")
        .connect("iter_fwhm", "fwhm", "smooth", "fwhm")
        .connect("smooth", "smoothed", "datasink", "files");
        wf
    }

    #[test]
    fn test_param_dir() {
        let mut a = vec![("fwhm".to_string(), json!(8))];
        assert_eq!(param_dir(&a), "_fwhm_8");

        a.push(("subject_id".to_string(), json!("sub/01")));
        assert_eq!(param_dir(&a), "_fwhm_8_subject_id_sub_01");

        let long = vec![(
            "in_file".to_string(),
            json!("/very/long/path/to/some/functional_run.nii"),
        )];
        let dir = param_dir(&long);
        assert!(dir.starts_with("_0x"));
        assert_eq!(dir.len(), 3 + 32);
    }

    #[test]
    fn test_colliding_labels_get_distinct_dirs() {
        let mut wf = Workflow::new("sweep");
        wf.add_node(
            Node::new("label", "identity").with_iterable("label", vec![json!("a b"), json!("a_b")]),
        )
        .add_node(Node::new("num", "identity").with_iterable("n", vec![json!(1), json!("1")]))
        .add_node(Node::new("fwhm", "identity").with_iterable("fwhm", vec![json!(4), json!(8)]));
        let graph = FlatGraph::from_workflow(&wf).unwrap();
        let expanded = expand(&graph).unwrap();

        for node in ["label", "num"] {
            let dirs: Vec<&String> = expanded
                .instances_of(node)
                .into_iter()
                .map(|i| &i.param_dirs[0])
                .collect();
            assert_eq!(dirs.len(), 2);
            assert_ne!(dirs[0], dirs[1], "{}", node);
            assert!(dirs[0].starts_with("_0x"));
        }
        // nodes without collisions keep readable names
        assert_eq!(expanded.get("fwhm[fwhm=1]").unwrap().param_dirs, vec!["_fwhm_8"]);
    }

    #[test]
    fn test_repeated_iterable_value_rejected() {
        let mut wf = Workflow::new("sweep");
        wf.add_node(Node::new("dup", "identity").with_iterable("x", vec![json!(2), json!(2)]));
        let graph = FlatGraph::from_workflow(&wf).unwrap();
        let err = expand(&graph).unwrap_err();
        assert!(err.to_string().contains("repeats"), "{}", err);
    }

    #[test]
    fn test_dirs_follow_declaration_order() {
        let mut wf = Workflow::new("ordered");
        wf.add_node(
            Node::new("pairs", "identity")
                .with_iterable("subject", vec![json!("s1")])
                .with_iterable("fwhm", vec![json!(4), json!(8)]),
        );
        let graph = FlatGraph::from_workflow(&wf).unwrap();
        let expanded = expand(&graph).unwrap();
        assert_eq!(expanded.instances[1].param_dirs, vec!["_subject_s1_fwhm_8"]);
    }

    #[test]
    fn test_no_iterables_is_identity_expansion() {
        let mut wf = Workflow::new("plain");
        wf.add_node(Node::new("a", "identity"))
            .add_node(Node::new("b", "identity"))
            .connect("a", "out", "b", "in");
        let graph = FlatGraph::from_workflow(&wf).unwrap();
        let expanded = expand(&graph).unwrap();

        assert_eq!(expanded.len(), 2);
        assert!(expanded.get("a").is_some());
        assert_eq!(expanded.edges.len(), 1);
        assert!(expanded.instances[0].param_dirs.is_empty());
    }

    #[test]
    fn test_cartesian_expansion() {
        let graph = FlatGraph::from_workflow(&sweep_workflow()).unwrap();
        let expanded = expand(&graph).unwrap();

        assert_eq!(expanded.instances_of("iter_subject").len(), 2);
        assert_eq!(expanded.instances_of("realign").len(), 2);
        assert_eq!(expanded.instances_of("smooth").len(), 4);
        // joined over fwhm, still split by subject
        assert_eq!(expanded.instances_of("datasink").len(), 2);

        let smooth = expanded
            .get("smooth[iter_subject=1,iter_fwhm=0]")
            .expect("instance id follows topological order of iterables");
        assert_eq!(smooth.param_dirs, vec!["_subject_id_s02", "_fwhm_4"]);

        let iter = expanded.get("iter_fwhm[iter_fwhm=1]").unwrap();
        assert_eq!(iter.iterable_inputs["fwhm"], json!(8));
    }

    #[test]
    fn test_edges_follow_matching_assignments() {
        let graph = FlatGraph::from_workflow(&sweep_workflow()).unwrap();
        let expanded = expand(&graph).unwrap();

        let into_smooth = expanded.incoming("smooth[iter_subject=0,iter_fwhm=1]");
        let sources: HashSet<&str> = into_smooth.iter().map(|e| e.source.as_str()).collect();
        assert!(sources.contains("realign[iter_subject=0]"));
        assert!(sources.contains("iter_fwhm[iter_fwhm=1]"));
        assert_eq!(sources.len(), 2);
    }

    #[test]
    fn test_join_collects_branches_in_order() {
        let graph = FlatGraph::from_workflow(&sweep_workflow()).unwrap();
        let expanded = expand(&graph).unwrap();

        let into_sink = expanded.incoming("datasink[iter_subject=1]");
        assert_eq!(into_sink.len(), 2);
        let mut orders: Vec<usize> = into_sink.iter().filter_map(|e| e.join_order).collect();
        orders.sort();
        assert_eq!(orders, vec![0, 1]);
        assert!(into_sink
            .iter()
            .all(|e| e.source.starts_with("smooth[iter_subject=1,")));
    }

    #[test]
    fn test_synchronized_iterables() {
        let mut wf = Workflow::new("zip");
        wf.add_node(
            Node::new("pairs", "identity")
                .with_iterable("a", vec![json!(1), json!(2), json!(3)])
                .with_iterable("b", vec![json!("x"), json!("y"), json!("z")])
                .synchronized(),
        );
        let graph = FlatGraph::from_workflow(&wf).unwrap();
        let expanded = expand(&graph).unwrap();
        assert_eq!(expanded.len(), 3);
        assert_eq!(expanded.instances[2].iterable_inputs["b"], json!("z"));
        assert_eq!(expanded.instances[2].param_dirs, vec!["_a_3_b_z"]);
    }

    #[test]
    fn test_descendants() {
        let graph = FlatGraph::from_workflow(&sweep_workflow()).unwrap();
        let expanded = expand(&graph).unwrap();
        let desc = expanded.descendants("realign[iter_subject=0]");
        assert_eq!(desc.len(), 3); // two smooth branches and one datasink
    }
}
