//! Workflow validation.

use std::collections::HashSet;

use super::graph::FlatGraph;
use super::types::Workflow;
use crate::error::{Error, Result};
use crate::interfaces::InterfaceRegistry;

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Validate a workflow definition.
///
/// Checks for:
/// - Well-formed, unique names at every nesting level
/// - Connection endpoints that resolve to nodes
/// - Known interfaces, ports, iterable and map fields
/// - Join sources that are upstream iterable nodes
/// - No circular dependencies
pub fn validate_workflow(workflow: &Workflow, registry: &InterfaceRegistry) -> Result<()> {
    validate_names(workflow)?;

    if workflow.node_count() == 0 {
        return Err(Error::Validation(
            "Workflow must have at least one node".into(),
        ));
    }

    let graph = FlatGraph::from_workflow(workflow)?;
    validate_graph(&graph, registry)
}

fn validate_names(workflow: &Workflow) -> Result<()> {
    if !valid_name(&workflow.name) {
        return Err(Error::Validation(format!(
            "Workflow name '{}' must be non-empty and contain only alphanumeric characters, hyphens, and underscores",
            workflow.name
        )));
    }

    let mut names = HashSet::new();
    for node in &workflow.nodes {
        if !valid_name(&node.name) {
            return Err(Error::Validation(format!(
                "Invalid node name '{}' in workflow '{}'",
                node.name, workflow.name
            )));
        }
        if node.interface.is_empty() {
            return Err(Error::Validation(format!(
                "Node '{}' has no interface",
                node.name
            )));
        }
        if !names.insert(node.name.as_str()) {
            return Err(Error::Validation(format!(
                "Duplicate node name '{}' in workflow '{}'",
                node.name, workflow.name
            )));
        }
    }

    for child in &workflow.workflows {
        if !names.insert(child.name.as_str()) {
            return Err(Error::Validation(format!(
                "Name '{}' is used twice in workflow '{}'",
                child.name, workflow.name
            )));
        }
        validate_names(child)?;
    }

    Ok(())
}

/// Validate an already flattened graph.
pub fn validate_graph(graph: &FlatGraph, registry: &InterfaceRegistry) -> Result<()> {
    let registry = registry.with_declared(&graph.interfaces)?;

    for flat in graph.nodes() {
        let node = &flat.node;
        let iface = registry.get(&node.interface).ok_or_else(|| {
            Error::Validation(format!(
                "Node '{}' uses unknown interface '{}'",
                flat.id, node.interface
            ))
        })?;

        let spec = iface
            .input_spec(&node.config)
            .map_err(|e| Error::Validation(format!("Node '{}': {}", flat.id, e)))?;
        let inputs: Option<HashSet<&str>> = spec
            .as_ref()
            .map(|fields| fields.iter().map(|f| f.name.as_str()).collect());
        let has_input = |name: &str| inputs.as_ref().map_or(true, |set| set.contains(name));

        for field in node.inputs.keys() {
            if !has_input(field) {
                return Err(Error::Validation(format!(
                    "Node '{}' sets unknown input '{}'",
                    flat.id, field
                )));
            }
        }

        for (field, values) in node.iterables.iter() {
            if !has_input(field) {
                return Err(Error::Validation(format!(
                    "Node '{}' iterates over unknown input '{}'",
                    flat.id, field
                )));
            }
            if values.is_empty() {
                return Err(Error::Validation(format!(
                    "Node '{}' has an empty iterable list for '{}'",
                    flat.id, field
                )));
            }
        }
        node.iterable_assignments()?;

        for field in &node.map_over {
            if !has_input(field) {
                return Err(Error::Validation(format!(
                    "Node '{}' maps over unknown input '{}'",
                    flat.id, field
                )));
            }
        }
        if node.is_map() && node.is_iterable() {
            return Err(Error::Validation(format!(
                "Node '{}' cannot be both a map node and an iterable node",
                flat.id
            )));
        }

        if let Some(source) = &flat.join_source {
            let is_iterable = graph.get(source).is_some_and(|n| n.node.is_iterable());
            if !is_iterable || !graph.ancestors(&flat.id).contains(source) {
                return Err(Error::Validation(format!(
                    "Node '{}' joins over '{}', which is not an upstream iterable node",
                    flat.id, source
                )));
            }
            for field in &node.join_fields {
                if !has_input(field) {
                    return Err(Error::Validation(format!(
                        "Node '{}' joins unknown input '{}'",
                        flat.id, field
                    )));
                }
            }
        } else if !node.join_fields.is_empty() {
            return Err(Error::Validation(format!(
                "Node '{}' sets join_fields without join_source",
                flat.id
            )));
        }

        if let Some(retry) = &node.retry {
            if retry.max_attempts == 0 {
                return Err(Error::Validation(format!(
                    "Node '{}' retry.max_attempts must be at least 1",
                    flat.id
                )));
            }
        }
    }

    let mut connected = HashSet::new();
    for edge in &graph.edges {
        let (Some(source), Some(target)) = (graph.get(&edge.source), graph.get(&edge.target)) else {
            continue;
        };

        if let Some(iface) = registry.get(&source.node.interface) {
            if let Some(outputs) = iface.output_names(&source.node.config)? {
                if !outputs.contains(&edge.source_port) {
                    return Err(Error::Validation(format!(
                        "Node '{}' has no output '{}'",
                        source.id, edge.source_port
                    )));
                }
            }
        }

        if let Some(iface) = registry.get(&target.node.interface) {
            if let Some(spec) = iface.input_spec(&target.node.config)? {
                if !spec.iter().any(|f| f.name == edge.target_port) {
                    return Err(Error::Validation(format!(
                        "Node '{}' has no input '{}'",
                        target.id, edge.target_port
                    )));
                }
            }
        }

        if target.node.iterables.contains_key(&edge.target_port) {
            return Err(Error::Validation(format!(
                "Input '{}.{}' is both connected and iterated",
                target.id, edge.target_port
            )));
        }

        if !connected.insert((edge.target.as_str(), edge.target_port.as_str())) {
            return Err(Error::Validation(format!(
                "Input '{}.{}' is connected more than once",
                target.id, edge.target_port
            )));
        }
    }

    graph.topological_order()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;

    fn check(yaml: &str) -> Result<()> {
        let workflow = parse_workflow(yaml).unwrap();
        validate_workflow(&workflow, &InterfaceRegistry::new())
    }

    #[test]
    fn test_validate_invalid_name() {
        let err = check(
            r#"
name: "my workflow!"
nodes:
  - name: a
    interface: identity
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("my workflow!"));
    }

    #[test]
    fn test_validate_dotted_node_name() {
        assert!(check(
            r#"
name: wf
nodes:
  - name: a.b
    interface: identity
"#
        )
        .is_err());
    }

    #[test]
    fn test_validate_duplicate_names() {
        let err = check(
            r#"
name: test
nodes:
  - name: a
    interface: identity
  - name: a
    interface: identity
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate node name"));

        let err = check(
            r#"
name: test
nodes:
  - name: preprocessing
    interface: identity
workflows:
  - name: preprocessing
    nodes:
      - name: realign
        interface: identity
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("used twice"));
    }

    #[test]
    fn test_validate_no_nodes() {
        assert!(check("name: empty\n").is_err());
    }

    #[test]
    fn test_validate_unknown_interface() {
        let err = check(
            r#"
name: test
nodes:
  - name: bet
    interface: fsl_bet
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown interface 'fsl_bet'"));
    }

    #[test]
    fn test_validate_ports_against_declared_interface() {
        let base = r#"
name: test
interfaces:
  smooth:
    command: spm_smooth
    inputs:
      in_files: { type: file, argstr: "%s" }
      fwhm: { type: float, argstr: "--fwhm %s" }
    outputs:
      smoothed_files: { glob: "s*.nii" }
nodes:
  - name: iter_fwhm
    interface: identity
    config: { fields: [fwhm] }
    iterables:
      fwhm: [4, 8]
  - name: smooth
    interface: smooth
  - name: sink
    interface: identity
connections:
  - from: iter_fwhm.fwhm
    to: smooth.fwhm
"#;
        check(base).unwrap();

        let bad_input = format!("{}  - from: iter_fwhm.fwhm\n    to: smooth.sigma\n", base);
        assert!(check(&bad_input).unwrap_err().to_string().contains("no input 'sigma'"));

        let bad_output = format!("{}  - from: smooth.out_file\n    to: sink.x\n", base);
        assert!(check(&bad_output).unwrap_err().to_string().contains("no output 'out_file'"));

        let twice = format!("{}  - from: iter_fwhm.fwhm\n    to: smooth.fwhm\n", base);
        assert!(check(&twice).unwrap_err().to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_unknown_static_input() {
        let err = check(
            r#"
name: test
nodes:
  - name: pick
    interface: select
    inputs:
      inlist: [a, b]
      idx: 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown input 'idx'"));
    }

    #[test]
    fn test_validate_join_requires_upstream_iterable() {
        let yaml = r#"
name: test
nodes:
  - name: iter_subject
    interface: identity
    iterables:
      subject_id: [s01, s02]
  - name: collect
    interface: identity
    join_source: iter_subject
    join_fields: [subject_id]
"#;
        let err = check(yaml).unwrap_err();
        assert!(err.to_string().contains("not an upstream iterable"));

        let connected = format!(
            "{}connections:\n  - from: iter_subject.subject_id\n    to: collect.subject_id\n",
            yaml
        );
        check(&connected).unwrap();
    }

    #[test]
    fn test_validate_synchronized_lengths() {
        let err = check(
            r#"
name: test
nodes:
  - name: pairs
    interface: identity
    synchronize: true
    iterables:
      a: [1, 2]
      b: [x]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("different lengths"));
    }

    #[test]
    fn test_validate_cycle() {
        let err = check(
            r#"
name: test
nodes:
  - name: a
    interface: identity
  - name: b
    interface: identity
connections:
  - from: a.x
    to: b.x
  - from: b.y
    to: a.y
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn test_validate_redeclared_builtin() {
        let err = check(
            r#"
name: test
interfaces:
  merge:
    command: my_merge
nodes:
  - name: m
    interface: merge
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot be redeclared"));
    }
}
