//! Structural validation of IR documents.
//!
//! Produces a list of [`Diagnostic`]s; any `error`-severity finding aborts
//! the enclosing run. Checks cover id uniqueness, dangling edge endpoints,
//! duplicate data fan-in, execution- and data-graph acyclicity (data cycles
//! are detected ignoring execution edges; iteration happens only through
//! `flow_loop`), entry-point existence and component-group coverage of
//! flexible constructors.

use crate::core::error::{Diagnostic, ShadeError, ShadeResult};
use crate::ir::{split_swizzle_suffix, EdgeKind, Function, IrDocument};
use crate::ops;
use std::collections::{HashMap, HashSet};

/// Validates the whole document.
pub fn validate(doc: &IrDocument) -> Vec<Diagnostic> {
    let mut diags = Vec::new();

    if doc.functions.iter().all(|f| f.id != doc.entry_point) {
        diags.push(Diagnostic::error(
            format!("entry point '{}' is not a known function", doc.entry_point),
            "document",
        ));
    }

    let mut seen_resources = HashSet::new();
    for res in &doc.resources {
        if !seen_resources.insert(res.id.as_str()) {
            diags.push(Diagnostic::error(
                format!("duplicate resource id '{}'", res.id),
                "document",
            ));
        }
    }

    let mut seen_functions = HashSet::new();
    for func in &doc.functions {
        if !seen_functions.insert(func.id.as_str()) {
            diags.push(Diagnostic::error(
                format!("duplicate function id '{}'", func.id),
                "document",
            ));
        }
        validate_function(doc, func, &mut diags);
    }

    diags
}

/// Validates and fails on the first `error`-severity diagnostic.
pub fn ensure_valid(doc: &IrDocument) -> ShadeResult<()> {
    let diags = validate(doc);
    for d in &diags {
        match d.severity {
            crate::core::error::Severity::Warning => log::warn!("{d}"),
            crate::core::error::Severity::Error => log::error!("{d}"),
        }
    }
    if diags
        .iter()
        .any(|d| d.severity == crate::core::error::Severity::Error)
    {
        return Err(ShadeError::Validation(diags));
    }
    Ok(())
}

fn validate_function(doc: &IrDocument, func: &Function, diags: &mut Vec<Diagnostic>) {
    let location = format!("function '{}'", func.id);

    let mut node_ids = HashSet::new();
    for node in &func.nodes {
        if !node_ids.insert(node.id.as_str()) {
            diags.push(Diagnostic::error(
                format!("duplicate node id '{}'", node.id),
                location.clone(),
            ));
        }
    }

    let mut data_targets = HashSet::new();
    for edge in &func.edges {
        let (from_base, _) = split_swizzle_suffix(&edge.from);
        if !node_ids.contains(from_base) {
            diags.push(Diagnostic::error(
                format!("edge references unknown source node '{from_base}'"),
                location.clone(),
            ));
        }
        if !node_ids.contains(edge.to.as_str()) {
            diags.push(Diagnostic::error(
                format!("edge references unknown target node '{}'", edge.to),
                location.clone(),
            ));
        }
        match edge.kind {
            EdgeKind::Data => {
                if !data_targets.insert((edge.to.as_str(), edge.port_in.as_str())) {
                    diags.push(Diagnostic::error(
                        format!(
                            "multiple data edges arrive at '{}'.'{}'",
                            edge.to, edge.port_in
                        ),
                        location.clone(),
                    ));
                }
            }
            EdgeKind::Execution => {
                if let Ok(from) = func.node(from_base) {
                    if !ops::is_executable(&from.op) {
                        diags.push(Diagnostic::error(
                            format!(
                                "execution edge leaves non-executable node '{}' (op {})",
                                from.id, from.op
                            ),
                            location.clone(),
                        ));
                    } else if !ops::exec_out_ports(&from.op).contains(&edge.port_out.as_str()) {
                        diags.push(Diagnostic::error(
                            format!(
                                "node '{}' (op {}) has no execution port '{}'",
                                from.id, from.op, edge.port_out
                            ),
                            location.clone(),
                        ));
                    }
                }
                if let Ok(to) = func.node(&edge.to) {
                    if !ops::is_executable(&to.op) {
                        diags.push(Diagnostic::error(
                            format!(
                                "execution edge enters non-executable node '{}' (op {})",
                                to.id, to.op
                            ),
                            location.clone(),
                        ));
                    }
                }
            }
        }
    }

    check_acyclic(func, EdgeKind::Data, "data", diags);
    check_acyclic(func, EdgeKind::Execution, "execution", diags);

    for node in &func.nodes {
        if let Some((_, width)) = ops::constructor_target(&node.op) {
            validate_constructor(func, node, width, diags);
        }
        match node.op.as_str() {
            "var_get" | "var_set" => {
                if node.arg_str("var").is_none() {
                    diags.push(Diagnostic::error(
                        format!("node '{}' (op {}) is missing key 'var'", node.id, node.op),
                        location.clone(),
                    ));
                }
            }
            "buffer_load" | "buffer_store" => match node.arg_str("buffer") {
                None => diags.push(Diagnostic::error(
                    format!("node '{}' (op {}) is missing key 'buffer'", node.id, node.op),
                    location.clone(),
                )),
                Some(id) if doc.resource(id).is_err() => diags.push(Diagnostic::error(
                    format!("node '{}' references unknown buffer '{id}'", node.id),
                    location.clone(),
                )),
                _ => {}
            },
            "texture_load" | "texture_store" => match node.arg_str("texture") {
                None => diags.push(Diagnostic::error(
                    format!(
                        "node '{}' (op {}) is missing key 'texture'",
                        node.id, node.op
                    ),
                    location.clone(),
                )),
                Some(id) if doc.resource(id).is_err() => diags.push(Diagnostic::error(
                    format!("node '{}' references unknown texture '{id}'", node.id),
                    location.clone(),
                )),
                _ => {}
            },
            "cmd_dispatch" | "call_func" => match node.arg_str("func") {
                None => diags.push(Diagnostic::error(
                    format!("node '{}' (op {}) is missing key 'func'", node.id, node.op),
                    location.clone(),
                )),
                Some(id) if doc.function(id).is_err() => diags.push(Diagnostic::error(
                    format!("node '{}' references unknown function '{id}'", node.id),
                    location.clone(),
                )),
                _ => {}
            },
            "builtin_get" => {
                match node.arg_str("name") {
                    None => diags.push(Diagnostic::error(
                        format!("node '{}' (op builtin_get) is missing key 'name'", node.id),
                        location.clone(),
                    )),
                    Some(name) if ops::builtin_type(name).is_none() => {
                        diags.push(Diagnostic::error(
                            format!("node '{}' reads unknown builtin '{name}'", node.id),
                            location.clone(),
                        ))
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// DFS cycle check over one edge kind, the other kind ignored.
fn check_acyclic(func: &Function, kind: EdgeKind, label: &str, diags: &mut Vec<Diagnostic>) {
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in func.edges.iter().filter(|e| e.kind == kind) {
        let (from, _) = split_swizzle_suffix(&edge.from);
        successors.entry(from).or_default().push(&edge.to);
    }

    // 0 = unvisited, 1 = on stack, 2 = done
    let mut state: HashMap<&str, u8> = HashMap::new();
    fn visit<'a>(
        node: &'a str,
        successors: &HashMap<&'a str, Vec<&'a str>>,
        state: &mut HashMap<&'a str, u8>,
    ) -> Option<String> {
        match state.get(node) {
            Some(1) => return Some(node.to_string()),
            Some(2) => return None,
            _ => {}
        }
        state.insert(node, 1);
        if let Some(next) = successors.get(node) {
            for n in next {
                if let Some(cycle) = visit(n, successors, state) {
                    return Some(cycle);
                }
            }
        }
        state.insert(node, 2);
        None
    }

    for node in &func.nodes {
        if let Some(at) = visit(&node.id, &successors, &mut state) {
            diags.push(Diagnostic::error(
                format!("{label} edges form a cycle through node '{at}'"),
                format!("function '{}'", func.id),
            ));
            return;
        }
    }
}

/// Checks that a flexible constructor's channel groups cover the target's
/// components exactly: no gaps, no overlaps, nothing out of range.
fn validate_constructor(
    func: &Function,
    node: &crate::ir::Node,
    width: usize,
    diags: &mut Vec<Diagnostic>,
) {
    let location = format!("function '{}', node '{}'", func.id, node.id);
    let mut groups: Vec<&str> = Vec::new();
    for edge in func.data_edges_to(&node.id) {
        groups.push(&edge.port_in);
    }
    for key in node.args.keys() {
        // Only channel-letter keys participate; other keys are op metadata.
        if key.chars().all(|c| "xyzwrgba".contains(c)) && !groups.contains(&key.as_str()) {
            groups.push(key);
        }
    }

    let mut covered = [0usize; 4];
    for group in &groups {
        if !ops::is_channel_group(group) {
            diags.push(Diagnostic::error(
                format!("'{group}' is not a valid component group"),
                location.clone(),
            ));
            return;
        }
        for c in group.chars() {
            let idx = crate::core::types::channel_index(c).unwrap();
            if idx >= width {
                diags.push(Diagnostic::error(
                    format!(
                        "component '{c}' is out of range for {} ({} components)",
                        node.op, width
                    ),
                    location.clone(),
                ));
                return;
            }
            covered[idx] += 1;
        }
    }

    for (idx, count) in covered.iter().enumerate().take(width) {
        let channel = ['x', 'y', 'z', 'w'][idx];
        if *count == 0 {
            diags.push(Diagnostic::error(
                format!("component '{channel}' of {} is not covered", node.op),
                location.clone(),
            ));
        } else if *count > 1 {
            diags.push(Diagnostic::error(
                format!("component '{channel}' of {} is covered twice", node.op),
                location.clone(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Severity;
    use crate::ir::{Edge, Function, FunctionKind, Node};
    use serde_json::json;

    fn doc_with(func: Function) -> IrDocument {
        IrDocument {
            entry_point: func.id.clone(),
            functions: vec![func],
            ..Default::default()
        }
    }

    fn empty_fn(id: &str) -> Function {
        Function {
            id: id.to_string(),
            kind: FunctionKind::Cpu,
            inputs: vec![],
            outputs: vec![],
            local_vars: vec![],
            nodes: vec![],
            edges: vec![],
        }
    }

    fn errors(doc: &IrDocument) -> Vec<String> {
        validate(doc)
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.message)
            .collect()
    }

    #[test]
    fn test_missing_entry_point() {
        let doc = IrDocument {
            entry_point: "nope".to_string(),
            ..Default::default()
        };
        assert!(errors(&doc).iter().any(|m| m.contains("entry point")));
    }

    #[test]
    fn test_duplicate_node_ids() {
        let mut func = empty_fn("f");
        func.nodes.push(Node::new("n", "math_add"));
        func.nodes.push(Node::new("n", "math_sub"));
        assert!(errors(&doc_with(func))
            .iter()
            .any(|m| m.contains("duplicate node id 'n'")));
    }

    #[test]
    fn test_dangling_edge_endpoint() {
        let mut func = empty_fn("f");
        func.nodes.push(Node::new("a", "literal"));
        func.edges.push(Edge::data("a", "ghost", "value"));
        assert!(errors(&doc_with(func))
            .iter()
            .any(|m| m.contains("unknown target node 'ghost'")));
    }

    #[test]
    fn test_duplicate_data_fanin() {
        let mut func = empty_fn("f");
        func.nodes.push(Node::new("a", "literal"));
        func.nodes.push(Node::new("b", "literal"));
        func.nodes.push(Node::new("s", "math_add"));
        func.edges.push(Edge::data("a", "s", "a"));
        func.edges.push(Edge::data("b", "s", "a"));
        assert!(errors(&doc_with(func))
            .iter()
            .any(|m| m.contains("multiple data edges")));
    }

    #[test]
    fn test_data_cycle_detected_ignoring_exec_edges() {
        let mut func = empty_fn("f");
        func.nodes.push(Node::new("a", "math_add"));
        func.nodes.push(Node::new("b", "math_add"));
        func.edges.push(Edge::data("a", "b", "a"));
        func.edges.push(Edge::data("b", "a", "a"));
        assert!(errors(&doc_with(func))
            .iter()
            .any(|m| m.contains("data edges form a cycle")));
    }

    #[test]
    fn test_constructor_gap_overlap_and_valid() {
        // Gap: float3 with only xy covered.
        let mut func = empty_fn("f");
        func.nodes
            .push(Node::new("c", "float3").with_arg("xy", json!([1.0, 2.0])));
        assert!(errors(&doc_with(func))
            .iter()
            .any(|m| m.contains("'z' of float3 is not covered")));

        // Overlap: x covered by both "x" and "xy".
        let mut func = empty_fn("f");
        func.nodes.push(
            Node::new("c", "float3")
                .with_arg("xy", json!([1.0, 2.0]))
                .with_arg("x", json!(0.0))
                .with_arg("z", json!(3.0)),
        );
        assert!(errors(&doc_with(func))
            .iter()
            .any(|m| m.contains("covered twice")));

        // Exact cover through a data edge plus a literal.
        let mut func = empty_fn("f");
        func.nodes.push(Node::new("v", "literal").with_arg("value", json!([1.0, 2.0])));
        func.nodes.push(Node::new("c", "float3").with_arg("z", json!(1.0)));
        func.edges.push(Edge::data("v", "c", "xy"));
        assert!(errors(&doc_with(func)).is_empty());
    }

    #[test]
    fn test_exec_edge_from_pure_node_rejected() {
        let mut func = empty_fn("f");
        func.nodes.push(Node::new("a", "math_add"));
        func.nodes.push(Node::new("b", "var_set").with_arg("var", json!("x")));
        func.edges.push(Edge::exec("a", "b"));
        assert!(errors(&doc_with(func))
            .iter()
            .any(|m| m.contains("leaves non-executable node")));
    }

    #[test]
    fn test_unknown_builtin_rejected() {
        let mut func = empty_fn("f");
        func.nodes
            .push(Node::new("b", "builtin_get").with_arg("name", json!("warp_factor")));
        assert!(errors(&doc_with(func))
            .iter()
            .any(|m| m.contains("unknown builtin 'warp_factor'")));
    }
}
