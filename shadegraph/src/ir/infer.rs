//! Type inference over the data-flow graph.
//!
//! Propagates types from literals, declarations and resource element types
//! across data edges. Source ids may carry inline swizzle suffixes
//! (`"n1.xyz"`): inference splits at the first `.`, resolves the base and
//! adjusts the component count while keeping the scalar kind. Unresolvable
//! ports fail with the node id and the offending port.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::types::{parse_swizzle, ScalarKind, ValueType};
use crate::ir::{split_swizzle_suffix, Function, IrDocument, Node};
use crate::ops;
use rustc_hash::FxHashMap;

/// Inferred result types per node id for one function.
pub type NodeTypes = FxHashMap<String, ValueType>;

/// Infers the result type of every value-producing node in `func`.
pub fn infer_function(doc: &IrDocument, func: &Function) -> ShadeResult<NodeTypes> {
    let mut ctx = Inference {
        doc,
        func,
        types: FxHashMap::default(),
        in_progress: Vec::new(),
    };
    for node in &func.nodes {
        // Executable nodes without results are skipped; everything else
        // must resolve.
        if produces_value(&node.op) {
            ctx.node_type(&node.id)?;
        }
    }
    Ok(ctx.types)
}

fn produces_value(op: &str) -> bool {
    !ops::is_executable(op) || matches!(op, "call_func")
}

struct Inference<'a> {
    doc: &'a IrDocument,
    func: &'a Function,
    types: NodeTypes,
    in_progress: Vec<String>,
}

impl<'a> Inference<'a> {
    fn fail(&self, node: &str, port: &str, message: impl Into<String>) -> ShadeError {
        ShadeError::TypeInference {
            node: node.to_string(),
            port: port.to_string(),
            message: message.into(),
        }
    }

    /// The type of a node's `result`, memoized.
    fn node_type(&mut self, id: &str) -> ShadeResult<ValueType> {
        if let Some(ty) = self.types.get(id) {
            return Ok(ty.clone());
        }
        if self.in_progress.iter().any(|n| n == id) {
            return Err(self.fail(id, "result", "cyclic data dependency"));
        }
        self.in_progress.push(id.to_string());
        let node = self.func.node(id)?;
        let ty = self.compute_node_type(node);
        self.in_progress.pop();
        let ty = ty?;
        self.types.insert(id.to_string(), ty.clone());
        Ok(ty)
    }

    /// Resolves a reference string: a node id or variable id, with an
    /// optional inline swizzle suffix.
    fn reference_type(&mut self, reference: &str) -> ShadeResult<ValueType> {
        let (base, suffix) = split_swizzle_suffix(reference);
        let base_ty = if let Some(var) = self.func.local_var(base) {
            var.value_type()?
        } else if let Some(input) = self.doc.input(base) {
            input.value_type()?
        } else if self.func.nodes.iter().any(|n| n.id == base) {
            self.node_type(base)?
        } else if let Some(setter) = self
            .func
            .nodes
            .iter()
            .find(|n| n.op == "var_set" && n.arg_str("var") == Some(base))
        {
            // Undeclared variables take the type of what gets written.
            let marker = format!("var:{base}");
            if self.in_progress.iter().any(|n| n == &marker) {
                return Err(self.fail(base, "value", "cyclic variable dependency"));
            }
            self.in_progress.push(marker);
            let setter = setter.clone();
            let ty = self.input_type(&setter, "value");
            self.in_progress.pop();
            ty?
        } else {
            return Err(self.fail(base, "result", "reference does not name a node or variable"));
        };
        match suffix {
            Some(s) => base_ty.swizzled(parse_swizzle(s)?.len()),
            None => Ok(base_ty),
        }
    }

    /// The type arriving at `(node, port)`: a data edge's source, or a
    /// literal carried on the node under the same key.
    fn input_type(&mut self, node: &Node, port: &str) -> ShadeResult<ValueType> {
        if let Some(edge) = self.func.data_edge_to(&node.id, port) {
            return self.reference_type(&edge.from);
        }
        match node.arg(port) {
            Some(serde_json::Value::String(reference)) => self.reference_type(reference),
            Some(literal) => literal_type(literal, None),
            None => Err(self.fail(&node.id, port, "no data edge and no literal")),
        }
    }

    fn input_type_opt(&mut self, node: &Node, port: &str) -> Option<ValueType> {
        self.input_type(node, port).ok()
    }

    fn compute_node_type(&mut self, node: &Node) -> ShadeResult<ValueType> {
        let op = node.op.as_str();
        if let Some((kind, width)) = ops::constructor_target(op) {
            return ValueType::vector_of(kind, width);
        }
        match op {
            "literal" => {
                if let Some(tag) = node.arg_str("dataType") {
                    ValueType::parse(tag)
                } else if let Some(value) = node.arg("value") {
                    literal_type(value, None)
                } else {
                    Err(self.fail(&node.id, "value", "literal carries no value"))
                }
            }
            "float" => Ok(ValueType::Float),
            "int" => Ok(ValueType::Int),
            "bool" => Ok(ValueType::Bool),
            "float3x3" => Ok(ValueType::Float3x3),
            "float4x4" => Ok(ValueType::Float4x4),
            "vec_swizzle" => {
                let channels = node.require_str("channels")?;
                let base = self.input_type(node, "vec")?;
                base.swizzled(parse_swizzle(channels)?.len())
            }
            "vec_get_element" => {
                let base = self.input_type(node, "vec")?;
                ValueType::vector_of(base.scalar_kind(), 1)
            }
            "vec_dot" | "vec_length" => Ok(ValueType::Float),
            "vec_normalize" => self.input_type(node, "vec"),
            "vec_mix" => self.input_type(node, "a"),
            "math_pi" | "math_e" => Ok(ValueType::Float),
            "math_abs" | "math_floor" | "math_ceil" | "math_fract" | "math_sqrt"
            | "math_exp" | "math_log" | "math_sin" | "math_cos" | "math_tan" | "math_tanh"
            | "math_atan" | "math_sign" | "math_not" => self.input_type(node, "a"),
            "math_add" | "math_sub" | "math_mul" | "math_div" | "math_mod" | "math_pow"
            | "math_min" | "math_max" | "math_atan2" | "math_and" | "math_or" | "math_xor" => {
                let a = self.input_type(node, "a")?;
                let b = self.input_type_opt(node, "b");
                Ok(broadcast(&a, b.as_ref()))
            }
            "math_mad" | "math_clamp" | "math_mix" => {
                let a = self.input_type(node, "a")?;
                let b = self.input_type_opt(node, "b");
                let c = self.input_type_opt(node, "c");
                Ok(broadcast(&broadcast(&a, b.as_ref()), c.as_ref()))
            }
            "math_lt" | "math_gt" | "math_le" | "math_ge" | "math_eq" | "math_neq" => {
                let a = self.input_type(node, "a")?;
                let b = self.input_type_opt(node, "b");
                let shape = broadcast(&a, b.as_ref());
                match shape.component_count(&self.doc.struct_registry())? {
                    1 => Ok(ValueType::Float),
                    n => ValueType::vector_of(ScalarKind::Float, n),
                }
            }
            "mat_mul" => {
                let b = self.input_type(node, "b")?;
                if b.is_vector() {
                    Ok(b)
                } else {
                    self.input_type(node, "a")
                }
            }
            "mat_extract" => match self.input_type(node, "mat")? {
                ValueType::Float3x3 => Ok(ValueType::Float3),
                ValueType::Float4x4 => Ok(ValueType::Float4),
                other => Err(self.fail(
                    &node.id,
                    "mat",
                    format!("mat_extract expects a matrix, got {other}"),
                )),
            },
            "quat_mul" | "quat_slerp" | "color_mix" => Ok(ValueType::Float4),
            "quat_to_mat4" => Ok(ValueType::Float4x4),
            "var_get" => {
                let var = node.require_str("var")?;
                self.reference_type(var)
            }
            "buffer_load" => {
                let buffer = node.require_str("buffer")?;
                self.doc.resource(buffer)?.element_type()
            }
            "texture_load" => Ok(ValueType::Float4),
            "array_construct" => {
                let mut count = 0;
                while node.arg(&format!("e{count}")).is_some()
                    || self.func.data_edge_to(&node.id, &format!("e{count}")).is_some()
                {
                    count += 1;
                }
                if count == 0 {
                    return Err(self.fail(&node.id, "e0", "array_construct has no elements"));
                }
                let elem = self.input_type(node, "e0")?;
                Ok(ValueType::Array(Box::new(elem), count))
            }
            "array_extract" => match self.input_type(node, "array")? {
                ValueType::Array(elem, _) => Ok(*elem),
                other => Err(self.fail(
                    &node.id,
                    "array",
                    format!("array_extract expects an array, got {other}"),
                )),
            },
            "array_set" => self.input_type(node, "array"),
            "struct_construct" => {
                let name = node.require_str("struct")?;
                Ok(ValueType::Struct(name.to_string()))
            }
            "struct_extract" => {
                let field = node.require_str("field")?;
                match self.input_type(node, "struct")? {
                    ValueType::Struct(name) => {
                        let registry = self.doc.struct_registry();
                        let def = registry
                            .get(&name)
                            .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?;
                        let f = def
                            .fields
                            .iter()
                            .find(|f| f.name == field)
                            .ok_or_else(|| {
                                self.fail(
                                    &node.id,
                                    "struct",
                                    format!("struct '{name}' has no field '{field}'"),
                                )
                            })?;
                        ValueType::parse(&f.data_type)
                    }
                    other => Err(self.fail(
                        &node.id,
                        "struct",
                        format!("struct_extract expects a struct, got {other}"),
                    )),
                }
            }
            "static_cast_float" => Ok(ValueType::Float),
            "static_cast_int" => Ok(ValueType::Int),
            "static_cast_uint" => Ok(ValueType::UInt),
            "static_cast_bool" => Ok(ValueType::Bool),
            "loop_index" => Ok(ValueType::Int),
            "builtin_get" => {
                let name = node.require_str("name")?;
                ops::builtin_type(name)
                    .map(|(ty, _)| ty)
                    .ok_or_else(|| self.fail(&node.id, "name", format!("unknown builtin '{name}'")))
            }
            "call_func" => {
                let callee = self.doc.function(node.require_str("func")?)?;
                match callee.outputs.first().and_then(|p| p.data_type.as_deref()) {
                    Some(tag) => ValueType::parse(tag),
                    None => Ok(ValueType::Float),
                }
            }
            other => Err(self.fail(
                &node.id,
                "result",
                format!("op '{other}' does not produce a value"),
            )),
        }
    }
}

/// Element-wise broadcast shape of two operand types.
fn broadcast(a: &ValueType, b: Option<&ValueType>) -> ValueType {
    match b {
        Some(b) if !a.is_vector() && b.is_vector() => b.clone(),
        _ => a.clone(),
    }
}

/// Infers the type of a JSON literal: numbers are `float`, short numeric
/// arrays are vectors, longer ones arrays of `float`.
pub fn literal_type(value: &serde_json::Value, hint: Option<&ValueType>) -> ShadeResult<ValueType> {
    if let Some(ty) = hint {
        return Ok(ty.clone());
    }
    match value {
        serde_json::Value::Number(_) => Ok(ValueType::Float),
        serde_json::Value::Bool(_) => Ok(ValueType::Bool),
        serde_json::Value::Array(items) if items.iter().all(|i| i.is_number()) => {
            match items.len() {
                1 => Ok(ValueType::Float),
                n @ 2..=4 => ValueType::vector_of(ScalarKind::Float, n),
                9 => Ok(ValueType::Float3x3),
                16 => Ok(ValueType::Float4x4),
                n => Ok(ValueType::Array(Box::new(ValueType::Float), n)),
            }
        }
        other => Err(ShadeError::Resource(format!(
            "cannot infer a type for literal {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Edge, FunctionKind, LocalVar};
    use serde_json::json;

    fn base_fn(id: &str) -> Function {
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

    #[test]
    fn test_literal_shapes() {
        assert_eq!(literal_type(&json!(1.0), None).unwrap(), ValueType::Float);
        assert_eq!(
            literal_type(&json!([1, 2, 3]), None).unwrap(),
            ValueType::Float3
        );
        assert_eq!(
            literal_type(
                &json!([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
                None
            )
            .unwrap(),
            ValueType::Float4x4
        );
    }

    #[test]
    fn test_swizzle_chain_types() {
        let mut func = base_fn("f");
        func.nodes.push(
            Node::new("v", "float4")
                .with_arg("x", json!(1.0))
                .with_arg("y", json!(2.0))
                .with_arg("z", json!(3.0))
                .with_arg("w", json!(4.0)),
        );
        func.nodes
            .push(Node::new("s", "vec_swizzle").with_arg("channels", json!("wzyx")));
        func.edges.push(Edge::data("v", "s", "vec"));
        let doc = IrDocument {
            entry_point: "f".to_string(),
            functions: vec![func],
            ..Default::default()
        };
        let types = infer_function(&doc, doc.function("f").unwrap()).unwrap();
        assert_eq!(types["v"], ValueType::Float4);
        assert_eq!(types["s"], ValueType::Float4);
    }

    #[test]
    fn test_inline_swizzle_on_edge_source() {
        let mut func = base_fn("f");
        func.local_vars.push(LocalVar {
            id: "c".to_string(),
            data_type: "float4".to_string(),
            initial_value: None,
        });
        // float3{xy: c.xy, z: 1.0} via a string-reference literal.
        func.nodes.push(
            Node::new("ctor", "float3")
                .with_arg("xy", json!("c.xy"))
                .with_arg("z", json!(1.0)),
        );
        func.nodes
            .push(Node::new("shrunk", "var_get").with_arg("var", json!("c.xyz")));
        let doc = IrDocument {
            entry_point: "f".to_string(),
            functions: vec![func],
            ..Default::default()
        };
        let types = infer_function(&doc, doc.function("f").unwrap()).unwrap();
        assert_eq!(types["ctor"], ValueType::Float3);
        assert_eq!(types["shrunk"], ValueType::Float3);
    }

    #[test]
    fn test_broadcast_scalar_vector() {
        let mut func = base_fn("f");
        func.nodes
            .push(Node::new("s", "literal").with_arg("value", json!(2.0)));
        func.nodes
            .push(Node::new("v", "literal").with_arg("value", json!([1, 2, 3])));
        func.nodes.push(Node::new("m", "math_mul"));
        func.edges.push(Edge::data("s", "m", "a"));
        func.edges.push(Edge::data("v", "m", "b"));
        let doc = IrDocument {
            entry_point: "f".to_string(),
            functions: vec![func],
            ..Default::default()
        };
        let types = infer_function(&doc, doc.function("f").unwrap()).unwrap();
        assert_eq!(types["m"], ValueType::Float3);
    }

    #[test]
    fn test_unresolved_port_reports_node_and_port() {
        let mut func = base_fn("f");
        func.nodes.push(Node::new("m", "math_add"));
        let doc = IrDocument {
            entry_point: "f".to_string(),
            functions: vec![func],
            ..Default::default()
        };
        let err = infer_function(&doc, doc.function("f").unwrap()).unwrap_err();
        match err {
            ShadeError::TypeInference { node, port, .. } => {
                assert_eq!(node, "m");
                assert_eq!(port, "a");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_buffer_load_takes_element_type() {
        let mut func = base_fn("f");
        func.nodes.push(
            Node::new("ld", "buffer_load")
                .with_arg("buffer", json!("b_data"))
                .with_arg("index", json!(0)),
        );
        let doc = IrDocument {
            entry_point: "f".to_string(),
            functions: vec![func],
            resources: vec![serde_json::from_value(json!({
                "id": "b_data", "type": "buffer", "dataType": "float2", "size": 8
            }))
            .unwrap()],
            ..Default::default()
        };
        let types = infer_function(&doc, doc.function("f").unwrap()).unwrap();
        assert_eq!(types["ld"], ValueType::Float2);
    }
}
