//! Rewriting a host-intent function into a GPU kernel plus trampoline.
//!
//! The transform deep-clones the document, renames the entry function to
//! `_gpu_kernel_<orig>` and flips it to a shader function. Every `var_set`
//! and `func_return` is assigned a capture offset into a synthetic buffer
//! (`b_force_gpu_capture`); component-wise capture stores are spliced onto
//! the execution chain after each `var_set` and before each `func_return`.
//! A host-type trampoline then dispatches the kernel once and syncs every
//! resource so the capture buffer is readable, and becomes the document's
//! entry point. After the run, the backend writes each captured slot back
//! into the evaluation context as a variable or the function result.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::types::{parse_swizzle, ValueType};
use crate::core::value::Value;
use crate::ir::infer::{self, literal_type, NodeTypes};
use crate::ir::{
    split_swizzle_suffix, Edge, Function, FunctionKind, IrDocument, Node, Resource, ResourceKind,
    Persistence, ResourceSize,
};
use crate::ops;
use serde_json::json;

/// Id of the synthetic capture buffer.
pub const CAPTURE_BUFFER_ID: &str = "b_force_gpu_capture";

/// What a capture slot feeds back into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// A variable write: `set_var(id, value)` after readback.
    Var(String),
    /// The function return value.
    Return,
}

/// One captured value's location in the capture buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSlot {
    /// Variable or return.
    pub target: CaptureTarget,
    /// Scalar offset into the capture buffer.
    pub offset: u32,
    /// Captured value type.
    pub ty: ValueType,
}

/// The transform's output.
#[derive(Debug, Clone)]
pub struct ForceGpuTransform {
    /// The rewritten document; its entry point is the trampoline.
    pub doc: IrDocument,
    /// Id of the rewritten kernel function.
    pub kernel_id: String,
    /// Id of the synthesized trampoline function.
    pub trampoline_id: String,
    /// Capture slots in offset order.
    pub slots: Vec<CaptureSlot>,
}

/// Applies the force-GPU rewrite to `doc`'s entry function.
pub fn force_gpu(doc: &IrDocument) -> ShadeResult<ForceGpuTransform> {
    let mut doc = doc.clone();
    let orig_entry = doc.entry_point.clone();
    let kernel_id = format!("_gpu_kernel_{orig_entry}");
    let trampoline_id = format!("_trampoline_{orig_entry}");

    {
        let func = doc
            .functions
            .iter_mut()
            .find(|f| f.id == orig_entry)
            .ok_or_else(|| ShadeError::unknown("function", orig_entry.clone()))?;
        func.id = kernel_id.clone();
        func.kind = FunctionKind::Shader;
    }

    let types = infer::infer_function(&doc, doc.function(&kernel_id)?)?;
    let slots = rewrite_kernel(&mut doc, &kernel_id, &types)?;

    let total: usize = {
        let structs = doc.struct_registry();
        let mut sum = 0;
        for slot in &slots {
            sum += slot.ty.component_count(&structs)?;
        }
        sum.max(1)
    };
    doc.resources.push(Resource {
        id: CAPTURE_BUFFER_ID.to_string(),
        kind: ResourceKind::Buffer,
        data_type: Some("float".to_string()),
        format: None,
        size: ResourceSize::Elements(total as u64),
        persistence: Persistence::CpuAccess,
    });

    let trampoline = build_trampoline(&doc, &kernel_id, &trampoline_id);
    doc.functions.push(trampoline);
    doc.entry_point = trampoline_id.clone();

    log::debug!(
        "force-gpu: kernel '{kernel_id}', {} capture slots, {} scalars",
        slots.len(),
        total
    );

    Ok(ForceGpuTransform {
        doc,
        kernel_id,
        trampoline_id,
        slots,
    })
}

/// Where a captured value comes from: an existing node/var reference or a
/// literal that needs its own node.
enum CaptureSource {
    Reference(String),
    Literal(serde_json::Value),
}

fn rewrite_kernel(
    doc: &mut IrDocument,
    kernel_id: &str,
    types: &NodeTypes,
) -> ShadeResult<Vec<CaptureSlot>> {
    let func = doc.function(kernel_id)?.clone();
    let mut slots = Vec::new();
    let mut offset = 0u32;
    let structs = doc.struct_registry();

    // Collect capture points in node order so offsets are deterministic.
    struct Injection {
        node_id: String,
        before: bool,
        source: CaptureSource,
        ty: ValueType,
        offset: u32,
    }
    let mut injections = Vec::new();

    for node in &func.nodes {
        let (target, before) = match node.op.as_str() {
            "var_set" => (
                CaptureTarget::Var(node.require_str("var")?.to_string()),
                false,
            ),
            "func_return" => (CaptureTarget::Return, true),
            _ => continue,
        };
        let (source, ty) = capture_source(&func, node, types, doc)?;
        // After a var_set the variable itself is re-read so later writes
        // on the same chain cannot alias the captured value.
        let (source, ty) = match &target {
            CaptureTarget::Var(var) => {
                let decl_ty = func
                    .local_var(var)
                    .map(|v| v.value_type())
                    .transpose()?
                    .unwrap_or(ty);
                (CaptureSource::Reference(var.clone()), decl_ty)
            }
            CaptureTarget::Return => (source, ty),
        };
        let count = ty.component_count(&structs)? as u32;
        slots.push(CaptureSlot {
            target,
            offset,
            ty: ty.clone(),
        });
        injections.push(Injection {
            node_id: node.id.clone(),
            before,
            source,
            ty,
            offset,
        });
        offset += count;
    }

    let func = doc
        .functions
        .iter_mut()
        .find(|f| f.id == kernel_id)
        .expect("kernel function disappeared");

    for (n, inj) in injections.into_iter().enumerate() {
        let prefix = format!("_cap{n}");
        let source_ref = match inj.source {
            CaptureSource::Reference(r) => {
                if matches!(
                    func.node(split_swizzle_suffix(&r).0).map(|nd| nd.op.as_str()),
                    Ok(_)
                ) && func.local_var(split_swizzle_suffix(&r).0).is_none()
                {
                    r
                } else {
                    // Variable reference: read it through a var_get node.
                    let get_id = format!("{prefix}_get");
                    func.nodes
                        .push(Node::new(get_id.clone(), "var_get").with_arg("var", json!(r)));
                    get_id
                }
            }
            CaptureSource::Literal(value) => {
                let lit_id = format!("{prefix}_lit");
                func.nodes.push(
                    Node::new(lit_id.clone(), "literal").with_arg("value", value),
                );
                lit_id
            }
        };

        let mut store_ids = Vec::new();
        emit_capture_stores(
            func,
            &prefix,
            &source_ref,
            &inj.ty,
            inj.offset,
            &mut store_ids,
            &structs,
        )?;
        let (Some(first_store), Some(last_store)) =
            (store_ids.first().cloned(), store_ids.last().cloned())
        else {
            continue;
        };
        for pair in store_ids.windows(2) {
            func.edges.push(Edge::exec(pair[0].clone(), pair[1].clone()));
        }

        if inj.before {
            // Splice ahead of the node: P -> stores -> node.
            let incoming: Vec<usize> = func
                .edges
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.kind == crate::ir::EdgeKind::Execution && e.to == inj.node_id
                })
                .map(|(i, _)| i)
                .collect();
            for i in incoming {
                func.edges[i].to = first_store.clone();
                func.edges[i].port_in = ops::EXEC_IN.to_string();
            }
            func.edges
                .push(Edge::exec(last_store.clone(), inj.node_id.clone()));
        } else {
            // Splice after the node: node -> stores -> old successor.
            let outgoing: Option<usize> = func
                .edges
                .iter()
                .position(|e| {
                    e.kind == crate::ir::EdgeKind::Execution
                        && e.from == inj.node_id
                        && e.port_out == ops::EXEC_OUT
                });
            if let Some(i) = outgoing {
                func.edges[i].from = last_store.clone();
            }
            func.edges
                .push(Edge::exec(inj.node_id.clone(), first_store.clone()));
        }
    }

    Ok(slots)
}

/// Determines a capture's source reference and type: the declared local
/// type first, then the inferred type of the value source, adjusted by any
/// inline swizzle on the source id.
fn capture_source(
    func: &Function,
    node: &Node,
    types: &NodeTypes,
    doc: &IrDocument,
) -> ShadeResult<(CaptureSource, ValueType)> {
    let reference: Option<String> = match func.data_edge_to(&node.id, "value") {
        Some(edge) => Some(edge.from.clone()),
        None => match node.arg("value") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => {
                let ty = literal_type(other, None)?;
                return Ok((CaptureSource::Literal(other.clone()), ty));
            }
            None => None,
        },
    };
    let reference = reference.ok_or_else(|| {
        ShadeError::Resource(format!(
            "node '{}' (op {}) captures nothing: no value source",
            node.id, node.op
        ))
    })?;

    let (base, suffix) = split_swizzle_suffix(&reference);
    let base_ty = if let Some(var) = func.local_var(base) {
        var.value_type()?
    } else if let Some(input) = doc.input(base) {
        input.value_type()?
    } else if let Some(ty) = types.get(base) {
        ty.clone()
    } else {
        return Err(ShadeError::unknown("capture source", base));
    };
    let ty = match suffix {
        Some(s) => base_ty.swizzled(parse_swizzle(s)?.len())?,
        None => base_ty,
    };
    Ok((CaptureSource::Reference(reference), ty))
}

/// Emits component extraction + `buffer_store` nodes for one captured
/// value, recursing through arrays and structs.
fn emit_capture_stores(
    func: &mut Function,
    prefix: &str,
    source_ref: &str,
    ty: &ValueType,
    offset: u32,
    store_ids: &mut Vec<String>,
    structs: &crate::ir::StructRegistry,
) -> ShadeResult<()> {
    match ty {
        ValueType::Float | ValueType::Int | ValueType::UInt | ValueType::Bool => {
            let st_id = format!("{prefix}_st{offset}");
            func.nodes.push(
                Node::new(st_id.clone(), "buffer_store")
                    .with_arg("buffer", json!(CAPTURE_BUFFER_ID))
                    .with_arg("index", json!(offset)),
            );
            func.edges.push(Edge::data(source_ref, st_id.clone(), "value"));
            store_ids.push(st_id);
        }
        ValueType::Float2
        | ValueType::Float3
        | ValueType::Float4
        | ValueType::Int2
        | ValueType::Int3
        | ValueType::Int4
        | ValueType::Float3x3
        | ValueType::Float4x4 => {
            // Matrices extract a column first, then a component.
            let (outer, inner) = match ty {
                ValueType::Float3x3 => (3, 3),
                ValueType::Float4x4 => (4, 4),
                other => (other.component_count(structs)?, 1),
            };
            for o in 0..outer {
                let elem_ref = if inner == 1 {
                    let el_id = format!("{prefix}_el{}", offset as usize + o);
                    func.nodes.push(
                        Node::new(el_id.clone(), "vec_get_element").with_arg("index", json!(o)),
                    );
                    func.edges.push(Edge::data(source_ref, el_id.clone(), "vec"));
                    el_id
                } else {
                    let col_id = format!("{prefix}_col{}_{o}", offset);
                    func.nodes.push(
                        Node::new(col_id.clone(), "vec_get_element").with_arg("index", json!(o)),
                    );
                    func.edges
                        .push(Edge::data(source_ref, col_id.clone(), "vec"));
                    col_id
                };
                if inner == 1 {
                    let at = offset as usize + o;
                    let st_id = format!("{prefix}_st{at}");
                    func.nodes.push(
                        Node::new(st_id.clone(), "buffer_store")
                            .with_arg("buffer", json!(CAPTURE_BUFFER_ID))
                            .with_arg("index", json!(at)),
                    );
                    func.edges.push(Edge::data(elem_ref, st_id.clone(), "value"));
                    store_ids.push(st_id);
                } else {
                    for i in 0..inner {
                        let at = offset as usize + o * inner + i;
                        let comp_id = format!("{prefix}_el{at}");
                        func.nodes.push(
                            Node::new(comp_id.clone(), "vec_get_element")
                                .with_arg("index", json!(i)),
                        );
                        func.edges
                            .push(Edge::data(elem_ref.clone(), comp_id.clone(), "vec"));
                        let st_id = format!("{prefix}_st{at}");
                        func.nodes.push(
                            Node::new(st_id.clone(), "buffer_store")
                                .with_arg("buffer", json!(CAPTURE_BUFFER_ID))
                                .with_arg("index", json!(at)),
                        );
                        func.edges.push(Edge::data(comp_id, st_id.clone(), "value"));
                        store_ids.push(st_id);
                    }
                }
            }
        }
        ValueType::Array(elem, n) => {
            let stride = elem.component_count(structs)? as u32;
            for i in 0..*n {
                let ex_id = format!("{prefix}_ax{}_{i}", offset);
                func.nodes.push(
                    Node::new(ex_id.clone(), "array_extract").with_arg("index", json!(i)),
                );
                func.edges
                    .push(Edge::data(source_ref, ex_id.clone(), "array"));
                emit_capture_stores(
                    func,
                    &format!("{prefix}_a{i}"),
                    &ex_id,
                    elem,
                    offset + i as u32 * stride,
                    store_ids,
                    structs,
                )?;
            }
        }
        ValueType::Struct(name) => {
            let def = structs
                .get(name)
                .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?
                .clone();
            let mut at = offset;
            for field in &def.fields {
                let fty = ValueType::parse(&field.data_type)?;
                let ex_id = format!("{prefix}_fx{}_{}", offset, field.name);
                func.nodes.push(
                    Node::new(ex_id.clone(), "struct_extract")
                        .with_arg("field", json!(field.name)),
                );
                func.edges
                    .push(Edge::data(source_ref, ex_id.clone(), "struct"));
                emit_capture_stores(
                    func,
                    &format!("{prefix}_f_{}", field.name),
                    &ex_id,
                    &fty,
                    at,
                    store_ids,
                    structs,
                )?;
                at += fty.component_count(structs)? as u32;
            }
        }
    }
    Ok(())
}

fn build_trampoline(doc: &IrDocument, kernel_id: &str, trampoline_id: &str) -> Function {
    let mut func = Function {
        id: trampoline_id.to_string(),
        kind: FunctionKind::Cpu,
        inputs: vec![],
        outputs: vec![],
        local_vars: vec![],
        nodes: vec![],
        edges: vec![],
    };
    func.nodes.push(
        Node::new("dispatch", "cmd_dispatch")
            .with_arg("func", json!(kernel_id))
            .with_arg("dispatch", json!([1, 1, 1])),
    );
    let mut prev = "dispatch".to_string();
    for resource in &doc.resources {
        let sync_id = format!("sync_{}", resource.id);
        let wait_id = format!("wait_{}", resource.id);
        func.nodes.push(
            Node::new(sync_id.clone(), "cmd_sync_to_cpu")
                .with_arg("resource", json!(resource.id)),
        );
        func.nodes.push(
            Node::new(wait_id.clone(), "cmd_wait_cpu_sync")
                .with_arg("resource", json!(resource.id)),
        );
        func.edges.push(Edge::exec(prev, sync_id.clone()));
        func.edges.push(Edge::exec(sync_id, wait_id.clone()));
        prev = wait_id;
    }
    func
}

/// Reconstructs captured values from the capture buffer's scalar data.
pub fn read_captures(
    slots: &[CaptureSlot],
    data: &[f32],
    structs: &crate::ir::StructRegistry,
) -> ShadeResult<Vec<(CaptureTarget, Value)>> {
    let mut out = Vec::with_capacity(slots.len());
    for slot in slots {
        let count = slot.ty.component_count(structs)?;
        let start = slot.offset as usize;
        let comps = data.get(start..start + count).ok_or_else(|| {
            ShadeError::Resource(format!(
                "capture buffer too small: slot at {start} needs {count} scalars, have {}",
                data.len()
            ))
        })?;
        out.push((
            slot.target.clone(),
            Value::from_components(&slot.ty, comps, structs)?,
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::validate;
    use serde_json::json;

    /// cpu entry: res = float3(10,20,30); return res.
    fn host_doc() -> IrDocument {
        serde_json::from_value(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "localVars": [{"id": "res", "dataType": "float3"}],
                "nodes": [
                    {"id": "v", "op": "float3", "x": 10.0, "y": 20.0, "z": 30.0},
                    {"id": "set", "op": "var_set", "var": "res"},
                    {"id": "ret", "op": "func_return", "value": "res"}
                ],
                "edges": [
                    {"from": "v", "portOut": "result", "to": "set", "portIn": "value", "type": "data"},
                    {"from": "set", "portOut": "exec_out", "to": "ret", "portIn": "exec_in", "type": "execution"}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_kernel_renamed_and_flipped() {
        let out = force_gpu(&host_doc()).unwrap();
        assert_eq!(out.kernel_id, "_gpu_kernel_main");
        assert_eq!(out.doc.entry_point, out.trampoline_id);
        let kernel = out.doc.function("_gpu_kernel_main").unwrap();
        assert_eq!(kernel.kind, FunctionKind::Shader);
        assert!(out.doc.function("main").is_err());
    }

    #[test]
    fn test_capture_slots_cover_var_and_return() {
        let out = force_gpu(&host_doc()).unwrap();
        assert_eq!(out.slots.len(), 2);
        assert_eq!(
            out.slots[0],
            CaptureSlot {
                target: CaptureTarget::Var("res".to_string()),
                offset: 0,
                ty: ValueType::Float3,
            }
        );
        assert_eq!(out.slots[1].target, CaptureTarget::Return);
        assert_eq!(out.slots[1].offset, 3);
        assert_eq!(out.slots[1].ty, ValueType::Float3);

        let capture = out.doc.resource(CAPTURE_BUFFER_ID).unwrap();
        assert_eq!(capture.size, ResourceSize::Elements(6));
        assert_eq!(capture.persistence, Persistence::CpuAccess);
    }

    #[test]
    fn test_rewritten_document_still_validates() {
        let out = force_gpu(&host_doc()).unwrap();
        let diags = validate::validate(&out.doc);
        let errors: Vec<_> = diags
            .iter()
            .filter(|d| d.severity == crate::core::error::Severity::Error)
            .collect();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_exec_chain_splice_order() {
        let out = force_gpu(&host_doc()).unwrap();
        let kernel = out.doc.function("_gpu_kernel_main").unwrap();
        // set -> capture stores -> ... -> stores-before-return -> ret.
        let after_set = kernel.exec_edge_from("set", ops::EXEC_OUT).unwrap();
        assert!(after_set.to.starts_with("_cap0"), "got {}", after_set.to);
        // The return node now has an execution predecessor that is a
        // capture store.
        let into_ret: Vec<_> = kernel
            .edges
            .iter()
            .filter(|e| e.kind == crate::ir::EdgeKind::Execution && e.to == "ret")
            .collect();
        assert_eq!(into_ret.len(), 1);
        assert!(into_ret[0].from.starts_with("_cap1"));
        // func_return stays last: it has no outgoing execution edges.
        assert!(kernel.exec_edge_from("ret", ops::EXEC_OUT).is_none());
    }

    #[test]
    fn test_trampoline_shape() {
        let out = force_gpu(&host_doc()).unwrap();
        let tramp = out.doc.function(&out.trampoline_id).unwrap();
        assert_eq!(tramp.kind, FunctionKind::Cpu);
        let dispatch = tramp.node("dispatch").unwrap();
        assert_eq!(dispatch.arg_str("func"), Some("_gpu_kernel_main"));
        assert_eq!(dispatch.arg("dispatch"), Some(&json!([1, 1, 1])));
        // sync/wait pairs for every resource, capture buffer included.
        assert!(tramp
            .node(&format!("sync_{CAPTURE_BUFFER_ID}"))
            .is_ok());
        assert!(tramp
            .node(&format!("wait_{CAPTURE_BUFFER_ID}"))
            .is_ok());
    }

    #[test]
    fn test_read_captures_roundtrip() {
        let out = force_gpu(&host_doc()).unwrap();
        let data = [10.0, 20.0, 30.0, 10.0, 20.0, 30.0];
        let captured =
            read_captures(&out.slots, &data, &out.doc.struct_registry()).unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(
            captured[0],
            (
                CaptureTarget::Var("res".to_string()),
                Value::Vector(vec![10.0, 20.0, 30.0])
            )
        );
        assert_eq!(
            captured[1],
            (CaptureTarget::Return, Value::Vector(vec![10.0, 20.0, 30.0]))
        );
    }

    #[test]
    fn test_inline_swizzle_adjusts_slot_type() {
        // return "v.xy" captures two scalars, not three.
        let doc: IrDocument = serde_json::from_value(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "nodes": [
                    {"id": "v", "op": "float3", "x": 1.0, "y": 2.0, "z": 3.0},
                    {"id": "ret", "op": "func_return", "value": "v.xy"}
                ],
                "edges": []
            }]
        }))
        .unwrap();
        let out = force_gpu(&doc).unwrap();
        assert_eq!(out.slots.len(), 1);
        assert_eq!(out.slots[0].ty, ValueType::Float2);
        assert_eq!(
            out.doc.resource(CAPTURE_BUFFER_ID).unwrap().size,
            ResourceSize::Elements(2)
        );
    }
}
