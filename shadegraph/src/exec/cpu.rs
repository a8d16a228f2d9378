//! Host-side lowering and execution.
//!
//! The CPU backend lowers a function into an executable walk over its
//! execution graph: locals become frame variables, pure nodes are
//! evaluated on demand and memoized per invocation, branches map to
//! native `if`/`else` and loops to counted iteration. All side-effect
//! ops route through an [`EffectHost`] façade so the same walk drives
//! both CPU-only evaluation and host graphs that dispatch GPU kernels;
//! every call site that may reach the GPU suspends.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::value::Value;
use crate::exec::context::{BuiltinValues, EvaluationContext};
use crate::exec::Backend;
use crate::ir::{Function, IrDocument, Node, ResourceSize, StructRegistry};
use crate::ops;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::pin::Pin;

/// A boxed, non-`Send` future; execution is single-threaded with
/// cooperative suspension at GPU boundaries.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Side-effect façade the execution walk routes through.
pub(crate) trait EffectHost {
    /// Runs `func_id` for the requested invocation counts.
    fn dispatch<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        func_id: &'a str,
        dispatch: [u32; 3],
        args: FxHashMap<String, Value>,
    ) -> BoxFuture<'a, ShadeResult<()>>;

    /// Executes a draw command.
    fn draw<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        node: &'a Node,
    ) -> BoxFuture<'a, ShadeResult<()>>;

    /// Begins reading a resource back to the host.
    fn sync_to_cpu<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        resource: &'a str,
    ) -> BoxFuture<'a, ShadeResult<()>>;

    /// Completes a pending readback.
    fn wait_cpu_sync<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        resource: &'a str,
    ) -> BoxFuture<'a, ShadeResult<()>>;
}

/// Per-invocation execution state.
struct ExecState {
    memo: FxHashMap<String, Value>,
    loops: Vec<(String, i32)>,
    returned: bool,
}

/// Runs one function invocation. Pushes a frame and leaves it on the
/// stack; callers that need it gone pop it afterwards.
pub(crate) fn run_function<'a>(
    ctx: &'a mut EvaluationContext,
    host: &'a dyn EffectHost,
    fn_id: &'a str,
    args: FxHashMap<String, Value>,
) -> BoxFuture<'a, ShadeResult<()>> {
    Box::pin(async move {
        let func = ctx.doc.function(fn_id)?.clone();
        ctx.push_frame(fn_id, args)?;
        ctx.result = None;
        let structs = ctx.structs.clone();
        let mut state = ExecState {
            memo: FxHashMap::default(),
            loops: Vec::new(),
            returned: false,
        };
        let roots: Vec<String> = func
            .nodes
            .iter()
            .filter(|n| ops::is_executable(&n.op) && !func.has_exec_predecessor(&n.id))
            .map(|n| n.id.clone())
            .collect();
        for root in roots {
            exec_chain(&mut *ctx, host, &func, &structs, &mut state, root).await?;
            if state.returned {
                break;
            }
        }
        Ok(())
    })
}

fn next_exec(func: &Function, id: &str, port: &str) -> Option<String> {
    func.exec_edge_from(id, port).map(|e| e.to.clone())
}

fn exec_chain<'a>(
    ctx: &'a mut EvaluationContext,
    host: &'a dyn EffectHost,
    func: &'a Function,
    structs: &'a StructRegistry,
    state: &'a mut ExecState,
    start: String,
) -> BoxFuture<'a, ShadeResult<()>> {
    Box::pin(async move {
        let mut current = Some(start);
        while let Some(id) = current {
            if state.returned {
                break;
            }
            let node = func.node(&id)?.clone();
            match node.op.as_str() {
                "var_set" => {
                    let value = eval_input(ctx, func, structs, state, &node, "value")?;
                    let var = node.require_str("var")?;
                    ctx.set_var(var, value);
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                "buffer_store" => {
                    let buffer = node.require_str("buffer")?.to_string();
                    let index =
                        eval_input(ctx, func, structs, state, &node, "index")?.as_index()?;
                    let value = eval_input(ctx, func, structs, state, &node, "value")?;
                    ctx.buffer_store(&buffer, index, &value)?;
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                "texture_store" => {
                    let texture = node.require_str("texture")?.to_string();
                    let coord =
                        eval_input(ctx, func, structs, state, &node, "coord")?.components()?;
                    let value = eval_input(ctx, func, structs, state, &node, "value")?;
                    if coord.len() < 2 {
                        return Err(ShadeError::Resource(
                            "texture_store expects a 2-component coordinate".to_string(),
                        ));
                    }
                    ctx.texture_store(&texture, coord[0] as usize, coord[1] as usize, &value)?;
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                "func_return" => {
                    let value = eval_input_opt(ctx, func, structs, state, &node, "value")?;
                    ctx.result = value;
                    state.returned = true;
                    current = None;
                }
                "flow_branch" => {
                    let cond =
                        eval_input(ctx, func, structs, state, &node, "cond")?.as_f32()?;
                    let port = if cond != 0.0 {
                        ops::EXEC_TRUE
                    } else {
                        ops::EXEC_FALSE
                    };
                    if let Some(arm) = next_exec(func, &id, port) {
                        let saved = state.memo.clone();
                        exec_chain(&mut *ctx, host, func, structs, &mut *state, arm).await?;
                        state.memo = saved;
                    }
                    current = None;
                }
                "flow_loop" => {
                    let start_v =
                        eval_input(ctx, func, structs, state, &node, "start")?.as_f32()? as i32;
                    let end_v =
                        eval_input(ctx, func, structs, state, &node, "end")?.as_f32()? as i32;
                    if let Some(body) = next_exec(func, &id, ops::EXEC_BODY) {
                        for i in start_v..end_v {
                            state.loops.push((id.clone(), i));
                            let saved = state.memo.clone();
                            exec_chain(&mut *ctx, host, func, structs, &mut *state, body.clone())
                                .await?;
                            state.memo = saved;
                            state.loops.pop();
                            if state.returned {
                                break;
                            }
                        }
                    }
                    current = next_exec(func, &id, ops::EXEC_COMPLETED);
                }
                "call_func" => {
                    let callee_id = node.require_str("func")?.to_string();
                    let callee = ctx.doc.function(&callee_id)?.clone();
                    let mut args = FxHashMap::default();
                    for port in &callee.inputs {
                        if let Some(v) =
                            eval_input_opt(ctx, func, structs, state, &node, &port.id)?
                        {
                            args.insert(port.id.clone(), v);
                        }
                    }
                    let saved_result = ctx.result.take();
                    run_function(&mut *ctx, host, &callee_id, args).await?;
                    ctx.pop_frame();
                    if let Some(v) = ctx.result.take() {
                        state.memo.insert(id.clone(), v);
                    }
                    ctx.result = saved_result;
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                "cmd_dispatch" => {
                    let target = node.require_str("func")?.to_string();
                    let dispatch = dispatch_counts(ctx, func, structs, state, &node)?;
                    let callee = ctx.doc.function(&target)?.clone();
                    let mut args = FxHashMap::default();
                    for port in &callee.inputs {
                        if let Some(v) =
                            eval_input_opt(ctx, func, structs, state, &node, &port.id)?
                        {
                            args.insert(port.id.clone(), v);
                        }
                    }
                    log::debug!("dispatch '{target}' x{dispatch:?}");
                    host.dispatch(&mut *ctx, &target, dispatch, args).await?;
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                "cmd_draw" => {
                    host.draw(&mut *ctx, &node).await?;
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                "cmd_resize_resource" => {
                    let resource = node.require_str("resource")?.to_string();
                    let size =
                        eval_input(ctx, func, structs, state, &node, "size")?.components()?;
                    let new_size = match size.len() {
                        1 => ResourceSize::Elements(size[0] as u64),
                        _ => ResourceSize::Texture2d([size[0] as u32, size[1] as u32]),
                    };
                    ctx.resize_resource(&resource, new_size)?;
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                "cmd_sync_to_cpu" => {
                    let resource = node.require_str("resource")?.to_string();
                    host.sync_to_cpu(&mut *ctx, &resource).await?;
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                "cmd_wait_cpu_sync" => {
                    let resource = node.require_str("resource")?.to_string();
                    host.wait_cpu_sync(&mut *ctx, &resource).await?;
                    current = next_exec(func, &id, ops::EXEC_OUT);
                }
                other => {
                    return Err(ShadeError::Unsupported(format!(
                        "op '{other}' is not executable"
                    )))
                }
            }
        }
        Ok(())
    })
}

fn dispatch_counts(
    ctx: &mut EvaluationContext,
    func: &Function,
    structs: &StructRegistry,
    state: &mut ExecState,
    node: &Node,
) -> ShadeResult<[u32; 3]> {
    let value = eval_input_opt(ctx, func, structs, state, node, "dispatch")?;
    Ok(match value {
        Some(v) => {
            let comps = v.components()?;
            [
                comps.first().copied().unwrap_or(1.0) as u32,
                comps.get(1).copied().unwrap_or(1.0) as u32,
                comps.get(2).copied().unwrap_or(1.0) as u32,
            ]
        }
        None => [1, 1, 1],
    })
}

fn eval_input(
    ctx: &mut EvaluationContext,
    func: &Function,
    structs: &StructRegistry,
    state: &mut ExecState,
    node: &Node,
    port: &str,
) -> ShadeResult<Value> {
    Evaluator {
        ctx,
        func,
        structs,
        state,
    }
    .input_value(node, port)
}

fn eval_input_opt(
    ctx: &mut EvaluationContext,
    func: &Function,
    structs: &StructRegistry,
    state: &mut ExecState,
    node: &Node,
    port: &str,
) -> ShadeResult<Option<Value>> {
    Evaluator {
        ctx,
        func,
        structs,
        state,
    }
    .input_value_opt(node, port)
}

/// Lazy, memoized data-flow evaluation within one invocation.
struct Evaluator<'e> {
    ctx: &'e mut EvaluationContext,
    func: &'e Function,
    structs: &'e StructRegistry,
    state: &'e mut ExecState,
}

impl<'e> Evaluator<'e> {
    fn input_value(&mut self, node: &Node, port: &str) -> ShadeResult<Value> {
        self.input_value_opt(node, port)?.ok_or_else(|| {
            ShadeError::TypeInference {
                node: node.id.clone(),
                port: port.to_string(),
                message: "no data edge and no literal".to_string(),
            }
        })
    }

    fn input_value_opt(&mut self, node: &Node, port: &str) -> ShadeResult<Option<Value>> {
        if let Some(edge) = self.func.data_edge_to(&node.id, port) {
            let from = edge.from.clone();
            return Ok(Some(self.ref_value(&from)?));
        }
        match node.arg(port) {
            Some(serde_json::Value::String(reference)) => {
                let reference = reference.clone();
                Ok(Some(self.ref_value(&reference)?))
            }
            Some(literal) => Ok(Some(Value::from_json(literal, None)?)),
            None => Ok(None),
        }
    }

    /// Resolves a node-or-variable reference with an optional inline
    /// swizzle suffix.
    fn ref_value(&mut self, reference: &str) -> ShadeResult<Value> {
        let (base, suffix) = crate::ir::split_swizzle_suffix(reference);
        let base_value = if self
            .ctx
            .stack
            .last()
            .is_some_and(|f| f.vars.contains_key(base))
        {
            self.ctx.get_var(base)?
        } else if self.func.nodes.iter().any(|n| n.id == base) {
            self.node_value(base)?
        } else {
            self.ctx.get_var(base)?
        };
        match suffix {
            Some(s) => ops::eval::swizzle(&base_value, s),
            None => Ok(base_value),
        }
    }

    fn node_value(&mut self, id: &str) -> ShadeResult<Value> {
        if let Some(v) = self.state.memo.get(id) {
            return Ok(v.clone());
        }
        let node = self.func.node(id)?.clone();
        let value = self.compute(&node)?;
        self.state.memo.insert(id.to_string(), value.clone());
        Ok(value)
    }

    fn compute(&mut self, node: &Node) -> ShadeResult<Value> {
        match node.op.as_str() {
            "var_get" => {
                let var = node.require_str("var")?.to_string();
                self.ref_value(&var)
            }
            "buffer_load" => {
                let buffer = node.require_str("buffer")?.to_string();
                let index = self.input_value(node, "index")?.as_index()?;
                self.ctx.buffer_load(&buffer, index)
            }
            "texture_load" => {
                let texture = node.require_str("texture")?.to_string();
                let coord = self.input_value(node, "coord")?.components()?;
                if coord.len() < 2 {
                    return Err(ShadeError::Resource(
                        "texture_load expects a 2-component coordinate".to_string(),
                    ));
                }
                self.ctx
                    .texture_load(&texture, coord[0] as usize, coord[1] as usize)
            }
            "builtin_get" => {
                let name = node.require_str("name")?;
                let (_, gpu_only) = ops::builtin_type(name)
                    .ok_or_else(|| ShadeError::unknown("builtin", name))?;
                if gpu_only {
                    return Err(ShadeError::BuiltinMisuse(name.to_string()));
                }
                let v = self
                    .ctx
                    .builtins
                    .get(name)
                    .ok_or_else(|| ShadeError::unknown("builtin", name))?;
                Ok(Value::Float(v))
            }
            "loop_index" => {
                let found = match node.arg_str("loop") {
                    Some(loop_id) => self
                        .state
                        .loops
                        .iter()
                        .rev()
                        .find(|(id, _)| id == loop_id)
                        .map(|(_, i)| *i),
                    None => self.state.loops.last().map(|(_, i)| *i),
                };
                found.map(Value::Int).ok_or_else(|| {
                    ShadeError::Resource(format!(
                        "loop_index node '{}' is not inside a loop body",
                        node.id
                    ))
                })
            }
            "call_func" => Err(ShadeError::Resource(format!(
                "call_func node '{}' was read before it executed",
                node.id
            ))),
            _ => {
                let structs = self.structs;
                let node = node.clone();
                let mut inputs = NodeInputs {
                    ev: self,
                    node: &node,
                };
                ops::eval::apply(&node, &mut inputs, structs)
            }
        }
    }
}

/// Adapts the evaluator to the op library's input resolver.
struct NodeInputs<'x, 'e> {
    ev: &'x mut Evaluator<'e>,
    node: &'x Node,
}

impl ops::eval::Inputs for NodeInputs<'_, '_> {
    fn value(&mut self, port: &str) -> ShadeResult<Value> {
        self.ev.input_value(self.node, port)
    }

    fn value_opt(&mut self, port: &str) -> ShadeResult<Option<Value>> {
        self.ev.input_value_opt(self.node, port)
    }

    fn channel_groups(&mut self) -> ShadeResult<Vec<(String, Value)>> {
        let mut groups: Vec<String> = Vec::new();
        for edge in self.ev.func.data_edges_to(&self.node.id) {
            if ops::is_channel_group(&edge.port_in) {
                groups.push(edge.port_in.clone());
            }
        }
        for key in self.node.args.keys() {
            if ops::is_channel_group(key) && !groups.contains(key) {
                groups.push(key.clone());
            }
        }
        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
            let value = self.ev.input_value(self.node, &group)?;
            out.push((group, value));
        }
        Ok(out)
    }
}

/// The CPU-only effect host: dispatch runs the target function once per
/// requested invocation, sync is a no-op because host data is already
/// authoritative, draw has no CPU counterpart.
pub(crate) struct CpuHost;

impl EffectHost for CpuHost {
    fn dispatch<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        func_id: &'a str,
        dispatch: [u32; 3],
        args: FxHashMap<String, Value>,
    ) -> BoxFuture<'a, ShadeResult<()>> {
        Box::pin(async move {
            let total = dispatch.iter().product::<u32>().max(1);
            let caller_result = ctx.result.take();
            for _ in 0..total {
                run_function(&mut *ctx, self, func_id, args.clone()).await?;
                ctx.pop_frame();
            }
            ctx.result = caller_result;
            Ok(())
        })
    }

    fn draw<'a>(
        &'a self,
        _ctx: &'a mut EvaluationContext,
        _node: &'a Node,
    ) -> BoxFuture<'a, ShadeResult<()>> {
        Box::pin(async move {
            Err(ShadeError::Unsupported(
                "cmd_draw is not available on the CPU backend".to_string(),
            ))
        })
    }

    fn sync_to_cpu<'a>(
        &'a self,
        _ctx: &'a mut EvaluationContext,
        _resource: &'a str,
    ) -> BoxFuture<'a, ShadeResult<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn wait_cpu_sync<'a>(
        &'a self,
        _ctx: &'a mut EvaluationContext,
        _resource: &'a str,
    ) -> BoxFuture<'a, ShadeResult<()>> {
        Box::pin(async move { Ok(()) })
    }
}

/// Executes IR host-side; also the conformance oracle for GPU runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    /// Creates a CPU backend.
    pub fn new() -> CpuBackend {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    fn create_context(
        &self,
        doc: &IrDocument,
        inputs: Option<FxHashMap<String, Value>>,
        builtins: Option<BuiltinValues>,
    ) -> ShadeResult<EvaluationContext> {
        EvaluationContext::new(doc, inputs, builtins)
    }

    async fn run(&self, ctx: &mut EvaluationContext, entry_point: &str) -> ShadeResult<()> {
        run_function(ctx, &CpuHost, entry_point, FxHashMap::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(doc_json: serde_json::Value) -> EvaluationContext {
        let doc: IrDocument = serde_json::from_value(doc_json).unwrap();
        let backend = CpuBackend::new();
        pollster::block_on(backend.execute(&doc, &doc.entry_point.clone(), None, None)).unwrap()
    }

    fn buffer_data(ctx: &EvaluationContext, id: &str) -> Vec<f32> {
        ctx.get_resource(id).unwrap().data.clone()
    }

    #[test]
    fn test_var_set_sequence_matches_paper_semantics() {
        let ctx = run(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "localVars": [
                    {"id": "a", "dataType": "float"},
                    {"id": "b", "dataType": "float"}
                ],
                "nodes": [
                    {"id": "s1", "op": "var_set", "var": "a", "value": 2.0},
                    {"id": "sum", "op": "math_add", "a": "a", "b": 3.0},
                    {"id": "s2", "op": "var_set", "var": "b"},
                    {"id": "s3", "op": "var_set", "var": "a", "value": 7.0}
                ],
                "edges": [
                    {"from": "sum", "portOut": "result", "to": "s2", "portIn": "value", "type": "data"},
                    {"from": "s1", "portOut": "exec_out", "to": "s2", "portIn": "exec_in", "type": "execution"},
                    {"from": "s2", "portOut": "exec_out", "to": "s3", "portIn": "exec_in", "type": "execution"}
                ]
            }]
        }));
        assert_eq!(ctx.get_var("a").unwrap(), Value::Float(7.0));
        assert_eq!(ctx.get_var("b").unwrap(), Value::Float(5.0));
    }

    #[test]
    fn test_swizzle_chain_scenarios() {
        // float4(1,2,3,4).wzyx stored scalar-wise -> [4,3,2,1]
        let ctx = run(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "nodes": [
                    {"id": "v", "op": "float4", "x": 1.0, "y": 2.0, "z": 3.0, "w": 4.0},
                    {"id": "st0", "op": "buffer_store", "buffer": "b_result", "index": 0, "value": "v.w"},
                    {"id": "st1", "op": "buffer_store", "buffer": "b_result", "index": 1, "value": "v.z"},
                    {"id": "st2", "op": "buffer_store", "buffer": "b_result", "index": 2, "value": "v.y"},
                    {"id": "st3", "op": "buffer_store", "buffer": "b_result", "index": 3, "value": "v.x"}
                ],
                "edges": [
                    {"from": "st0", "portOut": "exec_out", "to": "st1", "portIn": "exec_in", "type": "execution"},
                    {"from": "st1", "portOut": "exec_out", "to": "st2", "portIn": "exec_in", "type": "execution"},
                    {"from": "st2", "portOut": "exec_out", "to": "st3", "portIn": "exec_in", "type": "execution"}
                ]
            }],
            "resources": [
                {"id": "b_result", "type": "buffer", "dataType": "float", "size": 4}
            ]
        }));
        assert_eq!(buffer_data(&ctx, "b_result"), vec![4.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_swizzle_expansion_yxy() {
        // float2(1,2).yxy -> [2,1,2]
        let ctx = run(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "nodes": [
                    {"id": "v", "op": "float2", "x": 1.0, "y": 2.0},
                    {"id": "sw", "op": "vec_swizzle", "channels": "yxy"},
                    {"id": "st0", "op": "buffer_store", "buffer": "b_result", "index": 0, "value": "sw.x"},
                    {"id": "st1", "op": "buffer_store", "buffer": "b_result", "index": 1, "value": "sw.y"},
                    {"id": "st2", "op": "buffer_store", "buffer": "b_result", "index": 2, "value": "sw.z"}
                ],
                "edges": [
                    {"from": "v", "portOut": "result", "to": "sw", "portIn": "vec", "type": "data"},
                    {"from": "st0", "portOut": "exec_out", "to": "st1", "portIn": "exec_in", "type": "execution"},
                    {"from": "st1", "portOut": "exec_out", "to": "st2", "portIn": "exec_in", "type": "execution"}
                ]
            }],
            "resources": [
                {"id": "b_result", "type": "buffer", "dataType": "float", "size": 3}
            ]
        }));
        assert_eq!(buffer_data(&ctx, "b_result"), vec![2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_flexible_constructor_with_inline_swizzle() {
        // c: float4 = (0.2, 0.4, 0.6, 1.0); float3{xy: c.xy, z: 1.0}
        let ctx = run(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "localVars": [
                    {"id": "c", "dataType": "float4", "initialValue": [0.2, 0.4, 0.6, 1.0]}
                ],
                "nodes": [
                    {"id": "ctor", "op": "float3", "xy": "c.xy", "z": 1.0},
                    {"id": "ret", "op": "func_return"}
                ],
                "edges": [
                    {"from": "ctor", "portOut": "result", "to": "ret", "portIn": "value", "type": "data"}
                ]
            }]
        }));
        let Value::Vector(v) = ctx.result.clone().unwrap() else {
            panic!("expected a vector result");
        };
        for (got, want) in v.iter().zip([0.2, 0.4, 1.0]) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gpu_builtin_on_cpu_reports_exact_diagnostic() {
        let doc: IrDocument = serde_json::from_value(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "nodes": [
                    {"id": "gid", "op": "builtin_get", "name": "global_invocation_id"},
                    {"id": "set", "op": "var_set", "var": "x"}
                ],
                "edges": [
                    {"from": "gid", "portOut": "result", "to": "set", "portIn": "value", "type": "data"}
                ]
            }]
        }))
        .unwrap();
        let backend = CpuBackend::new();
        let err =
            pollster::block_on(backend.execute(&doc, "main", None, None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "GPU Built-in 'global_invocation_id' is not available in CPU context"
        );
    }

    #[test]
    fn test_branch_takes_one_arm() {
        let ctx = run(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "localVars": [{"id": "out", "dataType": "float"}],
                "nodes": [
                    {"id": "cmp", "op": "math_lt", "a": 1.0, "b": 2.0},
                    {"id": "br", "op": "flow_branch"},
                    {"id": "yes", "op": "var_set", "var": "out", "value": 10.0},
                    {"id": "no", "op": "var_set", "var": "out", "value": 20.0}
                ],
                "edges": [
                    {"from": "cmp", "portOut": "result", "to": "br", "portIn": "cond", "type": "data"},
                    {"from": "br", "portOut": "exec_true", "to": "yes", "portIn": "exec_in", "type": "execution"},
                    {"from": "br", "portOut": "exec_false", "to": "no", "portIn": "exec_in", "type": "execution"}
                ]
            }]
        }));
        assert_eq!(ctx.get_var("out").unwrap(), Value::Float(10.0));
    }

    #[test]
    fn test_loop_accumulates_with_loop_index() {
        // out[i] = i * 2 for i in 0..4, then a completion marker.
        let ctx = run(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "localVars": [{"id": "done", "dataType": "float"}],
                "nodes": [
                    {"id": "lp", "op": "flow_loop", "start": 0.0, "end": 4.0},
                    {"id": "idx", "op": "loop_index"},
                    {"id": "dbl", "op": "math_mul", "b": 2.0},
                    {"id": "st", "op": "buffer_store", "buffer": "b_out"},
                    {"id": "fin", "op": "var_set", "var": "done", "value": 1.0}
                ],
                "edges": [
                    {"from": "idx", "portOut": "result", "to": "dbl", "portIn": "a", "type": "data"},
                    {"from": "idx", "portOut": "result", "to": "st", "portIn": "index", "type": "data"},
                    {"from": "dbl", "portOut": "result", "to": "st", "portIn": "value", "type": "data"},
                    {"from": "lp", "portOut": "exec_body", "to": "st", "portIn": "exec_in", "type": "execution"},
                    {"from": "lp", "portOut": "exec_completed", "to": "fin", "portIn": "exec_in", "type": "execution"}
                ]
            }],
            "resources": [
                {"id": "b_out", "type": "buffer", "dataType": "float", "size": 4}
            ]
        }));
        assert_eq!(buffer_data(&ctx, "b_out"), vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(ctx.get_var("done").unwrap(), Value::Float(1.0));
    }

    #[test]
    fn test_call_func_returns_value() {
        let ctx = run(json!({
            "entryPoint": "main",
            "functions": [
                {
                    "id": "double",
                    "type": "cpu",
                    "inputs": [{"id": "x", "dataType": "float"}],
                    "outputs": [{"id": "out", "dataType": "float"}],
                    "nodes": [
                        {"id": "m", "op": "math_mul", "a": "x", "b": 2.0},
                        {"id": "r", "op": "func_return"}
                    ],
                    "edges": [
                        {"from": "m", "portOut": "result", "to": "r", "portIn": "value", "type": "data"}
                    ]
                },
                {
                    "id": "main",
                    "type": "cpu",
                    "localVars": [{"id": "y", "dataType": "float"}],
                    "nodes": [
                        {"id": "call", "op": "call_func", "func": "double", "x": 21.0},
                        {"id": "set", "op": "var_set", "var": "y"}
                    ],
                    "edges": [
                        {"from": "call", "portOut": "result", "to": "set", "portIn": "value", "type": "data"},
                        {"from": "call", "portOut": "exec_out", "to": "set", "portIn": "exec_in", "type": "execution"}
                    ]
                }
            ]
        }));
        assert_eq!(ctx.get_var("y").unwrap(), Value::Float(42.0));
    }

    #[test]
    fn test_cpu_dispatch_runs_target() {
        // The kernel writes a constant; the host dispatches then syncs.
        let ctx = run(json!({
            "entryPoint": "main",
            "functions": [
                {
                    "id": "kernel",
                    "type": "shader",
                    "nodes": [
                        {"id": "st", "op": "buffer_store", "buffer": "b_out", "index": 0, "value": 5.0}
                    ],
                    "edges": []
                },
                {
                    "id": "main",
                    "type": "cpu",
                    "nodes": [
                        {"id": "d", "op": "cmd_dispatch", "func": "kernel", "dispatch": [1, 1, 1]},
                        {"id": "s", "op": "cmd_sync_to_cpu", "resource": "b_out"},
                        {"id": "w", "op": "cmd_wait_cpu_sync", "resource": "b_out"}
                    ],
                    "edges": [
                        {"from": "d", "portOut": "exec_out", "to": "s", "portIn": "exec_in", "type": "execution"},
                        {"from": "s", "portOut": "exec_out", "to": "w", "portIn": "exec_in", "type": "execution"}
                    ]
                }
            ],
            "resources": [
                {"id": "b_out", "type": "buffer", "dataType": "float", "size": 1}
            ]
        }));
        assert_eq!(buffer_data(&ctx, "b_out"), vec![5.0]);
    }

    #[test]
    fn test_oob_store_propagates_with_buffer_name() {
        let doc: IrDocument = serde_json::from_value(json!({
            "entryPoint": "main",
            "functions": [{
                "id": "main",
                "type": "cpu",
                "nodes": [
                    {"id": "st", "op": "buffer_store", "buffer": "b_small", "index": 8.0, "value": 1.0}
                ]
            }],
            "resources": [
                {"id": "b_small", "type": "buffer", "dataType": "float", "size": 2}
            ]
        }))
        .unwrap();
        let backend = CpuBackend::new();
        let err =
            pollster::block_on(backend.execute(&doc, "main", None, None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "buffer 'b_small' index 8 out of bounds (size 2)"
        );
    }
}
