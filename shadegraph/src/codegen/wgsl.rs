//! Lowering an IR function to WGSL.
//!
//! The generator emits, in order: a diagnostics pragma, the `GlobalsBuffer`
//! wrapper (when global variables are referenced), the bindings block
//! (globals, packed inputs, each used resource with its typed inner
//! struct), a helper library for intrinsics written in WGSL, and the entry
//! function. Only bindings actually referenced by the lowered function are
//! declared, so the harness can reconstruct the bind group from the source
//! text alone.
//!
//! Executable nodes are visited at most once per path. Branch arms each
//! start a fresh visitation set, so nodes reachable from both arms are
//! duplicated rather than shared across the merge point. Pure
//! sub-expressions are materialized once per scope into `let` temporaries
//! through a memoization table keyed by node id.

use crate::codegen::input_layout::InputLayout;
use crate::core::error::{ShadeError, ShadeResult};
use crate::core::types::{parse_swizzle, ValueType};
use crate::ir::infer::{self, literal_type, NodeTypes};
use crate::ir::{
    split_swizzle_suffix, Function, IrDocument, Node, Resource, StructRegistry,
    TextureFormat,
};
use crate::ops;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Default compute workgroup size; reported through [`ShaderMetadata`].
pub const WORKGROUP_SIZE: [u32; 3] = [64, 1, 1];

/// Which entry-point signature to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    /// `@compute @workgroup_size(...)`, takes `global_invocation_id`.
    Compute,
    /// `@vertex`, returns `@builtin(position)`.
    Vertex,
    /// `@fragment`, returns `@location(0)`.
    Fragment,
}

/// Options controlling one generation run.
#[derive(Debug, Clone)]
pub struct ShaderOptions {
    /// Entry-point stage.
    pub stage: ShaderStage,
    /// Reserved binding slot for the globals storage buffer.
    pub global_buffer_binding: Option<u32>,
    /// Binding slot for the packed input buffer.
    pub input_binding: Option<u32>,
    /// Variable id -> scalar offset inside the globals buffer.
    pub var_map: FxHashMap<String, u32>,
    /// Declared type per variable id in `var_map`.
    pub var_types: FxHashMap<String, ValueType>,
    /// Inferred type per node id of the target function.
    pub node_types: NodeTypes,
    /// Resource id -> binding index.
    pub resource_bindings: FxHashMap<String, u32>,
    /// Sampler companion bindings.
    pub sampler_bindings: FxHashMap<String, u32>,
    /// Full resource declarations for typed struct emission.
    pub resource_defs: Vec<Resource>,
}

impl ShaderOptions {
    /// Compute-stage options with no bindings assigned.
    pub fn compute() -> ShaderOptions {
        ShaderOptions {
            stage: ShaderStage::Compute,
            global_buffer_binding: None,
            input_binding: None,
            var_map: FxHashMap::default(),
            var_types: FxHashMap::default(),
            node_types: NodeTypes::default(),
            resource_bindings: FxHashMap::default(),
            sampler_bindings: FxHashMap::default(),
            resource_defs: Vec::new(),
        }
    }
}

/// Declared layout metadata accompanying the source.
#[derive(Debug, Clone)]
pub struct ShaderMetadata {
    /// Packed input buffer layout.
    pub input_layout: InputLayout,
    /// Workgroup size baked into the entry point.
    pub workgroup_size: [u32; 3],
    /// Bindings actually emitted into the source.
    pub resource_bindings: FxHashMap<String, u32>,
}

/// The generator's result.
#[derive(Debug, Clone)]
pub struct ShaderOutput {
    /// WGSL source text.
    pub source: String,
    /// Layout metadata.
    pub metadata: ShaderMetadata,
}

/// Lowers `function_id` of `doc` to WGSL under `options`.
pub fn generate(
    doc: &IrDocument,
    function_id: &str,
    options: &ShaderOptions,
) -> ShadeResult<ShaderOutput> {
    let func = doc.function(function_id)?;
    let structs = doc.struct_registry();
    let node_types = if options.node_types.is_empty() {
        infer::infer_function(doc, func)?
    } else {
        options.node_types.clone()
    };

    let mut gen = Generator {
        doc,
        func,
        opts: options,
        structs: &structs,
        node_types,
        body: String::new(),
        indent: 1,
        memo: FxHashMap::default(),
        temp_count: 0,
        helpers: BTreeSet::new(),
        builtins_used: BTreeSet::new(),
        used_buffers: BTreeSet::new(),
        used_storage_textures: BTreeSet::new(),
        used_sampled_textures: BTreeSet::new(),
        used_globals: BTreeSet::new(),
        used_structs: BTreeSet::new(),
        loop_stack: Vec::new(),
        callees: BTreeMap::new(),
        param_inputs: false,
        inputs_read: false,
    };

    gen.emit_locals()?;
    gen.emit_execution()?;
    let body = std::mem::take(&mut gen.body);
    let source = gen.assemble(&body)?;

    let input_layout = InputLayout::build(&doc.inputs, &structs)?;
    let workgroup_size = match options.stage {
        ShaderStage::Compute => WORKGROUP_SIZE,
        _ => [1, 1, 1],
    };
    let mut emitted = FxHashMap::default();
    for id in gen
        .used_buffers
        .iter()
        .chain(gen.used_storage_textures.iter())
        .chain(gen.used_sampled_textures.iter())
    {
        if let Some(binding) = options.resource_bindings.get(id) {
            emitted.insert(id.clone(), *binding);
        }
    }

    log::trace!("generated WGSL for '{function_id}':\n{source}");

    Ok(ShaderOutput {
        source,
        metadata: ShaderMetadata {
            input_layout,
            workgroup_size,
            resource_bindings: emitted,
        },
    })
}

struct Generator<'a> {
    doc: &'a IrDocument,
    func: &'a Function,
    opts: &'a ShaderOptions,
    structs: &'a StructRegistry,
    node_types: NodeTypes,
    body: String,
    indent: usize,
    memo: FxHashMap<String, String>,
    temp_count: usize,
    helpers: BTreeSet<&'static str>,
    builtins_used: BTreeSet<String>,
    used_buffers: BTreeSet<String>,
    used_storage_textures: BTreeSet<String>,
    used_sampled_textures: BTreeSet<String>,
    used_globals: BTreeSet<String>,
    used_structs: BTreeSet<String>,
    loop_stack: Vec<(String, String)>,
    callees: BTreeMap<String, String>,
    param_inputs: bool,
    inputs_read: bool,
}

impl<'a> Generator<'a> {
    fn stmt(&mut self, line: &str) {
        for _ in 0..self.indent {
            self.body.push_str("    ");
        }
        self.body.push_str(line);
        self.body.push('\n');
    }

    fn fresh_temp(&mut self) -> String {
        let name = format!("_t{}", self.temp_count);
        self.temp_count += 1;
        name
    }

    /// Resource lookup preferring the options' declarations.
    fn resource_def(&self, id: &str) -> ShadeResult<&Resource> {
        if let Some(res) = self.opts.resource_defs.iter().find(|r| r.id == id) {
            return Ok(res);
        }
        self.doc.resource(id)
    }

    fn node_type(&self, id: &str) -> ShadeResult<ValueType> {
        self.node_types
            .get(id)
            .cloned()
            .ok_or_else(|| ShadeError::TypeInference {
                node: id.to_string(),
                port: "result".to_string(),
                message: "node has no inferred type".to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Locals
    // ------------------------------------------------------------------

    fn emit_locals(&mut self) -> ShadeResult<()> {
        for var in &self.func.local_vars {
            let ty = var.value_type()?;
            self.record_struct_use(&ty);
            let init = match &var.initial_value {
                Some(json) => const_expr(json, &ty)?,
                None => format!("{}()", ty.wgsl_name()),
            };
            let line = format!("var v_{}: {} = {init};", var.id, ty.wgsl_name());
            self.stmt(&line);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution graph
    // ------------------------------------------------------------------

    fn emit_execution(&mut self) -> ShadeResult<()> {
        let roots: Vec<String> = self
            .func
            .nodes
            .iter()
            .filter(|n| ops::is_executable(&n.op) && !self.func.has_exec_predecessor(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let mut visited = HashSet::new();
        for root in roots {
            self.emit_chain(&root, &mut visited)?;
        }
        Ok(())
    }

    fn emit_chain(&mut self, start: &str, visited: &mut HashSet<String>) -> ShadeResult<()> {
        let mut current = Some(start.to_string());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                break;
            }
            let node = self.func.node(&id)?.clone();
            match node.op.as_str() {
                "flow_branch" => {
                    self.emit_branch(&node, visited)?;
                    current = self.next_exec(&id, ops::EXEC_OUT);
                }
                "flow_loop" => {
                    self.emit_loop(&node, visited)?;
                    current = self.next_exec(&id, ops::EXEC_COMPLETED);
                }
                "func_return" => {
                    self.emit_return(&node)?;
                    current = None;
                }
                _ => {
                    self.emit_effect(&node)?;
                    current = self.next_exec(&id, ops::EXEC_OUT);
                }
            }
        }
        Ok(())
    }

    fn next_exec(&self, id: &str, port: &str) -> Option<String> {
        self.func.exec_edge_from(id, port).map(|e| e.to.clone())
    }

    fn emit_branch(&mut self, node: &Node, visited: &HashSet<String>) -> ShadeResult<()> {
        let cond = self.input_expr(node, "cond")?;
        self.stmt(&format!("if (f32({cond}) != 0.0) {{"));
        self.indent += 1;
        if let Some(next) = self.next_exec(&node.id, ops::EXEC_TRUE) {
            let mut arm_visited = visited.clone();
            let memo = self.memo.clone();
            self.emit_chain(&next, &mut arm_visited)?;
            self.memo = memo;
        }
        self.indent -= 1;
        self.stmt("} else {");
        self.indent += 1;
        if let Some(next) = self.next_exec(&node.id, ops::EXEC_FALSE) {
            let mut arm_visited = visited.clone();
            let memo = self.memo.clone();
            self.emit_chain(&next, &mut arm_visited)?;
            self.memo = memo;
        }
        self.indent -= 1;
        self.stmt("}");
        Ok(())
    }

    fn emit_loop(&mut self, node: &Node, visited: &mut HashSet<String>) -> ShadeResult<()> {
        let start = self.input_expr(node, "start")?;
        let end = self.input_expr(node, "end")?;
        let var = format!("i_{}", node.id);
        self.stmt(&format!(
            "for (var {var}: i32 = i32({start}); {var} < i32({end}); {var} = {var} + 1) {{"
        ));
        self.indent += 1;
        self.loop_stack.push((node.id.clone(), var));
        if let Some(next) = self.next_exec(&node.id, ops::EXEC_BODY) {
            let memo = self.memo.clone();
            self.emit_chain(&next, visited)?;
            self.memo = memo;
        }
        self.loop_stack.pop();
        self.indent -= 1;
        self.stmt("}");
        Ok(())
    }

    fn emit_return(&mut self, node: &Node) -> ShadeResult<()> {
        match self.opts.stage {
            ShaderStage::Compute => self.stmt("return;"),
            ShaderStage::Vertex | ShaderStage::Fragment => {
                let value = self.input_expr(node, "value")?;
                self.stmt(&format!("return vec4<f32>({value});"));
            }
        }
        Ok(())
    }

    fn emit_effect(&mut self, node: &Node) -> ShadeResult<()> {
        match node.op.as_str() {
            "var_set" => {
                let var = node.require_str("var")?.to_string();
                let value = self.input_expr(node, "value")?;
                if self.func.local_var(&var).is_some() {
                    self.stmt(&format!("v_{var} = {value};"));
                } else if let Some(&offset) = self.opts.var_map.get(&var) {
                    self.emit_global_store(&var, offset, &value)?;
                } else {
                    return Err(ShadeError::unknown("variable", var));
                }
            }
            "buffer_store" => {
                let buffer = node.require_str("buffer")?.to_string();
                let resource = self.resource_def(&buffer)?.clone();
                let index = self.input_expr(node, "index")?;
                let value = self.input_expr(node, "value")?;
                let elem = resource.element_type()?;
                self.record_struct_use(&elem);
                self.used_buffers.insert(buffer.clone());
                let coerced = coerce_to(&elem, &value);
                self.stmt(&format!("{buffer}.data[u32({index})] = {coerced};"));
            }
            "texture_store" => {
                let texture = node.require_str("texture")?.to_string();
                let coord = self.input_expr(node, "coord")?;
                let value = self.input_expr(node, "value")?;
                self.used_storage_textures.insert(texture.clone());
                self.stmt(&format!(
                    "textureStore({texture}, vec2<i32>({coord}), vec4<f32>({value}));"
                ));
            }
            "call_func" => {
                // Evaluated for its memoized result; the callee is pure.
                self.node_expr(&node.id)?;
            }
            other => {
                return Err(ShadeError::Unsupported(format!(
                    "op '{other}' cannot run inside a shader"
                )))
            }
        }
        Ok(())
    }

    fn emit_global_store(&mut self, var: &str, offset: u32, value: &str) -> ShadeResult<()> {
        let ty = self
            .opts
            .var_types
            .get(var)
            .cloned()
            .ok_or_else(|| ShadeError::unknown("variable type for", var))?;
        self.used_globals.insert(var.to_string());
        let count = ty.component_count(self.structs)?;
        if count == 1 {
            self.stmt(&format!("globals.data[{offset}u] = f32({value});"));
            return Ok(());
        }
        let tmp = self.fresh_temp();
        self.stmt(&format!("let {tmp} = {value};"));
        match ty {
            ValueType::Float3x3 | ValueType::Float4x4 => {
                let cols = if ty == ValueType::Float3x3 { 3 } else { 4 };
                for c in 0..cols {
                    for r in 0..cols {
                        let at = offset as usize + c * cols + r;
                        self.stmt(&format!("globals.data[{at}u] = f32({tmp}[{c}][{r}]);"));
                    }
                }
            }
            _ => {
                for i in 0..count {
                    let at = offset as usize + i;
                    self.stmt(&format!("globals.data[{at}u] = f32({tmp}[{i}]);"));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// The expression arriving at `(node, port)`: a data edge's source, a
    /// string reference, or an inline literal under the same key.
    fn input_expr(&mut self, node: &Node, port: &str) -> ShadeResult<String> {
        if let Some(edge) = self.func.data_edge_to(&node.id, port) {
            let from = edge.from.clone();
            return self.ref_expr(&from);
        }
        match node.arg(port) {
            Some(serde_json::Value::String(reference)) => {
                let reference = reference.clone();
                self.ref_expr(&reference)
            }
            Some(literal) => {
                let ty = literal_type(literal, None)?;
                const_expr(literal, &ty)
            }
            None => Err(ShadeError::TypeInference {
                node: node.id.clone(),
                port: port.to_string(),
                message: "no data edge and no literal".to_string(),
            }),
        }
    }

    /// Resolves a reference: node id or variable id plus optional inline
    /// swizzle suffix.
    fn ref_expr(&mut self, reference: &str) -> ShadeResult<String> {
        let (base, suffix) = split_swizzle_suffix(reference);
        let base_expr = self.base_ref_expr(base)?;
        match suffix {
            Some(s) => {
                parse_swizzle(s)?;
                Ok(format!("({base_expr}).{s}"))
            }
            None => Ok(base_expr),
        }
    }

    fn base_ref_expr(&mut self, base: &str) -> ShadeResult<String> {
        if self.func.local_var(base).is_some() {
            return Ok(format!("v_{base}"));
        }
        if self.param_inputs && self.func.inputs.iter().any(|p| p.id == base) {
            return Ok(base.to_string());
        }
        if self.doc.input(base).is_some() {
            if self.opts.input_binding.is_none() {
                return Err(ShadeError::Unsupported(format!(
                    "input '{base}' read without an input binding"
                )));
            }
            self.inputs_read = true;
            return Ok(format!("inputs.{base}"));
        }
        if let Some(&offset) = self.opts.var_map.get(base) {
            return self.global_read_expr(base, offset);
        }
        if self.func.nodes.iter().any(|n| n.id == base) {
            return self.node_expr(base);
        }
        Err(ShadeError::unknown("reference", base))
    }

    fn global_read_expr(&mut self, var: &str, offset: u32) -> ShadeResult<String> {
        let ty = self
            .opts
            .var_types
            .get(var)
            .cloned()
            .ok_or_else(|| ShadeError::unknown("variable type for", var))?;
        self.used_globals.insert(var.to_string());
        let count = ty.component_count(self.structs)?;
        let scalar = |at: usize| format!("globals.data[{at}u]");
        Ok(match count {
            1 => match ty {
                ValueType::Int => format!("i32({})", scalar(offset as usize)),
                ValueType::UInt | ValueType::Bool => format!("u32({})", scalar(offset as usize)),
                _ => scalar(offset as usize),
            },
            _ => {
                let comps: Vec<String> =
                    (0..count).map(|i| scalar(offset as usize + i)).collect();
                match ty {
                    ValueType::Float3x3 => format!("mat3x3<f32>({})", comps.join(", ")),
                    ValueType::Float4x4 => format!("mat4x4<f32>({})", comps.join(", ")),
                    _ => format!("{}({})", ty.wgsl_name(), comps.join(", ")),
                }
            }
        })
    }

    /// Materializes a pure node into a scoped temporary, once per scope.
    fn node_expr(&mut self, id: &str) -> ShadeResult<String> {
        if let Some(expr) = self.memo.get(id) {
            return Ok(expr.clone());
        }
        let node = self.func.node(id)?.clone();
        // array_set mutates a copy, so it needs a `var` temporary.
        if node.op == "array_set" {
            let array = self.input_expr(&node, "array")?;
            let index = self.input_expr(&node, "index")?;
            let value = self.input_expr(&node, "value")?;
            let tmp = self.fresh_temp();
            self.stmt(&format!("var {tmp} = {array};"));
            self.stmt(&format!("{tmp}[u32({index})] = {value};"));
            self.memo.insert(id.to_string(), tmp.clone());
            return Ok(tmp);
        }
        let expr = self.pure_expr(&node)?;
        let tmp = self.fresh_temp();
        self.stmt(&format!("let {tmp} = {expr};"));
        self.memo.insert(id.to_string(), tmp.clone());
        Ok(tmp)
    }

    fn pure_expr(&mut self, node: &Node) -> ShadeResult<String> {
        let op = node.op.as_str();
        if let Some((_, width)) = ops::constructor_target(op) {
            return self.constructor_expr(node, width);
        }
        let infix = |gen: &mut Self, symbol: &str| -> ShadeResult<String> {
            let a = gen.input_expr(node, "a")?;
            let b = gen.input_expr(node, "b")?;
            Ok(format!("({a} {symbol} {b})"))
        };
        let call1 = |gen: &mut Self, name: &str, port: &str| -> ShadeResult<String> {
            let a = gen.input_expr(node, port)?;
            Ok(format!("{name}({a})"))
        };
        let call2 = |gen: &mut Self, name: &str| -> ShadeResult<String> {
            let a = gen.input_expr(node, "a")?;
            let b = gen.input_expr(node, "b")?;
            Ok(format!("{name}({a}, {b})"))
        };
        let compare = |gen: &mut Self, symbol: &str| -> ShadeResult<String> {
            let a = gen.input_expr(node, "a")?;
            let b = gen.input_expr(node, "b")?;
            Ok(format!("select(0.0, 1.0, ({a}) {symbol} ({b}))"))
        };
        match op {
            "literal" => {
                let value = node.arg("value").ok_or_else(|| {
                    ShadeError::Resource(format!("literal node '{}' carries no value", node.id))
                })?;
                let ty = self.node_type(&node.id)?;
                const_expr(value, &ty)
            }
            "float" => call1(self, "f32", "value"),
            "int" => call1(self, "i32", "value"),
            "bool" => {
                let v = self.input_expr(node, "value")?;
                Ok(format!("u32(f32({v}) != 0.0)"))
            }
            "float3x3" => {
                let c0 = self.input_expr(node, "c0")?;
                let c1 = self.input_expr(node, "c1")?;
                let c2 = self.input_expr(node, "c2")?;
                Ok(format!("mat3x3<f32>({c0}, {c1}, {c2})"))
            }
            "float4x4" => {
                let c0 = self.input_expr(node, "c0")?;
                let c1 = self.input_expr(node, "c1")?;
                let c2 = self.input_expr(node, "c2")?;
                let c3 = self.input_expr(node, "c3")?;
                Ok(format!("mat4x4<f32>({c0}, {c1}, {c2}, {c3})"))
            }

            "vec_swizzle" => {
                let channels = node.require_str("channels")?.to_string();
                parse_swizzle(&channels)?;
                let vec = self.input_expr(node, "vec")?;
                Ok(format!("({vec}).{channels}"))
            }
            "vec_get_element" => {
                let vec = self.input_expr(node, "vec")?;
                let index = self.input_expr(node, "index")?;
                Ok(format!("({vec})[u32({index})]"))
            }
            "vec_dot" => call2(self, "dot"),
            "vec_length" => call1(self, "length", "vec"),
            "vec_normalize" => call1(self, "normalize", "vec"),
            "vec_mix" => {
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                let t = self.input_expr(node, "t")?;
                Ok(format!("mix({a}, {b}, {t})"))
            }

            "math_pi" => Ok("3.1415927".to_string()),
            "math_e" => Ok("2.7182817".to_string()),
            "math_add" => infix(self, "+"),
            "math_sub" => infix(self, "-"),
            "math_mul" => infix(self, "*"),
            "math_div" => infix(self, "/"),
            "math_mod" => {
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                Ok(format!("(({a}) - ({b}) * floor(({a}) / ({b})))"))
            }
            "math_mad" => {
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                let c = self.input_expr(node, "c")?;
                Ok(format!("(({a}) * ({b}) + ({c}))"))
            }
            "math_abs" => call1(self, "abs", "a"),
            "math_floor" => call1(self, "floor", "a"),
            "math_ceil" => call1(self, "ceil", "a"),
            "math_fract" => call1(self, "fract", "a"),
            "math_sqrt" => call1(self, "sqrt", "a"),
            "math_exp" => call1(self, "exp", "a"),
            "math_log" => call1(self, "log", "a"),
            "math_sin" => call1(self, "sin", "a"),
            "math_cos" => call1(self, "cos", "a"),
            "math_tan" => call1(self, "tan", "a"),
            "math_tanh" => call1(self, "tanh", "a"),
            "math_atan" => call1(self, "atan", "a"),
            "math_sign" => call1(self, "sign", "a"),
            "math_pow" => call2(self, "pow"),
            "math_min" => call2(self, "min"),
            "math_max" => call2(self, "max"),
            "math_atan2" => call2(self, "atan2"),
            "math_clamp" => {
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                let c = self.input_expr(node, "c")?;
                Ok(format!("clamp({a}, {b}, {c})"))
            }
            "math_mix" => {
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                let c = self.input_expr(node, "c")?;
                Ok(format!("mix({a}, {b}, {c})"))
            }
            "math_lt" => compare(self, "<"),
            "math_gt" => compare(self, ">"),
            "math_le" => compare(self, "<="),
            "math_ge" => compare(self, ">="),
            "math_eq" => compare(self, "=="),
            "math_neq" => compare(self, "!="),
            "math_and" => {
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                Ok(format!(
                    "select(0.0, 1.0, (({a}) != 0.0) && (({b}) != 0.0))"
                ))
            }
            "math_or" => {
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                Ok(format!(
                    "select(0.0, 1.0, (({a}) != 0.0) || (({b}) != 0.0))"
                ))
            }
            "math_xor" => {
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                Ok(format!(
                    "select(0.0, 1.0, (({a}) != 0.0) != (({b}) != 0.0))"
                ))
            }
            "math_not" => {
                let a = self.input_expr(node, "a")?;
                Ok(format!("select(0.0, 1.0, ({a}) == 0.0)"))
            }

            "mat_mul" => infix(self, "*"),
            "mat_extract" => {
                let mat = self.input_expr(node, "mat")?;
                let index = self.input_expr(node, "index")?;
                Ok(format!("({mat})[u32({index})]"))
            }
            "quat_mul" => {
                self.helpers.insert("quat_mul");
                call2(self, "sg_quat_mul")
            }
            "quat_slerp" => {
                self.helpers.insert("quat_slerp");
                let a = self.input_expr(node, "a")?;
                let b = self.input_expr(node, "b")?;
                let t = self.input_expr(node, "t")?;
                Ok(format!("sg_quat_slerp({a}, {b}, {t})"))
            }
            "quat_to_mat4" => {
                self.helpers.insert("quat_to_mat4");
                call1(self, "sg_quat_to_mat4", "quat")
            }
            "color_mix" => {
                self.helpers.insert("color_mix");
                // Port `b` is the source blended over the destination `a`.
                let dst = self.input_expr(node, "a")?;
                let src = self.input_expr(node, "b")?;
                Ok(format!("color_mix({src}, {dst})"))
            }

            "var_get" => {
                let var = node.require_str("var")?.to_string();
                self.ref_expr(&var)
            }
            "buffer_load" => {
                let buffer = node.require_str("buffer")?.to_string();
                self.resource_def(&buffer)?;
                let index = self.input_expr(node, "index")?;
                self.used_buffers.insert(buffer.clone());
                Ok(format!("{buffer}.data[u32({index})]"))
            }
            "texture_load" => {
                let texture = node.require_str("texture")?.to_string();
                let coord = self.input_expr(node, "coord")?;
                if self.used_storage_textures.contains(&texture) {
                    return Err(ShadeError::Unsupported(format!(
                        "texture '{texture}' cannot be both loaded and stored in one shader"
                    )));
                }
                self.used_sampled_textures.insert(texture.clone());
                Ok(format!("textureLoad({texture}, vec2<i32>({coord}), 0)"))
            }

            "array_construct" => {
                let ty = self.node_type(&node.id)?;
                let ValueType::Array(elem, count) = &ty else {
                    return Err(ShadeError::Resource(format!(
                        "array_construct node '{}' has non-array type {ty}",
                        node.id
                    )));
                };
                let mut elems = Vec::with_capacity(*count);
                for i in 0..*count {
                    elems.push(self.input_expr(node, &format!("e{i}"))?);
                }
                Ok(format!(
                    "array<{}, {count}>({})",
                    elem.wgsl_name(),
                    elems.join(", ")
                ))
            }
            "array_extract" => {
                let array = self.input_expr(node, "array")?;
                let index = self.input_expr(node, "index")?;
                Ok(format!("({array})[u32({index})]"))
            }
            "struct_construct" => {
                let name = node.require_str("struct")?.to_string();
                let def = self
                    .structs
                    .get(&name)
                    .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?
                    .clone();
                self.used_structs.insert(name.clone());
                let mut fields = Vec::with_capacity(def.fields.len());
                for field in &def.fields {
                    fields.push(self.input_expr(node, &field.name)?);
                }
                Ok(format!("S_{name}({})", fields.join(", ")))
            }
            "struct_extract" => {
                let field = node.require_str("field")?.to_string();
                let value = self.input_expr(node, "struct")?;
                Ok(format!("({value}).{field}"))
            }

            "static_cast_float" => call1(self, "f32", "value"),
            "static_cast_int" => call1(self, "i32", "value"),
            "static_cast_uint" => call1(self, "u32", "value"),
            "static_cast_bool" => {
                let v = self.input_expr(node, "value")?;
                Ok(format!("u32(f32({v}) != 0.0)"))
            }

            "loop_index" => {
                let name = match node.arg_str("loop") {
                    Some(loop_id) => self
                        .loop_stack
                        .iter()
                        .rev()
                        .find(|(id, _)| id == loop_id)
                        .map(|(_, var)| var.clone()),
                    None => self.loop_stack.last().map(|(_, var)| var.clone()),
                };
                name.ok_or_else(|| {
                    ShadeError::Resource(format!(
                        "loop_index node '{}' is not inside a loop body",
                        node.id
                    ))
                })
            }
            "builtin_get" => {
                let name = node.require_str("name")?.to_string();
                let (_, gpu_only) = ops::builtin_type(&name)
                    .ok_or_else(|| ShadeError::unknown("builtin", name.clone()))?;
                if !gpu_only {
                    return Err(ShadeError::Unsupported(format!(
                        "builtin '{name}' is host-side and not available in shader code"
                    )));
                }
                self.builtins_used.insert(name.clone());
                Ok(match name.as_str() {
                    "global_invocation_id" | "local_invocation_id" | "workgroup_id"
                    | "num_workgroups" => format!("vec3<i32>({name})"),
                    "vertex_index" | "instance_index" | "local_invocation_index" => {
                        format!("i32({name})")
                    }
                    "position" | "frag_coord" => "frag_coord".to_string(),
                    "front_facing" => "u32(front_facing)".to_string(),
                    other => {
                        return Err(ShadeError::unknown("builtin", other));
                    }
                })
            }
            "call_func" => {
                let callee_id = node.require_str("func")?.to_string();
                self.ensure_callee(&callee_id)?;
                let callee = self.doc.function(&callee_id)?.clone();
                let mut args = Vec::with_capacity(callee.inputs.len());
                for port in &callee.inputs {
                    args.push(self.input_expr(node, &port.id)?);
                }
                Ok(format!("fn_{callee_id}({})", args.join(", ")))
            }

            other => Err(ShadeError::Unsupported(format!(
                "op '{other}' has no WGSL lowering"
            ))),
        }
    }

    fn constructor_expr(&mut self, node: &Node, width: usize) -> ShadeResult<String> {
        let ty = self.node_type(&node.id)?;
        // Collect groups from data edges and channel-letter literal keys,
        // ordered by first channel.
        let mut groups: Vec<String> = Vec::new();
        for edge in self.func.data_edges_to(&node.id) {
            if ops::is_channel_group(&edge.port_in) {
                groups.push(edge.port_in.clone());
            }
        }
        for key in node.args.keys() {
            if ops::is_channel_group(key) && !groups.contains(key) {
                groups.push(key.clone());
            }
        }
        groups.sort_by_key(|g| {
            g.chars()
                .next()
                .and_then(crate::core::types::channel_index)
                .unwrap_or(usize::MAX)
        });
        let mut parts = Vec::with_capacity(groups.len());
        for group in &groups {
            let expr = self.input_expr(node, group)?;
            // Broadcast form: a scalar source replicates across its group.
            if group.len() > 1 && self.source_component_count(node, group) == Some(1) {
                parts.push(format!("vec{}<f32>({expr})", group.len()));
            } else {
                parts.push(expr);
            }
        }
        let float_ctor = format!("vec{width}<f32>({})", parts.join(", "));
        Ok(match ty.scalar_kind() {
            crate::core::types::ScalarKind::Int => format!("vec{width}<i32>({float_ctor})"),
            _ => float_ctor,
        })
    }

    /// Best-effort component count of the value feeding `(node, port)`,
    /// used to detect scalar broadcast into a multi-channel group.
    fn source_component_count(&self, node: &Node, port: &str) -> Option<usize> {
        let reference: String = match self.func.data_edge_to(&node.id, port) {
            Some(edge) => edge.from.clone(),
            None => match node.arg(port) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(_)) | Some(serde_json::Value::Bool(_)) => {
                    return Some(1)
                }
                Some(serde_json::Value::Array(items)) => return Some(items.len()),
                _ => return None,
            },
        };
        let (base, suffix) = split_swizzle_suffix(&reference);
        if let Some(s) = suffix {
            return Some(s.len());
        }
        let ty = if let Some(var) = self.func.local_var(base) {
            var.value_type().ok()?
        } else if let Some(input) = self.doc.input(base) {
            input.value_type().ok()?
        } else if let Some(ty) = self.node_types.get(base) {
            ty.clone()
        } else if let Some(ty) = self.opts.var_types.get(base) {
            ty.clone()
        } else {
            return None;
        };
        ty.component_count(self.structs).ok()
    }

    /// Generates a WGSL helper function for a pure expression callee.
    fn ensure_callee(&mut self, callee_id: &str) -> ShadeResult<()> {
        if self.callees.contains_key(callee_id) {
            return Ok(());
        }
        let callee = self.doc.function(callee_id)?;
        let executable: Vec<&Node> = callee
            .nodes
            .iter()
            .filter(|n| ops::is_executable(&n.op))
            .collect();
        if executable.len() != 1 || executable[0].op != "func_return" {
            return Err(ShadeError::Unsupported(format!(
                "function '{callee_id}' is not a pure expression function and cannot be called \
                 from a shader"
            )));
        }
        let ret_node = executable[0].clone();
        let ret_ty = match callee.outputs.first().and_then(|p| p.data_type.as_deref()) {
            Some(tag) => ValueType::parse(tag)?,
            None => ValueType::Float,
        };

        let mut sub = Generator {
            doc: self.doc,
            func: callee,
            opts: self.opts,
            structs: self.structs,
            node_types: infer::infer_function(self.doc, callee)?,
            body: String::new(),
            indent: 1,
            memo: FxHashMap::default(),
            temp_count: 0,
            helpers: std::mem::take(&mut self.helpers),
            builtins_used: BTreeSet::new(),
            used_buffers: std::mem::take(&mut self.used_buffers),
            used_storage_textures: std::mem::take(&mut self.used_storage_textures),
            used_sampled_textures: std::mem::take(&mut self.used_sampled_textures),
            used_globals: std::mem::take(&mut self.used_globals),
            used_structs: std::mem::take(&mut self.used_structs),
            loop_stack: Vec::new(),
            callees: std::mem::take(&mut self.callees),
            param_inputs: true,
            inputs_read: self.inputs_read,
        };
        sub.emit_locals()?;
        let value = sub.input_expr(&ret_node, "value")?;
        sub.stmt(&format!("return {};", coerce_to(&ret_ty, &value)));

        let params: Vec<String> = callee
            .inputs
            .iter()
            .map(|p| {
                let tag = p.data_type.as_deref().unwrap_or("float");
                Ok(format!("{}: {}", p.id, ValueType::parse(tag)?.wgsl_name()))
            })
            .collect::<ShadeResult<_>>()?;
        let text = format!(
            "fn fn_{callee_id}({}) -> {} {{\n{}}}\n",
            params.join(", "),
            ret_ty.wgsl_name(),
            sub.body
        );

        self.helpers = sub.helpers;
        self.used_buffers = sub.used_buffers;
        self.used_storage_textures = sub.used_storage_textures;
        self.used_sampled_textures = sub.used_sampled_textures;
        self.used_globals = sub.used_globals;
        self.used_structs = sub.used_structs;
        self.callees = sub.callees;
        self.inputs_read = sub.inputs_read;
        self.callees.insert(callee_id.to_string(), text);
        Ok(())
    }

    fn record_struct_use(&mut self, ty: &ValueType) {
        match ty {
            ValueType::Struct(name) => {
                self.used_structs.insert(name.clone());
            }
            ValueType::Array(elem, _) => self.record_struct_use(elem),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Assembly
    // ------------------------------------------------------------------

    fn assemble(&mut self, body: &str) -> ShadeResult<String> {
        let mut out = String::new();
        out.push_str("diagnostic(off, derivative_uniformity);\n\n");

        // The inputs block is bound whenever the entry guard or the body
        // reads it.
        let emit_inputs = self.opts.input_binding.is_some()
            && (self.opts.stage == ShaderStage::Compute || self.inputs_read);
        if emit_inputs {
            for decl in &self.doc.inputs {
                let ty = decl.value_type()?;
                self.record_struct_use(&ty);
            }
        }

        // Named struct definitions used anywhere in the shader.
        for name in self.used_structs.clone() {
            let def = self
                .structs
                .get(&name)
                .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?;
            out.push_str(&format!("struct S_{name} {{\n"));
            for field in &def.fields {
                let fty = ValueType::parse(&field.data_type)?;
                let attr = match fty {
                    ValueType::Float3 | ValueType::Int3 => "@size(16) ",
                    _ => "",
                };
                out.push_str(&format!("    {attr}{}: {},\n", field.name, fty.wgsl_name()));
            }
            out.push_str("}\n\n");
        }

        // Globals buffer.
        if !self.used_globals.is_empty() {
            let binding = self.opts.global_buffer_binding.ok_or_else(|| {
                ShadeError::Unsupported(
                    "global variables referenced but no globals binding assigned".to_string(),
                )
            })?;
            out.push_str("struct GlobalsBuffer {\n    data: array<f32>,\n}\n");
            out.push_str(&format!(
                "@group(0) @binding({binding}) var<storage, read_write> globals: GlobalsBuffer;\n\n"
            ));
        }

        // Packed inputs.
        if emit_inputs {
            let binding = self.opts.input_binding.unwrap_or(1);
            out.push_str("struct Inputs {\n");
            out.push_str("    @size(16) u_dispatch_size: vec3<u32>,\n");
            for decl in &self.doc.inputs {
                let ty = decl.value_type()?;
                let attr = match ty {
                    ValueType::Float3 | ValueType::Int3 => "@size(16) ",
                    _ => "",
                };
                let name = match &ty {
                    ValueType::Array(elem, 0) => format!("array<{}>", elem.wgsl_name()),
                    other => other.wgsl_name(),
                };
                out.push_str(&format!("    {attr}{}: {},\n", decl.id, name));
            }
            out.push_str("}\n");
            out.push_str(&format!(
                "@group(0) @binding({binding}) var<storage, read> inputs: Inputs;\n\n"
            ));
        }

        // Resource bindings, deterministic order.
        for id in self.used_buffers.clone() {
            let binding = *self
                .opts
                .resource_bindings
                .get(&id)
                .ok_or_else(|| ShadeError::unknown("binding for resource", id.clone()))?;
            let resource = self.resource_def(&id)?;
            let elem = resource.element_type()?;
            out.push_str(&format!(
                "struct Buffer_{id} {{\n    data: array<{}>,\n}}\n",
                elem.wgsl_name()
            ));
            out.push_str(&format!(
                "@group(0) @binding({binding}) var<storage, read_write> {id}: Buffer_{id};\n\n"
            ));
        }
        for id in self.used_sampled_textures.clone() {
            let binding = *self
                .opts
                .resource_bindings
                .get(&id)
                .ok_or_else(|| ShadeError::unknown("binding for resource", id.clone()))?;
            out.push_str(&format!(
                "@group(0) @binding({binding}) var {id}: texture_2d<f32>;\n\n"
            ));
        }
        for id in self.used_storage_textures.clone() {
            let binding = *self
                .opts
                .resource_bindings
                .get(&id)
                .ok_or_else(|| ShadeError::unknown("binding for resource", id.clone()))?;
            let format = match self.resource_def(&id)?.texture_format() {
                TextureFormat::Rgba8 => "rgba8unorm",
                TextureFormat::R32f => "r32float",
                TextureFormat::Rgba32f => "rgba32float",
            };
            out.push_str(&format!(
                "@group(0) @binding({binding}) var {id}: texture_storage_2d<{format}, write>;\n\n"
            ));
        }

        // Helper library.
        for helper in &self.helpers {
            out.push_str(helper_source(helper));
            out.push('\n');
        }
        for text in self.callees.values() {
            out.push_str(text);
            out.push('\n');
        }

        // Entry function.
        match self.opts.stage {
            ShaderStage::Compute => {
                let [wx, wy, wz] = WORKGROUP_SIZE;
                out.push_str(&format!("@compute @workgroup_size({wx}, {wy}, {wz})\n"));
                let mut params = vec![
                    "@builtin(global_invocation_id) global_invocation_id: vec3<u32>".to_string(),
                ];
                for name in &self.builtins_used {
                    let param = match name.as_str() {
                        "local_invocation_id" => {
                            "@builtin(local_invocation_id) local_invocation_id: vec3<u32>"
                        }
                        "workgroup_id" => "@builtin(workgroup_id) workgroup_id: vec3<u32>",
                        "num_workgroups" => "@builtin(num_workgroups) num_workgroups: vec3<u32>",
                        "local_invocation_index" => {
                            "@builtin(local_invocation_index) local_invocation_index: u32"
                        }
                        _ => continue,
                    };
                    params.push(param.to_string());
                }
                out.push_str(&format!("fn main({}) {{\n", params.join(", ")));
                if self.opts.input_binding.is_some() {
                    out.push_str(
                        "    if (global_invocation_id.x >= inputs.u_dispatch_size.x) {\n        \
                         return;\n    }\n",
                    );
                }
            }
            ShaderStage::Vertex => {
                out.push_str("@vertex\n");
                out.push_str(
                    "fn main(@builtin(vertex_index) vertex_index: u32, \
                     @builtin(instance_index) instance_index: u32) -> \
                     @builtin(position) vec4<f32> {\n",
                );
            }
            ShaderStage::Fragment => {
                out.push_str("@fragment\n");
                out.push_str(
                    "fn main(@builtin(position) frag_coord: vec4<f32>, \
                     @builtin(front_facing) front_facing: bool) -> @location(0) vec4<f32> {\n",
                );
            }
        }
        out.push_str(body);
        if matches!(self.opts.stage, ShaderStage::Vertex | ShaderStage::Fragment) {
            // Fallthrough when no func_return terminates the graph.
            out.push_str("    return vec4<f32>(0.0);\n");
        }
        out.push_str("}\n");
        Ok(out)
    }
}

/// Wraps `expr` in a conversion to `ty` where a constructor exists.
fn coerce_to(ty: &ValueType, expr: &str) -> String {
    match ty {
        ValueType::Float | ValueType::Int | ValueType::UInt | ValueType::Bool => {
            format!("{}({expr})", ty.wgsl_name())
        }
        ValueType::Float2
        | ValueType::Float3
        | ValueType::Float4
        | ValueType::Int2
        | ValueType::Int3
        | ValueType::Int4 => format!("{}({expr})", ty.wgsl_name()),
        _ => expr.to_string(),
    }
}

fn fmt_f32(x: f32) -> String {
    let s = format!("{x:?}");
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{s}.0")
    }
}

/// A WGSL constant expression for a JSON literal of a known type.
fn const_expr(json: &serde_json::Value, ty: &ValueType) -> ShadeResult<String> {
    let scalars: Vec<f32> = match json {
        serde_json::Value::Number(n) => vec![n.as_f64().unwrap_or(0.0) as f32],
        serde_json::Value::Bool(b) => vec![if *b { 1.0 } else { 0.0 }],
        serde_json::Value::Array(items) => items
            .iter()
            .map(|i| i.as_f64().unwrap_or(0.0) as f32)
            .collect(),
        other => {
            return Err(ShadeError::Resource(format!(
                "cannot emit literal {other} as a shader constant"
            )))
        }
    };
    let fmt_kind = |x: f32| -> String {
        match ty.scalar_kind() {
            crate::core::types::ScalarKind::Float => fmt_f32(x),
            crate::core::types::ScalarKind::Int => format!("{}", x as i32),
            crate::core::types::ScalarKind::UInt | crate::core::types::ScalarKind::Bool => {
                format!("{}u", if x != 0.0 { x as u32 } else { 0 })
            }
        }
    };
    Ok(match ty {
        ValueType::Float | ValueType::Int | ValueType::UInt | ValueType::Bool => {
            fmt_kind(scalars[0])
        }
        ValueType::Float2
        | ValueType::Float3
        | ValueType::Float4
        | ValueType::Int2
        | ValueType::Int3
        | ValueType::Int4
        | ValueType::Float3x3
        | ValueType::Float4x4 => {
            let parts: Vec<String> = scalars.iter().map(|&x| fmt_kind(x)).collect();
            format!("{}({})", ty.wgsl_name(), parts.join(", "))
        }
        ValueType::Array(elem, n) => {
            let parts: Vec<String> = scalars.iter().map(|&x| fmt_kind(x)).collect();
            format!("array<{}, {n}>({})", elem.wgsl_name(), parts.join(", "))
        }
        ValueType::Struct(name) => {
            return Err(ShadeError::Unsupported(format!(
                "struct literal for '{name}' cannot be emitted inline"
            )))
        }
    })
}

fn helper_source(name: &str) -> &'static str {
    match name {
        "color_mix" => {
            "fn color_mix(src: vec4<f32>, dst: vec4<f32>) -> vec4<f32> {\n    \
             let out_a = src.a + dst.a * (1.0 - src.a);\n    \
             if (out_a < 1e-5) {\n        return vec4<f32>(0.0);\n    }\n    \
             let rgb = (src.rgb * src.a + dst.rgb * dst.a * (1.0 - src.a)) / out_a;\n    \
             return vec4<f32>(rgb, out_a);\n}\n"
        }
        "quat_mul" => {
            "fn sg_quat_mul(a: vec4<f32>, b: vec4<f32>) -> vec4<f32> {\n    \
             return vec4<f32>(\n        \
             a.w * b.xyz + b.w * a.xyz + cross(a.xyz, b.xyz),\n        \
             a.w * b.w - dot(a.xyz, b.xyz));\n}\n"
        }
        "quat_slerp" => {
            "fn sg_quat_slerp(a: vec4<f32>, b: vec4<f32>, t: f32) -> vec4<f32> {\n    \
             var cos_theta = dot(a, b);\n    \
             var b2 = b;\n    \
             if (cos_theta < 0.0) {\n        b2 = -b;\n        cos_theta = -cos_theta;\n    }\n    \
             if (cos_theta > 0.9995) {\n        return normalize(mix(a, b2, t));\n    }\n    \
             let theta = acos(cos_theta);\n    \
             return (a * sin((1.0 - t) * theta) + b2 * sin(t * theta)) / sin(theta);\n}\n"
        }
        "quat_to_mat4" => {
            "fn sg_quat_to_mat4(q: vec4<f32>) -> mat4x4<f32> {\n    \
             let x2 = q.x + q.x;\n    let y2 = q.y + q.y;\n    let z2 = q.z + q.z;\n    \
             let xx = q.x * x2;\n    let xy = q.x * y2;\n    let xz = q.x * z2;\n    \
             let yy = q.y * y2;\n    let yz = q.y * z2;\n    let zz = q.z * z2;\n    \
             let wx = q.w * x2;\n    let wy = q.w * y2;\n    let wz = q.w * z2;\n    \
             return mat4x4<f32>(\n        \
             vec4<f32>(1.0 - (yy + zz), xy + wz, xz - wy, 0.0),\n        \
             vec4<f32>(xy - wz, 1.0 - (xx + zz), yz + wx, 0.0),\n        \
             vec4<f32>(xz + wy, yz - wx, 1.0 - (xx + yy), 0.0),\n        \
             vec4<f32>(0.0, 0.0, 0.0, 1.0));\n}\n"
        }
        other => unreachable!("unknown helper '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Edge, FunctionKind, LocalVar};
    use serde_json::json;

    fn compute_opts(resources: &[(&str, u32)]) -> ShaderOptions {
        let mut opts = ShaderOptions::compute();
        opts.input_binding = Some(1);
        for (id, binding) in resources {
            opts.resource_bindings.insert(id.to_string(), *binding);
        }
        opts
    }

    fn float_buffer(id: &str, size: u64) -> Resource {
        serde_json::from_value(json!({
            "id": id, "type": "buffer", "dataType": "float", "size": size
        }))
        .unwrap()
    }

    /// A kernel storing float4(1,2,3,4).wzyx scalars into b_result[0..4].
    fn swizzle_store_doc() -> IrDocument {
        let mut func = Function {
            id: "k".to_string(),
            kind: FunctionKind::Shader,
            inputs: vec![],
            outputs: vec![],
            local_vars: vec![],
            nodes: vec![],
            edges: vec![],
        };
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
        let mut prev: Option<String> = None;
        for i in 0..4 {
            let get = format!("g{i}");
            func.nodes.push(
                Node::new(get.clone(), "vec_get_element").with_arg("index", json!(i)),
            );
            func.edges.push(Edge::data("s", get.clone(), "vec"));
            let st = format!("st{i}");
            func.nodes.push(
                Node::new(st.clone(), "buffer_store")
                    .with_arg("buffer", json!("b_result"))
                    .with_arg("index", json!(i)),
            );
            func.edges.push(Edge::data(get, st.clone(), "value"));
            if let Some(p) = prev {
                func.edges.push(Edge::exec(p, st.clone()));
            }
            prev = Some(st);
        }
        IrDocument {
            entry_point: "k".to_string(),
            functions: vec![func],
            resources: vec![float_buffer("b_result", 4)],
            ..Default::default()
        }
    }

    #[test]
    fn test_compute_entry_shape() {
        let doc = swizzle_store_doc();
        let out = generate(&doc, "k", &compute_opts(&[("b_result", 2)])).unwrap();
        assert!(out.source.contains("@compute @workgroup_size(64, 1, 1)"));
        assert!(out
            .source
            .contains("@builtin(global_invocation_id) global_invocation_id: vec3<u32>"));
        assert!(out.source.contains("diagnostic(off, derivative_uniformity);"));
        assert!(out
            .source
            .contains("struct Buffer_b_result {\n    data: array<f32>,\n}"));
        assert!(out
            .source
            .contains("@group(0) @binding(2) var<storage, read_write> b_result: Buffer_b_result;"));
        assert_eq!(out.metadata.workgroup_size, WORKGROUP_SIZE);
        assert_eq!(out.metadata.resource_bindings.get("b_result"), Some(&2));
    }

    #[test]
    fn test_swizzle_chain_emitted_once() {
        let doc = swizzle_store_doc();
        let out = generate(&doc, "k", &compute_opts(&[("b_result", 2)])).unwrap();
        // The float4 constructor and the swizzle are each materialized once.
        assert_eq!(out.source.matches("vec4<f32>(1.0, 2.0, 3.0, 4.0)").count(), 1);
        assert_eq!(out.source.matches(".wzyx").count(), 1);
        // Four stores reach the buffer.
        assert_eq!(out.source.matches("b_result.data[").count(), 4);
    }

    #[test]
    fn test_unreferenced_bindings_are_not_emitted() {
        let mut doc = swizzle_store_doc();
        doc.resources.push(float_buffer("b_unused", 8));
        let out = generate(
            &doc,
            "k",
            &compute_opts(&[("b_result", 2), ("b_unused", 3)]),
        )
        .unwrap();
        assert!(!out.source.contains("b_unused"));
        assert!(!out.metadata.resource_bindings.contains_key("b_unused"));
    }

    #[test]
    fn test_branch_arms_duplicate_shared_node() {
        // branch -> both arms store the same pure node's value.
        let mut func = Function {
            id: "k".to_string(),
            kind: FunctionKind::Shader,
            inputs: vec![],
            outputs: vec![],
            local_vars: vec![],
            nodes: vec![],
            edges: vec![],
        };
        func.nodes
            .push(Node::new("c", "literal").with_arg("value", json!(1.0)));
        func.nodes.push(Node::new("br", "flow_branch"));
        func.edges.push(Edge::data("c", "br", "cond"));
        func.nodes
            .push(Node::new("val", "literal").with_arg("value", json!(7.0)));
        for (arm, port) in [("a", ops::EXEC_TRUE), ("b", ops::EXEC_FALSE)] {
            let st = format!("st_{arm}");
            func.nodes.push(
                Node::new(st.clone(), "buffer_store")
                    .with_arg("buffer", json!("b_result"))
                    .with_arg("index", json!(0)),
            );
            func.edges.push(Edge::data("val", st.clone(), "value"));
            func.edges.push(Edge::exec_port("br", port, st));
        }
        // A shared downstream store reachable from both arms.
        func.nodes.push(
            Node::new("st_shared", "buffer_store")
                .with_arg("buffer", json!("b_result"))
                .with_arg("index", json!(1))
                .with_arg("value", json!(9.0)),
        );
        func.edges.push(Edge::exec("st_a", "st_shared"));
        func.edges.push(Edge::exec("st_b", "st_shared"));

        let doc = IrDocument {
            entry_point: "k".to_string(),
            functions: vec![func],
            resources: vec![float_buffer("b_result", 4)],
            ..Default::default()
        };
        let out = generate(&doc, "k", &compute_opts(&[("b_result", 2)])).unwrap();
        // Shared literal is re-materialized per arm; the shared downstream
        // store appears in each arm independently.
        assert!(out.source.matches("let").count() >= 2);
        assert_eq!(
            out.source
                .matches("b_result.data[u32(1.0)] = f32(9.0);")
                .count(),
            2
        );
        assert!(out.source.contains("if (f32("));
    }

    #[test]
    fn test_loop_emits_counted_for() {
        let mut func = Function {
            id: "k".to_string(),
            kind: FunctionKind::Shader,
            inputs: vec![],
            outputs: vec![],
            local_vars: vec![],
            nodes: vec![],
            edges: vec![],
        };
        func.nodes.push(
            Node::new("lp", "flow_loop")
                .with_arg("start", json!(0))
                .with_arg("end", json!(4)),
        );
        func.nodes.push(Node::new("idx", "loop_index"));
        func.nodes.push(
            Node::new("st", "buffer_store").with_arg("buffer", json!("b_result")),
        );
        func.edges.push(Edge::data("idx", "st", "index"));
        func.edges.push(Edge::data("idx", "st", "value"));
        func.edges.push(Edge::exec_port("lp", ops::EXEC_BODY, "st"));
        func.nodes.push(
            Node::new("after", "buffer_store")
                .with_arg("buffer", json!("b_result"))
                .with_arg("index", json!(0))
                .with_arg("value", json!(5.0)),
        );
        func.edges
            .push(Edge::exec_port("lp", ops::EXEC_COMPLETED, "after"));

        let doc = IrDocument {
            entry_point: "k".to_string(),
            functions: vec![func],
            resources: vec![float_buffer("b_result", 4)],
            ..Default::default()
        };
        let out = generate(&doc, "k", &compute_opts(&[("b_result", 2)])).unwrap();
        assert!(out
            .source
            .contains("for (var i_lp: i32 = i32(0.0); i_lp < i32(4.0); i_lp = i_lp + 1) {"));
        // The completed chain continues after the loop.
        let loop_at = out.source.find("for (var i_lp").unwrap();
        let after_at = out.source.find("= f32(5.0);").unwrap();
        assert!(after_at > loop_at);
    }

    #[test]
    fn test_globals_wrapper_and_scalar_offsets() {
        let mut func = Function {
            id: "k".to_string(),
            kind: FunctionKind::Shader,
            inputs: vec![],
            outputs: vec![],
            local_vars: vec![],
            nodes: vec![],
            edges: vec![],
        };
        func.nodes.push(
            Node::new("set", "var_set")
                .with_arg("var", json!("res"))
                .with_arg("value", json!([1.0, 2.0, 3.0])),
        );
        let doc = IrDocument {
            entry_point: "k".to_string(),
            functions: vec![func],
            ..Default::default()
        };
        let mut opts = ShaderOptions::compute();
        opts.global_buffer_binding = Some(0);
        opts.var_map.insert("res".to_string(), 4);
        opts.var_types.insert("res".to_string(), ValueType::Float3);
        let out = generate(&doc, "k", &opts).unwrap();
        assert!(out
            .source
            .contains("struct GlobalsBuffer {\n    data: array<f32>,\n}"));
        assert!(out
            .source
            .contains("@group(0) @binding(0) var<storage, read_write> globals: GlobalsBuffer;"));
        assert!(out.source.contains("globals.data[4u]"));
        assert!(out.source.contains("globals.data[6u]"));
    }

    #[test]
    fn test_cpu_builtin_rejected_in_shader() {
        let mut func = Function {
            id: "k".to_string(),
            kind: FunctionKind::Shader,
            inputs: vec![],
            outputs: vec![],
            local_vars: vec![],
            nodes: vec![],
            edges: vec![],
        };
        func.nodes
            .push(Node::new("t", "builtin_get").with_arg("name", json!("time")));
        func.nodes.push(
            Node::new("st", "buffer_store")
                .with_arg("buffer", json!("b_result"))
                .with_arg("index", json!(0)),
        );
        func.edges.push(Edge::data("t", "st", "value"));
        let doc = IrDocument {
            entry_point: "k".to_string(),
            functions: vec![func],
            resources: vec![float_buffer("b_result", 1)],
            ..Default::default()
        };
        let err = generate(&doc, "k", &compute_opts(&[("b_result", 2)])).unwrap_err();
        assert!(err.to_string().contains("time"));
    }

    #[test]
    fn test_local_var_declared_with_initializer() {
        let mut func = Function {
            id: "k".to_string(),
            kind: FunctionKind::Shader,
            inputs: vec![],
            outputs: vec![],
            local_vars: vec![LocalVar {
                id: "c".to_string(),
                data_type: "float4".to_string(),
                initial_value: Some(json!([0.2, 0.4, 0.6, 1.0])),
            }],
            nodes: vec![],
            edges: vec![],
        };
        func.nodes.push(
            Node::new("st", "buffer_store")
                .with_arg("buffer", json!("b_result"))
                .with_arg("index", json!(0))
                .with_arg("value", json!("c.x")),
        );
        let doc = IrDocument {
            entry_point: "k".to_string(),
            functions: vec![func],
            resources: vec![float_buffer("b_result", 1)],
            ..Default::default()
        };
        let out = generate(&doc, "k", &compute_opts(&[("b_result", 2)])).unwrap();
        assert!(out
            .source
            .contains("var v_c: vec4<f32> = vec4<f32>(0.2, 0.4, 0.6, 1.0);"));
        assert!(out.source.contains("(v_c).x"));
    }

    #[test]
    fn test_fmt_f32_always_parses_as_float() {
        assert_eq!(fmt_f32(1.0), "1.0");
        assert_eq!(fmt_f32(0.5), "0.5");
        assert!(fmt_f32(1e-7).contains('e') || fmt_f32(1e-7).contains('.'));
    }
}
