//! Evaluation contexts: the mutable state a run operates on.
//!
//! An [`EvaluationContext`] exclusively owns its resource states; the GPU
//! harness borrows them during dispatch. Host-side `data` is authoritative
//! while nothing is dispatched and goes stale (tracked by `gpu_dirty`)
//! until readback completes. GPU-side handles are created lazily on first
//! binding and dropped on destroy or resize.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::value::Value;
use crate::ir::infer::{self, NodeTypes};
use crate::ir::{validate, IrDocument, Persistence, Resource, ResourceKind, ResourceSize, StructRegistry};
use crate::transform::force_gpu::CaptureSlot;
use rustc_hash::FxHashMap;

/// Host-supplied built-in values readable on any backend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BuiltinValues {
    /// Seconds since playback start.
    pub time: f32,
    /// Seconds since the previous frame.
    pub delta_time: f32,
    /// Current tempo.
    pub bpm: f32,
    /// Beats since playback start.
    pub beat_number: f32,
    /// Beats since the previous frame.
    pub beat_delta: f32,
}

impl BuiltinValues {
    /// Looks up a CPU-readable built-in by name.
    pub fn get(&self, name: &str) -> Option<f32> {
        match name {
            "time" => Some(self.time),
            "delta_time" => Some(self.delta_time),
            "bpm" => Some(self.bpm),
            "beat_number" => Some(self.beat_number),
            "beat_delta" => Some(self.beat_delta),
            _ => None,
        }
    }
}

/// One stack frame: the variables of a function invocation.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Owning function id.
    pub fn_id: String,
    /// Locals, call arguments and anything `var_set` created.
    pub vars: FxHashMap<String, Value>,
}

/// Runtime state of one declared resource.
#[derive(Debug)]
pub struct ResourceState {
    /// The declaration this state was built from.
    pub decl: Resource,
    /// Flat scalar components, authoritative while not dispatched.
    pub data: Vec<f32>,
    /// Set when a dispatch may have written the GPU copy; cleared on
    /// successful readback.
    pub gpu_dirty: bool,
    /// Lazily created GPU buffer handle.
    #[cfg(feature = "gpu")]
    pub gpu_buffer: Option<wgpu::Buffer>,
    /// Lazily created GPU texture handle.
    #[cfg(feature = "gpu")]
    pub gpu_texture: Option<wgpu::Texture>,
}

impl ResourceState {
    fn new(decl: Resource, structs: &StructRegistry) -> ShadeResult<ResourceState> {
        let data = vec![0.0; Self::component_len(&decl, structs)?];
        Ok(ResourceState {
            decl,
            data,
            gpu_dirty: false,
            #[cfg(feature = "gpu")]
            gpu_buffer: None,
            #[cfg(feature = "gpu")]
            gpu_texture: None,
        })
    }

    fn component_len(decl: &Resource, structs: &StructRegistry) -> ShadeResult<usize> {
        Ok(match decl.kind {
            ResourceKind::Buffer => {
                decl.size.element_count() as usize
                    * decl.element_type()?.component_count(structs)?
            }
            ResourceKind::Texture2d => {
                decl.size.element_count() as usize * decl.texture_format().channels()
            }
            ResourceKind::Sampler => 0,
        })
    }

    /// Scalar components per buffer element.
    pub fn comps_per_element(&self, structs: &StructRegistry) -> ShadeResult<usize> {
        self.decl.element_type()?.component_count(structs)
    }

    /// Element (or texel) count.
    pub fn element_count(&self) -> usize {
        self.decl.size.element_count() as usize
    }

    /// Drops GPU handles so the next binding reallocates.
    pub fn drop_gpu_handles(&mut self) {
        #[cfg(feature = "gpu")]
        {
            self.gpu_buffer = None;
            self.gpu_texture = None;
        }
    }
}

/// The mutable state threaded through a run.
#[derive(Debug)]
pub struct EvaluationContext {
    /// The (possibly transformed) document this context executes.
    pub doc: IrDocument,
    /// Struct table resolved from the document.
    pub structs: StructRegistry,
    /// Host-supplied inputs merged over declared defaults.
    pub inputs: FxHashMap<String, Value>,
    /// CPU-readable built-in values.
    pub builtins: BuiltinValues,
    /// Resource states keyed by id.
    pub resources: FxHashMap<String, ResourceState>,
    /// Frames, one per live function call.
    pub stack: Vec<Frame>,
    /// The current function return value.
    pub result: Option<Value>,
    /// Inferred node types per function id.
    pub(crate) node_types: FxHashMap<String, NodeTypes>,
    /// Capture slots installed by the force-GPU transform.
    pub(crate) capture_slots: Vec<CaptureSlot>,
}

impl EvaluationContext {
    /// Validates `doc`, infers types and builds the initial state.
    pub fn new(
        doc: &IrDocument,
        inputs: Option<FxHashMap<String, Value>>,
        builtins: Option<BuiltinValues>,
    ) -> ShadeResult<EvaluationContext> {
        validate::ensure_valid(doc)?;
        let structs = doc.struct_registry();

        let mut node_types = FxHashMap::default();
        for func in &doc.functions {
            node_types.insert(func.id.clone(), infer::infer_function(doc, func)?);
        }

        let mut resources = FxHashMap::default();
        for decl in &doc.resources {
            resources.insert(
                decl.id.clone(),
                ResourceState::new(decl.clone(), &structs)?,
            );
        }

        let mut merged = FxHashMap::default();
        for decl in &doc.inputs {
            let value = match &decl.default {
                Some(json) => Value::from_json(json, decl.value_type().ok().as_ref())?,
                None => Value::zero_of(&decl.value_type()?, &structs)?,
            };
            merged.insert(decl.id.clone(), value);
        }
        if let Some(supplied) = inputs {
            merged.extend(supplied);
        }

        Ok(EvaluationContext {
            doc: doc.clone(),
            structs,
            inputs: merged,
            builtins: builtins.unwrap_or_default(),
            resources,
            stack: Vec::new(),
            result: None,
            node_types,
            capture_slots: Vec::new(),
        })
    }

    /// Pushes a frame for `fn_id`, initializing declared locals and the
    /// supplied call arguments.
    pub fn push_frame(
        &mut self,
        fn_id: &str,
        args: FxHashMap<String, Value>,
    ) -> ShadeResult<()> {
        let func = self.doc.function(fn_id)?;
        let mut vars = FxHashMap::default();
        for local in &func.local_vars {
            let ty = local.value_type()?;
            let value = match &local.initial_value {
                Some(json) => Value::from_json(json, Some(&ty))?,
                None => Value::zero_of(&ty, &self.structs)?,
            };
            vars.insert(local.id.clone(), value);
        }
        vars.extend(args);
        self.stack.push(Frame {
            fn_id: fn_id.to_string(),
            vars,
        });
        Ok(())
    }

    /// Pops the top frame.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.stack.pop()
    }

    /// Sets a variable in the top frame, creating the frame if the stack
    /// is empty.
    pub fn set_var(&mut self, id: &str, value: Value) {
        match self.stack.last_mut() {
            Some(frame) => {
                frame.vars.insert(id.to_string(), value);
            }
            None => {
                let mut frame = Frame::default();
                frame.vars.insert(id.to_string(), value);
                self.stack.push(frame);
            }
        }
    }

    /// Reads a variable: top frame first, then the host inputs.
    pub fn get_var(&self, id: &str) -> ShadeResult<Value> {
        if let Some(frame) = self.stack.last() {
            if let Some(v) = frame.vars.get(id) {
                return Ok(v.clone());
            }
        }
        if let Some(v) = self.inputs.get(id) {
            return Ok(v.clone());
        }
        Err(ShadeError::unknown("variable", id))
    }

    /// The resource state for `id`.
    pub fn get_resource(&self, id: &str) -> ShadeResult<&ResourceState> {
        self.resources
            .get(id)
            .ok_or_else(|| ShadeError::unknown("resource", id))
    }

    pub(crate) fn get_resource_mut(&mut self, id: &str) -> ShadeResult<&mut ResourceState> {
        self.resources
            .get_mut(id)
            .ok_or_else(|| ShadeError::unknown("resource", id))
    }

    /// Loads a typed element from a buffer resource. Out-of-bounds access
    /// fails (the GPU clamps instead; the CPU stays strict on purpose).
    pub fn buffer_load(&self, id: &str, index: usize) -> ShadeResult<Value> {
        let state = self.get_resource(id)?;
        let count = state.element_count();
        if index >= count {
            return Err(ShadeError::Resource(format!(
                "buffer '{id}' index {index} out of bounds (size {count})"
            )));
        }
        let stride = state.comps_per_element(&self.structs)?;
        let elem_ty = state.decl.element_type()?;
        Value::from_components(
            &elem_ty,
            &state.data[index * stride..(index + 1) * stride],
            &self.structs,
        )
    }

    /// Stores a typed element into a buffer resource, strict on bounds.
    pub fn buffer_store(&mut self, id: &str, index: usize, value: &Value) -> ShadeResult<()> {
        let structs = self.structs.clone();
        let state = self.get_resource_mut(id)?;
        let count = state.element_count();
        if index >= count {
            return Err(ShadeError::Resource(format!(
                "buffer '{id}' index {index} out of bounds (size {count})"
            )));
        }
        let stride = state.comps_per_element(&structs)?;
        let comps = value.components()?;
        if comps.len() != stride {
            return Err(ShadeError::Resource(format!(
                "buffer '{id}' element expects {stride} components, got {}",
                comps.len()
            )));
        }
        state.data[index * stride..(index + 1) * stride].copy_from_slice(&comps);
        Ok(())
    }

    /// Loads a texel as `[r, g, b, a]` (single-channel formats expand to
    /// `[v, 0, 0, 1]`).
    pub fn texture_load(&self, id: &str, x: usize, y: usize) -> ShadeResult<Value> {
        let state = self.get_resource(id)?;
        let ResourceSize::Texture2d([w, h]) = state.decl.size else {
            return Err(ShadeError::Resource(format!(
                "resource '{id}' is not a texture"
            )));
        };
        if x >= w as usize || y >= h as usize {
            return Err(ShadeError::Resource(format!(
                "texture '{id}' coord ({x}, {y}) out of bounds ({w}x{h})"
            )));
        }
        let channels = state.decl.texture_format().channels();
        let at = (y * w as usize + x) * channels;
        let texel = &state.data[at..at + channels];
        Ok(Value::Vector(match channels {
            1 => vec![texel[0], 0.0, 0.0, 1.0],
            _ => texel.to_vec(),
        }))
    }

    /// Stores a texel from an rgba value.
    pub fn texture_store(&mut self, id: &str, x: usize, y: usize, value: &Value) -> ShadeResult<()> {
        let comps = value.components()?;
        let state = self.get_resource_mut(id)?;
        let ResourceSize::Texture2d([w, h]) = state.decl.size else {
            return Err(ShadeError::Resource(format!(
                "resource '{id}' is not a texture"
            )));
        };
        if x >= w as usize || y >= h as usize {
            return Err(ShadeError::Resource(format!(
                "texture '{id}' coord ({x}, {y}) out of bounds ({w}x{h})"
            )));
        }
        let channels = state.decl.texture_format().channels();
        let at = (y * w as usize + x) * channels;
        for c in 0..channels {
            state.data[at + c] = comps.get(c).copied().unwrap_or(0.0);
        }
        Ok(())
    }

    /// Resizes a resource in place. Contents are preserved up to the new
    /// size unless the declaration asks for clear-on-resize; stale GPU
    /// handles are dropped either way.
    pub fn resize_resource(&mut self, id: &str, size: ResourceSize) -> ShadeResult<()> {
        let structs = self.structs.clone();
        let state = self.get_resource_mut(id)?;
        state.decl.size = size;
        let new_len = ResourceState::component_len(&state.decl, &structs)?;
        if state.decl.persistence == Persistence::ClearOnResize {
            state.data.clear();
            state.data.resize(new_len, 0.0);
        } else {
            state.data.resize(new_len, 0.0);
        }
        state.drop_gpu_handles();
        log::debug!("resized resource '{id}' to {:?}", state.decl.size);
        Ok(())
    }

    /// The inferred node types of one function.
    pub(crate) fn function_node_types(&self, fn_id: &str) -> ShadeResult<&NodeTypes> {
        self.node_types
            .get(fn_id)
            .ok_or_else(|| ShadeError::unknown("function", fn_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with_buffer() -> IrDocument {
        serde_json::from_value(json!({
            "entryPoint": "main",
            "functions": [{"id": "main", "type": "cpu"}],
            "resources": [
                {"id": "b_data", "type": "buffer", "dataType": "float2", "size": 4}
            ],
            "inputs": [
                {"id": "gain", "dataType": "float", "default": 2.0}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_inputs_merge_defaults_and_supplied() {
        let doc = doc_with_buffer();
        let ctx = EvaluationContext::new(&doc, None, None).unwrap();
        assert_eq!(ctx.inputs.get("gain"), Some(&Value::Float(2.0)));

        let mut supplied = FxHashMap::default();
        supplied.insert("gain".to_string(), Value::Float(5.0));
        let ctx = EvaluationContext::new(&doc, Some(supplied), None).unwrap();
        assert_eq!(ctx.inputs.get("gain"), Some(&Value::Float(5.0)));
    }

    #[test]
    fn test_buffer_roundtrip_and_strict_oob() {
        let doc = doc_with_buffer();
        let mut ctx = EvaluationContext::new(&doc, None, None).unwrap();
        ctx.buffer_store("b_data", 2, &Value::Vector(vec![1.0, -1.0]))
            .unwrap();
        assert_eq!(
            ctx.buffer_load("b_data", 2).unwrap(),
            Value::Vector(vec![1.0, -1.0])
        );
        let err = ctx.buffer_load("b_data", 4).unwrap_err();
        assert_eq!(
            err.to_string(),
            "buffer 'b_data' index 4 out of bounds (size 4)"
        );
        let err = ctx
            .buffer_store("b_data", 9, &Value::Vector(vec![0.0, 0.0]))
            .unwrap_err();
        assert!(err.to_string().contains("index 9 out of bounds"));
    }

    #[test]
    fn test_frames_shadow_inputs() {
        let doc = doc_with_buffer();
        let mut ctx = EvaluationContext::new(&doc, None, None).unwrap();
        ctx.push_frame("main", FxHashMap::default()).unwrap();
        assert_eq!(ctx.get_var("gain").unwrap(), Value::Float(2.0));
        ctx.set_var("gain", Value::Float(9.0));
        assert_eq!(ctx.get_var("gain").unwrap(), Value::Float(9.0));
        ctx.pop_frame();
        assert_eq!(ctx.get_var("gain").unwrap(), Value::Float(2.0));
    }

    #[test]
    fn test_resize_preserves_or_clears() {
        let doc = doc_with_buffer();
        let mut ctx = EvaluationContext::new(&doc, None, None).unwrap();
        ctx.buffer_store("b_data", 0, &Value::Vector(vec![3.0, 4.0]))
            .unwrap();
        ctx.resize_resource("b_data", ResourceSize::Elements(8)).unwrap();
        assert_eq!(
            ctx.buffer_load("b_data", 0).unwrap(),
            Value::Vector(vec![3.0, 4.0])
        );
        assert_eq!(ctx.get_resource("b_data").unwrap().element_count(), 8);
    }

    #[test]
    fn test_texture_single_channel_expansion() {
        let doc: IrDocument = serde_json::from_value(json!({
            "entryPoint": "main",
            "functions": [{"id": "main", "type": "cpu"}],
            "resources": [
                {"id": "t_height", "type": "texture2d", "format": "r32f", "size": [2, 2]}
            ]
        }))
        .unwrap();
        let mut ctx = EvaluationContext::new(&doc, None, None).unwrap();
        ctx.texture_store("t_height", 1, 0, &Value::Vector(vec![0.5, 0.0, 0.0, 1.0]))
            .unwrap();
        assert_eq!(
            ctx.texture_load("t_height", 1, 0).unwrap(),
            Value::Vector(vec![0.5, 0.0, 0.0, 1.0])
        );
    }
}
