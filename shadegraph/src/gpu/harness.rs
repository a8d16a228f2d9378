//! The GPU dispatch harness.
//!
//! Given a validated context, a shader function id and the requested
//! invocation counts, the harness generates (or re-uses) the WGSL, packs
//! the inputs, allocates or re-uses GPU-side resources, assembles a bind
//! group filtered to the bindings that actually appear in the shader
//! source, encodes a compute pass, and reads every GPU-backed resource
//! back through 256-byte row-padded staging buffers, reconstructing typed
//! host values (trimming `vec3` padding and converting normalized `u8`
//! texels to floats).

use crate::codegen::wgsl::{self, ShaderOptions, WORKGROUP_SIZE};
use crate::core::error::{ShadeError, ShadeResult};
use crate::core::layout::{LayoutRule, WritePlan};
use crate::core::value::Value;
use crate::exec::context::EvaluationContext;
use crate::gpu::cache;
use crate::gpu::device::{shared_gpu, SharedGpu};
use crate::ir::{Resource, ResourceKind, ResourceSize, TextureFormat};
use regex::Regex;
use rustc_hash::FxHashMap;

/// Binding slot reserved for the globals buffer.
pub const GLOBALS_BINDING: u32 = 0;
/// Binding slot for the packed input buffer.
pub const INPUT_BINDING: u32 = 1;
/// First binding slot handed to resources.
pub const FIRST_RESOURCE_BINDING: u32 = 2;

/// Deterministic binding assignment: globals, inputs, then resources in
/// id order, then sampler companions.
pub fn assign_bindings(resources: &[Resource]) -> (FxHashMap<String, u32>, FxHashMap<String, u32>) {
    let mut ids: Vec<&Resource> = resources.iter().collect();
    ids.sort_by(|a, b| a.id.cmp(&b.id));
    let mut bindings = FxHashMap::default();
    let mut samplers = FxHashMap::default();
    let mut next = FIRST_RESOURCE_BINDING;
    for res in &ids {
        if res.kind == ResourceKind::Sampler {
            continue;
        }
        bindings.insert(res.id.clone(), next);
        next += 1;
    }
    for res in &ids {
        if res.kind == ResourceKind::Sampler {
            samplers.insert(res.id.clone(), next);
            next += 1;
        }
    }
    (bindings, samplers)
}

/// Builds the shader options for dispatching `fn_id` from `ctx`.
pub fn shader_options(ctx: &EvaluationContext, fn_id: &str) -> ShadeResult<ShaderOptions> {
    let func = ctx.doc.function(fn_id)?;
    let (resource_bindings, sampler_bindings) = assign_bindings(&ctx.doc.resources);
    let mut var_map = FxHashMap::default();
    let mut var_types = FxHashMap::default();
    let mut offset = 0u32;
    for var in &func.local_vars {
        let ty = var.value_type()?;
        let count = ty.component_count(&ctx.structs)? as u32;
        var_map.insert(var.id.clone(), offset);
        var_types.insert(var.id.clone(), ty);
        offset += count;
    }
    // Variables written without a declaration live in the globals buffer;
    // their type follows the written value.
    let node_types = ctx.function_node_types(fn_id)?;
    for node in &func.nodes {
        if node.op != "var_set" {
            continue;
        }
        let Some(var) = node.arg_str("var") else {
            continue;
        };
        if var_map.contains_key(var) {
            continue;
        }
        let ty = match func.data_edge_to(&node.id, "value") {
            Some(edge) => {
                let (base, suffix) = crate::ir::split_swizzle_suffix(&edge.from);
                let base_ty = node_types
                    .get(base)
                    .cloned()
                    .ok_or_else(|| ShadeError::unknown("node type for", base))?;
                match suffix {
                    Some(s) => base_ty.swizzled(crate::core::types::parse_swizzle(s)?.len())?,
                    None => base_ty,
                }
            }
            None => match node.arg("value") {
                Some(serde_json::Value::String(reference)) => {
                    let (base, suffix) = crate::ir::split_swizzle_suffix(reference);
                    let base_ty = node_types
                        .get(base)
                        .cloned()
                        .or_else(|| {
                            func.local_var(base).and_then(|v| v.value_type().ok())
                        })
                        .ok_or_else(|| ShadeError::unknown("reference", base))?;
                    match suffix {
                        Some(s) => {
                            base_ty.swizzled(crate::core::types::parse_swizzle(s)?.len())?
                        }
                        None => base_ty,
                    }
                }
                Some(literal) => crate::ir::infer::literal_type(literal, None)?,
                None => continue,
            },
        };
        let count = ty.component_count(&ctx.structs)? as u32;
        var_map.insert(var.to_string(), offset);
        var_types.insert(var.to_string(), ty);
        offset += count;
    }
    let mut opts = ShaderOptions::compute();
    opts.global_buffer_binding = Some(GLOBALS_BINDING);
    opts.input_binding = Some(INPUT_BINDING);
    opts.var_map = var_map;
    opts.var_types = var_types;
    opts.node_types = ctx.function_node_types(fn_id)?.clone();
    opts.resource_bindings = resource_bindings;
    opts.sampler_bindings = sampler_bindings;
    opts.resource_defs = ctx.doc.resources.clone();
    Ok(opts)
}

/// Runs `fn_id` as a compute kernel for `dispatch` invocations.
///
/// `args` override the context's inputs for this dispatch. On return the
/// host-side data of every GPU-backed resource is fresh.
pub async fn run_compute(
    ctx: &mut EvaluationContext,
    fn_id: &str,
    dispatch: [u32; 3],
    args: &FxHashMap<String, Value>,
) -> ShadeResult<()> {
    let gpu = shared_gpu().await?;
    let _serialized = gpu.acquire();

    let options = shader_options(ctx, fn_id)?;
    let output = wgsl::generate(&ctx.doc, fn_id, &options)?;
    let pipeline = cache::compute_pipeline(&gpu, &output.source)?;

    // Globals buffer: one scalar per local-var component, minimum 16
    // bytes so the binding is always creatable.
    let globals_scalars: u32 = {
        let mut sum = 0;
        for ty in options.var_types.values() {
            sum += ty.component_count(&ctx.structs)? as u32;
        }
        sum
    };
    let globals_size = u64::from(globals_scalars * 4).max(16);
    let globals_buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("shadegraph globals"),
        size: globals_size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    // Packed inputs.
    let mut merged = ctx.inputs.clone();
    for (k, v) in args {
        merged.insert(k.clone(), v.clone());
    }
    let packed = output
        .metadata
        .input_layout
        .pack(&merged, &ctx.doc.inputs, dispatch, &ctx.structs)?;
    let input_buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("shadegraph inputs"),
        size: (packed.len() as u64).max(16),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    gpu.queue.write_buffer(&input_buffer, 0, &packed);

    // Upload the resources the shader binds.
    let bound: Vec<String> = output.metadata.resource_bindings.keys().cloned().collect();
    for id in &bound {
        upload_resource(&gpu, ctx, id)?;
    }

    // Bind group filtered to the bindings present in the source.
    let binding_used = |binding: u32| -> bool {
        Regex::new(&format!(r"@binding\(\s*{binding}\s*\)"))
            .map(|re| re.is_match(&output.source))
            .unwrap_or(false)
    };
    let mut entries: Vec<wgpu::BindGroupEntry> = Vec::new();
    if binding_used(GLOBALS_BINDING) {
        entries.push(wgpu::BindGroupEntry {
            binding: GLOBALS_BINDING,
            resource: globals_buffer.as_entire_binding(),
        });
    }
    if binding_used(INPUT_BINDING) {
        entries.push(wgpu::BindGroupEntry {
            binding: INPUT_BINDING,
            resource: input_buffer.as_entire_binding(),
        });
    }
    let mut texture_views: Vec<(u32, wgpu::TextureView)> = Vec::new();
    for id in &bound {
        let binding = output.metadata.resource_bindings[id];
        if !binding_used(binding) {
            continue;
        }
        let state = ctx.get_resource(id)?;
        match state.decl.kind {
            ResourceKind::Buffer => {
                let buffer = state.gpu_buffer.as_ref().ok_or_else(|| {
                    ShadeError::Gpu(format!("buffer '{id}' has no GPU allocation"))
                })?;
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: buffer.as_entire_binding(),
                });
            }
            ResourceKind::Texture2d => {
                let texture = state.gpu_texture.as_ref().ok_or_else(|| {
                    ShadeError::Gpu(format!("texture '{id}' has no GPU allocation"))
                })?;
                texture_views.push((
                    binding,
                    texture.create_view(&wgpu::TextureViewDescriptor::default()),
                ));
            }
            ResourceKind::Sampler => {}
        }
    }
    for (binding, view) in &texture_views {
        entries.push(wgpu::BindGroupEntry {
            binding: *binding,
            resource: wgpu::BindingResource::TextureView(view),
        });
    }
    entries.sort_by_key(|e| e.binding);

    let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("shadegraph dispatch"),
        layout: &pipeline.get_bind_group_layout(0),
        entries: &entries,
    });

    // Encode, dispatch and copy out.
    let [wx, wy, wz] = WORKGROUP_SIZE;
    let groups = [
        dispatch[0].div_ceil(wx).max(1),
        dispatch[1].div_ceil(wy).max(1),
        dispatch[2].div_ceil(wz).max(1),
    ];
    log::debug!(
        "dispatching '{fn_id}': invocations {dispatch:?}, workgroups {groups:?}, {} bindings",
        entries.len()
    );

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("shadegraph dispatch"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("shadegraph compute"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
    }

    let mut readbacks = Vec::new();
    for id in &bound {
        if let Some(readback) = encode_readback(&gpu, ctx, id, &mut encoder)? {
            readbacks.push(readback);
        }
        ctx.get_resource_mut(id)?.gpu_dirty = true;
    }

    gpu.queue.submit(std::iter::once(encoder.finish()));

    // Map every staging buffer, then wait once for the whole submission.
    let mut receivers = Vec::with_capacity(readbacks.len());
    for readback in &readbacks {
        let (tx, rx) = crossbeam_channel::bounded(1);
        readback
            .staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        receivers.push(rx);
    }
    gpu.device.poll(wgpu::Maintain::Wait);
    if gpu.is_lost() {
        return Err(ShadeError::DeviceLost(
            "device lost while waiting for readback".to_string(),
        ));
    }
    for rx in receivers {
        rx.recv()
            .map_err(|_| ShadeError::Gpu("staging map callback dropped".to_string()))?
            .map_err(|e| ShadeError::Gpu(format!("staging map failed: {e}")))?;
    }

    for readback in readbacks {
        let bytes = readback.staging.slice(..).get_mapped_range().to_vec();
        readback.staging.unmap();
        apply_readback(ctx, &readback, &bytes)?;
        ctx.get_resource_mut(&readback.id)?.gpu_dirty = false;
    }

    Ok(())
}

/// Runs a vertex+fragment pair into a target texture resource.
///
/// Both stages are generated with the shared binding assignment; the bind
/// group is filtered against the union of the two sources.
pub async fn run_draw(
    ctx: &mut EvaluationContext,
    target: &str,
    vertex_fn: &str,
    fragment_fn: &str,
    count: u32,
) -> ShadeResult<()> {
    let gpu = shared_gpu().await?;
    let _serialized = gpu.acquire();

    let mut vs_options = shader_options(ctx, vertex_fn)?;
    vs_options.stage = crate::codegen::wgsl::ShaderStage::Vertex;
    let vs = wgsl::generate(&ctx.doc, vertex_fn, &vs_options)?;
    let mut fs_options = shader_options(ctx, fragment_fn)?;
    fs_options.stage = crate::codegen::wgsl::ShaderStage::Fragment;
    let fs = wgsl::generate(&ctx.doc, fragment_fn, &fs_options)?;

    let target_format = ctx.get_resource(target)?.decl.texture_format();
    let pipeline = cache::render_pipeline(&gpu, &vs.source, &fs.source, target_format)?;

    let mut bound: Vec<String> = vs
        .metadata
        .resource_bindings
        .keys()
        .chain(fs.metadata.resource_bindings.keys())
        .cloned()
        .collect();
    bound.sort();
    bound.dedup();
    upload_resource(&gpu, ctx, target)?;
    for id in &bound {
        if id != target {
            upload_resource(&gpu, ctx, id)?;
        }
    }

    let combined = format!("{}\n{}", vs.source, fs.source);
    let binding_used = |binding: u32| -> bool {
        Regex::new(&format!(r"@binding\(\s*{binding}\s*\)"))
            .map(|re| re.is_match(&combined))
            .unwrap_or(false)
    };
    let all_bindings = {
        let (bindings, _) = assign_bindings(&ctx.doc.resources);
        bindings
    };
    let mut entries: Vec<wgpu::BindGroupEntry> = Vec::new();
    let mut texture_views: Vec<(u32, wgpu::TextureView)> = Vec::new();
    for id in &bound {
        let binding = all_bindings[id];
        if !binding_used(binding) || id == target {
            continue;
        }
        let state = ctx.get_resource(id)?;
        match state.decl.kind {
            ResourceKind::Buffer => {
                if let Some(buffer) = state.gpu_buffer.as_ref() {
                    entries.push(wgpu::BindGroupEntry {
                        binding,
                        resource: buffer.as_entire_binding(),
                    });
                }
            }
            ResourceKind::Texture2d => {
                if let Some(texture) = state.gpu_texture.as_ref() {
                    texture_views.push((
                        binding,
                        texture.create_view(&wgpu::TextureViewDescriptor::default()),
                    ));
                }
            }
            ResourceKind::Sampler => {}
        }
    }
    for (binding, view) in &texture_views {
        entries.push(wgpu::BindGroupEntry {
            binding: *binding,
            resource: wgpu::BindingResource::TextureView(view),
        });
    }
    entries.sort_by_key(|e| e.binding);
    let bind_group = if entries.is_empty() {
        None
    } else {
        Some(gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shadegraph draw"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        }))
    };

    let target_view = {
        let state = ctx.get_resource(target)?;
        let texture = state
            .gpu_texture
            .as_ref()
            .ok_or_else(|| ShadeError::Gpu(format!("draw target '{target}' not allocated")))?;
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    };

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("shadegraph draw"),
        });
    {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("shadegraph draw"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&pipeline);
        if let Some(bg) = &bind_group {
            pass.set_bind_group(0, bg, &[]);
        }
        pass.draw(0..count, 0..1);
    }

    let mut readbacks = Vec::new();
    if let Some(readback) = encode_readback(&gpu, ctx, target, &mut encoder)? {
        readbacks.push(readback);
    }
    ctx.get_resource_mut(target)?.gpu_dirty = true;

    gpu.queue.submit(std::iter::once(encoder.finish()));
    let mut receivers = Vec::with_capacity(readbacks.len());
    for readback in &readbacks {
        let (tx, rx) = crossbeam_channel::bounded(1);
        readback
            .staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        receivers.push(rx);
    }
    gpu.device.poll(wgpu::Maintain::Wait);
    for rx in receivers {
        rx.recv()
            .map_err(|_| ShadeError::Gpu("staging map callback dropped".to_string()))?
            .map_err(|e| ShadeError::Gpu(format!("staging map failed: {e}")))?;
    }
    for readback in readbacks {
        let bytes = readback.staging.slice(..).get_mapped_range().to_vec();
        readback.staging.unmap();
        apply_readback(ctx, &readback, &bytes)?;
        ctx.get_resource_mut(&readback.id)?.gpu_dirty = false;
    }
    Ok(())
}

/// One pending staging copy.
struct Readback {
    id: String,
    staging: wgpu::Buffer,
    kind: ReadbackKind,
}

enum ReadbackKind {
    Buffer {
        plan: WritePlan,
        count: usize,
    },
    Texture {
        format: TextureFormat,
        width: u32,
        height: u32,
        padded_bytes_per_row: u32,
    },
}

/// Creates or re-uses the GPU allocation for `id` and uploads the host
/// data.
fn upload_resource(gpu: &SharedGpu, ctx: &mut EvaluationContext, id: &str) -> ShadeResult<()> {
    let structs = ctx.structs.clone();
    let state = ctx.get_resource_mut(id)?;
    match state.decl.kind {
        ResourceKind::Buffer => {
            let plan = WritePlan::build(
                &state.decl.element_type()?,
                LayoutRule::Std430,
                &structs,
            )?;
            let count = state.element_count();
            let size = (plan.size * count) as u64;
            let size = size.max(16);
            if !state
                .gpu_buffer
                .as_ref()
                .is_some_and(|b| b.size() == size)
            {
                state.gpu_buffer = Some(gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(id),
                    size,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                }));
            }
            let comps = plan.steps.len();
            let mut bytes = vec![0u8; (plan.size * count).max(16)];
            for i in 0..count {
                plan.write(
                    &state.data[i * comps..(i + 1) * comps],
                    &mut bytes[i * plan.size..(i + 1) * plan.size],
                )?;
            }
            let buffer = state
                .gpu_buffer
                .as_ref()
                .ok_or_else(|| ShadeError::Gpu(format!("buffer '{id}' allocation failed")))?;
            gpu.queue.write_buffer(buffer, 0, &bytes);
        }
        ResourceKind::Texture2d => {
            let ResourceSize::Texture2d([width, height]) = state.decl.size else {
                return Err(ShadeError::Resource(format!(
                    "texture '{id}' has a non-2d size"
                )));
            };
            let format = state.decl.texture_format();
            if state.gpu_texture.is_none() {
                state.gpu_texture = Some(gpu.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(id),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: cache::texture_format(format),
                    usage: wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::STORAGE_BINDING
                        | wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::COPY_DST
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                }));
            }
            let unpadded = width as usize * format.bytes_per_texel();
            let padded = pad_row(unpadded as u32) as usize;
            let mut bytes = vec![0u8; padded * height as usize];
            let channels = format.channels();
            for y in 0..height as usize {
                let row = &mut bytes[y * padded..y * padded + unpadded];
                for x in 0..width as usize {
                    let at = (y * width as usize + x) * channels;
                    let texel = &state.data[at..at + channels];
                    match format {
                        TextureFormat::Rgba8 => {
                            for (c, v) in texel.iter().enumerate() {
                                row[x * 4 + c] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                            }
                        }
                        TextureFormat::R32f | TextureFormat::Rgba32f => {
                            let start = x * channels * 4;
                            for (c, v) in texel.iter().enumerate() {
                                row[start + c * 4..start + c * 4 + 4]
                                    .copy_from_slice(&v.to_le_bytes());
                            }
                        }
                    }
                }
            }
            let texture = state
                .gpu_texture
                .as_ref()
                .ok_or_else(|| ShadeError::Gpu(format!("texture '{id}' allocation failed")))?;
            gpu.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &bytes,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded as u32),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        }
        ResourceKind::Sampler => {}
    }
    Ok(())
}

/// Encodes the copy into a freshly created staging buffer.
fn encode_readback(
    gpu: &SharedGpu,
    ctx: &EvaluationContext,
    id: &str,
    encoder: &mut wgpu::CommandEncoder,
) -> ShadeResult<Option<Readback>> {
    let state = ctx.get_resource(id)?;
    match state.decl.kind {
        ResourceKind::Buffer => {
            let Some(buffer) = state.gpu_buffer.as_ref() else {
                return Ok(None);
            };
            let plan = WritePlan::build(
                &state.decl.element_type()?,
                LayoutRule::Std430,
                &ctx.structs,
            )?;
            let count = state.element_count();
            let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("shadegraph staging"),
                size: buffer.size(),
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, buffer.size());
            Ok(Some(Readback {
                id: id.to_string(),
                staging,
                kind: ReadbackKind::Buffer { plan, count },
            }))
        }
        ResourceKind::Texture2d => {
            let Some(texture) = state.gpu_texture.as_ref() else {
                return Ok(None);
            };
            let ResourceSize::Texture2d([width, height]) = state.decl.size else {
                return Ok(None);
            };
            let format = state.decl.texture_format();
            let padded = pad_row(width * format.bytes_per_texel() as u32);
            let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("shadegraph staging"),
                size: u64::from(padded) * u64::from(height),
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &staging,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(padded),
                        rows_per_image: Some(height),
                    },
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
            Ok(Some(Readback {
                id: id.to_string(),
                staging,
                kind: ReadbackKind::Texture {
                    format,
                    width,
                    height,
                    padded_bytes_per_row: padded,
                },
            }))
        }
        ResourceKind::Sampler => Ok(None),
    }
}

/// Writes mapped staging bytes back into the host-side resource data,
/// un-padding rows and re-normalizing texel formats.
fn apply_readback(
    ctx: &mut EvaluationContext,
    readback: &Readback,
    bytes: &[u8],
) -> ShadeResult<()> {
    match &readback.kind {
        ReadbackKind::Buffer { plan, count } => {
            let mut data = Vec::with_capacity(count * plan.steps.len());
            for i in 0..*count {
                let chunk = &bytes[i * plan.size..(i + 1) * plan.size];
                data.extend(plan.read(chunk)?);
            }
            ctx.get_resource_mut(&readback.id)?.data = data;
        }
        ReadbackKind::Texture {
            format,
            width,
            height,
            padded_bytes_per_row,
        } => {
            let channels = format.channels();
            let unpadded = *width as usize * format.bytes_per_texel();
            let mut data = Vec::with_capacity(*width as usize * *height as usize * channels);
            for y in 0..*height as usize {
                let row = &bytes[y * *padded_bytes_per_row as usize..][..unpadded];
                for x in 0..*width as usize {
                    match format {
                        TextureFormat::Rgba8 => {
                            for c in 0..4 {
                                data.push(row[x * 4 + c] as f32 / 255.0);
                            }
                        }
                        TextureFormat::R32f | TextureFormat::Rgba32f => {
                            for c in 0..channels {
                                let at = x * channels * 4 + c * 4;
                                data.push(f32::from_le_bytes(
                                    row[at..at + 4].try_into().expect("4-byte texel chunk"),
                                ));
                            }
                        }
                    }
                }
            }
            ctx.get_resource_mut(&readback.id)?.data = data;
        }
    }
    Ok(())
}

/// Rounds a row size up to the 256-byte copy alignment.
pub fn pad_row(unpadded: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pad_row_alignment() {
        assert_eq!(pad_row(1), 256);
        assert_eq!(pad_row(256), 256);
        assert_eq!(pad_row(257), 512);
        assert_eq!(pad_row(1024), 1024);
    }

    #[test]
    fn test_binding_assignment_is_deterministic() {
        let resources: Vec<Resource> = vec![
            serde_json::from_value(json!({
                "id": "b_zeta", "type": "buffer", "dataType": "float", "size": 1
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "id": "b_alpha", "type": "buffer", "dataType": "float", "size": 1
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "id": "s_linear", "type": "sampler", "size": 1
            }))
            .unwrap(),
        ];
        let (bindings, samplers) = assign_bindings(&resources);
        assert_eq!(bindings["b_alpha"], FIRST_RESOURCE_BINDING);
        assert_eq!(bindings["b_zeta"], FIRST_RESOURCE_BINDING + 1);
        assert_eq!(samplers["s_linear"], FIRST_RESOURCE_BINDING + 2);
    }
}
