//! Shader module and pipeline caches, keyed on the exact generated
//! source string.
//!
//! Sources are pre-validated with naga's WGSL front-end so compilation
//! diagnostics carry `line:column` annotations; any error fails the run
//! with the numbered source listing logged at error level. Successful
//! modules and pipelines are retained until device loss.

use crate::core::error::{ShadeError, ShadeResult};
use crate::gpu::device::SharedGpu;
use crate::ir::TextureFormat;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Compiled artifacts scoped to one device.
#[derive(Default)]
pub struct ShaderCaches {
    modules: FxHashMap<String, Arc<wgpu::ShaderModule>>,
    compute: FxHashMap<String, Arc<wgpu::ComputePipeline>>,
    render: FxHashMap<String, Arc<wgpu::RenderPipeline>>,
}

/// Returns the compiled shader module for `source`, compiling on miss.
pub(crate) fn shader_module(
    gpu: &SharedGpu,
    source: &str,
) -> ShadeResult<Arc<wgpu::ShaderModule>> {
    let mut caches = gpu.caches.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(module) = caches.modules.get(source) {
        return Ok(module.clone());
    }
    validate_wgsl(source)?;
    let module = Arc::new(gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("shadegraph"),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }));
    caches.modules.insert(source.to_string(), module.clone());
    Ok(module)
}

/// Returns the compute pipeline for `source`, compiling on miss.
pub(crate) fn compute_pipeline(
    gpu: &SharedGpu,
    source: &str,
) -> ShadeResult<Arc<wgpu::ComputePipeline>> {
    {
        let caches = gpu.caches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pipeline) = caches.compute.get(source) {
            return Ok(pipeline.clone());
        }
    }
    let module = shader_module(gpu, source)?;
    let pipeline = Arc::new(gpu.device.create_compute_pipeline(
        &wgpu::ComputePipelineDescriptor {
            label: Some("shadegraph compute"),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        },
    ));
    let mut caches = gpu.caches.lock().unwrap_or_else(|e| e.into_inner());
    caches.compute.insert(source.to_string(), pipeline.clone());
    Ok(pipeline)
}

/// Returns the render pipeline for a vertex+fragment source pair, keyed
/// on their concatenation.
pub(crate) fn render_pipeline(
    gpu: &SharedGpu,
    vertex_source: &str,
    fragment_source: &str,
    target_format: TextureFormat,
) -> ShadeResult<Arc<wgpu::RenderPipeline>> {
    let key = format!("{vertex_source}\n// ---\n{fragment_source}");
    {
        let caches = gpu.caches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pipeline) = caches.render.get(&key) {
            return Ok(pipeline.clone());
        }
    }
    let vs = shader_module(gpu, vertex_source)?;
    let fs = shader_module(gpu, fragment_source)?;
    let format = texture_format(target_format);
    let pipeline = Arc::new(gpu.device.create_render_pipeline(
        &wgpu::RenderPipelineDescriptor {
            label: Some("shadegraph render"),
            layout: None,
            vertex: wgpu::VertexState {
                module: &vs,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &fs,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        },
    ));
    let mut caches = gpu.caches.lock().unwrap_or_else(|e| e.into_inner());
    caches.render.insert(key, pipeline.clone());
    Ok(pipeline)
}

/// The wgpu format for a declared texture format.
pub(crate) fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::R32f => wgpu::TextureFormat::R32Float,
        TextureFormat::Rgba32f => wgpu::TextureFormat::Rgba32Float,
    }
}

/// Parses and validates WGSL, producing `line:column`-annotated errors
/// and logging the numbered listing on failure.
pub(crate) fn validate_wgsl(source: &str) -> ShadeResult<()> {
    let module = match naga::front::wgsl::parse_str(source) {
        Ok(module) => module,
        Err(err) => {
            let position = err
                .location(source)
                .map(|loc| format!("{}:{}", loc.line_number, loc.line_position))
                .unwrap_or_else(|| "?:?".to_string());
            log_numbered_listing(source);
            return Err(ShadeError::ShaderCompile(format!(
                "{position}: {}",
                err.message()
            )));
        }
    };
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    if let Err(err) = validator.validate(&module) {
        let position = err
            .spans()
            .next()
            .map(|(span, _)| span.location(source))
            .map(|loc| format!("{}:{}", loc.line_number, loc.line_position))
            .unwrap_or_else(|| "?:?".to_string());
        log_numbered_listing(source);
        return Err(ShadeError::ShaderCompile(format!(
            "{position}: {}",
            err.emit_to_string(source).trim_end()
        )));
    }
    Ok(())
}

fn log_numbered_listing(source: &str) {
    let mut listing = String::new();
    for (i, line) in source.lines().enumerate() {
        listing.push_str(&format!("{:4} | {line}\n", i + 1));
    }
    log::error!("shader compilation failed; source:\n{listing}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_minimal_compute() {
        let source = "@compute @workgroup_size(64, 1, 1)\n\
                      fn main(@builtin(global_invocation_id) id: vec3<u32>) {\n}\n";
        validate_wgsl(source).unwrap();
    }

    #[test]
    fn test_parse_error_carries_line_and_column() {
        let source = "fn main( {\n}\n";
        let err = validate_wgsl(source).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("1:"), "missing line annotation in: {text}");
    }

    #[test]
    fn test_validation_error_is_annotated() {
        // Parses fine but fails validation: bad return type value.
        let source = "fn f() -> f32 {\n    return vec2<f32>(0.0);\n}\n";
        let err = validate_wgsl(source).unwrap_err();
        assert!(matches!(err, ShadeError::ShaderCompile(_)));
    }
}
