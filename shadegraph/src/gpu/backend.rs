//! GPU-backed implementations of the backend trait.
//!
//! [`GpuBackend`] runs shader-type entries directly through the harness
//! and evaluates host-type entries with dispatches routed to the GPU.
//! [`ForceGpuBackend`] additionally applies the force-GPU transform so a
//! host-intent graph executes as a kernel, then writes captured variables
//! and the return value back into the context after readback.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::value::Value;
use crate::exec::context::{BuiltinValues, EvaluationContext};
use crate::exec::cpu::{run_function, BoxFuture, EffectHost};
use crate::exec::Backend;
use crate::gpu::harness;
use crate::ir::{FunctionKind, IrDocument, Node};
use crate::transform::force_gpu::{self, CaptureTarget, CAPTURE_BUFFER_ID};
use rustc_hash::FxHashMap;

/// Effect host that routes dispatch and draw to the wgpu harness. Sync
/// pairs are satisfied trivially because the harness reads every bound
/// resource back as part of the dispatch.
pub(crate) struct GpuHost;

impl EffectHost for GpuHost {
    fn dispatch<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        func_id: &'a str,
        dispatch: [u32; 3],
        args: FxHashMap<String, Value>,
    ) -> BoxFuture<'a, ShadeResult<()>> {
        Box::pin(async move { harness::run_compute(ctx, func_id, dispatch, &args).await })
    }

    fn draw<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        node: &'a Node,
    ) -> BoxFuture<'a, ShadeResult<()>> {
        Box::pin(async move {
            let target = node.require_str("target")?.to_string();
            let vertex = node.require_str("vertex")?.to_string();
            let fragment = node.require_str("fragment")?.to_string();
            let count = node.arg_f64("count").unwrap_or(3.0) as u32;
            harness::run_draw(ctx, &target, &vertex, &fragment, count).await
        })
    }

    fn sync_to_cpu<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        resource: &'a str,
    ) -> BoxFuture<'a, ShadeResult<()>> {
        Box::pin(async move {
            // Readback happened inside the dispatch; nothing pending.
            let _ = ctx.get_resource(resource)?;
            Ok(())
        })
    }

    fn wait_cpu_sync<'a>(
        &'a self,
        ctx: &'a mut EvaluationContext,
        resource: &'a str,
    ) -> BoxFuture<'a, ShadeResult<()>> {
        Box::pin(async move {
            let state = ctx.get_resource(resource)?;
            if state.gpu_dirty {
                return Err(ShadeError::Gpu(format!(
                    "resource '{resource}' still dirty after sync"
                )));
            }
            Ok(())
        })
    }
}

/// Executes IR through wgpu.
#[derive(Debug, Default, Clone, Copy)]
pub struct GpuBackend;

impl GpuBackend {
    /// Creates a GPU backend.
    pub fn new() -> GpuBackend {
        GpuBackend
    }
}

impl Backend for GpuBackend {
    fn create_context(
        &self,
        doc: &IrDocument,
        inputs: Option<FxHashMap<String, Value>>,
        builtins: Option<BuiltinValues>,
    ) -> ShadeResult<EvaluationContext> {
        EvaluationContext::new(doc, inputs, builtins)
    }

    async fn run(&self, ctx: &mut EvaluationContext, entry_point: &str) -> ShadeResult<()> {
        let kind = ctx.doc.function(entry_point)?.kind;
        match kind {
            FunctionKind::Shader => {
                harness::run_compute(ctx, entry_point, [1, 1, 1], &FxHashMap::default()).await
            }
            FunctionKind::Cpu => {
                run_function(ctx, &GpuHost, entry_point, FxHashMap::default()).await
            }
        }
    }
}

/// Forces a host-intent entry function onto the GPU for conformance runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForceGpuBackend;

impl ForceGpuBackend {
    /// Creates a force-GPU backend.
    pub fn new() -> ForceGpuBackend {
        ForceGpuBackend
    }
}

impl Backend for ForceGpuBackend {
    fn create_context(
        &self,
        doc: &IrDocument,
        inputs: Option<FxHashMap<String, Value>>,
        builtins: Option<BuiltinValues>,
    ) -> ShadeResult<EvaluationContext> {
        let transform = force_gpu::force_gpu(doc)?;
        let mut ctx = EvaluationContext::new(&transform.doc, inputs, builtins)?;
        ctx.capture_slots = transform.slots;
        Ok(ctx)
    }

    async fn run(&self, ctx: &mut EvaluationContext, entry_point: &str) -> ShadeResult<()> {
        // Callers name the original entry; the transform re-pointed the
        // document at the synthesized trampoline.
        let resolved = if ctx.doc.function(entry_point).is_ok() {
            entry_point.to_string()
        } else if ctx
            .doc
            .function(&format!("_gpu_kernel_{entry_point}"))
            .is_ok()
        {
            format!("_trampoline_{entry_point}")
        } else {
            return Err(ShadeError::unknown("function", entry_point));
        };
        run_function(ctx, &GpuHost, &resolved, FxHashMap::default()).await?;

        let data = ctx.get_resource(CAPTURE_BUFFER_ID)?.data.clone();
        let slots = ctx.capture_slots.clone();
        let structs = ctx.structs.clone();
        for (target, value) in force_gpu::read_captures(&slots, &data, &structs)? {
            match target {
                CaptureTarget::Var(var) => ctx.set_var(&var, value),
                CaptureTarget::Return => ctx.result = Some(value),
            }
        }
        Ok(())
    }
}
