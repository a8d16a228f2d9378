//! Evaluation backends and the host API.
//!
//! A [`Backend`] exposes three operations: `create_context` builds an
//! [`context::EvaluationContext`] from an IR document, `run` executes a
//! function by id with side effects landing in the context, and `execute`
//! combines the two. Backends differ in where the graph runs:
//! [`cpu::CpuBackend`] evaluates host-side and doubles as the conformance
//! oracle; the GPU backends live in [`crate::gpu`].

pub mod context;
pub mod cpu;

use crate::core::error::ShadeResult;
use crate::core::value::Value;
use crate::ir::IrDocument;
use rustc_hash::FxHashMap;

pub use context::{BuiltinValues, EvaluationContext, Frame, ResourceState};

/// A way of executing IR documents.
#[allow(async_fn_in_trait)]
pub trait Backend {
    /// Validates the document and builds the initial evaluation state.
    fn create_context(
        &self,
        doc: &IrDocument,
        inputs: Option<FxHashMap<String, Value>>,
        builtins: Option<BuiltinValues>,
    ) -> ShadeResult<EvaluationContext>;

    /// Runs `entry_point`; effects mutate `ctx`. The entry frame is left
    /// on the stack so variables stay inspectable.
    async fn run(&self, ctx: &mut EvaluationContext, entry_point: &str) -> ShadeResult<()>;

    /// `create_context` followed by `run`.
    async fn execute(
        &self,
        doc: &IrDocument,
        entry_point: &str,
        inputs: Option<FxHashMap<String, Value>>,
        builtins: Option<BuiltinValues>,
    ) -> ShadeResult<EvaluationContext> {
        let mut ctx = self.create_context(doc, inputs, builtins)?;
        self.run(&mut ctx, entry_point).await?;
        Ok(ctx)
    }
}
