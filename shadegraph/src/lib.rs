#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![allow(rustdoc::private_intra_doc_links)]

//! # shadegraph
//!
//! A graph-based shader/compute runtime. It consumes an intermediate
//! representation describing compute-and-render pipelines as a directed
//! graph of typed operations and executes it by compiling to WGSL and
//! dispatching through wgpu, and/or by evaluating the same graph on the
//! CPU for conformance testing.
//!
//! ## Key Modules
//!
//! - [`core`]: error handling, the closed type-tag set, byte layout under
//!   std140/std430-style rules, and host values.
//! - [`ir`]: the document model with serde wire form, structural
//!   validation and type inference.
//! - [`ops`]: the built-in operator library shared by every backend.
//! - [`codegen`]: the WGSL shader generator and input packing.
//! - [`exec`]: evaluation contexts, the backend trait and the CPU
//!   evaluator.
//! - [`transform`]: IR rewrites, currently the force-GPU transform.
//! - [`gpu`] (feature `gpu`): the wgpu dispatch harness, shared device,
//!   pipeline cache and the GPU-backed backends.

pub mod codegen;
pub mod core;
pub mod exec;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod ir;
pub mod logger;
pub mod ops;
pub mod transform;

pub use crate::core::error::{Diagnostic, Severity, ShadeError, ShadeResult};
pub use crate::core::types::ValueType;
pub use crate::core::value::Value;
pub use crate::exec::cpu::CpuBackend;
pub use crate::exec::{Backend, BuiltinValues, EvaluationContext};
pub use crate::ir::IrDocument;
