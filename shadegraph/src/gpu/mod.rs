//! GPU execution through wgpu.
//!
//! - [`device`]: the process-wide shared device, serialization lock and
//!   reset hook.
//! - [`cache`]: shader modules and pipelines deduplicated by source.
//! - [`harness`]: resource allocation, bind-group assembly, dispatch,
//!   draw and staging readback.
//! - [`backend`]: [`backend::GpuBackend`] and
//!   [`backend::ForceGpuBackend`].

pub mod backend;
pub mod cache;
pub mod device;
pub mod harness;

pub use backend::{ForceGpuBackend, GpuBackend};
pub use device::{reset_shared_gpu, shared_gpu, SharedGpu};
