//! IR-to-IR transforms applied before lowering.

pub mod force_gpu;
