//! Shader code generation.
//!
//! [`wgsl`] lowers a validated, typed IR function to WGSL source plus
//! layout metadata; [`input_layout`] describes how host inputs pack into
//! the shader's input buffer.

pub mod input_layout;
pub mod wgsl;
