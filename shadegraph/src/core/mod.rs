//! Core runtime infrastructure.
//!
//! - **Error handling**: the crate-wide [`error::ShadeError`] enum and
//!   [`error::ShadeResult`] alias.
//! - **Types**: the closed [`types::ValueType`] tag set with component
//!   counts and WGSL names.
//! - **Layout**: std140/std430-style sizing, alignment and the replayable
//!   [`layout::WritePlan`] packer.
//! - **Values**: the host-side [`value::Value`] model.

pub mod error;
pub mod layout;
pub mod types;
pub mod value;
