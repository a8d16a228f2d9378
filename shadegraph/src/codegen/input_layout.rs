//! The packed input buffer layout.
//!
//! Inputs are packed into one storage buffer as an ordered list of write
//! operations keyed by recognized type shapes (`f32`, `i32`, `u32`, `vec`,
//! `mat`, `struct`, `array`), preceded by the special
//! `u_dispatch_size: uint3`. Offsets follow std430 struct rules so the
//! emitted WGSL `Inputs` struct sees the same bytes (`vec3` members carry
//! an explicit `@size(16)`).
//!
//! A runtime-length array is permitted at most once per layout and must
//! sit at the end; its length is derived at pack time from the supplied
//! value.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::layout::{self, LayoutRule, WritePlan};
use crate::core::types::ValueType;
use crate::core::value::Value;
use crate::ir::{InputDecl, StructRegistry};
use rustc_hash::FxHashMap;

/// The name of the implicit dispatch-size input.
pub const DISPATCH_SIZE_INPUT: &str = "u_dispatch_size";

/// The recognized shape of one input write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputWriteKind {
    /// Scalar `f32`.
    F32,
    /// Scalar `i32`.
    I32,
    /// Scalar `u32` (also carries `bool`).
    U32,
    /// Vector with `n` components.
    Vec {
        /// Component count, 2-4.
        n: usize,
    },
    /// Square matrix with `cols` columns.
    Mat {
        /// Column count, 3 or 4.
        cols: usize,
    },
    /// Named struct.
    Struct {
        /// Struct name.
        name: String,
    },
    /// Fixed- or runtime-length array.
    Array {
        /// `None` for the single trailing runtime-length array.
        len: Option<usize>,
    },
    /// The implicit `u_dispatch_size: uint3`.
    DispatchSize,
}

/// One write operation in the layout.
#[derive(Debug, Clone, PartialEq)]
pub struct InputWriteOp {
    /// Input id (field name in the WGSL `Inputs` struct).
    pub id: String,
    /// Recognized shape.
    pub kind: InputWriteKind,
    /// Byte offset of the field.
    pub offset: usize,
    /// Full type of the field.
    pub ty: ValueType,
}

/// The complete ordered layout.
#[derive(Debug, Clone, PartialEq)]
pub struct InputLayout {
    /// Writes in field order; the runtime array (if any) is last.
    pub ops: Vec<InputWriteOp>,
    /// Size of the fixed-length prefix in bytes.
    pub fixed_size: usize,
    /// Element type of the trailing runtime-length array, if declared.
    pub runtime_element: Option<ValueType>,
}

fn classify(ty: &ValueType) -> InputWriteKind {
    match ty {
        ValueType::Float => InputWriteKind::F32,
        ValueType::Int => InputWriteKind::I32,
        ValueType::UInt | ValueType::Bool => InputWriteKind::U32,
        ValueType::Float2 | ValueType::Int2 => InputWriteKind::Vec { n: 2 },
        ValueType::Float3 | ValueType::Int3 => InputWriteKind::Vec { n: 3 },
        ValueType::Float4 | ValueType::Int4 => InputWriteKind::Vec { n: 4 },
        ValueType::Float3x3 => InputWriteKind::Mat { cols: 3 },
        ValueType::Float4x4 => InputWriteKind::Mat { cols: 4 },
        ValueType::Array(_, n) => InputWriteKind::Array {
            len: if *n == 0 { None } else { Some(*n) },
        },
        ValueType::Struct(name) => InputWriteKind::Struct { name: name.clone() },
    }
}

impl InputLayout {
    /// Builds the layout for the declared inputs, in declaration order.
    pub fn build(inputs: &[InputDecl], structs: &StructRegistry) -> ShadeResult<InputLayout> {
        let rule = LayoutRule::Std430;
        let mut ops = vec![InputWriteOp {
            id: DISPATCH_SIZE_INPUT.to_string(),
            kind: InputWriteKind::DispatchSize,
            offset: 0,
            ty: ValueType::Int3,
        }];
        // vec3<u32> occupies 16 bytes under the documented vec3 rule.
        let mut offset = 16usize;
        let mut runtime_element = None;

        for (index, decl) in inputs.iter().enumerate() {
            if runtime_element.is_some() {
                return Err(ShadeError::Validation(vec![
                    crate::core::error::Diagnostic::error(
                        format!(
                            "runtime-length array input must be last, but '{}' follows it",
                            decl.id
                        ),
                        "inputs",
                    ),
                ]));
            }
            let ty = decl.value_type()?;
            let kind = classify(&ty);
            if let ValueType::Array(elem, 0) = &ty {
                if index != inputs.len() - 1 {
                    return Err(ShadeError::Validation(vec![
                        crate::core::error::Diagnostic::error(
                            format!("runtime-length array input '{}' must be last", decl.id),
                            "inputs",
                        ),
                    ]));
                }
                let elem_align = layout::align(elem, rule, structs)?;
                offset = offset.div_ceil(elem_align) * elem_align;
                ops.push(InputWriteOp {
                    id: decl.id.clone(),
                    kind,
                    offset,
                    ty: ty.clone(),
                });
                runtime_element = Some((**elem).clone());
                continue;
            }
            let field_align = layout::align(&ty, rule, structs)?;
            offset = offset.div_ceil(field_align) * field_align;
            ops.push(InputWriteOp {
                id: decl.id.clone(),
                kind,
                offset,
                ty: ty.clone(),
            });
            offset += layout::size_bytes(&ty, rule, structs)?;
        }

        Ok(InputLayout {
            ops,
            fixed_size: offset.max(16),
            runtime_element,
        })
    }

    /// Packs host inputs (falling back to declared defaults) plus the
    /// dispatch size into bytes.
    pub fn pack(
        &self,
        values: &FxHashMap<String, Value>,
        defaults: &[InputDecl],
        dispatch_size: [u32; 3],
        structs: &StructRegistry,
    ) -> ShadeResult<Vec<u8>> {
        let rule = LayoutRule::Std430;
        let mut out = vec![0u8; self.fixed_size];

        for op in &self.ops {
            match &op.kind {
                InputWriteKind::DispatchSize => {
                    for (i, d) in dispatch_size.iter().enumerate() {
                        out[op.offset + i * 4..op.offset + i * 4 + 4]
                            .copy_from_slice(&d.to_le_bytes());
                    }
                }
                InputWriteKind::Array { len: None } => {
                    let elem = self
                        .runtime_element
                        .as_ref()
                        .ok_or_else(|| ShadeError::Resource("layout corrupt".to_string()))?;
                    let value = lookup(values, defaults, &op.id, structs)?;
                    let Value::Array(items) = &value else {
                        return Err(ShadeError::Resource(format!(
                            "input '{}' expects an array value",
                            op.id
                        )));
                    };
                    let plan = WritePlan::build(elem, rule, structs)?;
                    let base = out.len();
                    out.resize(base + plan.size * items.len(), 0);
                    for (i, item) in items.iter().enumerate() {
                        plan.write(
                            &item.components()?,
                            &mut out[base + i * plan.size..base + (i + 1) * plan.size],
                        )?;
                    }
                }
                _ => {
                    let value = lookup(values, defaults, &op.id, structs)?;
                    let plan = WritePlan::build(&op.ty, rule, structs)?;
                    plan.write(
                        &value.components()?,
                        &mut out[op.offset..op.offset + plan.size],
                    )?;
                }
            }
        }
        Ok(out)
    }
}

fn lookup(
    values: &FxHashMap<String, Value>,
    defaults: &[InputDecl],
    id: &str,
    structs: &StructRegistry,
) -> ShadeResult<Value> {
    if let Some(v) = values.get(id) {
        return Ok(v.clone());
    }
    let decl = defaults
        .iter()
        .find(|d| d.id == id)
        .ok_or_else(|| ShadeError::unknown("input", id))?;
    match &decl.default {
        Some(json) => Value::from_json(json, decl.value_type().ok().as_ref()),
        None => Value::zero_of(&decl.value_type()?, structs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(id: &str, ty: &str) -> InputDecl {
        InputDecl {
            id: id.to_string(),
            data_type: ty.to_string(),
            default: None,
        }
    }

    #[test]
    fn test_dispatch_size_is_first() {
        let layout = InputLayout::build(&[], &StructRegistry::default()).unwrap();
        assert_eq!(layout.ops.len(), 1);
        assert_eq!(layout.ops[0].kind, InputWriteKind::DispatchSize);
        assert_eq!(layout.fixed_size, 16);
    }

    #[test]
    fn test_field_offsets_follow_std430() {
        let layout = InputLayout::build(
            &[decl("gain", "float"), decl("tint", "float4"), decl("mode", "int")],
            &StructRegistry::default(),
        )
        .unwrap();
        let offsets: Vec<(String, usize)> = layout
            .ops
            .iter()
            .map(|op| (op.id.clone(), op.offset))
            .collect();
        assert_eq!(
            offsets,
            vec![
                ("u_dispatch_size".to_string(), 0),
                ("gain".to_string(), 16),
                ("tint".to_string(), 32),
                ("mode".to_string(), 48),
            ]
        );
        assert_eq!(layout.fixed_size, 52);
    }

    #[test]
    fn test_runtime_array_must_be_last() {
        let err = InputLayout::build(
            &[decl("samples", "array<float,0>"), decl("gain", "float")],
            &StructRegistry::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be last"));

        let ok = InputLayout::build(
            &[decl("gain", "float"), decl("samples", "array<float,0>")],
            &StructRegistry::default(),
        )
        .unwrap();
        assert_eq!(ok.runtime_element, Some(ValueType::Float));
    }

    #[test]
    fn test_pack_writes_dispatch_and_values() {
        let decls = vec![decl("gain", "float")];
        let layout = InputLayout::build(&decls, &StructRegistry::default()).unwrap();
        let mut values = FxHashMap::default();
        values.insert("gain".to_string(), Value::Float(0.5));
        let bytes = layout
            .pack(&values, &decls, [8, 1, 1], &StructRegistry::default())
            .unwrap();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 8);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(f32::from_le_bytes(bytes[16..20].try_into().unwrap()), 0.5);
    }

    #[test]
    fn test_pack_runtime_array_length_from_value() {
        let decls = vec![decl("samples", "array<float,0>")];
        let layout = InputLayout::build(&decls, &StructRegistry::default()).unwrap();
        let mut values = FxHashMap::default();
        values.insert(
            "samples".to_string(),
            Value::Array(vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]),
        );
        let bytes = layout
            .pack(&values, &decls, [1, 1, 1], &StructRegistry::default())
            .unwrap();
        assert_eq!(bytes.len(), 16 + 12);
        assert_eq!(f32::from_le_bytes(bytes[16..20].try_into().unwrap()), 1.0);
        assert_eq!(f32::from_le_bytes(bytes[24..28].try_into().unwrap()), 3.0);
    }

    #[test]
    fn test_default_fallback_and_zero() {
        let decls = vec![InputDecl {
            id: "tint".to_string(),
            data_type: "float2".to_string(),
            default: Some(json!([0.25, 0.75])),
        }];
        let layout = InputLayout::build(&decls, &StructRegistry::default()).unwrap();
        let bytes = layout
            .pack(
                &FxHashMap::default(),
                &decls,
                [1, 1, 1],
                &StructRegistry::default(),
            )
            .unwrap();
        assert_eq!(f32::from_le_bytes(bytes[16..20].try_into().unwrap()), 0.25);
        assert_eq!(f32::from_le_bytes(bytes[20..24].try_into().unwrap()), 0.75);
    }
}
