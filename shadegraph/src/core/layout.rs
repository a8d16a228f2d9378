//! Byte layout under std140/std430-style rules.
//!
//! Scalars take 4 bytes. `vec2` aligns to 8, `vec3` and `vec4` to 16.
//! `vec3` both aligns to and occupies 16 bytes in every context here (the
//! spec-permitted choice, applied consistently; readback trims the pad
//! lane). `float3x3` is three `vec3` columns padded to 16 (48 bytes),
//! `float4x4` is 64. Array stride equals the element's aligned size,
//! additionally rounded to 16 under [`LayoutRule::Std140`]. Struct members
//! are aligned individually and the struct size rounds up to its own
//! alignment.
//!
//! Packing goes through a [`WritePlan`]: a flat list of
//! `(byte offset, scalar kind)` steps built once per `(type, rule)` and
//! replayed per element, so per-call reflection never happens on the hot
//! upload path.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::types::{ScalarKind, ValueType};
use crate::core::value::Value;
use crate::ir::StructRegistry;

/// Which layout rule set applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutRule {
    /// Uniform-style: array strides round up to 16.
    Std140,
    /// Storage-style: natural strides.
    Std430,
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// Alignment in bytes of `ty` under `rule`.
pub fn align(ty: &ValueType, rule: LayoutRule, structs: &StructRegistry) -> ShadeResult<usize> {
    Ok(match ty {
        ValueType::Float | ValueType::Int | ValueType::UInt | ValueType::Bool => 4,
        ValueType::Float2 | ValueType::Int2 => 8,
        ValueType::Float3
        | ValueType::Float4
        | ValueType::Int3
        | ValueType::Int4
        | ValueType::Float3x3
        | ValueType::Float4x4 => 16,
        ValueType::Array(elem, _) => {
            let a = align(elem, rule, structs)?;
            match rule {
                LayoutRule::Std140 => round_up(a, 16),
                LayoutRule::Std430 => a,
            }
        }
        ValueType::Struct(name) => {
            let def = structs
                .get(name)
                .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?;
            let mut a = 4;
            for field in &def.fields {
                let fty = ValueType::parse(&field.data_type)?;
                a = a.max(align(&fty, rule, structs)?);
            }
            match rule {
                LayoutRule::Std140 => round_up(a, 16),
                LayoutRule::Std430 => a,
            }
        }
    })
}

/// Occupied size in bytes of `ty` under `rule`, including trailing padding
/// up to the type's own alignment (so it doubles as the array stride).
pub fn size_bytes(ty: &ValueType, rule: LayoutRule, structs: &StructRegistry) -> ShadeResult<usize> {
    Ok(match ty {
        ValueType::Float | ValueType::Int | ValueType::UInt | ValueType::Bool => 4,
        ValueType::Float2 | ValueType::Int2 => 8,
        ValueType::Float3 | ValueType::Int3 => 16,
        ValueType::Float4 | ValueType::Int4 => 16,
        ValueType::Float3x3 => 48,
        ValueType::Float4x4 => 64,
        ValueType::Array(elem, n) => n * array_stride(elem, rule, structs)?,
        ValueType::Struct(name) => {
            let def = structs
                .get(name)
                .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?;
            let mut offset = 0;
            for field in &def.fields {
                let fty = ValueType::parse(&field.data_type)?;
                offset = round_up(offset, align(&fty, rule, structs)?);
                offset += size_bytes(&fty, rule, structs)?;
            }
            round_up(offset, align(ty, rule, structs)?)
        }
    })
}

/// Stride of an array of `elem` under `rule`.
pub fn array_stride(
    elem: &ValueType,
    rule: LayoutRule,
    structs: &StructRegistry,
) -> ShadeResult<usize> {
    let stride = round_up(
        size_bytes(elem, rule, structs)?,
        align(elem, rule, structs)?,
    );
    Ok(match rule {
        LayoutRule::Std140 => round_up(stride, 16),
        LayoutRule::Std430 => stride,
    })
}

/// One scalar write in a [`WritePlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStep {
    /// Byte offset of the scalar inside the packed element.
    pub offset: usize,
    /// How the f32 component is encoded at that offset.
    pub kind: ScalarKind,
}

/// A prebuilt packing plan for one type under one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    /// Packed size in bytes (array stride for element use).
    pub size: usize,
    /// One step per flat component, in component order.
    pub steps: Vec<WriteStep>,
}

impl WritePlan {
    /// Builds the plan for `ty` under `rule`.
    pub fn build(
        ty: &ValueType,
        rule: LayoutRule,
        structs: &StructRegistry,
    ) -> ShadeResult<WritePlan> {
        let mut steps = Vec::new();
        plan_into(ty, rule, structs, 0, &mut steps)?;
        Ok(WritePlan {
            size: round_up(
                size_bytes(ty, rule, structs)?,
                align(ty, rule, structs)?,
            ),
            steps,
        })
    }

    /// Encodes flat `comps` into `out` at the planned offsets.
    ///
    /// `out` must hold at least `self.size` bytes and `comps` exactly one
    /// component per step.
    pub fn write(&self, comps: &[f32], out: &mut [u8]) -> ShadeResult<()> {
        if comps.len() != self.steps.len() {
            return Err(ShadeError::Resource(format!(
                "component count mismatch: plan has {} steps, value has {}",
                self.steps.len(),
                comps.len()
            )));
        }
        for (step, &c) in self.steps.iter().zip(comps) {
            let bytes: [u8; 4] = match step.kind {
                ScalarKind::Float => c.to_le_bytes(),
                ScalarKind::Int => (c as i32).to_le_bytes(),
                ScalarKind::UInt => (if c < 0.0 { 0u32 } else { c as u32 }).to_le_bytes(),
                ScalarKind::Bool => (if c != 0.0 { 1u32 } else { 0u32 }).to_le_bytes(),
            };
            out[step.offset..step.offset + 4].copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Decodes the planned scalars out of `bytes` back into flat components.
    pub fn read(&self, bytes: &[u8]) -> ShadeResult<Vec<f32>> {
        let mut comps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let raw: [u8; 4] = bytes
                .get(step.offset..step.offset + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| {
                    ShadeError::Resource(format!(
                        "packed data too short: need byte {}, have {}",
                        step.offset + 4,
                        bytes.len()
                    ))
                })?;
            comps.push(match step.kind {
                ScalarKind::Float => f32::from_le_bytes(raw),
                ScalarKind::Int => i32::from_le_bytes(raw) as f32,
                ScalarKind::UInt => u32::from_le_bytes(raw) as f32,
                ScalarKind::Bool => {
                    if u32::from_le_bytes(raw) != 0 {
                        1.0
                    } else {
                        0.0
                    }
                }
            });
        }
        Ok(comps)
    }
}

fn plan_into(
    ty: &ValueType,
    rule: LayoutRule,
    structs: &StructRegistry,
    base: usize,
    steps: &mut Vec<WriteStep>,
) -> ShadeResult<()> {
    let kind = ty.scalar_kind();
    match ty {
        ValueType::Float | ValueType::Int | ValueType::UInt | ValueType::Bool => {
            steps.push(WriteStep { offset: base, kind });
        }
        ValueType::Float2 | ValueType::Int2 => {
            for i in 0..2 {
                steps.push(WriteStep {
                    offset: base + i * 4,
                    kind,
                });
            }
        }
        ValueType::Float3 | ValueType::Int3 => {
            for i in 0..3 {
                steps.push(WriteStep {
                    offset: base + i * 4,
                    kind,
                });
            }
        }
        ValueType::Float4 | ValueType::Int4 => {
            for i in 0..4 {
                steps.push(WriteStep {
                    offset: base + i * 4,
                    kind,
                });
            }
        }
        ValueType::Float3x3 => {
            // Column-major, each vec3 column padded to 16 bytes.
            for col in 0..3 {
                for row in 0..3 {
                    steps.push(WriteStep {
                        offset: base + col * 16 + row * 4,
                        kind,
                    });
                }
            }
        }
        ValueType::Float4x4 => {
            for i in 0..16 {
                steps.push(WriteStep {
                    offset: base + i * 4,
                    kind,
                });
            }
        }
        ValueType::Array(elem, n) => {
            let stride = array_stride(elem, rule, structs)?;
            for i in 0..*n {
                plan_into(elem, rule, structs, base + i * stride, steps)?;
            }
        }
        ValueType::Struct(name) => {
            let def = structs
                .get(name)
                .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?;
            let mut offset = base;
            for field in &def.fields {
                let fty = ValueType::parse(&field.data_type)?;
                offset = round_up(offset, align(&fty, rule, structs)?);
                plan_into(&fty, rule, structs, offset, steps)?;
                offset += size_bytes(&fty, rule, structs)?;
            }
        }
    }
    Ok(())
}

/// Packs a typed value into bytes under `rule`.
pub fn pack(
    value: &Value,
    ty: &ValueType,
    rule: LayoutRule,
    structs: &StructRegistry,
) -> ShadeResult<Vec<u8>> {
    let plan = WritePlan::build(ty, rule, structs)?;
    let mut out = vec![0u8; plan.size];
    plan.write(&value.components()?, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{StructDef, StructField, StructRegistry};

    fn no_structs() -> StructRegistry {
        StructRegistry::default()
    }

    fn lit(tag: &str) -> ValueType {
        ValueType::parse(tag).unwrap()
    }

    #[test]
    fn test_scalar_and_vector_sizes() {
        let s = no_structs();
        assert_eq!(size_bytes(&lit("float"), LayoutRule::Std430, &s).unwrap(), 4);
        assert_eq!(size_bytes(&lit("float2"), LayoutRule::Std430, &s).unwrap(), 8);
        assert_eq!(size_bytes(&lit("float3"), LayoutRule::Std430, &s).unwrap(), 16);
        assert_eq!(size_bytes(&lit("float4"), LayoutRule::Std430, &s).unwrap(), 16);
        assert_eq!(size_bytes(&lit("float3x3"), LayoutRule::Std430, &s).unwrap(), 48);
        assert_eq!(size_bytes(&lit("float4x4"), LayoutRule::Std430, &s).unwrap(), 64);
    }

    #[test]
    fn test_array_stride_rules() {
        let s = no_structs();
        let arr = lit("array<float,4>");
        // std430 keeps natural 4-byte stride, std140 rounds to 16.
        assert_eq!(size_bytes(&arr, LayoutRule::Std430, &s).unwrap(), 16);
        assert_eq!(size_bytes(&arr, LayoutRule::Std140, &s).unwrap(), 64);
        // vec3 elements stride 16 in both rule sets.
        let arr3 = lit("array<float3,2>");
        assert_eq!(size_bytes(&arr3, LayoutRule::Std430, &s).unwrap(), 32);
        assert_eq!(size_bytes(&arr3, LayoutRule::Std140, &s).unwrap(), 32);
    }

    #[test]
    fn test_struct_member_alignment() {
        let mut s = StructRegistry::default();
        s.insert(
            "Light".to_string(),
            StructDef {
                name: "Light".to_string(),
                fields: vec![
                    StructField {
                        name: "intensity".to_string(),
                        data_type: "float".to_string(),
                    },
                    StructField {
                        name: "position".to_string(),
                        data_type: "float3".to_string(),
                    },
                ],
            },
        );
        let ty = lit("struct:Light");
        // float at 0, vec3 aligned to 16, struct rounds to its alignment.
        assert_eq!(align(&ty, LayoutRule::Std430, &s).unwrap(), 16);
        assert_eq!(size_bytes(&ty, LayoutRule::Std430, &s).unwrap(), 32);

        let plan = WritePlan::build(&ty, LayoutRule::Std430, &s).unwrap();
        let offsets: Vec<usize> = plan.steps.iter().map(|w| w.offset).collect();
        assert_eq!(offsets, vec![0, 16, 20, 24]);
    }

    #[test]
    fn test_mat3x3_column_padding() {
        let plan = WritePlan::build(&lit("float3x3"), LayoutRule::Std430, &no_structs()).unwrap();
        let offsets: Vec<usize> = plan.steps.iter().map(|w| w.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 16, 20, 24, 32, 36, 40]);
    }

    #[test]
    fn test_pack_roundtrip_vec3_trims_padding() {
        let s = no_structs();
        let value = Value::Vector(vec![1.0, 2.0, 3.0]);
        let bytes = pack(&value, &lit("float3"), LayoutRule::Std430, &s).unwrap();
        assert_eq!(bytes.len(), 16);
        let plan = WritePlan::build(&lit("float3"), LayoutRule::Std430, &s).unwrap();
        assert_eq!(plan.read(&bytes).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_pack_int_kind_writes_exact_integers() {
        let s = no_structs();
        let bytes = pack(
            &Value::Vector(vec![1.0, -2.0]),
            &lit("int2"),
            LayoutRule::Std430,
            &s,
        )
        .unwrap();
        assert_eq!(i32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1);
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), -2);
    }

    #[test]
    fn test_write_rejects_component_mismatch() {
        let plan =
            WritePlan::build(&lit("float2"), LayoutRule::Std430, &no_structs()).unwrap();
        let mut out = vec![0u8; plan.size];
        assert!(plan.write(&[1.0], &mut out).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn float_types() -> impl Strategy<Value = ValueType> {
            prop_oneof![
                Just(lit("float")),
                Just(lit("float2")),
                Just(lit("float3")),
                Just(lit("float4")),
                Just(lit("float3x3")),
                Just(lit("float4x4")),
                (1usize..8).prop_map(|n| ValueType::Array(Box::new(ValueType::Float3), n)),
            ]
        }

        proptest! {
            #[test]
            fn write_then_read_is_identity(
                ty in float_types(),
                rule in prop_oneof![Just(LayoutRule::Std140), Just(LayoutRule::Std430)],
                seed in proptest::collection::vec(-1.0e6f32..1.0e6, 16 * 8),
            ) {
                let s = no_structs();
                let plan = WritePlan::build(&ty, rule, &s).unwrap();
                let comps: Vec<f32> = seed[..plan.steps.len()].to_vec();
                let mut bytes = vec![0u8; plan.size];
                plan.write(&comps, &mut bytes).unwrap();
                prop_assert_eq!(plan.read(&bytes).unwrap(), comps);
            }

            #[test]
            fn offsets_respect_alignment(ty in float_types()) {
                let s = no_structs();
                let plan = WritePlan::build(&ty, LayoutRule::Std430, &s).unwrap();
                for step in &plan.steps {
                    prop_assert_eq!(step.offset % 4, 0);
                    prop_assert!(step.offset + 4 <= plan.size);
                }
            }
        }
    }
}
