//! Host-side runtime values.
//!
//! Every IR type maps to a host [`Value`]: scalars, fixed-length component
//! vectors (vectors *and* matrices, stored flat in column-major order),
//! arrays and structured records. Integer vectors are carried as `f32`
//! components on the host and exact-cast at pack time; the element type
//! decides the byte encoding, not the value. This keeps the op library's
//! element-wise broadcasting uniform across scalar kinds.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::types::{ScalarKind, ValueType};
use crate::ir::StructRegistry;

/// A runtime value flowing through the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 32-bit float scalar.
    Float(f32),
    /// 32-bit signed integer scalar.
    Int(i32),
    /// 32-bit unsigned integer scalar.
    UInt(u32),
    /// Boolean scalar; packs as a 0/1 `u32`.
    Bool(bool),
    /// Vector or matrix components, flat, column-major for matrices.
    Vector(Vec<f32>),
    /// Fixed-length array of element values.
    Array(Vec<Value>),
    /// Ordered named fields.
    Struct(Vec<(String, Value)>),
}

impl Value {
    /// Returns the scalar as `f32`, or an error for compound values.
    pub fn as_f32(&self) -> ShadeResult<f32> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f32),
            Value::UInt(v) => Ok(*v as f32),
            Value::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            other => Err(ShadeError::Resource(format!(
                "expected a scalar value, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Returns the scalar as an index, rejecting negatives.
    pub fn as_index(&self) -> ShadeResult<usize> {
        let f = self.as_f32()?;
        if f < 0.0 {
            return Err(ShadeError::Resource(format!("negative index {f}")));
        }
        Ok(f as usize)
    }

    /// True for `Float`/`Int`/`UInt`/`Bool`.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Float(_) | Value::Int(_) | Value::UInt(_) | Value::Bool(_)
        )
    }

    /// Flattens the value into scalar components, depth-first.
    pub fn components(&self) -> ShadeResult<Vec<f32>> {
        let mut out = Vec::new();
        self.append_components(&mut out)?;
        Ok(out)
    }

    fn append_components(&self, out: &mut Vec<f32>) -> ShadeResult<()> {
        match self {
            Value::Vector(v) => out.extend_from_slice(v),
            Value::Array(items) => {
                for item in items {
                    item.append_components(out)?;
                }
            }
            Value::Struct(fields) => {
                for (_, v) in fields {
                    v.append_components(out)?;
                }
            }
            scalar => out.push(scalar.as_f32()?),
        }
        Ok(())
    }

    /// Rebuilds a typed value from flat components.
    ///
    /// Consumes exactly `ty.component_count()` entries from `comps`.
    pub fn from_components(
        ty: &ValueType,
        comps: &[f32],
        structs: &StructRegistry,
    ) -> ShadeResult<Value> {
        let needed = ty.component_count(structs)?;
        if comps.len() < needed {
            return Err(ShadeError::Resource(format!(
                "not enough components to build {ty}: need {needed}, have {}",
                comps.len()
            )));
        }
        let comps = &comps[..needed];
        Ok(match ty {
            ValueType::Float => Value::Float(comps[0]),
            ValueType::Int => Value::Int(comps[0] as i32),
            ValueType::UInt => Value::UInt(comps[0] as u32),
            ValueType::Bool => Value::Bool(comps[0] != 0.0),
            ValueType::Float2
            | ValueType::Float3
            | ValueType::Float4
            | ValueType::Int2
            | ValueType::Int3
            | ValueType::Int4
            | ValueType::Float3x3
            | ValueType::Float4x4 => Value::Vector(comps.to_vec()),
            ValueType::Array(elem, n) => {
                let stride = elem.component_count(structs)?;
                let mut items = Vec::with_capacity(*n);
                for i in 0..*n {
                    items.push(Value::from_components(
                        elem,
                        &comps[i * stride..(i + 1) * stride],
                        structs,
                    )?);
                }
                Value::Array(items)
            }
            ValueType::Struct(name) => {
                let def = structs
                    .get(name)
                    .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?;
                let mut fields = Vec::with_capacity(def.fields.len());
                let mut at = 0;
                for field in &def.fields {
                    let fty = ValueType::parse(&field.data_type)?;
                    let n = fty.component_count(structs)?;
                    fields.push((
                        field.name.clone(),
                        Value::from_components(&fty, &comps[at..at + n], structs)?,
                    ));
                    at += n;
                }
                Value::Struct(fields)
            }
        })
    }

    /// The zero value of a type (all components zero, `false` for bool).
    pub fn zero_of(ty: &ValueType, structs: &StructRegistry) -> ShadeResult<Value> {
        let n = ty.component_count(structs)?;
        Value::from_components(ty, &vec![0.0; n], structs)
    }

    /// Coerces the flat components of this value into a scalar of `kind`.
    pub fn cast_scalar(&self, kind: ScalarKind) -> ShadeResult<Value> {
        let f = self.as_f32()?;
        Ok(match kind {
            ScalarKind::Float => Value::Float(f),
            ScalarKind::Int => Value::Int(f as i32),
            ScalarKind::UInt => Value::UInt(if f < 0.0 { 0 } else { f as u32 }),
            ScalarKind::Bool => Value::Bool(f != 0.0),
        })
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Value::Float(_) => "float",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Bool(_) => "bool",
            Value::Vector(_) => "vector",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
        }
    }

    /// Parses a JSON literal into a value, guided by an optional type.
    ///
    /// Numbers become `Float` (or the scalar of `ty`), arrays become
    /// `Vector` when every element is a number, `Array` otherwise.
    pub fn from_json(json: &serde_json::Value, ty: Option<&ValueType>) -> ShadeResult<Value> {
        match json {
            serde_json::Value::Number(n) => {
                let f = n.as_f64().unwrap_or(0.0) as f32;
                Ok(match ty {
                    Some(ValueType::Int) => Value::Int(f as i32),
                    Some(ValueType::UInt) => Value::UInt(f as u32),
                    Some(ValueType::Bool) => Value::Bool(f != 0.0),
                    _ => Value::Float(f),
                })
            }
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Array(items) => {
                if items.iter().all(|i| i.is_number()) {
                    Ok(Value::Vector(
                        items
                            .iter()
                            .map(|i| i.as_f64().unwrap_or(0.0) as f32)
                            .collect(),
                    ))
                } else {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(Value::from_json(item, None)?);
                    }
                    Ok(Value::Array(out))
                }
            }
            other => Err(ShadeError::Resource(format!(
                "unsupported literal {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::StructRegistry;

    fn no_structs() -> StructRegistry {
        StructRegistry::default()
    }

    #[test]
    fn test_components_flatten_depth_first() {
        let v = Value::Array(vec![
            Value::Vector(vec![1.0, 2.0]),
            Value::Vector(vec![3.0, 4.0]),
        ]);
        assert_eq!(v.components().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_from_components_roundtrip_vector() {
        let ty = ValueType::Float3;
        let v = Value::from_components(&ty, &[1.0, 2.0, 3.0], &no_structs()).unwrap();
        assert_eq!(v, Value::Vector(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_from_components_array_of_vec2() {
        let ty = ValueType::Array(Box::new(ValueType::Float2), 2);
        let v = Value::from_components(&ty, &[1.0, 2.0, 3.0, 4.0], &no_structs()).unwrap();
        assert_eq!(
            v,
            Value::Array(vec![
                Value::Vector(vec![1.0, 2.0]),
                Value::Vector(vec![3.0, 4.0])
            ])
        );
    }

    #[test]
    fn test_zero_of_bool_is_false() {
        assert_eq!(
            Value::zero_of(&ValueType::Bool, &no_structs()).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_cast_scalar_truncates_toward_zero() {
        assert_eq!(
            Value::Float(2.9).cast_scalar(ScalarKind::Int).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            Value::Float(-1.5).cast_scalar(ScalarKind::UInt).unwrap(),
            Value::UInt(0)
        );
    }

    #[test]
    fn test_from_json_number_array_is_vector() {
        let json: serde_json::Value = serde_json::json!([1, 2, 3]);
        assert_eq!(
            Value::from_json(&json, None).unwrap(),
            Value::Vector(vec![1.0, 2.0, 3.0])
        );
    }
}
