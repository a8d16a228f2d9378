//! The closed type-tag set and its host/shader mappings.
//!
//! Type tags are strings: `float`, `int`, `uint`, `bool`, `float2|3|4`,
//! `int2|3|4`, `float3x3`, `float4x4`, `array<T,N>`, `struct:<name>`.
//! Each tag maps to a host value shape, a WGSL type name and a byte layout
//! (see [`crate::core::layout`]).

use crate::core::error::{ShadeError, ShadeResult};
use crate::ir::StructRegistry;
use std::fmt;

/// The scalar base kind of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    /// `f32`
    Float,
    /// `i32`
    Int,
    /// `u32`
    UInt,
    /// `bool` (stored as a 0/1 `u32` in buffers)
    Bool,
}

/// A type in the IR's closed tag set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `float`
    Float,
    /// `int`
    Int,
    /// `uint`
    UInt,
    /// `bool`
    Bool,
    /// `float2`
    Float2,
    /// `float3`
    Float3,
    /// `float4`
    Float4,
    /// `int2`
    Int2,
    /// `int3`
    Int3,
    /// `int4`
    Int4,
    /// `float3x3`, three `vec3` columns
    Float3x3,
    /// `float4x4`, four `vec4` columns
    Float4x4,
    /// `array<T,N>`
    Array(Box<ValueType>, usize),
    /// `struct:<name>`, resolved through the document's struct table
    Struct(String),
}

impl ValueType {
    /// Parses a type tag string.
    pub fn parse(tag: &str) -> ShadeResult<ValueType> {
        let tag = tag.trim();
        Ok(match tag {
            "float" => ValueType::Float,
            "int" => ValueType::Int,
            "uint" => ValueType::UInt,
            "bool" => ValueType::Bool,
            "float2" => ValueType::Float2,
            "float3" => ValueType::Float3,
            "float4" => ValueType::Float4,
            "int2" => ValueType::Int2,
            "int3" => ValueType::Int3,
            "int4" => ValueType::Int4,
            "float3x3" => ValueType::Float3x3,
            "float4x4" => ValueType::Float4x4,
            _ => {
                if let Some(name) = tag.strip_prefix("struct:") {
                    ValueType::Struct(name.to_string())
                } else if let Some(inner) = tag
                    .strip_prefix("array<")
                    .and_then(|s| s.strip_suffix('>'))
                {
                    let (elem, count) = inner.rsplit_once(',').ok_or_else(|| {
                        ShadeError::Resource(format!("malformed array type tag '{tag}'"))
                    })?;
                    let count: usize = count.trim().parse().map_err(|_| {
                        ShadeError::Resource(format!("malformed array length in '{tag}'"))
                    })?;
                    ValueType::Array(Box::new(ValueType::parse(elem)?), count)
                } else {
                    return Err(ShadeError::Resource(format!("unknown type tag '{tag}'")));
                }
            }
        })
    }

    /// Number of scalar components, resolving struct fields recursively.
    pub fn component_count(&self, structs: &StructRegistry) -> ShadeResult<usize> {
        Ok(match self {
            ValueType::Float | ValueType::Int | ValueType::UInt | ValueType::Bool => 1,
            ValueType::Float2 | ValueType::Int2 => 2,
            ValueType::Float3 | ValueType::Int3 => 3,
            ValueType::Float4 | ValueType::Int4 => 4,
            ValueType::Float3x3 => 9,
            ValueType::Float4x4 => 16,
            ValueType::Array(elem, n) => n * elem.component_count(structs)?,
            ValueType::Struct(name) => {
                let def = structs
                    .get(name)
                    .ok_or_else(|| ShadeError::unknown("struct", name.clone()))?;
                let mut total = 0;
                for field in &def.fields {
                    total += ValueType::parse(&field.data_type)?.component_count(structs)?;
                }
                total
            }
        })
    }

    /// The scalar base kind. Arrays and structs report their leading kind.
    pub fn scalar_kind(&self) -> ScalarKind {
        match self {
            ValueType::Float
            | ValueType::Float2
            | ValueType::Float3
            | ValueType::Float4
            | ValueType::Float3x3
            | ValueType::Float4x4 => ScalarKind::Float,
            ValueType::Int | ValueType::Int2 | ValueType::Int3 | ValueType::Int4 => {
                ScalarKind::Int
            }
            ValueType::UInt => ScalarKind::UInt,
            ValueType::Bool => ScalarKind::Bool,
            ValueType::Array(elem, _) => elem.scalar_kind(),
            ValueType::Struct(_) => ScalarKind::Float,
        }
    }

    /// Builds a scalar or vector type of `kind` with `count` components.
    pub fn vector_of(kind: ScalarKind, count: usize) -> ShadeResult<ValueType> {
        Ok(match (kind, count) {
            (ScalarKind::Float, 1) => ValueType::Float,
            (ScalarKind::Float, 2) => ValueType::Float2,
            (ScalarKind::Float, 3) => ValueType::Float3,
            (ScalarKind::Float, 4) => ValueType::Float4,
            (ScalarKind::Int, 1) => ValueType::Int,
            (ScalarKind::Int, 2) => ValueType::Int2,
            (ScalarKind::Int, 3) => ValueType::Int3,
            (ScalarKind::Int, 4) => ValueType::Int4,
            (ScalarKind::UInt, 1) => ValueType::UInt,
            (ScalarKind::Bool, 1) => ValueType::Bool,
            _ => {
                return Err(ShadeError::Resource(format!(
                    "no vector type with {count} components of {kind:?}"
                )))
            }
        })
    }

    /// Adjusts this type to a swizzle of `count` channels, keeping the
    /// scalar kind. `float4` + 2 channels -> `float2`; one channel -> the
    /// scalar type.
    pub fn swizzled(&self, count: usize) -> ShadeResult<ValueType> {
        ValueType::vector_of(self.scalar_kind(), count)
    }

    /// True for `float2|3|4` and `int2|3|4`.
    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            ValueType::Float2
                | ValueType::Float3
                | ValueType::Float4
                | ValueType::Int2
                | ValueType::Int3
                | ValueType::Int4
        )
    }

    /// True for scalar tags.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            ValueType::Float | ValueType::Int | ValueType::UInt | ValueType::Bool
        )
    }

    /// The WGSL spelling of this type. Bools spell as `u32` so values can
    /// live in storage buffers.
    pub fn wgsl_name(&self) -> String {
        match self {
            ValueType::Float => "f32".to_string(),
            ValueType::Int => "i32".to_string(),
            ValueType::UInt => "u32".to_string(),
            ValueType::Bool => "u32".to_string(),
            ValueType::Float2 => "vec2<f32>".to_string(),
            ValueType::Float3 => "vec3<f32>".to_string(),
            ValueType::Float4 => "vec4<f32>".to_string(),
            ValueType::Int2 => "vec2<i32>".to_string(),
            ValueType::Int3 => "vec3<i32>".to_string(),
            ValueType::Int4 => "vec4<i32>".to_string(),
            ValueType::Float3x3 => "mat3x3<f32>".to_string(),
            ValueType::Float4x4 => "mat4x4<f32>".to_string(),
            ValueType::Array(elem, n) => format!("array<{}, {n}>", elem.wgsl_name()),
            ValueType::Struct(name) => format!("S_{name}"),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Float => write!(f, "float"),
            ValueType::Int => write!(f, "int"),
            ValueType::UInt => write!(f, "uint"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Float2 => write!(f, "float2"),
            ValueType::Float3 => write!(f, "float3"),
            ValueType::Float4 => write!(f, "float4"),
            ValueType::Int2 => write!(f, "int2"),
            ValueType::Int3 => write!(f, "int3"),
            ValueType::Int4 => write!(f, "int4"),
            ValueType::Float3x3 => write!(f, "float3x3"),
            ValueType::Float4x4 => write!(f, "float4x4"),
            ValueType::Array(elem, n) => write!(f, "array<{elem},{n}>"),
            ValueType::Struct(name) => write!(f, "struct:{name}"),
        }
    }
}

/// Parses a swizzle channel letter into a component index.
///
/// Accepts both position (`xyzw`) and color (`rgba`) alphabets.
pub fn channel_index(c: char) -> Option<usize> {
    match c {
        'x' | 'r' => Some(0),
        'y' | 'g' => Some(1),
        'z' | 'b' => Some(2),
        'w' | 'a' => Some(3),
        _ => None,
    }
}

/// Parses a swizzle string (1-4 channels) into component indices.
pub fn parse_swizzle(channels: &str) -> ShadeResult<Vec<usize>> {
    if channels.is_empty() || channels.len() > 4 {
        return Err(ShadeError::Resource(format!(
            "swizzle '{channels}' must name 1 to 4 channels"
        )));
    }
    channels
        .chars()
        .map(|c| {
            channel_index(c).ok_or_else(|| {
                ShadeError::Resource(format!("invalid swizzle channel '{c}' in '{channels}'"))
            })
        })
        .collect()
}
