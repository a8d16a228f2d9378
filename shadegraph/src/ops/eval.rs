//! Host-side semantics of the pure op library.
//!
//! This is the CPU oracle the shader generator is checked against: every
//! context-free op (constructors, swizzles, math, matrix/quaternion work,
//! casts, array and struct plumbing) evaluates here with the same
//! semantics the emitted WGSL has. Element-wise broadcasting mixes scalars
//! with vectors; comparisons produce 0/1 scalars so they compose; logical
//! ops coerce through `!= 0`; `mod(a, b) = a - b * floor(a / b)`.
//!
//! Context-dependent ops (`var_get`, `buffer_load`, `texture_load`,
//! `builtin_get`, `call_func` and all executable ops) are handled by the
//! evaluation backends, not here.

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::types::{channel_index, parse_swizzle, ScalarKind, ValueType};
use crate::core::value::Value;
use crate::ir::{Node, StructRegistry};
use crate::ops;
use cgmath::{Matrix3, Matrix4, Quaternion, Vector3, Vector4};

/// Resolves a node's data inputs during evaluation.
///
/// `value` follows the data edge arriving at the port, or reads a literal
/// carried on the node under the same key; `channel_groups` returns the
/// resolved component-group arguments of a flexible constructor.
pub trait Inputs {
    /// The value arriving at `port`; errors when absent.
    fn value(&mut self, port: &str) -> ShadeResult<Value>;
    /// The value arriving at `port`, or `None` when the port is unfed.
    fn value_opt(&mut self, port: &str) -> ShadeResult<Option<Value>>;
    /// Resolved `(group, value)` pairs of a flexible constructor.
    fn channel_groups(&mut self) -> ShadeResult<Vec<(String, Value)>>;
}

/// Evaluates a context-free pure op.
pub fn apply(node: &Node, inputs: &mut dyn Inputs, structs: &StructRegistry) -> ShadeResult<Value> {
    let op = node.op.as_str();
    if let Some((kind, width)) = ops::constructor_target(op) {
        return construct_vector(node, inputs, kind, width);
    }
    match op {
        "literal" => {
            let value = node.arg("value").ok_or_else(|| {
                ShadeError::Resource(format!("literal node '{}' carries no value", node.id))
            })?;
            let hint = match node.arg_str("dataType") {
                Some(tag) => Some(ValueType::parse(tag)?),
                None => None,
            };
            Value::from_json(value, hint.as_ref())
        }
        "float" => inputs.value("value")?.cast_scalar(ScalarKind::Float),
        "int" => inputs.value("value")?.cast_scalar(ScalarKind::Int),
        "bool" => inputs.value("value")?.cast_scalar(ScalarKind::Bool),
        "float3x3" => construct_matrix(inputs, 3),
        "float4x4" => construct_matrix(inputs, 4),

        "vec_swizzle" => {
            let channels = node.require_str("channels")?;
            swizzle(&inputs.value("vec")?, channels)
        }
        "vec_get_element" => {
            let vec = inputs.value("vec")?.components()?;
            let index = inputs.value("index")?.as_index()?;
            vec.get(index).copied().map(Value::Float).ok_or_else(|| {
                ShadeError::Resource(format!(
                    "vector element {index} out of range (len {})",
                    vec.len()
                ))
            })
        }
        "vec_dot" => {
            let a = inputs.value("a")?.components()?;
            let b = inputs.value("b")?.components()?;
            Ok(Value::Float(
                a.iter().zip(&b).map(|(x, y)| x * y).sum::<f32>(),
            ))
        }
        "vec_length" => {
            let v = inputs.value("vec")?.components()?;
            Ok(Value::Float(
                v.iter().map(|x| x * x).sum::<f32>().sqrt(),
            ))
        }
        "vec_normalize" => {
            let v = inputs.value("vec")?.components()?;
            let len = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if len == 0.0 {
                Ok(Value::Vector(v))
            } else {
                Ok(Value::Vector(v.iter().map(|x| x / len).collect()))
            }
        }
        "vec_mix" => {
            let a = inputs.value("a")?;
            let b = inputs.value("b")?;
            let t = inputs.value("t")?.as_f32()?;
            map2(&a, &b, |x, y| x + (y - x) * t)
        }

        "math_pi" => Ok(Value::Float(std::f32::consts::PI)),
        "math_e" => Ok(Value::Float(std::f32::consts::E)),
        "math_abs" => map1(&inputs.value("a")?, f32::abs),
        "math_floor" => map1(&inputs.value("a")?, f32::floor),
        "math_ceil" => map1(&inputs.value("a")?, f32::ceil),
        "math_fract" => map1(&inputs.value("a")?, |x| x - x.floor()),
        "math_sqrt" => map1(&inputs.value("a")?, f32::sqrt),
        "math_exp" => map1(&inputs.value("a")?, f32::exp),
        "math_log" => map1(&inputs.value("a")?, f32::ln),
        "math_sin" => map1(&inputs.value("a")?, f32::sin),
        "math_cos" => map1(&inputs.value("a")?, f32::cos),
        "math_tan" => map1(&inputs.value("a")?, f32::tan),
        "math_tanh" => map1(&inputs.value("a")?, f32::tanh),
        "math_atan" => map1(&inputs.value("a")?, f32::atan),
        "math_sign" => map1(&inputs.value("a")?, f32::signum),
        "math_not" => map1(&inputs.value("a")?, |x| if x != 0.0 { 0.0 } else { 1.0 }),

        "math_add" => int_aware(node, inputs, |a, b| a.wrapping_add(b), |a, b| a + b),
        "math_sub" => int_aware(node, inputs, |a, b| a.wrapping_sub(b), |a, b| a - b),
        "math_mul" => int_aware(node, inputs, |a, b| a.wrapping_mul(b), |a, b| a * b),
        "math_div" => int_aware(
            node,
            inputs,
            |a, b| if b == 0 { 0 } else { a.wrapping_div(b) },
            |a, b| a / b,
        ),
        "math_mod" => int_aware(
            node,
            inputs,
            |a, b| if b == 0 { 0 } else { a.rem_euclid(b) },
            |a, b| a - b * (a / b).floor(),
        ),
        "math_pow" => bin(inputs, f32::powf),
        "math_min" => bin(inputs, f32::min),
        "math_max" => bin(inputs, f32::max),
        "math_atan2" => bin(inputs, f32::atan2),
        "math_and" => bin(inputs, |a, b| bool_scalar(a != 0.0 && b != 0.0)),
        "math_or" => bin(inputs, |a, b| bool_scalar(a != 0.0 || b != 0.0)),
        "math_xor" => bin(inputs, |a, b| bool_scalar((a != 0.0) != (b != 0.0))),
        "math_lt" => bin(inputs, |a, b| bool_scalar(a < b)),
        "math_gt" => bin(inputs, |a, b| bool_scalar(a > b)),
        "math_le" => bin(inputs, |a, b| bool_scalar(a <= b)),
        "math_ge" => bin(inputs, |a, b| bool_scalar(a >= b)),
        "math_eq" => bin(inputs, |a, b| bool_scalar(a == b)),
        "math_neq" => bin(inputs, |a, b| bool_scalar(a != b)),
        "math_mad" => {
            let a = inputs.value("a")?;
            let b = inputs.value("b")?;
            let c = inputs.value("c")?;
            let ab = map2(&a, &b, |x, y| x * y)?;
            map2(&ab, &c, |x, y| x + y)
        }
        "math_clamp" => {
            let a = inputs.value("a")?;
            let lo = inputs.value("b")?;
            let hi = inputs.value("c")?;
            let lower = map2(&a, &lo, f32::max)?;
            map2(&lower, &hi, f32::min)
        }
        "math_mix" => {
            let a = inputs.value("a")?;
            let b = inputs.value("b")?;
            let t = inputs.value("c")?.as_f32()?;
            map2(&a, &b, |x, y| x + (y - x) * t)
        }

        "mat_mul" => mat_mul(&inputs.value("a")?, &inputs.value("b")?),
        "mat_extract" => {
            let mat = inputs.value("mat")?.components()?;
            let index = inputs.value("index")?.as_index()?;
            let rows = match mat.len() {
                9 => 3,
                16 => 4,
                n => {
                    return Err(ShadeError::Resource(format!(
                        "mat_extract expects 9 or 16 components, got {n}"
                    )))
                }
            };
            let start = index * rows;
            mat.get(start..start + rows)
                .map(|col| Value::Vector(col.to_vec()))
                .ok_or_else(|| {
                    ShadeError::Resource(format!("matrix column {index} out of range"))
                })
        }
        "quat_mul" => {
            let a = quat(&inputs.value("a")?)?;
            let b = quat(&inputs.value("b")?)?;
            Ok(quat_value(a * b))
        }
        "quat_slerp" => {
            let a = quat(&inputs.value("a")?)?;
            let b = quat(&inputs.value("b")?)?;
            let t = inputs.value("t")?.as_f32()?;
            Ok(quat_value(a.slerp(b, t)))
        }
        "quat_to_mat4" => {
            let q = quat(&inputs.value("quat")?)?;
            let m: Matrix4<f32> = q.into();
            let cols: [[f32; 4]; 4] = m.into();
            Ok(Value::Vector(cols.into_iter().flatten().collect()))
        }
        "color_mix" => {
            // Port `b` is the source blended over the destination `a`.
            let dst = inputs.value("a")?.components()?;
            let src = inputs.value("b")?.components()?;
            Ok(Value::Vector(color_mix(&src, &dst)?))
        }

        "array_construct" => {
            let mut items = Vec::new();
            while let Some(v) = inputs.value_opt(&format!("e{}", items.len()))? {
                items.push(v);
            }
            if items.is_empty() {
                return Err(ShadeError::Resource(format!(
                    "array_construct node '{}' has no elements",
                    node.id
                )));
            }
            Ok(Value::Array(items))
        }
        "array_extract" => {
            let Value::Array(items) = inputs.value("array")? else {
                return Err(ShadeError::Resource(
                    "array_extract expects an array".to_string(),
                ));
            };
            let index = inputs.value("index")?.as_index()?;
            items.get(index).cloned().ok_or_else(|| {
                ShadeError::Resource(format!(
                    "array element {index} out of range (len {})",
                    items.len()
                ))
            })
        }
        "array_set" => {
            let Value::Array(mut items) = inputs.value("array")? else {
                return Err(ShadeError::Resource(
                    "array_set expects an array".to_string(),
                ));
            };
            let index = inputs.value("index")?.as_index()?;
            if index >= items.len() {
                return Err(ShadeError::Resource(format!(
                    "array element {index} out of range (len {})",
                    items.len()
                )));
            }
            items[index] = inputs.value("value")?;
            Ok(Value::Array(items))
        }
        "struct_construct" => {
            let name = node.require_str("struct")?;
            let def = structs
                .get(name)
                .ok_or_else(|| ShadeError::unknown("struct", name))?;
            let mut fields = Vec::with_capacity(def.fields.len());
            for field in &def.fields {
                fields.push((field.name.clone(), inputs.value(&field.name)?));
            }
            Ok(Value::Struct(fields))
        }
        "struct_extract" => {
            let field = node.require_str("field")?;
            let Value::Struct(fields) = inputs.value("struct")? else {
                return Err(ShadeError::Resource(
                    "struct_extract expects a struct".to_string(),
                ));
            };
            fields
                .into_iter()
                .find(|(name, _)| name == field)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    ShadeError::Resource(format!("struct value has no field '{field}'"))
                })
        }

        "static_cast_float" => inputs.value("value")?.cast_scalar(ScalarKind::Float),
        "static_cast_int" => inputs.value("value")?.cast_scalar(ScalarKind::Int),
        "static_cast_uint" => inputs.value("value")?.cast_scalar(ScalarKind::UInt),
        "static_cast_bool" => inputs.value("value")?.cast_scalar(ScalarKind::Bool),

        other => Err(ShadeError::Resource(format!(
            "op '{other}' has no host evaluation"
        ))),
    }
}

fn bool_scalar(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Applies a swizzle string to a value's components.
pub fn swizzle(value: &Value, channels: &str) -> ShadeResult<Value> {
    let comps = value.components()?;
    let indices = parse_swizzle(channels)?;
    let mut out = Vec::with_capacity(indices.len());
    for idx in &indices {
        out.push(*comps.get(*idx).ok_or_else(|| {
            ShadeError::Resource(format!(
                "swizzle channel {} out of range for a {}-component value",
                channels, comps.len()
            ))
        })?);
    }
    if out.len() == 1 {
        Ok(Value::Float(out[0]))
    } else {
        Ok(Value::Vector(out))
    }
}

/// The premultiplied source-over blend used by `color_mix`.
pub fn color_mix(src: &[f32], dst: &[f32]) -> ShadeResult<Vec<f32>> {
    if src.len() != 4 || dst.len() != 4 {
        return Err(ShadeError::Resource(
            "color_mix expects two float4 colors".to_string(),
        ));
    }
    let src_a = src[3];
    let dst_a = dst[3];
    let out_a = src_a + dst_a * (1.0 - src_a);
    if out_a < 1e-5 {
        return Ok(vec![0.0, 0.0, 0.0, 0.0]);
    }
    let mut out = vec![0.0; 4];
    for i in 0..3 {
        out[i] = (src[i] * src_a + dst[i] * dst_a * (1.0 - src_a)) / out_a;
    }
    out[3] = out_a;
    Ok(out)
}

fn map1(a: &Value, f: impl Fn(f32) -> f32) -> ShadeResult<Value> {
    if a.is_scalar() {
        Ok(Value::Float(f(a.as_f32()?)))
    } else {
        Ok(Value::Vector(
            a.components()?.into_iter().map(f).collect(),
        ))
    }
}

/// Element-wise combine with scalar/vector broadcasting.
pub fn map2(a: &Value, b: &Value, f: impl Fn(f32, f32) -> f32) -> ShadeResult<Value> {
    match (a.is_scalar(), b.is_scalar()) {
        (true, true) => Ok(Value::Float(f(a.as_f32()?, b.as_f32()?))),
        (true, false) => {
            let x = a.as_f32()?;
            Ok(Value::Vector(
                b.components()?.into_iter().map(|y| f(x, y)).collect(),
            ))
        }
        (false, true) => {
            let y = b.as_f32()?;
            Ok(Value::Vector(
                a.components()?.into_iter().map(|x| f(x, y)).collect(),
            ))
        }
        (false, false) => {
            let xs = a.components()?;
            let ys = b.components()?;
            if xs.len() != ys.len() {
                return Err(ShadeError::Resource(format!(
                    "component count mismatch: {} vs {}",
                    xs.len(),
                    ys.len()
                )));
            }
            Ok(Value::Vector(
                xs.into_iter().zip(ys).map(|(x, y)| f(x, y)).collect(),
            ))
        }
    }
}

fn bin(inputs: &mut dyn Inputs, f: impl Fn(f32, f32) -> f32) -> ShadeResult<Value> {
    let a = inputs.value("a")?;
    let b = inputs.value("b")?;
    map2(&a, &b, f)
}

/// Integer-exact arithmetic when both operands are `Int` scalars, float
/// semantics otherwise (WGSL `/` is integer division on `i32`).
fn int_aware(
    _node: &Node,
    inputs: &mut dyn Inputs,
    fi: impl Fn(i32, i32) -> i32,
    ff: impl Fn(f32, f32) -> f32,
) -> ShadeResult<Value> {
    let a = inputs.value("a")?;
    let b = inputs.value("b")?;
    if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
        return Ok(Value::Int(fi(*x, *y)));
    }
    map2(&a, &b, ff)
}

fn construct_vector(
    node: &Node,
    inputs: &mut dyn Inputs,
    kind: ScalarKind,
    width: usize,
) -> ShadeResult<Value> {
    let groups = inputs.channel_groups()?;
    let mut comps = vec![f32::NAN; width];
    for (group, value) in &groups {
        let indices: Vec<usize> = group.chars().filter_map(channel_index).collect();
        if value.is_scalar() {
            // Broadcast form replicates a scalar across its group.
            let x = value.as_f32()?;
            for idx in &indices {
                comps[*idx] = x;
            }
        } else {
            let vals = value.components()?;
            if vals.len() != indices.len() {
                return Err(ShadeError::Resource(format!(
                    "group '{group}' of node '{}' expects {} components, got {}",
                    node.id,
                    indices.len(),
                    vals.len()
                )));
            }
            for (idx, v) in indices.iter().zip(vals) {
                comps[*idx] = v;
            }
        }
    }
    if comps.iter().any(|c| c.is_nan()) {
        return Err(ShadeError::Resource(format!(
            "constructor node '{}' leaves components uncovered",
            node.id
        )));
    }
    if kind == ScalarKind::Int {
        comps = comps.into_iter().map(|c| (c as i32) as f32).collect();
    }
    Ok(Value::Vector(comps))
}

fn construct_matrix(inputs: &mut dyn Inputs, cols: usize) -> ShadeResult<Value> {
    let mut comps = Vec::with_capacity(cols * cols);
    for c in 0..cols {
        let col = inputs.value(&format!("c{c}"))?.components()?;
        if col.len() != cols {
            return Err(ShadeError::Resource(format!(
                "matrix column c{c} expects {cols} components, got {}",
                col.len()
            )));
        }
        comps.extend(col);
    }
    Ok(Value::Vector(comps))
}

fn mat_mul(a: &Value, b: &Value) -> ShadeResult<Value> {
    let ac = a.components()?;
    let bc = b.components()?;
    match (ac.len(), bc.len()) {
        (9, 9) => {
            let m = mat3(&ac) * mat3(&bc);
            let cols: [[f32; 3]; 3] = m.into();
            Ok(Value::Vector(cols.into_iter().flatten().collect()))
        }
        (9, 3) => {
            let v = mat3(&ac) * Vector3::new(bc[0], bc[1], bc[2]);
            Ok(Value::Vector(vec![v.x, v.y, v.z]))
        }
        (16, 16) => {
            let m = mat4(&ac) * mat4(&bc);
            let cols: [[f32; 4]; 4] = m.into();
            Ok(Value::Vector(cols.into_iter().flatten().collect()))
        }
        (16, 4) => {
            let v = mat4(&ac) * Vector4::new(bc[0], bc[1], bc[2], bc[3]);
            Ok(Value::Vector(vec![v.x, v.y, v.z, v.w]))
        }
        (x, y) => Err(ShadeError::Resource(format!(
            "mat_mul cannot combine {x} and {y} components"
        ))),
    }
}

fn mat3(c: &[f32]) -> Matrix3<f32> {
    Matrix3::new(c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7], c[8])
}

fn mat4(c: &[f32]) -> Matrix4<f32> {
    Matrix4::new(
        c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7], c[8], c[9], c[10], c[11], c[12], c[13],
        c[14], c[15],
    )
}

fn quat(v: &Value) -> ShadeResult<Quaternion<f32>> {
    let c = v.components()?;
    if c.len() != 4 {
        return Err(ShadeError::Resource(
            "quaternion values need 4 components (x, y, z, w)".to_string(),
        ));
    }
    Ok(Quaternion::new(c[3], c[0], c[1], c[2]))
}

fn quat_value(q: Quaternion<f32>) -> Value {
    Value::Vector(vec![q.v.x, q.v.y, q.v.z, q.s])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;
    use serde_json::json;

    /// Test resolver backed by a plain map; groups are every entry whose
    /// key is a channel group.
    struct MapInputs(FxHashMap<String, Value>);

    impl Inputs for MapInputs {
        fn value(&mut self, port: &str) -> ShadeResult<Value> {
            self.0
                .get(port)
                .cloned()
                .ok_or_else(|| ShadeError::Resource(format!("missing input '{port}'")))
        }
        fn value_opt(&mut self, port: &str) -> ShadeResult<Option<Value>> {
            Ok(self.0.get(port).cloned())
        }
        fn channel_groups(&mut self) -> ShadeResult<Vec<(String, Value)>> {
            Ok(self
                .0
                .iter()
                .filter(|(k, _)| ops::is_channel_group(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    fn inputs(pairs: &[(&str, Value)]) -> MapInputs {
        MapInputs(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn run(op: &str, pairs: &[(&str, Value)]) -> Value {
        let node = Node::new("n", op);
        apply(&node, &mut inputs(pairs), &StructRegistry::default()).unwrap()
    }

    #[test]
    fn test_swizzle_reverse_and_expand() {
        // float4(1,2,3,4).wzyx == [4,3,2,1]
        let v = Value::Vector(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            swizzle(&v, "wzyx").unwrap(),
            Value::Vector(vec![4.0, 3.0, 2.0, 1.0])
        );
        // float2(1,2).yxy == [2,1,2]
        let v2 = Value::Vector(vec![1.0, 2.0]);
        assert_eq!(
            swizzle(&v2, "yxy").unwrap(),
            Value::Vector(vec![2.0, 1.0, 2.0])
        );
        assert_eq!(swizzle(&v, "a").unwrap(), Value::Float(4.0));
        assert!(swizzle(&v2, "z").is_err());
    }

    #[test]
    fn test_color_mix_source_over() {
        // S1: a=[1,0,0,1], b=[0,1,0,0.5] -> [0.5, 0.5, 0, 1]; port `b`
        // is the source blended over the destination `a`.
        let out = run(
            "color_mix",
            &[
                ("a", Value::Vector(vec![1.0, 0.0, 0.0, 1.0])),
                ("b", Value::Vector(vec![0.0, 1.0, 0.0, 0.5])),
            ],
        );
        let Value::Vector(out) = out else {
            panic!("expected a vector result");
        };
        for (got, want) in out.iter().zip([0.5, 0.5, 0.0, 1.0]) {
            assert!((got - want).abs() < 1e-5, "got {out:?}");
        }
        // An opaque source fully covers the destination.
        let out = color_mix(&[1.0, 0.0, 0.0, 1.0], &[0.0, 1.0, 0.0, 0.5]).unwrap();
        for (got, want) in out.iter().zip([1.0, 0.0, 0.0, 1.0]) {
            assert!((got - want).abs() < 1e-5);
        }
        // Fully transparent output collapses to zero.
        let out = color_mix(&[1.0, 1.0, 1.0, 0.0], &[0.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_constructor_groups_concatenate_in_channel_order() {
        let node = Node::new("c", "float4");
        let mut res = inputs(&[
            ("w", Value::Float(1.0)),
            ("xyz", Value::Vector(vec![0.2, 0.4, 0.6])),
        ]);
        let v = apply(&node, &mut res, &StructRegistry::default()).unwrap();
        assert_eq!(v, Value::Vector(vec![0.2, 0.4, 0.6, 1.0]));
    }

    #[test]
    fn test_constructor_broadcast_scalar() {
        let node = Node::new("c", "float3");
        let mut res = inputs(&[("xyz", Value::Float(2.5))]);
        let v = apply(&node, &mut res, &StructRegistry::default()).unwrap();
        assert_eq!(v, Value::Vector(vec![2.5, 2.5, 2.5]));
    }

    #[test]
    fn test_int_constructor_truncates() {
        let node = Node::new("c", "int2");
        let mut res = inputs(&[("xy", Value::Vector(vec![1.9, -2.1]))]);
        let v = apply(&node, &mut res, &StructRegistry::default()).unwrap();
        assert_eq!(v, Value::Vector(vec![1.0, -2.0]));
    }

    #[test]
    fn test_mod_matches_floor_definition() {
        let v = run(
            "math_mod",
            &[("a", Value::Float(-3.0)), ("b", Value::Float(2.0))],
        );
        // -3 - 2*floor(-3/2) = -3 - 2*(-2) = 1
        assert_eq!(v, Value::Float(1.0));
    }

    #[test]
    fn test_comparisons_compose_as_scalars() {
        let lt = run(
            "math_lt",
            &[("a", Value::Float(1.0)), ("b", Value::Float(2.0))],
        );
        assert_eq!(lt, Value::Float(1.0));
        let and = run(
            "math_and",
            &[("a", lt), ("b", Value::Float(0.0))],
        );
        assert_eq!(and, Value::Float(0.0));
    }

    #[test]
    fn test_broadcasting_scalar_vector() {
        let v = run(
            "math_mul",
            &[
                ("a", Value::Float(2.0)),
                ("b", Value::Vector(vec![1.0, 2.0, 3.0])),
            ],
        );
        assert_eq!(v, Value::Vector(vec![2.0, 4.0, 6.0]));
    }

    #[test]
    fn test_integer_division_stays_integral() {
        let v = run("math_div", &[("a", Value::Int(7)), ("b", Value::Int(2))]);
        assert_eq!(v, Value::Int(3));
        let f = run(
            "math_div",
            &[("a", Value::Float(7.0)), ("b", Value::Float(2.0))],
        );
        assert_eq!(f, Value::Float(3.5));
    }

    #[test]
    fn test_mat_identity_roundtrip() {
        let identity: Vec<f32> = vec![
            1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0,
        ];
        let v = run(
            "mat_mul",
            &[
                ("a", Value::Vector(identity.clone())),
                ("b", Value::Vector(vec![1.0, 2.0, 3.0])),
            ],
        );
        assert_eq!(v, Value::Vector(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_quat_mul_identity() {
        let id = Value::Vector(vec![0.0, 0.0, 0.0, 1.0]);
        let q = Value::Vector(vec![0.5, 0.5, 0.5, 0.5]);
        assert_eq!(run("quat_mul", &[("a", id), ("b", q.clone())]), q);
    }

    #[test]
    fn test_quat_to_mat4_identity() {
        let v = run(
            "quat_to_mat4",
            &[("quat", Value::Vector(vec![0.0, 0.0, 0.0, 1.0]))],
        );
        let Value::Vector(m) = v else { panic!() };
        for (i, x) in m.iter().enumerate() {
            let want = if i % 5 == 0 { 1.0 } else { 0.0 };
            assert!((x - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_array_ops() {
        let arr = run(
            "array_construct",
            &[
                ("e0", Value::Float(1.0)),
                ("e1", Value::Float(2.0)),
                ("e2", Value::Float(3.0)),
            ],
        );
        let second = run(
            "array_extract",
            &[("array", arr.clone()), ("index", Value::Int(1))],
        );
        assert_eq!(second, Value::Float(2.0));
        let node = Node::new("n", "array_extract");
        let err = apply(
            &node,
            &mut inputs(&[("array", arr), ("index", Value::Int(9))]),
            &StructRegistry::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_casts() {
        assert_eq!(
            run("static_cast_int", &[("value", Value::Float(3.7))]),
            Value::Int(3)
        );
        assert_eq!(
            run("static_cast_bool", &[("value", Value::Float(0.0))]),
            Value::Bool(false)
        );
        assert_eq!(
            run("static_cast_float", &[("value", Value::Bool(true))]),
            Value::Float(1.0)
        );
    }
}
