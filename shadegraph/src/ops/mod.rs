//! The built-in operator library, shared between the shader generator and
//! the host evaluator.
//!
//! # Port conventions
//!
//! Data inputs are named ports; most ops use `a`/`b`/`c`. The single data
//! output is the unnamed `result` port. Executable ops additionally expose
//! `exec_in`/`exec_out`, plus op-specific `exec_true`/`exec_false`
//! (`flow_branch`) and `exec_body`/`exec_completed` (`flow_loop`).
//!
//! | op group | data ports / keys |
//! |---|---|
//! | `literal` | key `value`, optional key `dataType` |
//! | `float`/`int`/`bool` | port or key `value` |
//! | `floatN`/`intN` | channel-group ports/keys over `xyzw` (`x`, `xy`, `xyz`, ...) |
//! | `float3x3`/`float4x4` | column ports `c0..cN` |
//! | `vec_swizzle` | port `vec`, key `channels` |
//! | `vec_get_element` | ports `vec`, `index` |
//! | `vec_dot`/`vec_mix` | ports `a`, `b` (+ `t` for mix) |
//! | `vec_length`/`vec_normalize` | port `vec` |
//! | `math_*` | ports `a` (+ `b`, + `c` for `mad`/`clamp`/`mix`) |
//! | `color_mix` | ports `a` (destination), `b` (source blended over `a`) |
//! | `mat_mul`/`quat_mul` | ports `a`, `b` |
//! | `mat_extract` | ports `mat`, `index` |
//! | `quat_slerp` | ports `a`, `b`, `t` |
//! | `quat_to_mat4` | port `quat` |
//! | `var_get`/`var_set` | key `var` (+ port `value` for set) |
//! | `buffer_load`/`buffer_store` | key `buffer`, ports `index` (+ `value`) |
//! | `texture_load`/`texture_store` | key `texture`, ports `coord` (+ `value`) |
//! | `array_construct` | element ports `e0..eN` |
//! | `array_extract`/`array_set` | ports `array`, `index` (+ `value`) |
//! | `struct_construct` | key `struct`, field-named ports |
//! | `struct_extract` | port `struct`, key `field` |
//! | `static_cast_*` | port `value` |
//! | `flow_branch` | port `cond` |
//! | `flow_loop` | ports `start`, `end` |
//! | `loop_index` | optional key `loop` naming the loop node |
//! | `func_return` | port `value` |
//! | `cmd_dispatch` | keys `func`, `dispatch`; argument ports named after the callee's inputs |
//! | `cmd_draw` | keys `target`, `vertex`, `fragment`, `count`, `pipeline` |
//! | `cmd_resize_resource` | key `resource`, port `size` |
//! | `cmd_sync_to_cpu`/`cmd_wait_cpu_sync` | key `resource` |
//! | `call_func` | key `func`; argument ports named after the callee's inputs |
//! | `builtin_get` | key `name` |

pub mod eval;

use crate::core::types::{channel_index, ScalarKind, ValueType};

/// Execution input port.
pub const EXEC_IN: &str = "exec_in";
/// Execution output port.
pub const EXEC_OUT: &str = "exec_out";
/// Branch taken-arm port.
pub const EXEC_TRUE: &str = "exec_true";
/// Branch fallthrough-arm port.
pub const EXEC_FALSE: &str = "exec_false";
/// Loop body port.
pub const EXEC_BODY: &str = "exec_body";
/// Loop completion port.
pub const EXEC_COMPLETED: &str = "exec_completed";

/// True when the op participates in the execution graph.
///
/// Executable ops are `cmd_*`, `flow_*` and the side-effecting set
/// `var_set`, `buffer_store`, `texture_store`, `call_func`, `func_return`.
pub fn is_executable(op: &str) -> bool {
    op.starts_with("cmd_")
        || op.starts_with("flow_")
        || matches!(
            op,
            "var_set" | "buffer_store" | "texture_store" | "call_func" | "func_return"
        )
}

/// The execution output ports an op may drive.
pub fn exec_out_ports(op: &str) -> &'static [&'static str] {
    match op {
        "flow_branch" => &[EXEC_TRUE, EXEC_FALSE],
        "flow_loop" => &[EXEC_BODY, EXEC_COMPLETED],
        "func_return" => &[],
        _ => &[EXEC_OUT],
    }
}

/// Constructor target for `floatN`/`intN` ops: scalar kind and width.
pub fn constructor_target(op: &str) -> Option<(ScalarKind, usize)> {
    match op {
        "float2" => Some((ScalarKind::Float, 2)),
        "float3" => Some((ScalarKind::Float, 3)),
        "float4" => Some((ScalarKind::Float, 4)),
        "int2" => Some((ScalarKind::Int, 2)),
        "int3" => Some((ScalarKind::Int, 3)),
        "int4" => Some((ScalarKind::Int, 4)),
        _ => None,
    }
}

/// True when `key` is a well-formed channel group (`x`, `xy`, `zw`, ...).
///
/// Groups must be contiguous ascending runs so that concatenating the
/// accepted groups in `x,y,z,w` order reproduces component order.
pub fn is_channel_group(key: &str) -> bool {
    if key.is_empty() || key.len() > 4 {
        return false;
    }
    let mut prev: Option<usize> = None;
    for c in key.chars() {
        let Some(idx) = channel_index(c) else {
            return false;
        };
        if let Some(p) = prev {
            if idx != p + 1 {
                return false;
            }
        }
        prev = Some(idx);
    }
    true
}

/// Built-in value names readable on the CPU backend.
pub const CPU_BUILTINS: &[&str] = &["time", "delta_time", "bpm", "beat_number", "beat_delta"];

/// Built-in value names only available inside shaders.
pub const GPU_BUILTINS: &[&str] = &[
    "position",
    "vertex_index",
    "instance_index",
    "global_invocation_id",
    "local_invocation_id",
    "workgroup_id",
    "local_invocation_index",
    "num_workgroups",
    "frag_coord",
    "front_facing",
];

/// The inferred type of a built-in read, plus whether it is GPU-only.
pub fn builtin_type(name: &str) -> Option<(ValueType, bool)> {
    match name {
        "time" | "delta_time" | "bpm" | "beat_number" | "beat_delta" => {
            Some((ValueType::Float, false))
        }
        "global_invocation_id" | "local_invocation_id" | "workgroup_id" | "num_workgroups" => {
            Some((ValueType::Int3, true))
        }
        "vertex_index" | "instance_index" | "local_invocation_index" => {
            Some((ValueType::Int, true))
        }
        "position" | "frag_coord" => Some((ValueType::Float4, true)),
        "front_facing" => Some((ValueType::Bool, true)),
        _ => None,
    }
}
