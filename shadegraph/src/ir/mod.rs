//! The intermediate representation: typed graphs of operations.
//!
//! An [`IrDocument`] bundles function definitions, resource declarations,
//! named struct types, uniform-like input declarations and an entry-point
//! function id. Functions hold nodes and edges; nodes expose named data
//! ports and execution ports, edges connect them. The wire form is a plain
//! serde tree; auxiliary keys on a node (op-specific literals) are
//! preserved verbatim through a flattened map.
//!
//! Documents are immutable inputs to the runtime: transforms that rewrite
//! them (the force-GPU transform) clone first.

pub mod infer;
pub mod validate;

use crate::core::error::{ShadeError, ShadeResult};
use crate::core::types::ValueType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named struct types, keyed by name.
pub type StructRegistry = BTreeMap<String, StructDef>;

/// A complete IR document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IrDocument {
    /// Function definitions.
    #[serde(default)]
    pub functions: Vec<Function>,
    /// Resource declarations; ids are unique across the document.
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Named struct types.
    #[serde(default)]
    pub structs: Vec<StructDef>,
    /// Uniform-like input declarations.
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    /// Id of the function executed by `run`.
    pub entry_point: String,
}

impl IrDocument {
    /// Looks up a function by id.
    pub fn function(&self, id: &str) -> ShadeResult<&Function> {
        self.functions
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| ShadeError::unknown("function", id))
    }

    /// Looks up a resource by id.
    pub fn resource(&self, id: &str) -> ShadeResult<&Resource> {
        self.resources
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| ShadeError::unknown("resource", id))
    }

    /// Builds the struct lookup table.
    pub fn struct_registry(&self) -> StructRegistry {
        self.structs
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect()
    }

    /// Looks up an input declaration by id.
    pub fn input(&self, id: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|i| i.id == id)
    }
}

/// Whether a function runs host-side or as a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    /// Host-side execution.
    Cpu,
    /// Compiled to a shader stage.
    Shader,
}

/// A function definition: ports, locals and the operation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    /// Unique function id.
    pub id: String,
    /// Host or shader.
    #[serde(rename = "type")]
    pub kind: FunctionKind,
    /// Ordered input ports.
    #[serde(default)]
    pub inputs: Vec<Port>,
    /// Ordered output ports.
    #[serde(default)]
    pub outputs: Vec<Port>,
    /// Local variable declarations.
    #[serde(default)]
    pub local_vars: Vec<LocalVar>,
    /// Operation nodes; ids are unique within the function.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Data and execution edges between nodes.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Function {
    /// Looks up a node by id.
    pub fn node(&self, id: &str) -> ShadeResult<&Node> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| ShadeError::unknown("node", id))
    }

    /// Looks up a local variable declaration.
    pub fn local_var(&self, id: &str) -> Option<&LocalVar> {
        self.local_vars.iter().find(|v| v.id == id)
    }

    /// The data edge arriving at `(node, port)`, if any.
    pub fn data_edge_to<'a>(&'a self, node: &str, port: &str) -> Option<&'a Edge> {
        self.edges
            .iter()
            .find(|e| e.kind == EdgeKind::Data && e.to == node && e.port_in == port)
    }

    /// All data edges arriving at `node`, in declaration order.
    pub fn data_edges_to<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.kind == EdgeKind::Data && e.to == node)
    }

    /// The execution edge leaving `(node, port)`, if any.
    pub fn exec_edge_from<'a>(&'a self, node: &str, port: &str) -> Option<&'a Edge> {
        self.edges
            .iter()
            .find(|e| e.kind == EdgeKind::Execution && e.from == node && e.port_out == port)
    }

    /// True when `node` has any incoming execution edge.
    pub fn has_exec_predecessor(&self, node: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.kind == EdgeKind::Execution && e.to == node)
    }
}

/// A typed port on a function boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Port id, unique within the function's side.
    pub id: String,
    /// Declared type tag, when known statically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

/// A local variable declaration inside a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalVar {
    /// Variable id.
    pub id: String,
    /// Declared type tag.
    pub data_type: String,
    /// Optional literal initial value; zero of the type otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<serde_json::Value>,
}

impl LocalVar {
    /// Parses the declared type tag.
    pub fn value_type(&self) -> ShadeResult<ValueType> {
        ValueType::parse(&self.data_type)
    }
}

/// An operation node.
///
/// Beyond `id` and `op`, nodes carry arbitrary auxiliary keys per op
/// (`var`, `buffer`, `channels`, `dispatch`, literal arguments, ...) which
/// round-trip verbatim through `args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node id, unique within the function.
    pub id: String,
    /// Operation name, see [`crate::ops`].
    pub op: String,
    /// Op-specific auxiliary keys, preserved verbatim.
    #[serde(flatten)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    /// Creates a node with no auxiliary keys.
    pub fn new(id: impl Into<String>, op: impl Into<String>) -> Node {
        Node {
            id: id.into(),
            op: op.into(),
            args: serde_json::Map::new(),
        }
    }

    /// Adds an auxiliary key (builder style).
    pub fn with_arg(mut self, key: &str, value: serde_json::Value) -> Node {
        self.args.insert(key.to_string(), value);
        self
    }

    /// A string-valued auxiliary key.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }

    /// A numeric auxiliary key as `f64`.
    pub fn arg_f64(&self, key: &str) -> Option<f64> {
        self.args.get(key).and_then(|v| v.as_f64())
    }

    /// A raw auxiliary key.
    pub fn arg(&self, key: &str) -> Option<&serde_json::Value> {
        self.args.get(key)
    }

    /// The required string key, or a resource error naming the node.
    pub fn require_str(&self, key: &str) -> ShadeResult<&str> {
        self.arg_str(key).ok_or_else(|| {
            ShadeError::Resource(format!(
                "node '{}' (op {}) is missing required key '{key}'",
                self.id, self.op
            ))
        })
    }
}

/// Whether an edge carries data or execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Value flow into a named input port.
    Data,
    /// Execution ordering between executable nodes.
    Execution,
}

/// A directed edge between two node ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Source node id; may carry an inline swizzle suffix (`"n1.xyz"`).
    pub from: String,
    /// Source port name (usually `"result"` or an exec port).
    pub port_out: String,
    /// Destination node id.
    pub to: String,
    /// Destination port name.
    pub port_in: String,
    /// Data or execution.
    #[serde(rename = "type")]
    pub kind: EdgeKind,
}

impl Edge {
    /// Creates a data edge from `from`'s result port.
    pub fn data(from: impl Into<String>, to: impl Into<String>, port_in: impl Into<String>) -> Edge {
        Edge {
            from: from.into(),
            port_out: "result".to_string(),
            to: to.into(),
            port_in: port_in.into(),
            kind: EdgeKind::Data,
        }
    }

    /// Creates an execution edge from `from`'s `exec_out` port.
    pub fn exec(from: impl Into<String>, to: impl Into<String>) -> Edge {
        Edge::exec_port(from, "exec_out", to)
    }

    /// Creates an execution edge from a specific exec port.
    pub fn exec_port(
        from: impl Into<String>,
        port_out: impl Into<String>,
        to: impl Into<String>,
    ) -> Edge {
        Edge {
            from: from.into(),
            port_out: port_out.into(),
            to: to.into(),
            port_in: "exec_in".to_string(),
            kind: EdgeKind::Execution,
        }
    }
}

/// What kind of GPU object backs a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Linear storage buffer of typed elements.
    Buffer,
    /// Two-dimensional texture.
    Texture2d,
    /// Sampler object.
    Sampler,
}

/// Texture formats supported by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureFormat {
    /// 8-bit normalized RGBA; host floats in [0,1] convert to `u8`.
    Rgba8,
    /// Single-channel 32-bit float.
    R32f,
    /// Four-channel 32-bit float.
    Rgba32f,
}

impl TextureFormat {
    /// Bytes per texel.
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::R32f => 4,
            TextureFormat::Rgba32f => 16,
        }
    }

    /// Scalar channels per texel.
    pub fn channels(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::R32f => 1,
            TextureFormat::Rgba32f => 4,
        }
    }
}

/// Retention policy for a resource's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Persistence {
    /// Contents persist across runs.
    #[default]
    Retain,
    /// Cleared at the start of every frame.
    ClearPerFrame,
    /// Cleared when the resource is resized.
    ClearOnResize,
    /// Contents are read back to the host after GPU writes.
    CpuAccess,
}

/// Declared size: element count for buffers, width/height for textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceSize {
    /// 1-D element count.
    Elements(u64),
    /// 2-D texel dimensions.
    Texture2d([u32; 2]),
}

impl ResourceSize {
    /// The linear element count (texels for textures).
    pub fn element_count(&self) -> u64 {
        match self {
            ResourceSize::Elements(n) => *n,
            ResourceSize::Texture2d([w, h]) => u64::from(*w) * u64::from(*h),
        }
    }
}

/// A resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Unique id across the document.
    pub id: String,
    /// Buffer, texture or sampler.
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    /// Element type tag for buffers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Texel format for textures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<TextureFormat>,
    /// Fixed size.
    pub size: ResourceSize,
    /// Retention policy.
    #[serde(default)]
    pub persistence: Persistence,
}

impl Resource {
    /// The buffer element type; `float` when unspecified.
    pub fn element_type(&self) -> ShadeResult<ValueType> {
        match &self.data_type {
            Some(tag) => ValueType::parse(tag),
            None => Ok(ValueType::Float),
        }
    }

    /// The texture format; `rgba8` when unspecified.
    pub fn texture_format(&self) -> TextureFormat {
        self.format.unwrap_or(TextureFormat::Rgba8)
    }
}

/// A uniform-like input declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDecl {
    /// Input id, referenced by `var_get`.
    pub id: String,
    /// Type tag. `array<T,0>` declares a runtime-length array.
    pub data_type: String,
    /// Optional default when the host supplies no value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl InputDecl {
    /// Parses the declared type tag.
    pub fn value_type(&self) -> ShadeResult<ValueType> {
        ValueType::parse(&self.data_type)
    }
}

/// A named struct type: an ordered sequence of typed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructDef {
    /// Struct name, referenced by `struct:<name>` tags.
    pub name: String,
    /// Ordered fields.
    pub fields: Vec<StructField>,
}

/// One field in a struct definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructField {
    /// Field name.
    pub name: String,
    /// Field type tag.
    pub data_type: String,
}

/// Splits an id with an optional inline swizzle suffix.
///
/// `"n1.xyz"` -> `("n1", Some("xyz"))`; `"n1"` -> `("n1", None)`. The split
/// happens at the first `.`.
pub fn split_swizzle_suffix(id: &str) -> (&str, Option<&str>) {
    match id.split_once('.') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (id, None),
    }
}
