//! Model container: a versioned, single-buffer graph description.
//!
//! Layout:
//! ```text
//! ┌──────────────────────────────────┐
//! │ Magic: "KSTL" (4 bytes)          │
//! │ Schema version: u32 LE           │
//! │ Header size: u32 LE              │
//! ├──────────────────────────────────┤
//! │ Header JSON (tensors, ops, I/O)  │
//! ├──────────────────────────────────┤
//! │ Padding to 16-byte alignment     │
//! ├──────────────────────────────────┤
//! │ Constant blob (weights, biases)  │
//! └──────────────────────────────────┘
//! ```
//!
//! [`Model::from_bytes`] only maps the buffer: it checks the magic and the
//! header bounds and copies nothing, so it is cheap enough to run on a
//! `'static` byte array embedded with `include_bytes!`. The schema version is
//! checked by the session before [`Model::graph`] parses the header.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::arena::align_up;
use crate::ops::OpCode;
use crate::tensor::{DType, QuantParams, Shape};

/// Magic bytes identifying a model container.
pub const MAGIC: &[u8; 4] = b"KSTL";

/// Schema version this runtime understands.
pub const SCHEMA_VERSION: u32 = 3;

/// Alignment of the constant blob relative to the start of the container.
const BLOB_ALIGNMENT: usize = 16;

const PREAMBLE: usize = 12;

/// Byte range of a constant tensor inside the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRef {
    pub offset: usize,
    pub nbytes: usize,
}

/// Declaration of one tensor in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDef {
    pub name: String,
    pub dtype: DType,
    pub shape: Shape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quant: Option<QuantParams>,
    /// Set for constant tensors stored in the blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferRef>,
}

impl TensorDef {
    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes occupied by the tensor's elements.
    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel())
    }

    /// `nbytes`, or `None` if the shape overflows `usize`.
    pub fn checked_nbytes(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))?
            .checked_mul(self.dtype.element_size())
    }

    pub fn is_constant(&self) -> bool {
        self.buffer.is_some()
    }

    /// Affine parameters, identity when the tensor is not quantized.
    pub fn quant_params(&self) -> QuantParams {
        self.quant.unwrap_or_default()
    }
}

/// One operator application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpNode {
    /// Operator name as written by the converter.
    pub op: String,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

impl OpNode {
    /// The operator this node runs, if the runtime knows it.
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_str(&self.op)
    }
}

/// Parsed graph header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub name: String,
    pub tensors: Vec<TensorDef>,
    pub ops: Vec<OpNode>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl Graph {
    pub fn tensor(&self, index: usize) -> Option<&TensorDef> {
        self.tensors.get(index)
    }

    /// Distinct operator names referenced by the graph, sorted.
    pub fn operator_names(&self) -> BTreeSet<&str> {
        self.ops.iter().map(|n| n.op.as_str()).collect()
    }

    /// Check every index and constant range against the tensor table and a
    /// blob of `blob_len` bytes, and that ops appear in dependency order.
    pub fn validate(&self, blob_len: usize) -> Result<(), FormatError> {
        let n = self.tensors.len();
        let mut activation_bytes = 0usize;
        for (i, t) in self.tensors.iter().enumerate() {
            let size = t.checked_nbytes().ok_or_else(|| {
                FormatError::InvalidGraph(format!("tensor {} '{}' shape {:?} overflows", i, t.name, t.shape.as_slice()))
            })?;
            if !t.is_constant() {
                activation_bytes = activation_bytes
                    .checked_add(size)
                    .and_then(|total| total.checked_add(BLOB_ALIGNMENT))
                    .ok_or_else(|| FormatError::InvalidGraph("activation tensors overflow the address space".into()))?;
            }
            if let Some(buf) = t.buffer {
                if buf.nbytes != size {
                    return Err(FormatError::InvalidGraph(format!(
                        "tensor {} '{}' declares {} bytes, shape needs {}",
                        i, t.name, buf.nbytes, size
                    )));
                }
                let end = buf.offset.checked_add(buf.nbytes);
                if end.map_or(true, |e| e > blob_len) {
                    return Err(FormatError::InvalidGraph(format!(
                        "tensor {} '{}' buffer lies outside the {}-byte blob",
                        i, t.name, blob_len
                    )));
                }
            }
        }

        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(FormatError::InvalidGraph("graph needs at least one input and one output".into()));
        }
        for &i in self.inputs.iter().chain(&self.outputs) {
            match self.tensors.get(i) {
                None => return Err(FormatError::InvalidGraph(format!("graph I/O tensor {} out of range", i))),
                Some(t) if t.is_constant() => {
                    return Err(FormatError::InvalidGraph(format!("graph I/O tensor '{}' is constant", t.name)))
                }
                Some(_) => {}
            }
        }

        let mut available = vec![false; n];
        for (i, t) in self.tensors.iter().enumerate() {
            available[i] = t.is_constant();
        }
        for &i in &self.inputs {
            available[i] = true;
        }
        for (k, node) in self.ops.iter().enumerate() {
            for &i in &node.inputs {
                if i >= n {
                    return Err(FormatError::InvalidGraph(format!("op {} ({}) reads tensor {} out of range", k, node.op, i)));
                }
                if !available[i] {
                    return Err(FormatError::InvalidGraph(format!(
                        "op {} ({}) reads '{}' before it is produced",
                        k, node.op, self.tensors[i].name
                    )));
                }
            }
            for &o in &node.outputs {
                if o >= n {
                    return Err(FormatError::InvalidGraph(format!("op {} ({}) writes tensor {} out of range", k, node.op, o)));
                }
                if available[o] {
                    return Err(FormatError::InvalidGraph(format!(
                        "op {} ({}) writes '{}' which is already defined",
                        k, node.op, self.tensors[o].name
                    )));
                }
                available[o] = true;
            }
        }
        for &o in &self.outputs {
            if !available[o] {
                return Err(FormatError::InvalidGraph(format!(
                    "graph output '{}' is never produced",
                    self.tensors[o].name
                )));
            }
        }
        Ok(())
    }
}

/// A mapped model container. Borrows the bytes; never mutates them.
#[derive(Debug, Clone, Copy)]
pub struct Model<'a> {
    data: &'a [u8],
    header_size: usize,
}

impl<'a> Model<'a> {
    /// Map a container. Checks magic and header bounds only.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, FormatError> {
        if data.len() < PREAMBLE {
            return Err(FormatError::TooSmall);
        }
        if &data[0..4] != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let header_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        match PREAMBLE.checked_add(header_size) {
            Some(end) if end <= data.len() => {}
            _ => return Err(FormatError::TooSmall),
        }
        Ok(Model { data, header_size })
    }

    /// Declared schema version.
    pub fn version(&self) -> u32 {
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    /// Whether the declared version matches [`SCHEMA_VERSION`].
    pub fn is_supported(&self) -> bool {
        self.version() == SCHEMA_VERSION
    }

    /// Size of the whole container in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Constant blob (empty when the container stores no constants).
    pub fn blob(&self) -> &'a [u8] {
        let start = align_up(PREAMBLE + self.header_size, BLOB_ALIGNMENT);
        self.data.get(start..).unwrap_or(&[])
    }

    /// Bytes of a constant tensor.
    pub fn constant(&self, buffer: BufferRef) -> Option<&'a [u8]> {
        self.blob().get(buffer.offset..buffer.offset.checked_add(buffer.nbytes)?)
    }

    /// Parse and validate the graph header.
    pub fn graph(&self) -> Result<Graph, FormatError> {
        let header = &self.data[PREAMBLE..PREAMBLE + self.header_size];
        let text = std::str::from_utf8(header)
            .map_err(|_| FormatError::InvalidHeader("not valid UTF-8".into()))?;
        let graph: Graph = serde_json::from_str(text)
            .map_err(|e| FormatError::InvalidHeader(e.to_string()))?;
        graph.validate(self.blob().len())?;
        Ok(graph)
    }
}

/// Container parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("buffer too small for a model container")]
    TooSmall,

    #[error("invalid magic bytes (expected KSTL)")]
    BadMagic,

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}

/// Builder for assembling containers programmatically.
pub struct ModelBuilder {
    version: u32,
    graph: Graph,
    blob: Vec<u8>,
}

impl ModelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            version: SCHEMA_VERSION,
            graph: Graph {
                name: name.to_string(),
                tensors: Vec::new(),
                ops: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
            blob: Vec::new(),
        }
    }

    /// Override the schema version written to the preamble.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Declare an activation tensor; returns its index.
    pub fn add_tensor(&mut self, name: &str, dtype: DType, shape: &[usize], quant: Option<QuantParams>) -> usize {
        self.graph.tensors.push(TensorDef {
            name: name.to_string(),
            dtype,
            shape: Shape::from_slice(shape),
            quant,
            buffer: None,
        });
        self.graph.tensors.len() - 1
    }

    /// Declare a constant tensor backed by `data`; returns its index.
    pub fn add_constant(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
        quant: Option<QuantParams>,
        data: &[u8],
    ) -> usize {
        let offset = align_up(self.blob.len(), BLOB_ALIGNMENT);
        self.blob.resize(offset, 0);
        self.blob.extend_from_slice(data);
        self.graph.tensors.push(TensorDef {
            name: name.to_string(),
            dtype,
            shape: Shape::from_slice(shape),
            quant,
            buffer: Some(BufferRef { offset, nbytes: data.len() }),
        });
        self.graph.tensors.len() - 1
    }

    pub fn add_op(&mut self, op: OpCode, inputs: &[usize], outputs: &[usize]) -> &mut OpNode {
        self.add_named_op(op.as_str(), inputs, outputs)
    }

    /// Add an operator by name, including names the runtime does not know.
    pub fn add_named_op(&mut self, op: &str, inputs: &[usize], outputs: &[usize]) -> &mut OpNode {
        self.graph.ops.push(OpNode {
            op: op.to_string(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            params: HashMap::new(),
        });
        let last = self.graph.ops.len() - 1;
        &mut self.graph.ops[last]
    }

    pub fn inputs(&mut self, inputs: &[usize]) -> &mut Self {
        self.graph.inputs = inputs.to_vec();
        self
    }

    pub fn outputs(&mut self, outputs: &[usize]) -> &mut Self {
        self.graph.outputs = outputs.to_vec();
        self
    }

    /// Serialize to container bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let header = serde_json::to_vec(&self.graph)
            .map_err(|e| FormatError::InvalidHeader(e.to_string()))?;
        let blob_start = align_up(PREAMBLE + header.len(), BLOB_ALIGNMENT);

        let mut buf = Vec::with_capacity(blob_start + self.blob.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
        buf.extend_from_slice(&header);
        buf.resize(blob_start, 0);
        buf.extend_from_slice(&self.blob);
        Ok(buf)
    }
}
