//! Operator identifiers and the kernel dispatch contract.
//!
//! Kernel bodies are supplied by the integrator's inference engine through
//! [`Kernel`]; this crate only names the operators, routes tensors to them and
//! times them.

pub mod registry;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::tensor::{TensorView, TensorViewMut};

pub use registry::{KernelProvider, OpRegistry, OpRegistryBuilder, RegistryError};

/// Operators a vision graph may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpCode {
    #[serde(rename = "average_pool_2d")]
    AveragePool2D,
    #[serde(rename = "conv_2d")]
    Conv2D,
    #[serde(rename = "depthwise_conv_2d")]
    DepthwiseConv2D,
    #[serde(rename = "reshape")]
    Reshape,
    #[serde(rename = "softmax")]
    Softmax,
    #[serde(rename = "max_pool_2d")]
    MaxPool2D,
    #[serde(rename = "fully_connected")]
    FullyConnected,
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "mul")]
    Mul,
}

/// The operators the deployed classifier needs.
pub const DEPLOYMENT_OPS: [OpCode; 7] = [
    OpCode::AveragePool2D,
    OpCode::Conv2D,
    OpCode::DepthwiseConv2D,
    OpCode::Reshape,
    OpCode::Softmax,
    OpCode::MaxPool2D,
    OpCode::FullyConnected,
];

impl OpCode {
    pub const ALL: [OpCode; 9] = [
        OpCode::AveragePool2D,
        OpCode::Conv2D,
        OpCode::DepthwiseConv2D,
        OpCode::Reshape,
        OpCode::Softmax,
        OpCode::MaxPool2D,
        OpCode::FullyConnected,
        OpCode::Add,
        OpCode::Mul,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::AveragePool2D => "average_pool_2d",
            OpCode::Conv2D => "conv_2d",
            OpCode::DepthwiseConv2D => "depthwise_conv_2d",
            OpCode::Reshape => "reshape",
            OpCode::Softmax => "softmax",
            OpCode::MaxPool2D => "max_pool_2d",
            OpCode::FullyConnected => "fully_connected",
            OpCode::Add => "add",
            OpCode::Mul => "mul",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.as_str() == s)
    }

    /// Profiling bucket, or `None` for untracked operators.
    pub fn category(&self) -> Option<KernelCategory> {
        match self {
            OpCode::FullyConnected => Some(KernelCategory::FullyConnected),
            OpCode::DepthwiseConv2D => Some(KernelCategory::DepthwiseConv),
            OpCode::Conv2D => Some(KernelCategory::Conv),
            OpCode::AveragePool2D | OpCode::MaxPool2D => Some(KernelCategory::Pooling),
            OpCode::Add => Some(KernelCategory::Add),
            OpCode::Mul => Some(KernelCategory::Mul),
            OpCode::Reshape | OpCode::Softmax => None,
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel families tracked by the profiler, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelCategory {
    FullyConnected,
    DepthwiseConv,
    Conv,
    Pooling,
    Add,
    Mul,
}

impl KernelCategory {
    pub const ALL: [KernelCategory; 6] = [
        KernelCategory::FullyConnected,
        KernelCategory::DepthwiseConv,
        KernelCategory::Conv,
        KernelCategory::Pooling,
        KernelCategory::Add,
        KernelCategory::Mul,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Label used in profile lines.
    pub fn label(&self) -> &'static str {
        match self {
            KernelCategory::FullyConnected => "Fully Connected",
            KernelCategory::DepthwiseConv => "Depthwise Conv",
            KernelCategory::Conv => "Conv",
            KernelCategory::Pooling => "Pooling",
            KernelCategory::Add => "Add",
            KernelCategory::Mul => "Mul",
        }
    }
}

/// A concrete operator implementation.
///
/// Kernels read their inputs and write their outputs through the views in the
/// context; they must not retain any view past the call.
pub trait Kernel: Send + Sync {
    fn eval(&self, ctx: &mut KernelContext<'_>) -> Result<(), KernelError>;
}

impl<F> Kernel for F
where
    F: Fn(&mut KernelContext<'_>) -> Result<(), KernelError> + Send + Sync,
{
    fn eval(&self, ctx: &mut KernelContext<'_>) -> Result<(), KernelError> {
        self(ctx)
    }
}

/// Everything one kernel call may touch.
pub struct KernelContext<'a> {
    pub op: OpCode,
    params: &'a HashMap<String, String>,
    inputs: SmallVec<[TensorView<'a>; 4]>,
    outputs: SmallVec<[TensorViewMut<'a>; 2]>,
    scratch: &'a mut [u8],
}

impl<'a> KernelContext<'a> {
    pub fn new(
        op: OpCode,
        params: &'a HashMap<String, String>,
        inputs: SmallVec<[TensorView<'a>; 4]>,
        outputs: SmallVec<[TensorViewMut<'a>; 2]>,
        scratch: &'a mut [u8],
    ) -> Self {
        Self { op, params, inputs, outputs, scratch }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, index: usize) -> Result<&TensorView<'a>, KernelError> {
        self.inputs.get(index).ok_or(KernelError::MissingInput(index))
    }

    pub fn output(&mut self, index: usize) -> Result<&mut TensorViewMut<'a>, KernelError> {
        self.outputs.get_mut(index).ok_or(KernelError::MissingOutput(index))
    }

    /// Arena bytes past the planned tensors, free for the duration of the call.
    pub fn scratch(&mut self) -> &mut [u8] {
        self.scratch
    }

    /// Raw string parameter from the model header.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Parsed parameter; missing or malformed values are an error.
    pub fn param_as<T: std::str::FromStr>(&self, name: &str) -> Result<T, KernelError> {
        let raw = self.param(name).ok_or_else(|| KernelError::BadParam {
            name: name.to_string(),
            reason: "missing".into(),
        })?;
        raw.parse().map_err(|_| KernelError::BadParam {
            name: name.to_string(),
            reason: format!("cannot parse {:?}", raw),
        })
    }
}

/// Failures reported by a kernel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("input {0} not bound")]
    MissingInput(usize),

    #[error("output {0} not bound")]
    MissingOutput(usize),

    #[error("parameter '{name}': {reason}")]
    BadParam { name: String, reason: String },

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Failed(String),
}
