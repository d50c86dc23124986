//! # kestrel-edge
//!
//! Inference core for a resource-constrained vision pipeline: load a
//! quantized classifier once, then capture, encode, invoke and score frames
//! forever inside one statically sized tensor arena.
//!
//! ## Key Features
//! - `.kstl` model container: zero-copy, constant weights stay in the blob
//! - Arena allocator: one upfront reservation, offsets planned at prepare
//! - Fixed operator registry bound to an external kernel library
//! - u8 to i8 input codec and affine score dequantization
//! - Per-category kernel timing with nominal energy estimates

pub mod arena;
pub mod config;
pub mod driver;
pub mod format;
pub mod ops;
pub mod plan;
pub mod profile;
pub mod quant;
pub mod runtime;
pub mod tensor;

pub use arena::{Arena, ArenaSlot, BudgetHeap, MemoryBackend, MemoryCaps, SystemHeap};
pub use config::{PipelineConfig, RunMode};
pub use driver::{boot, Driver, ImageSource, Pipeline, Responder, Runner, ScoreVector, Yielder};
pub use format::{Model, ModelBuilder};
pub use ops::{Kernel, KernelContext, OpCode, OpRegistry, DEPLOYMENT_OPS};
pub use plan::MemoryPlan;
pub use runtime::{Session, SessionError, SessionOptions};
pub use tensor::{DType, QuantParams, TensorView, TensorViewMut};
