//! Shared fixtures: a person-detection-shaped model, a stub kernel library and
//! recording collaborators.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_edge::driver::{CaptureError, ImageSource, Responder, ScoreVector, Yielder};
use kestrel_edge::format::{ModelBuilder, SCHEMA_VERSION};
use kestrel_edge::ops::{Kernel, KernelContext, KernelError, KernelProvider, OpCode, OpRegistry, DEPLOYMENT_OPS};
use kestrel_edge::profile::{IterationProfile, ProfileSink};
use kestrel_edge::tensor::{DType, QuantParams};

pub const COLS: usize = 96;
pub const ROWS: usize = 96;
pub const CHANNELS: usize = 1;
pub const CLASSES: usize = 10;

/// Output calibration of the deployed classifier.
pub const OUTPUT_QUANT: QuantParams = QuantParams { scale: 0.00390625, zero_point: -128 };

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "element {} differs: {} vs {} (tol={})", i, x, y, tol);
    }
}

/// 96x96x1 -> conv -> depthwise -> avg pool -> reshape -> fc -> `head` -> 10 classes.
pub fn build_model(version: u32, head: &str) -> Vec<u8> {
    let mut b = ModelBuilder::new("person_detect").version(version);
    let input_q = Some(QuantParams::new(0.0078125, 0));
    let x = b.add_tensor("input", DType::I8, &[1, ROWS, COLS, CHANNELS], input_q);
    let a = b.add_tensor("conv", DType::I8, &[1, 48, 48, 4], input_q);
    let d = b.add_tensor("dw", DType::I8, &[1, 24, 24, 4], input_q);
    let p = b.add_tensor("pool", DType::I8, &[1, 1, 1, 4], input_q);
    let r = b.add_tensor("flat", DType::I8, &[1, 4], input_q);
    let w = b.add_constant("fc_weights", DType::I8, &[CLASSES, 4], input_q, &[1u8; CLASSES * 4]);
    let bias = b.add_constant("fc_bias", DType::I32, &[CLASSES], None, &[0u8; CLASSES * 4]);
    let l = b.add_tensor("logits", DType::I8, &[1, CLASSES], Some(QuantParams::new(0.1, 0)));
    let y = b.add_tensor("scores", DType::I8, &[1, CLASSES], Some(OUTPUT_QUANT));

    b.add_op(OpCode::Conv2D, &[x], &[a]).params.insert("stride".into(), "2".into());
    b.add_op(OpCode::DepthwiseConv2D, &[a], &[d]).params.insert("stride".into(), "2".into());
    b.add_op(OpCode::AveragePool2D, &[d], &[p]);
    b.add_op(OpCode::Reshape, &[p], &[r]);
    b.add_op(OpCode::FullyConnected, &[r, w, bias], &[l]);
    b.add_named_op(head, &[l], &[y]);
    b.inputs(&[x]).outputs(&[y]);
    b.to_bytes().unwrap()
}

pub fn person_model() -> Vec<u8> {
    build_model(SCHEMA_VERSION, "softmax")
}

/// One fully connected op from an `input`-typed tensor of `shape` to a
/// `classes`-wide `output`-typed score tensor.
pub fn io_model(input: DType, shape: &[usize], output: DType, classes: usize) -> Vec<u8> {
    let mut b = ModelBuilder::new("io");
    let x = b.add_tensor("input", input, shape, Some(QuantParams::new(0.0078125, 0)));
    let y = b.add_tensor("scores", output, &[1, classes], Some(OUTPUT_QUANT));
    b.add_op(OpCode::FullyConnected, &[x], &[y]);
    b.inputs(&[x]).outputs(&[y]);
    b.to_bytes().unwrap()
}

/// What the stub kernels observed.
#[derive(Default)]
pub struct EngineLog {
    pub calls: Mutex<Vec<OpCode>>,
    pub fail_once: Mutex<Option<OpCode>>,
    pub scratch_len: Mutex<usize>,
    /// Input the first conv saw on its latest call.
    pub first_input: Mutex<Vec<i8>>,
}

impl EngineLog {
    /// Completed forward passes, counted by the first op of the graph.
    pub fn passes(&self) -> usize {
        self.calls.lock().iter().filter(|op| **op == OpCode::Conv2D).count()
    }
}

/// Writes raw zeros to every output and records the call.
struct StubKernel {
    op: OpCode,
    log: Arc<EngineLog>,
}

impl Kernel for StubKernel {
    fn eval(&self, ctx: &mut KernelContext<'_>) -> Result<(), KernelError> {
        self.log.calls.lock().push(self.op);
        if self.op == OpCode::Conv2D {
            let stride: usize = ctx.param_as("stride")?;
            assert_eq!(stride, 2);
            *self.log.scratch_len.lock() = ctx.scratch().len();
            let x = ctx.input(0)?.as_i8().ok_or(KernelError::Failed("input dtype".into()))?;
            *self.log.first_input.lock() = x.to_vec();
        }
        {
            let mut fail = self.log.fail_once.lock();
            if *fail == Some(self.op) {
                *fail = None;
                return Err(KernelError::Failed(format!("{} diverged", self.op)));
            }
        }
        for i in 0..ctx.num_outputs() {
            ctx.output(i)?.bytes_mut().fill(0);
        }
        Ok(())
    }
}

/// Kernel library standing in for the inference engine.
pub struct StubEngine {
    pub log: Arc<EngineLog>,
    pub missing: Vec<OpCode>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self { log: Arc::new(EngineLog::default()), missing: Vec::new() }
    }
}

impl KernelProvider for StubEngine {
    fn kernel(&self, op: OpCode) -> Option<Arc<dyn Kernel>> {
        if self.missing.contains(&op) {
            return None;
        }
        Some(Arc::new(StubKernel { op, log: self.log.clone() }))
    }
}

/// Registry of the deployment operator set backed by `engine`.
pub fn registry(engine: &StubEngine) -> Arc<OpRegistry> {
    Arc::new(OpRegistry::register(&DEPLOYMENT_OPS, engine).unwrap())
}

/// Registry of every deployment op except `without`.
pub fn registry_without(engine: &StubEngine, without: OpCode) -> Arc<OpRegistry> {
    let ops: Vec<OpCode> = DEPLOYMENT_OPS.iter().copied().filter(|op| *op != without).collect();
    Arc::new(OpRegistry::register(&ops, engine).unwrap())
}

#[derive(Clone, Default)]
pub struct RecordingResponder {
    pub seen: Arc<Mutex<Vec<ScoreVector>>>,
}

impl Responder for RecordingResponder {
    fn respond(&mut self, scores: &ScoreVector) {
        self.seen.lock().push(*scores);
    }
}

/// Produces constant frames; captures whose 1-based index is in `fail_on`
/// fail.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    pub value: u8,
    pub fail_on: Vec<usize>,
    pub fail_init: bool,
    pub captures: Arc<Mutex<usize>>,
}

impl ScriptedSource {
    pub fn constant(value: u8) -> Self {
        Self { value, ..Default::default() }
    }
}

impl ImageSource for ScriptedSource {
    fn init(&mut self) -> Result<(), CaptureError> {
        if self.fail_init {
            return Err(CaptureError::Device("sensor not detected".into()));
        }
        Ok(())
    }

    fn get_image(&mut self, cols: usize, rows: usize, channels: usize, out: &mut [u8]) -> Result<(), CaptureError> {
        let expected = cols * rows * channels;
        if out.len() != expected {
            return Err(CaptureError::SizeMismatch { expected, actual: out.len() });
        }
        let n = {
            let mut captures = self.captures.lock();
            *captures += 1;
            *captures
        };
        if self.fail_on.contains(&n) {
            return Err(CaptureError::Device(format!("frame {} dropped", n)));
        }
        out.fill(self.value);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct CountingYielder {
    pub yields: Arc<Mutex<usize>>,
}

impl Yielder for CountingYielder {
    fn yield_now(&mut self) {
        *self.yields.lock() += 1;
    }
}

/// Keeps every formatted profile line.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub lines: Arc<Mutex<Vec<String>>>,
    pub reports: Arc<Mutex<Vec<IterationProfile>>>,
}

impl ProfileSink for RecordingSink {
    fn report(&mut self, profile: &IterationProfile) {
        self.reports.lock().push(*profile);
        self.lines.lock().extend(profile.lines().map(|l| l.to_string()));
    }
}
