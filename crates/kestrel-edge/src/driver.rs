//! Pipeline driver: capture, encode, invoke, decode, respond, yield.
//!
//! The driver owns the prepared [`Session`] and calls out to three
//! collaborators it does not implement: an [`ImageSource`], a [`Responder`]
//! and a [`Yielder`]. Steady-state faults (capture or invoke failure) are
//! logged and the loop moves on to the next iteration; boot faults are
//! returned from [`boot`] and [`Runner::start`] and must stop the system.

use std::sync::Arc;
use std::time::Duration;

use crate::arena::MemoryBackend;
use crate::config::{InputConfig, PipelineConfig, RunMode};
use crate::format::Model;
use crate::ops::OpRegistry;
use crate::profile::{LogSink, ProfileSink};
use crate::quant::{decode_scores, encode_input, CodecError};
use crate::runtime::{Session, SessionError};
use crate::tensor::{DType, TensorView};

/// Number of class scores forwarded to the responder. The output tensor may
/// hold more classes; the rest are not read.
pub const SCORE_CLASSES: usize = 6;

/// Calibrated scores for classes `0..SCORE_CLASSES`.
pub type ScoreVector = [f32; SCORE_CLASSES];

/// Frame producer.
pub trait ImageSource {
    /// One-time device setup, called before the first capture.
    fn init(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Fill `out` with `cols * rows * channels` unsigned samples, row-major,
    /// channel-interleaved.
    fn get_image(&mut self, cols: usize, rows: usize, channels: usize, out: &mut [u8]) -> Result<(), CaptureError>;
}

/// Consumer of each iteration's scores.
pub trait Responder {
    fn respond(&mut self, scores: &ScoreVector);
}

/// Cooperative scheduling point between iterations.
pub trait Yielder {
    fn yield_now(&mut self);
}

/// Logs every score vector.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogResponder;

impl Responder for LogResponder {
    fn respond(&mut self, scores: &ScoreVector) {
        tracing::info!(
            target: "kestrel::respond",
            "scores: {:.4} {:.4} {:.4} {:.4} {:.4} {:.4}",
            scores[0],
            scores[1],
            scores[2],
            scores[3],
            scores[4],
            scores[5]
        );
    }
}

/// Sleeps for one scheduler tick.
#[derive(Debug, Clone, Copy)]
pub struct TaskDelay {
    pub tick: Duration,
}

impl Default for TaskDelay {
    fn default() -> Self {
        Self { tick: Duration::from_millis(1) }
    }
}

impl Yielder for TaskDelay {
    fn yield_now(&mut self) {
        std::thread::sleep(self.tick);
    }
}

/// Build and prepare the session described by `config`.
///
/// Every boot fault is logged once before it is returned.
pub fn boot<'m>(
    config: &PipelineConfig,
    model: Model<'m>,
    registry: Arc<OpRegistry>,
) -> Result<Session<'m>, SessionError> {
    prepare_logged(Session::new(model, registry, config.session_options()))
}

/// As [`boot`], taking the arena from `backend`.
pub fn boot_with_backend<'m>(
    config: &PipelineConfig,
    model: Model<'m>,
    registry: Arc<OpRegistry>,
    backend: Box<dyn MemoryBackend>,
) -> Result<Session<'m>, SessionError> {
    prepare_logged(Session::with_backend(model, registry, config.session_options(), backend))
}

fn prepare_logged(mut session: Session<'_>) -> Result<Session<'_>, SessionError> {
    if let Err(e) = session.prepare() {
        tracing::error!("boot fault: {}", e);
        return Err(e);
    }
    tracing::info!("session ready: {}", session.info());
    Ok(session)
}

/// Prepared session plus the responder and optional profile sink.
pub struct Pipeline<'m> {
    session: Session<'m>,
    responder: Box<dyn Responder>,
    sink: Option<Box<dyn ProfileSink>>,
}

impl<'m> Pipeline<'m> {
    /// Wrap a session. Profiles go to [`LogSink`] when the session profiles.
    pub fn new(session: Session<'m>, responder: Box<dyn Responder>) -> Self {
        let sink: Option<Box<dyn ProfileSink>> =
            if session.profiling_enabled() { Some(Box::new(LogSink)) } else { None };
        Self { session, responder, sink }
    }

    /// Send profiles to `sink` instead of the log.
    pub fn with_profile_sink(mut self, sink: Box<dyn ProfileSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Encode `raw`, run one forward pass, decode and hand the scores to the
    /// responder.
    pub fn infer_frame(&mut self, raw: &[u8]) -> Result<ScoreVector, PipelineError> {
        {
            let mut input = self.session.input_mut(0)?;
            encode_input(raw, &mut input)?;
        }

        let result = self.session.invoke();
        if self.session.profiling_enabled() {
            let profile = self.session.take_profile();
            if let Some(sink) = self.sink.as_mut() {
                sink.report(&profile);
            }
        }
        result?;

        let output = self.session.output(0)?;
        check_output(&output)?;
        let scores: ScoreVector = decode_scores(&output, 0);
        self.responder.respond(&scores);
        Ok(scores)
    }

    pub fn session(&self) -> &Session<'m> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<'m> {
        &mut self.session
    }

    pub fn into_session(self) -> Session<'m> {
        self.session
    }
}

/// Result of one driver iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Responded,
    CaptureFailed,
    InvokeFailed,
}

/// Outcome counts over several iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationStats {
    pub responded: usize,
    pub capture_failed: usize,
    pub invoke_failed: usize,
}

impl IterationStats {
    fn record(&mut self, outcome: IterationOutcome) {
        match outcome {
            IterationOutcome::Responded => self.responded += 1,
            IterationOutcome::CaptureFailed => self.capture_failed += 1,
            IterationOutcome::InvokeFailed => self.invoke_failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.responded + self.capture_failed + self.invoke_failed
    }
}

/// The continuous capture loop.
pub struct Driver<'m> {
    pipeline: Pipeline<'m>,
    source: Box<dyn ImageSource>,
    yielder: Box<dyn Yielder>,
    geometry: InputConfig,
    frame: Vec<u8>,
}

impl<'m> Driver<'m> {
    /// Frame buffer is sized once from `geometry`.
    pub fn new(
        pipeline: Pipeline<'m>,
        source: Box<dyn ImageSource>,
        yielder: Box<dyn Yielder>,
        geometry: InputConfig,
    ) -> Self {
        Self {
            pipeline,
            source,
            yielder,
            geometry,
            frame: vec![0u8; geometry.sample_count()],
        }
    }

    /// Initialise the image source.
    pub fn init(&mut self) -> Result<(), PipelineError> {
        self.source.init().map_err(|e| {
            tracing::error!("camera init failed: {}", e);
            PipelineError::CaptureInit(e)
        })
    }

    /// Capture, infer and respond once, then yield. The yield happens
    /// whatever the outcome.
    pub fn run_iteration(&mut self) -> IterationOutcome {
        let outcome = self.step();
        self.yielder.yield_now();
        outcome
    }

    fn step(&mut self) -> IterationOutcome {
        let InputConfig { cols, rows, channels } = self.geometry;
        if let Err(e) = self.source.get_image(cols, rows, channels, &mut self.frame) {
            tracing::warn!("{}", PipelineError::CaptureFailed(e));
            return IterationOutcome::CaptureFailed;
        }
        match self.pipeline.infer_frame(&self.frame) {
            Ok(_) => IterationOutcome::Responded,
            Err(e) => {
                tracing::error!("{}", e);
                IterationOutcome::InvokeFailed
            }
        }
    }

    /// Run `n` iterations.
    pub fn run_for(&mut self, n: usize) -> IterationStats {
        let mut stats = IterationStats::default();
        for _ in 0..n {
            stats.record(self.run_iteration());
        }
        stats
    }

    /// Run forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.run_iteration();
        }
    }

    pub fn pipeline(&self) -> &Pipeline<'m> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline<'m> {
        &mut self.pipeline
    }
}

/// Check the prepared model against what the pipeline feeds and reads: an
/// i8 input holding one configured frame, and an 8-bit output with at least
/// [`SCORE_CLASSES`] classes.
pub fn check_io(session: &Session<'_>, input: &InputConfig) -> Result<(), PipelineError> {
    let x = session.input(0)?;
    if x.dtype != DType::I8 {
        return Err(PipelineError::InputType(x.dtype));
    }
    if x.numel() != input.sample_count() {
        return Err(PipelineError::InputSize { model: x.numel(), configured: input.sample_count() });
    }
    check_output(&session.output(0)?)
}

fn check_output(output: &TensorView<'_>) -> Result<(), PipelineError> {
    if !output.dtype.is_quantized_8bit() {
        return Err(PipelineError::OutputType(output.dtype));
    }
    if output.numel() < SCORE_CLASSES {
        return Err(PipelineError::TooFewClasses(output.numel()));
    }
    Ok(())
}

/// What the configured run mode starts.
pub enum Runner<'m> {
    Continuous(Driver<'m>),
    /// No image source; the caller feeds frames to the pipeline.
    InferenceOnly(Pipeline<'m>),
}

impl<'m> Runner<'m> {
    /// Assemble the pipeline for `config.mode`. The model's I/O is checked
    /// against `config.input` first. In continuous mode the image source is
    /// initialised here. Either failure is a boot fault.
    pub fn start(
        config: &PipelineConfig,
        pipeline: Pipeline<'m>,
        source: Box<dyn ImageSource>,
        yielder: Box<dyn Yielder>,
    ) -> Result<Self, PipelineError> {
        check_io(pipeline.session(), &config.input)?;
        match config.mode {
            RunMode::Continuous => {
                let mut driver = Driver::new(pipeline, source, yielder, config.input);
                driver.init()?;
                Ok(Runner::Continuous(driver))
            }
            RunMode::InferenceOnly => Ok(Runner::InferenceOnly(pipeline)),
        }
    }

    pub fn mode(&self) -> RunMode {
        match self {
            Runner::Continuous(_) => RunMode::Continuous,
            Runner::InferenceOnly(_) => RunMode::InferenceOnly,
        }
    }
}

/// Image source failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Device(String),

    #[error("frame buffer holds {actual} samples, capture needs {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Pipeline failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("image capture failed: {0}")]
    CaptureFailed(CaptureError),

    #[error("image source init failed: {0}")]
    CaptureInit(CaptureError),

    #[error("model input has element type {0}, expected i8")]
    InputType(DType),

    #[error("model input holds {model} samples, configured frame has {configured}")]
    InputSize { model: usize, configured: usize },

    #[error("model output has element type {0}, expected i8 or u8")]
    OutputType(DType),

    #[error("model output has {0} classes, at least {min} are read", min = SCORE_CLASSES)]
    TooFewClasses(usize),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
