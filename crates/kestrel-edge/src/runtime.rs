//! Inference session: binds a model, an operator registry and the arena,
//! then runs forward passes.
//!
//! Lifecycle: `Unprepared --prepare()--> Prepared --invoke()--> Prepared`.
//! Preparation happens once at boot; a failure is latched and never retried
//! internally. Invocation reuses the planned arena layout and performs no
//! heap allocation beyond the per-op view lists, which stay inline.

use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;

use crate::arena::{ArenaError, ArenaSlot, MemoryBackend, MemoryCaps, SystemHeap};
use crate::format::{FormatError, Graph, Model, TensorDef, SCHEMA_VERSION};
use crate::ops::{Kernel, KernelContext, KernelError, OpRegistry};
use crate::plan::{MemoryPlan, PlanError, Placement};
use crate::profile::{IterationProfile, KernelProfiler};
use crate::tensor::{TensorView, TensorViewMut};

/// Default arena base size for the deployed classifier.
pub const DEFAULT_ARENA_BYTES: usize = 81 * 1024;

/// Construction-time session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Arena capacity in bytes (base plus any scratch allowance).
    pub arena_size: usize,
    /// Capabilities requested for the arena.
    pub caps: MemoryCaps,
    /// Time every kernel call into the per-category profiler.
    pub profiling: bool,
}

impl SessionOptions {
    pub fn new(arena_size: usize) -> Self {
        Self { arena_size, ..Default::default() }
    }

    pub fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    pub fn with_caps(mut self, caps: MemoryCaps) -> Self {
        self.caps = caps;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_BYTES,
            caps: MemoryCaps::INTERNAL_8BIT,
            profiling: false,
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unprepared,
    Prepared,
}

/// Everything bound by a successful `prepare`.
struct Prepared {
    graph: Graph,
    plan: MemoryPlan,
    /// Kernel for each op, in graph order.
    kernels: Vec<Arc<dyn Kernel>>,
}

/// Inference session for one model.
pub struct Session<'m> {
    model: Model<'m>,
    registry: Arc<OpRegistry>,
    options: SessionOptions,
    backend: Box<dyn MemoryBackend>,
    arena: ArenaSlot,
    prepared: Option<Prepared>,
    fault: Option<SessionError>,
    profiler: KernelProfiler,
}

impl<'m> Session<'m> {
    /// Create a session that takes its arena from the host allocator.
    pub fn new(model: Model<'m>, registry: Arc<OpRegistry>, options: SessionOptions) -> Self {
        Self::with_backend(model, registry, options, Box::new(SystemHeap))
    }

    /// Create a session with an explicit platform heap.
    pub fn with_backend(
        model: Model<'m>,
        registry: Arc<OpRegistry>,
        options: SessionOptions,
        backend: Box<dyn MemoryBackend>,
    ) -> Self {
        Self {
            model,
            registry,
            options,
            backend,
            arena: ArenaSlot::new(),
            prepared: None,
            fault: None,
            profiler: KernelProfiler::new(options.profiling),
        }
    }

    /// Validate the model, acquire the arena, bind kernels and plan tensors.
    ///
    /// Calling again after success is a no-op. After a failure the same
    /// error is returned without another attempt.
    pub fn prepare(&mut self) -> Result<(), SessionError> {
        if self.prepared.is_some() {
            return Ok(());
        }
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        match self.build() {
            Ok(prepared) => {
                tracing::info!(
                    "prepared '{}': {} ops, {} tensors planned, arena {}/{} bytes",
                    prepared.graph.name,
                    prepared.graph.ops.len(),
                    prepared.plan.num_planned(),
                    prepared.plan.required_bytes(),
                    self.options.arena_size,
                );
                self.prepared = Some(prepared);
                Ok(())
            }
            Err(e) => {
                self.fault = Some(e.clone());
                Err(e)
            }
        }
    }

    fn build(&mut self) -> Result<Prepared, SessionError> {
        let version = self.model.version();
        if version != SCHEMA_VERSION {
            return Err(SessionError::SchemaMismatch { found: version, supported: SCHEMA_VERSION });
        }

        let arena = self
            .arena
            .acquire(self.options.arena_size, self.options.caps, self.backend.as_ref())
            .map_err(SessionError::OutOfMemory)?;
        let capacity = arena.capacity();

        let graph = self.model.graph()?;

        let mut kernels = Vec::with_capacity(graph.ops.len());
        for node in &graph.ops {
            let kernel = node
                .opcode()
                .and_then(|op| self.registry.get(op))
                .ok_or_else(|| SessionError::UnsupportedOperator(node.op.clone()))?;
            kernels.push(Arc::clone(kernel));
        }

        let plan = MemoryPlan::build(&graph, capacity).map_err(|e| match e {
            PlanError::ArenaTooSmall { required, capacity } => {
                SessionError::TensorAllocationFailed { required, capacity }
            }
        })?;

        Ok(Prepared { graph, plan, kernels })
    }

    /// Run one forward pass over the current input tensor contents.
    ///
    /// With profiling on, the pass is timed into `Total` whether or not a
    /// kernel fails.
    pub fn invoke(&mut self) -> Result<(), SessionError> {
        if self.prepared.is_none() {
            return Err(SessionError::NotPrepared);
        }
        let pass_start = self.profiler.is_enabled().then(Instant::now);
        let result = self.run_ops();
        if let Some(start) = pass_start {
            self.profiler.record_total(start.elapsed());
        }
        result
    }

    fn run_ops(&mut self) -> Result<(), SessionError> {
        let prepared = self.prepared.as_ref().ok_or(SessionError::NotPrepared)?;
        let arena = self.arena.get_mut().ok_or(SessionError::NotPrepared)?;
        let profiling = self.profiler.is_enabled();

        let capacity = arena.capacity();
        let base = arena.as_mut_ptr();
        let scratch_offset = prepared.plan.scratch_offset().min(capacity);

        for (index, (node, kernel)) in prepared.graph.ops.iter().zip(&prepared.kernels).enumerate() {
            let mut inputs: SmallVec<[TensorView<'_>; 4]> = SmallVec::new();
            for &t in &node.inputs {
                let def = &prepared.graph.tensors[t];
                let data: &[u8] = match def.buffer {
                    Some(buf) => self.model.constant(buf).ok_or(SessionError::NoSuchTensor(t))?,
                    // SAFETY: the plan keeps every tensor live at this op in
                    // its own in-bounds range, disjoint from the outputs.
                    None => unsafe { planned_bytes(base, placement(&prepared.plan, t)?) },
                };
                inputs.push(view(def, data));
            }

            let mut outputs: SmallVec<[TensorViewMut<'_>; 2]> = SmallVec::new();
            for &t in &node.outputs {
                let def = &prepared.graph.tensors[t];
                // SAFETY: as above; an op never lists a tensor as both input
                // and output, and distinct outputs are live together.
                let data = unsafe { planned_bytes_mut(base, placement(&prepared.plan, t)?) };
                outputs.push(TensorViewMut::new(&def.name, def.dtype, &def.shape, def.quant_params(), data));
            }

            // SAFETY: scratch starts past every planned tensor.
            let scratch = unsafe {
                std::slice::from_raw_parts_mut(base.add(scratch_offset), capacity - scratch_offset)
            };

            let mut ctx = KernelContext::new(
                node.opcode().ok_or_else(|| SessionError::UnsupportedOperator(node.op.clone()))?,
                &node.params,
                inputs,
                outputs,
                scratch,
            );

            tracing::trace!("op {} {}", index, node.op);
            let start = profiling.then(Instant::now);
            kernel.eval(&mut ctx).map_err(|source| SessionError::InvokeFailed {
                index,
                op: node.op.clone(),
                source,
            })?;
            if let (Some(start), Some(category)) = (start, ctx.op.category()) {
                self.profiler.record(category, start.elapsed());
            }
        }
        Ok(())
    }

    /// Writable view of graph input `index`.
    pub fn input_mut(&mut self, index: usize) -> Result<TensorViewMut<'_>, SessionError> {
        let prepared = self.prepared.as_ref().ok_or(SessionError::NotPrepared)?;
        let t = *prepared.graph.inputs.get(index).ok_or(SessionError::NoSuchTensor(index))?;
        let def = &prepared.graph.tensors[t];
        let p = placement(&prepared.plan, t)?;
        let arena = self.arena.get_mut().ok_or(SessionError::NotPrepared)?;
        let data = arena.slice_mut(p.offset, p.size).ok_or(SessionError::NoSuchTensor(t))?;
        Ok(TensorViewMut::new(&def.name, def.dtype, &def.shape, def.quant_params(), data))
    }

    /// Read-only view of graph input `index`.
    ///
    /// The planner may reuse the input's bytes for later tensors, so after
    /// an `invoke` the contents are no longer the encoded frame.
    pub fn input(&self, index: usize) -> Result<TensorView<'_>, SessionError> {
        let prepared = self.prepared.as_ref().ok_or(SessionError::NotPrepared)?;
        let t = *prepared.graph.inputs.get(index).ok_or(SessionError::NoSuchTensor(index))?;
        self.arena_view(prepared, t)
    }

    /// Read-only view of graph output `index`.
    pub fn output(&self, index: usize) -> Result<TensorView<'_>, SessionError> {
        let prepared = self.prepared.as_ref().ok_or(SessionError::NotPrepared)?;
        let t = *prepared.graph.outputs.get(index).ok_or(SessionError::NoSuchTensor(index))?;
        self.arena_view(prepared, t)
    }

    fn arena_view<'s>(&'s self, prepared: &'s Prepared, t: usize) -> Result<TensorView<'s>, SessionError> {
        let def = &prepared.graph.tensors[t];
        let p = placement(&prepared.plan, t)?;
        let arena = self.arena.get().ok_or(SessionError::NotPrepared)?;
        let data = arena.slice(p.offset, p.size).ok_or(SessionError::NoSuchTensor(t))?;
        Ok(view(def, data))
    }

    pub fn state(&self) -> SessionState {
        if self.prepared.is_some() {
            SessionState::Prepared
        } else {
            SessionState::Unprepared
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    /// The latched preparation failure, if any.
    pub fn fault(&self) -> Option<&SessionError> {
        self.fault.as_ref()
    }

    pub fn model(&self) -> &Model<'m> {
        &self.model
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Parsed graph, once prepared.
    pub fn graph(&self) -> Option<&Graph> {
        self.prepared.as_ref().map(|p| &p.graph)
    }

    /// Tensor layout, once prepared.
    pub fn plan(&self) -> Option<&MemoryPlan> {
        self.prepared.as_ref().map(|p| &p.plan)
    }

    /// Whether the arena has been acquired.
    pub fn arena_held(&self) -> bool {
        self.arena.is_held()
    }

    /// Arena capacity in bytes, if held.
    pub fn arena_capacity(&self) -> Option<usize> {
        self.arena.get().map(|a| a.capacity())
    }

    /// Base address of the arena, if held.
    pub fn arena_addr(&self) -> Option<usize> {
        self.arena.get().map(|a| a.base_addr())
    }

    /// Raw arena contents, if held.
    pub fn arena_bytes(&self) -> Option<&[u8]> {
        self.arena.get().map(|a| a.as_slice())
    }

    /// Planned bytes in use, once prepared.
    pub fn arena_used(&self) -> Option<usize> {
        self.plan().map(|p| p.required_bytes())
    }

    pub fn profiling_enabled(&self) -> bool {
        self.profiler.is_enabled()
    }

    /// Take the accumulated kernel timings and reset them.
    pub fn take_profile(&mut self) -> IterationProfile {
        self.profiler.take()
    }

    /// One-line summary.
    pub fn info(&self) -> String {
        match &self.prepared {
            Some(p) => format!(
                "{}  schema=v{} ops={} tensors={} arena={}/{}B",
                p.graph.name,
                self.model.version(),
                p.graph.ops.len(),
                p.graph.tensors.len(),
                p.plan.required_bytes(),
                self.options.arena_size,
            ),
            None => format!(
                "unprepared  schema=v{} arena={}B",
                self.model.version(),
                self.options.arena_size
            ),
        }
    }
}

fn view<'a>(def: &'a TensorDef, data: &'a [u8]) -> TensorView<'a> {
    TensorView::new(&def.name, def.dtype, &def.shape, def.quant_params(), data)
}

fn placement(plan: &MemoryPlan, t: usize) -> Result<Placement, SessionError> {
    plan.placement(t).ok_or(SessionError::NoSuchTensor(t))
}

/// # Safety
/// `p` must lie within the arena at `base`, and no mutable reference may
/// overlap it for the returned lifetime.
unsafe fn planned_bytes<'a>(base: *mut u8, p: Placement) -> &'a [u8] {
    std::slice::from_raw_parts(base.add(p.offset), p.size)
}

/// # Safety
/// `p` must lie within the arena at `base`, and no other reference may
/// overlap it for the returned lifetime.
unsafe fn planned_bytes_mut<'a>(base: *mut u8, p: Placement) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(base.add(p.offset), p.size)
}

/// Session failures. All but `NotPrepared`, `InvokeFailed` and `NoSuchTensor`
/// are raised by `prepare` and are fatal at boot.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("model provided is schema version {found} not equal to supported version {supported}")]
    SchemaMismatch { found: u32, supported: u32 },

    #[error("arena allocation failed: {0}")]
    OutOfMemory(#[source] ArenaError),

    #[error("operator '{0}' is not registered")]
    UnsupportedOperator(String),

    #[error("tensor allocation failed: model needs {required} bytes, arena has {capacity}")]
    TensorAllocationFailed { required: usize, capacity: usize },

    #[error("malformed model: {0}")]
    MalformedModel(#[from] FormatError),

    #[error("session is not prepared")]
    NotPrepared,

    #[error("invoke failed at op {index} ({op}): {source}")]
    InvokeFailed {
        index: usize,
        op: String,
        #[source]
        source: KernelError,
    },

    #[error("no tensor bound at index {0}")]
    NoSuchTensor(usize),
}

impl SessionError {
    /// Whether the error comes from preparation and must stop the boot.
    pub fn is_boot_fault(&self) -> bool {
        matches!(
            self,
            SessionError::SchemaMismatch { .. }
                | SessionError::OutOfMemory(_)
                | SessionError::UnsupportedOperator(_)
                | SessionError::TensorAllocationFailed { .. }
                | SessionError::MalformedModel(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::BudgetHeap;
    use crate::format::ModelBuilder;
    use crate::ops::{OpCode, OpRegistryBuilder};
    use crate::tensor::{DType, QuantParams};

    /// input[8] -conv_2d(add 1)-> hidden[8] -fully_connected(copy)-> output[4]
    fn model_bytes() -> Vec<u8> {
        let mut b = ModelBuilder::new("unit");
        let x = b.add_tensor("input", DType::I8, &[1, 8], Some(QuantParams::new(1.0, 0)));
        let h = b.add_tensor("hidden", DType::I8, &[1, 8], None);
        let y = b.add_tensor("output", DType::I8, &[1, 4], Some(QuantParams::new(0.5, -128)));
        b.add_op(OpCode::Conv2D, &[x], &[h]);
        b.add_op(OpCode::FullyConnected, &[h], &[y]);
        b.inputs(&[x]).outputs(&[y]);
        b.to_bytes().unwrap()
    }

    fn registry() -> Arc<OpRegistry> {
        let mut b = OpRegistryBuilder::with_capacity(2);
        let plus_one = |ctx: &mut KernelContext<'_>| -> Result<(), KernelError> {
            let src = ctx.input(0)?.as_i8().ok_or(KernelError::Failed("dtype".into()))?;
            let dst = ctx.output(0)?.as_i8_mut().ok_or(KernelError::Failed("dtype".into()))?;
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s.wrapping_add(1);
            }
            Ok(())
        };
        let head = |ctx: &mut KernelContext<'_>| -> Result<(), KernelError> {
            let src = ctx.input(0)?.bytes();
            let dst = ctx.output(0)?;
            let n = dst.numel();
            dst.bytes_mut().copy_from_slice(&src[..n]);
            Ok(())
        };
        b.add(OpCode::Conv2D, Arc::new(plus_one)).unwrap();
        b.add(OpCode::FullyConnected, Arc::new(head)).unwrap();
        Arc::new(b.build())
    }

    #[test]
    fn test_prepare_and_invoke() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let mut session = Session::new(model, registry(), SessionOptions::new(1024));
        assert_eq!(session.state(), SessionState::Unprepared);
        session.prepare().unwrap();
        assert_eq!(session.state(), SessionState::Prepared);

        session.input_mut(0).unwrap().as_i8_mut().unwrap().copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
        session.invoke().unwrap();
        let out = session.output(0).unwrap();
        assert_eq!(out.as_i8().unwrap(), &[1, 2, 3, 4]);
        assert_eq!(out.quant, QuantParams::new(0.5, -128));
    }

    #[test]
    fn test_prepare_twice_is_noop() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let mut session = Session::new(model, registry(), SessionOptions::new(1024));
        session.prepare().unwrap();
        let addr = session.arena_addr();
        let used = session.arena_used();
        session.prepare().unwrap();
        assert_eq!(session.arena_addr(), addr);
        assert_eq!(session.arena_used(), used);
        assert!(session.is_prepared());
    }

    #[test]
    fn test_invoke_unprepared_rejected() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let mut session = Session::new(model, registry(), SessionOptions::new(1024));
        assert_eq!(session.invoke(), Err(SessionError::NotPrepared));
        assert!(!session.arena_held());
        assert!(matches!(session.input_mut(0), Err(SessionError::NotPrepared)));
    }

    #[test]
    fn test_schema_mismatch() {
        let mut b = ModelBuilder::new("old").version(SCHEMA_VERSION - 1);
        let x = b.add_tensor("x", DType::I8, &[4], None);
        b.inputs(&[x]).outputs(&[x]);
        let bytes = b.to_bytes().unwrap();
        let mut session = Session::new(Model::from_bytes(&bytes).unwrap(), registry(), SessionOptions::new(64));
        assert_eq!(
            session.prepare(),
            Err(SessionError::SchemaMismatch { found: SCHEMA_VERSION - 1, supported: SCHEMA_VERSION })
        );
        assert!(!session.arena_held());
    }

    #[test]
    fn test_out_of_memory_latched() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let mut session = Session::with_backend(
            model,
            registry(),
            SessionOptions::new(1024),
            Box::new(BudgetHeap::new(512)),
        );
        let err = session.prepare().unwrap_err();
        assert!(matches!(err, SessionError::OutOfMemory(ArenaError::OutOfMemory { size: 1024, .. })));
        assert!(err.is_boot_fault());
        assert_eq!(session.prepare(), Err(err));
        assert_eq!(session.state(), SessionState::Unprepared);
    }

    #[test]
    fn test_arena_too_small() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let mut session = Session::new(model, registry(), SessionOptions::new(20));
        let err = session.prepare().unwrap_err();
        assert!(matches!(err, SessionError::TensorAllocationFailed { capacity: 20, .. }));
        assert!(session.arena_held());
        assert_eq!(session.invoke(), Err(SessionError::NotPrepared));
    }

    #[test]
    fn test_unregistered_operator() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let mut only_conv = OpRegistryBuilder::with_capacity(1);
        only_conv
            .add(OpCode::Conv2D, Arc::new(|_: &mut KernelContext<'_>| -> Result<(), KernelError> { Ok(()) }))
            .unwrap();
        let mut session = Session::new(model, Arc::new(only_conv.build()), SessionOptions::new(1024));
        assert_eq!(
            session.prepare(),
            Err(SessionError::UnsupportedOperator("fully_connected".into()))
        );
    }

    #[test]
    fn test_kernel_failure_reported() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let mut b = OpRegistryBuilder::with_capacity(2);
        b.add(OpCode::Conv2D, Arc::new(|_: &mut KernelContext<'_>| -> Result<(), KernelError> { Ok(()) }))
            .unwrap();
        b.add(
            OpCode::FullyConnected,
            Arc::new(|_: &mut KernelContext<'_>| -> Result<(), KernelError> {
                Err(KernelError::Failed("overflow".into()))
            }),
        )
        .unwrap();
        let mut session = Session::new(model, Arc::new(b.build()), SessionOptions::new(1024));
        session.prepare().unwrap();
        let err = session.invoke().unwrap_err();
        assert!(matches!(err, SessionError::InvokeFailed { index: 1, ref op, .. } if op == "fully_connected"));
        assert!(!err.is_boot_fault());
        // still usable afterwards
        assert!(session.is_prepared());
    }

    #[test]
    fn test_profiling_accumulates_by_category() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let opts = SessionOptions::new(1024).with_profiling(true);
        let mut session = Session::new(model, registry(), opts);
        session.prepare().unwrap();
        session.invoke().unwrap();
        let profile = session.take_profile();
        assert!(profile.total >= profile.category(crate::ops::KernelCategory::Conv));
        assert!(session.take_profile().is_zero());
    }

    #[test]
    fn test_failed_pass_still_timed() {
        let bytes = model_bytes();
        let model = Model::from_bytes(&bytes).unwrap();
        let mut b = OpRegistryBuilder::with_capacity(2);
        b.add(OpCode::Conv2D, Arc::new(|_: &mut KernelContext<'_>| -> Result<(), KernelError> { Ok(()) }))
            .unwrap();
        b.add(
            OpCode::FullyConnected,
            Arc::new(|_: &mut KernelContext<'_>| -> Result<(), KernelError> {
                std::thread::sleep(std::time::Duration::from_millis(2));
                Err(KernelError::Failed("overflow".into()))
            }),
        )
        .unwrap();
        let opts = SessionOptions::new(1024).with_profiling(true);
        let mut session = Session::new(model, Arc::new(b.build()), opts);
        session.prepare().unwrap();
        assert!(session.invoke().is_err());
        let profile = session.take_profile();
        assert!(profile.total >= std::time::Duration::from_millis(2));
        assert!(profile.category(crate::ops::KernelCategory::FullyConnected).is_zero());
    }
}
