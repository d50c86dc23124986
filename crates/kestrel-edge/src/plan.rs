//! Tensor layout planning inside the arena.
//!
//! Every activation tensor gets a fixed byte offset, computed once at prepare
//! time. Tensors whose lifetimes overlap never share bytes; tensors that are
//! never live at the same time may reuse the same region. Constants stay in
//! the model blob and are not planned.

use crate::arena::{align_up, ARENA_ALIGN};
use crate::format::Graph;

/// Placement of one activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub offset: usize,
    pub size: usize,
    /// First op index at which the tensor is live.
    pub first_use: usize,
    /// Last op index at which the tensor is live (inclusive).
    pub last_use: usize,
}

impl Placement {
    fn overlaps_in_time(&self, other: &Placement) -> bool {
        self.first_use <= other.last_use && other.first_use <= self.last_use
    }
}

/// Offsets for every planned tensor plus the total footprint.
#[derive(Debug, Clone)]
pub struct MemoryPlan {
    placements: Vec<Option<Placement>>,
    required: usize,
}

impl MemoryPlan {
    /// Plan `graph` without a capacity limit.
    ///
    /// Greedy first-fit: tensors are placed largest first at the lowest
    /// aligned offset that does not collide with an already placed tensor of
    /// overlapping lifetime.
    pub fn compute(graph: &Graph) -> Self {
        let n_ops = graph.ops.len();
        let mut live: Vec<Option<(usize, usize)>> = vec![None; graph.tensors.len()];

        let touch = |t: usize, at: usize, live: &mut Vec<Option<(usize, usize)>>| {
            live[t] = Some(match live[t] {
                None => (at, at),
                Some((first, last)) => (first.min(at), last.max(at)),
            });
        };
        for &t in &graph.inputs {
            touch(t, 0, &mut live);
        }
        for (k, node) in graph.ops.iter().enumerate() {
            for &t in node.inputs.iter().chain(&node.outputs) {
                touch(t, k, &mut live);
            }
        }
        for &t in &graph.outputs {
            touch(t, n_ops, &mut live);
        }

        let mut order: Vec<usize> = (0..graph.tensors.len())
            .filter(|&t| live[t].is_some() && !graph.tensors[t].is_constant())
            .collect();
        order.sort_by(|&a, &b| {
            graph.tensors[b]
                .nbytes()
                .cmp(&graph.tensors[a].nbytes())
                .then(a.cmp(&b))
        });

        let mut placements: Vec<Option<Placement>> = vec![None; graph.tensors.len()];
        let mut placed: Vec<Placement> = Vec::with_capacity(order.len());
        let mut required = 0usize;

        for t in order {
            let (first_use, last_use) = match live[t] {
                Some(span) => span,
                None => continue,
            };
            let size = graph.tensors[t].nbytes();
            let mut candidate = Placement { offset: 0, size, first_use, last_use };

            let mut conflicts: Vec<&Placement> =
                placed.iter().filter(|p| p.overlaps_in_time(&candidate)).collect();
            conflicts.sort_by_key(|p| p.offset);
            for c in conflicts {
                if candidate.offset + size <= c.offset {
                    break;
                }
                candidate.offset = candidate.offset.max(align_up(c.offset + c.size, ARENA_ALIGN));
            }

            required = required.max(candidate.offset + size);
            placements[t] = Some(candidate);
            placed.push(candidate);
        }

        MemoryPlan { placements, required }
    }

    /// Plan `graph` into an arena of `capacity` bytes.
    pub fn build(graph: &Graph, capacity: usize) -> Result<Self, PlanError> {
        let plan = Self::compute(graph);
        plan.fits(capacity)?;
        Ok(plan)
    }

    /// Check the plan against an arena capacity.
    pub fn fits(&self, capacity: usize) -> Result<(), PlanError> {
        if self.required > capacity {
            return Err(PlanError::ArenaTooSmall { required: self.required, capacity });
        }
        Ok(())
    }

    /// Placement of tensor `index`, `None` for constants and unused tensors.
    pub fn placement(&self, index: usize) -> Option<Placement> {
        self.placements.get(index).copied().flatten()
    }

    /// Bytes of arena needed for all planned tensors.
    pub fn required_bytes(&self) -> usize {
        self.required
    }

    /// First byte past the planned tensors where scratch space begins.
    pub fn scratch_offset(&self) -> usize {
        align_up(self.required, ARENA_ALIGN)
    }

    /// Number of planned tensors.
    pub fn num_planned(&self) -> usize {
        self.placements.iter().filter(|p| p.is_some()).count()
    }

    /// Footprint in KiB, for reports.
    pub fn required_kib(&self) -> f32 {
        self.required as f32 / 1024.0
    }
}

/// Layout planning failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("arena of {capacity} bytes is too small, model needs {required}")]
    ArenaTooSmall { required: usize, capacity: usize },
}
