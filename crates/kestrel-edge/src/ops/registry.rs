//! Operator registry: the fixed set of kernels a session may dispatch to.
//!
//! Built once at boot from an explicit operator list, then frozen and shared
//! read-only with the session. Registering only what the graph needs keeps
//! unused kernel code out of the image; a missing entry surfaces at
//! `Session::prepare` as `UnsupportedOperator`.

use std::sync::Arc;

use super::{Kernel, OpCode};

/// The inference engine's kernel library.
pub trait KernelProvider {
    /// Concrete implementation for `op`, if the engine has one.
    fn kernel(&self, op: OpCode) -> Option<Arc<dyn Kernel>>;
}

/// Immutable operator-to-kernel table.
pub struct OpRegistry {
    entries: Vec<(OpCode, Arc<dyn Kernel>)>,
}

impl OpRegistry {
    /// Bind every operator in `ops` to the provider's kernel.
    pub fn register(ops: &[OpCode], provider: &dyn KernelProvider) -> Result<Self, RegistryError> {
        let mut builder = OpRegistryBuilder::with_capacity(ops.len());
        for &op in ops {
            let kernel = provider.kernel(op).ok_or(RegistryError::NoKernel(op))?;
            builder.add(op, kernel)?;
        }
        Ok(builder.build())
    }

    /// Kernel registered for `op`.
    pub fn get(&self, op: OpCode) -> Option<&Arc<dyn Kernel>> {
        self.entries.iter().find(|(o, _)| *o == op).map(|(_, k)| k)
    }

    pub fn contains(&self, op: OpCode) -> bool {
        self.get(op).is_some()
    }

    /// Registered operators in registration order.
    pub fn ops(&self) -> impl Iterator<Item = OpCode> + '_ {
        self.entries.iter().map(|(op, _)| *op)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ops()).finish()
    }
}

/// Fixed-capacity builder for [`OpRegistry`].
pub struct OpRegistryBuilder {
    capacity: usize,
    entries: Vec<(OpCode, Arc<dyn Kernel>)>,
}

impl OpRegistryBuilder {
    /// Builder that accepts at most `capacity` operators.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity, entries: Vec::with_capacity(capacity) }
    }

    pub fn add(&mut self, op: OpCode, kernel: Arc<dyn Kernel>) -> Result<&mut Self, RegistryError> {
        if self.entries.iter().any(|(o, _)| *o == op) {
            return Err(RegistryError::Duplicate(op));
        }
        if self.entries.len() == self.capacity {
            return Err(RegistryError::CapacityExceeded { capacity: self.capacity, op });
        }
        self.entries.push((op, kernel));
        Ok(self)
    }

    pub fn build(self) -> OpRegistry {
        OpRegistry { entries: self.entries }
    }
}

/// Registry construction failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry capacity {capacity} exhausted while adding {op}")]
    CapacityExceeded { capacity: usize, op: OpCode },

    #[error("operator {0} registered twice")]
    Duplicate(OpCode),

    #[error("inference engine provides no kernel for {0}")]
    NoKernel(OpCode),
}
