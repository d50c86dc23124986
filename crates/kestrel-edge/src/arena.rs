//! Tensor arena: the one fixed-size working region of the inference session.
//!
//! The region is requested once from a [`MemoryBackend`] with explicit
//! capability constraints, then never resized or released while the process
//! runs. Sub-allocation inside it is offset-based and planned ahead of time
//! (see [`crate::plan`]), so steady-state inference performs no heap traffic.

use std::alloc::Layout;
use std::ptr::NonNull;

use parking_lot::Mutex;

/// Alignment of the arena base and of every planned tensor offset.
pub const ARENA_ALIGN: usize = 16;

/// Memory-capability constraints for the arena request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCaps {
    /// Must live in on-chip (internal) RAM rather than external PSRAM.
    pub internal: bool,
    /// Must be byte-addressable (8-bit accessible).
    pub byte_addressable: bool,
}

impl MemoryCaps {
    /// Internal, byte-addressable RAM: what the tensor arena asks for.
    pub const INTERNAL_8BIT: MemoryCaps = MemoryCaps { internal: true, byte_addressable: true };
    /// Any byte-addressable RAM, external memory allowed.
    pub const ANY_8BIT: MemoryCaps = MemoryCaps { internal: false, byte_addressable: true };
}

impl Default for MemoryCaps {
    fn default() -> Self {
        Self::INTERNAL_8BIT
    }
}

/// An owned, zero-initialised, [`ARENA_ALIGN`]-aligned block of memory.
pub struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region exclusively owns its allocation.
unsafe impl Send for Region {}

impl Region {
    /// Allocate `size` zeroed bytes from the global allocator.
    /// Returns `None` on allocation failure or for a zero size.
    pub fn zeroed(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, ARENA_ALIGN).ok()?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(raw).map(|ptr| Region { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("addr", &self.ptr.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Platform heap seam. Implementations decide which physical memory satisfies
/// a set of [`MemoryCaps`].
pub trait MemoryBackend: Send {
    /// Allocate `size` bytes honouring `caps`, or `None` if the platform cannot.
    fn allocate(&self, size: usize, caps: MemoryCaps) -> Option<Region>;

    /// Short name used in diagnostics.
    fn name(&self) -> &str;
}

/// Host allocator. Every capability set is satisfiable on a hosted target.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHeap;

impl MemoryBackend for SystemHeap {
    fn allocate(&self, size: usize, _caps: MemoryCaps) -> Option<Region> {
        Region::zeroed(size)
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// Heap with a fixed byte budget for internal RAM.
///
/// Models a microcontroller's on-chip SRAM: requests for internal memory are
/// served until the budget is spent, requests without the `internal` cap are
/// served from the unbounded host heap.
#[derive(Debug)]
pub struct BudgetHeap {
    remaining: Mutex<usize>,
}

impl BudgetHeap {
    pub fn new(internal_bytes: usize) -> Self {
        Self { remaining: Mutex::new(internal_bytes) }
    }

    /// Internal bytes still available.
    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }
}

impl MemoryBackend for BudgetHeap {
    fn allocate(&self, size: usize, caps: MemoryCaps) -> Option<Region> {
        if !caps.internal {
            return Region::zeroed(size);
        }
        let mut remaining = self.remaining.lock();
        if size > *remaining {
            return None;
        }
        let region = Region::zeroed(size)?;
        *remaining -= size;
        Some(region)
    }

    fn name(&self) -> &str {
        "budget"
    }
}

/// The tensor arena: a fixed-capacity region addressed by byte offsets.
#[derive(Debug)]
pub struct Arena {
    region: Region,
}

impl Arena {
    fn new(region: Region) -> Self {
        Self { region }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Address of the first byte; stable for the arena's lifetime.
    pub fn base_addr(&self) -> usize {
        self.region.ptr.as_ptr() as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region owns `len` initialised (zeroed) bytes.
        unsafe { std::slice::from_raw_parts(self.region.ptr.as_ptr(), self.region.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.region.ptr.as_ptr(), self.region.len()) }
    }

    /// Raw base pointer, for handing out disjoint planned sub-slices.
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.region.ptr.as_ptr()
    }

    /// Bytes `[offset, offset + len)`, if in bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.as_slice().get(offset..end)
    }

    /// Mutable bytes `[offset, offset + len)`, if in bounds.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let end = offset.checked_add(len)?;
        self.as_mut_slice().get_mut(offset..end)
    }
}

/// Holds the arena once acquired.
///
/// `acquire` allocates at most once: later calls return the arena already
/// held and ignore their arguments. There is no release; the region is
/// reclaimed when the owning session is dropped at teardown.
#[derive(Debug, Default)]
pub struct ArenaSlot {
    arena: Option<Arena>,
}

impl ArenaSlot {
    pub fn new() -> Self {
        Self { arena: None }
    }

    /// Acquire the arena, allocating from `backend` only if none is held.
    pub fn acquire(
        &mut self,
        size: usize,
        caps: MemoryCaps,
        backend: &dyn MemoryBackend,
    ) -> Result<&mut Arena, ArenaError> {
        let arena = match self.arena.take() {
            Some(held) => held,
            None => {
                if size == 0 {
                    return Err(ArenaError::ZeroSize);
                }
                let region = backend.allocate(size, caps).ok_or_else(|| ArenaError::OutOfMemory {
                    size,
                    backend: backend.name().to_string(),
                })?;
                tracing::debug!("arena: {} bytes at {:p} from {} heap", size, region.ptr, backend.name());
                Arena::new(region)
            }
        };
        Ok(self.arena.insert(arena))
    }

    pub fn is_held(&self) -> bool {
        self.arena.is_some()
    }

    pub fn get(&self) -> Option<&Arena> {
        self.arena.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Arena> {
        self.arena.as_mut()
    }
}

/// Round `n` up to the next multiple of `align` (a power of two).
pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Arena acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("couldn't allocate memory of {size} bytes from the {backend} heap")]
    OutOfMemory { size: usize, backend: String },

    #[error("arena size must be non-zero")]
    ZeroSize,
}
