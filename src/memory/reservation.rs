use super::error::ChunkError;
use super::stats;
use super::vm::{HeapVmOps, PlatformVmOps, VmOps};
use crate::sync::Arc;
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

// Process reservations ever constructed. Never decremented: the process
// reservation lives until exit.
crate::sync::static_atomic! {
    static PROCESS_RESERVATIONS: AtomicUsize = AtomicUsize::new(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationKind {
    /// The one OS-backed arena of this process. Never released.
    Process,
    /// Heap-backed arena for tests and harnesses. Released on drop.
    Scratch,
}

/// Align `addr` up to `granularity` and report `(aligned, slack)`.
fn align_up(addr: usize, granularity: usize) -> (usize, usize) {
    let aligned = (addr + granularity - 1) & !(granularity - 1);
    (aligned, aligned - addr)
}

/// Heap block behind a scratch reservation.
///
/// Shared by the reservation and every chunk handle carved from it; the
/// block goes back to the allocator when the last of them is dropped.
pub(crate) struct ScratchBlock {
    origin: NonNull<u8>,
    capacity: usize,
    granularity: usize,
}

// Safety: the block is only freed by its last owner; access to its bytes is
// governed by the chunk handles and the owning source.
unsafe impl Send for ScratchBlock {}
// Safety: see above; the block itself has no interior state.
unsafe impl Sync for ScratchBlock {}

impl Drop for ScratchBlock {
    fn drop(&mut self) {
        // Safety: origin/capacity/granularity match the reserve call.
        if let Err(e) =
            unsafe { HeapVmOps::release(self.origin, self.capacity, self.granularity) }
        {
            log::error!("failed to release scratch reservation: {e}");
        }
        stats::sub_saturating(&stats::RESERVED_BYTES, self.capacity);
    }
}

/// One contiguous range of address space, bump-carved into chunks.
pub struct MemoryReservation {
    /// Address returned by the reservation primitive.
    origin: NonNull<u8>,
    /// `origin` aligned up to `granularity`.
    start: NonNull<u8>,
    capacity: usize,
    slack: usize,
    granularity: usize,
    cursor: usize,
    remaining: usize,
    /// Present for scratch reservations only.
    backing: Option<Arc<ScratchBlock>>,
}

// Safety: MemoryReservation owns its address range and is Send.
unsafe impl Send for MemoryReservation {}

impl MemoryReservation {
    /// Reserve the process arena.
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::DuplicateReservation` if a process reservation
    /// was constructed before (successfully or not), or `ChunkError::Vm` if
    /// the OS refuses the range.
    pub(crate) fn process(capacity: usize, granularity: usize) -> Result<Self, ChunkError> {
        let existing = PROCESS_RESERVATIONS.fetch_add(1, Ordering::AcqRel);
        if existing > 0 {
            return Err(ChunkError::DuplicateReservation { existing });
        }
        // Safety: FFI call to reserve memory.
        let origin = unsafe { PlatformVmOps::reserve(capacity, granularity)? };
        Ok(Self::from_origin(origin, capacity, granularity, None))
    }

    /// Reserve a heap-backed scratch arena. Does not count against the
    /// one-per-process limit.
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::Vm` if the allocation fails.
    pub(crate) fn scratch(capacity: usize, granularity: usize) -> Result<Self, ChunkError> {
        // Safety: heap allocation; released in Drop with the same layout.
        let origin = unsafe { HeapVmOps::reserve(capacity, granularity)? };
        let block = Arc::new(ScratchBlock {
            origin,
            capacity,
            granularity,
        });
        Ok(Self::from_origin(origin, capacity, granularity, Some(block)))
    }

    fn from_origin(
        origin: NonNull<u8>,
        capacity: usize,
        granularity: usize,
        backing: Option<Arc<ScratchBlock>>,
    ) -> Self {
        let (_, slack) = align_up(origin.as_ptr() as usize, granularity);
        // Safety: slack < granularity <= capacity, so start stays inside the range.
        let start = unsafe { origin.add(slack) };
        stats::RESERVED_BYTES.fetch_add(capacity, Ordering::Relaxed);
        let res = Self {
            origin,
            start,
            capacity,
            slack,
            granularity,
            cursor: 0,
            remaining: capacity - slack,
            backing,
        };
        log::debug!(
            "reserved {capacity} bytes at {origin:p} ({:?}), {slack} bytes of alignment slack",
            res.kind()
        );
        res
    }

    /// Total bytes requested from the OS.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.capacity
    }

    /// Address handed back by the OS, before alignment.
    #[must_use]
    pub fn buffer_start(&self) -> NonNull<u8> {
        self.origin
    }

    /// First chunk-aligned address; chunk `i` starts at `start + i * granularity`.
    #[must_use]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    /// Bytes lost to aligning `buffer_start` up to the granularity.
    #[must_use]
    pub fn slack(&self) -> usize {
        self.slack
    }

    #[must_use]
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Bytes not yet carved.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Bytes carved so far.
    #[must_use]
    pub fn carved(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn kind(&self) -> ReservationKind {
        match self.backing {
            Some(_) => ReservationKind::Scratch,
            None => ReservationKind::Process,
        }
    }

    /// Keep-alive token for chunk handles. `None` for the process arena,
    /// which is never released.
    pub(crate) fn backing(&self) -> Option<Arc<ScratchBlock>> {
        self.backing.clone()
    }

    /// Bump-carve the next chunk. `None` once fewer than `granularity`
    /// bytes remain.
    pub(crate) fn carve(&mut self) -> Option<NonNull<u8>> {
        if self.remaining < self.granularity {
            return None;
        }
        // Safety: cursor + granularity <= capacity - slack, inside the range.
        let chunk = unsafe { self.start.add(self.cursor) };
        self.cursor += self.granularity;
        self.remaining -= self.granularity;
        Some(chunk)
    }

    /// Base address of carved chunk number `index`.
    pub(crate) fn chunk_base(&self, index: usize) -> NonNull<u8> {
        debug_assert!(
            index * self.granularity < self.cursor,
            "chunk index {index} was never carved"
        );
        // Safety: index is below the carve cursor.
        unsafe { self.start.add(index * self.granularity) }
    }

    /// Carve index of the chunk containing `ptr`, if that chunk was carved.
    #[must_use]
    pub fn index_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.start.as_ptr() as usize)?;
        (offset < self.cursor).then(|| offset / self.granularity)
    }

    /// Reservation-level invariants: aligned start, granular cursor, and
    /// `carved + remaining + slack == capacity`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.start.as_ptr() as usize % self.granularity == 0
            && self.slack < self.granularity
            && self.cursor.is_multiple_of(self.granularity)
            && self.cursor + self.remaining + self.slack == self.capacity
    }
}
