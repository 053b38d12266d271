use super::bucket::BucketTable;
use super::chunk::{Chunk, ChunkHeader, ChunkId, ChunkState};
use super::config::{ChunkSourceConfig, EmptyChunkPolicy};
use super::error::{ChunkError, ReformatError};
use super::reservation::MemoryReservation;
use super::stats;
use std::ptr::NonNull;

/// Hands out fixed-granularity chunks formatted for one object size class,
/// recycling returned chunks through per-class free-list buckets.
///
/// The OS is only involved when the reservation is made. After that,
/// `acquire` and `release` are O(1): a bucket pop, an overflow pop plus
/// reformat, or a bump carve.
///
/// There is no internal synchronization; callers serialize access (see
/// `GlobalChunkSource` for the coarse-lock arrangement).
pub struct ChunkSource {
    pub(super) reservation: MemoryReservation,
    pub(super) buckets: BucketTable,
    pub(super) config: ChunkSourceConfig,
}

/// Per-source accounting snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceStats {
    /// Bytes requested from the reservation primitive.
    pub capacity: usize,
    /// Bytes lost aligning the reservation base.
    pub slack: usize,
    pub chunk_bytes: usize,
    /// Bytes bump-carved from the reservation.
    pub carved_bytes: usize,
    pub carved_chunks: usize,
    /// Chunks linked into some bucket.
    pub resident_chunks: usize,
    pub remaining_bytes: usize,
}

impl SourceStats {
    #[must_use]
    pub fn checked_out_chunks(&self) -> usize {
        self.carved_chunks.saturating_sub(self.resident_chunks)
    }

    #[must_use]
    pub fn checked_out_bytes(&self) -> usize {
        self.checked_out_chunks() * self.chunk_bytes
    }

    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.resident_chunks * self.chunk_bytes
    }

    /// `checked out + resident + remaining + slack == capacity`, with every
    /// carved byte accounted to a registered chunk.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.resident_chunks <= self.carved_chunks
            && self.carved_chunks * self.chunk_bytes == self.carved_bytes
            && self.checked_out_bytes() + self.resident_bytes() + self.remaining_bytes + self.slack
                == self.capacity
    }
}

impl ChunkSource {
    /// Create the process chunk source over a fresh OS reservation.
    ///
    /// # Errors
    ///
    /// - `ChunkError::InvalidConfig` if `config` does not validate.
    /// - `ChunkError::DuplicateReservation` if a process source was already
    ///   constructed.
    /// - `ChunkError::Vm` if the OS refuses the reservation.
    pub fn new(config: ChunkSourceConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        let reservation = MemoryReservation::process(config.capacity, config.granularity)?;
        Ok(Self::with_reservation(reservation, config))
    }

    /// Like [`ChunkSource::new`], but any failure terminates the process.
    ///
    /// A second process arena means two sets of address bookkeeping, which
    /// nothing downstream can recover from.
    pub fn new_or_abort(config: ChunkSourceConfig) -> Self {
        match Self::new(config) {
            Ok(source) => source,
            Err(e) => {
                log::error!("cannot create the process chunk source: {e}");
                std::process::abort();
            }
        }
    }

    /// Create a chunk source over a heap-backed scratch reservation, outside
    /// the one-per-process limit. Intended for tests and fuzzing harnesses.
    ///
    /// # Errors
    ///
    /// `ChunkError::InvalidConfig` or `ChunkError::Vm`.
    pub fn scratch(config: ChunkSourceConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        let reservation = MemoryReservation::scratch(config.capacity, config.granularity)?;
        Ok(Self::with_reservation(reservation, config))
    }

    fn with_reservation(reservation: MemoryReservation, config: ChunkSourceConfig) -> Self {
        let buckets =
            BucketTable::new(config.num_classes(), config.size_step, config.max_chunks());
        Self {
            reservation,
            buckets,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ChunkSourceConfig {
        &self.config
    }

    #[must_use]
    pub fn reservation(&self) -> &MemoryReservation {
        &self.reservation
    }

    /// Obtain a chunk formatted for objects of `size` bytes.
    ///
    /// `size` must be a positive multiple of the size-class step, at most the
    /// largest class size. Debug builds assert this.
    ///
    /// Order of preference: a recycled chunk of the same class, then an
    /// overflow chunk reformatted for `size`, then a freshly carved chunk.
    ///
    /// # Errors
    ///
    /// `ChunkError::Exhausted` when every bucket it may draw from is empty
    /// and the reservation cannot yield another chunk. Non-fatal: releasing a
    /// chunk makes later calls succeed again.
    pub fn acquire(&mut self, size: usize) -> Result<Chunk, ChunkError> {
        debug_assert!(
            size.is_multiple_of(self.config.size_step),
            "Size {size} is not a multiple of the size-class step {}",
            self.config.size_step
        );
        let index = self.buckets.index_for(size);

        if let Some(id) = self.buckets.pop(index) {
            return Ok(self.check_out(id));
        }

        let overflow = self.buckets.overflow();
        if let Some(id) = self.buckets.pop(overflow) {
            let base = self.reservation.chunk_base(id.index());
            // Safety: the chunk was linked in a bucket, so no handle to it exists.
            let header = unsafe { ChunkHeader::read(base) };
            debug_assert_eq!(
                header.live(),
                0,
                "overflow chunk {id} still holds live objects"
            );
            log::trace!(
                "reformatting overflow chunk {id} from object size {} to {size}",
                header.object_size()
            );
            // Safety: overflow chunks are empty and unreferenced.
            unsafe { ChunkHeader::format(base, size) };
            stats::REFORMATTED_CHUNKS.add(1);
            return Ok(self.check_out(id));
        }

        self.carve(size)
    }

    fn carve(&mut self, size: usize) -> Result<Chunk, ChunkError> {
        let Some(base) = self.reservation.carve() else {
            let remaining = self.reservation.remaining();
            stats::EXHAUSTED_REQUESTS.add(1);
            log::warn!(
                "chunk source memory exhausted: object size {size}, {remaining} bytes left, chunk size {}",
                self.config.granularity
            );
            return Err(ChunkError::Exhausted {
                object_size: size,
                remaining,
            });
        };
        let id = self.buckets.register();
        debug_assert_eq!(self.reservation.index_of(base.as_ptr()), Some(id.index()));
        // Safety: freshly carved memory, owned by nobody yet.
        unsafe { ChunkHeader::format(base, size) };
        stats::CARVED_CHUNKS.add(1);
        log::debug!("carved chunk {id} at {base:p} for object size {size}");
        let backing = self.reservation.backing();
        // Safety: the chunk was just registered as Unattached and is in no bucket.
        Ok(unsafe { Chunk::from_raw(id, base, self.config.granularity, backing) })
    }

    /// Unlinked chunk `id` becomes the caller's.
    fn check_out(&mut self, id: ChunkId) -> Chunk {
        let old = self.buckets.set_state(id, ChunkState::Unattached);
        debug_assert_eq!(old, ChunkState::InFreeList, "popped chunk {id} was not in a free list");
        let base = self.reservation.chunk_base(id.index());
        let backing = self.reservation.backing();
        // Safety: `id` was just popped, so nothing else references it.
        unsafe { Chunk::from_raw(id, base, self.config.granularity, backing) }
    }

    /// Return a chunk to its bucket.
    ///
    /// A chunk that does not belong to this source is ignored.
    pub fn release(&mut self, chunk: Chunk) {
        if !self.owns(&chunk) {
            log::trace!("ignoring release of foreign chunk {chunk:?}");
            return;
        }
        let (id, _, _) = chunk.into_raw();
        self.release_id(id);
    }

    /// Return the chunk named by `id` to its bucket.
    ///
    /// This is the address-based path for callers that track chunks by
    /// pointer (see [`ChunkSource::chunk_for`]). Misuse is absorbed: releasing
    /// a chunk that is already in a free list, or an id this source never
    /// carved, leaves every bucket, link and state untouched.
    pub fn release_id(&mut self, id: ChunkId) {
        let Some(slot) = self.buckets.slot(id) else {
            log::trace!("ignoring release of unknown chunk {id}");
            return;
        };
        if slot.state == ChunkState::InFreeList {
            log::trace!("ignoring release of already recycled chunk {id}");
            return;
        }
        debug_assert!(slot.next.is_none(), "checked-out chunk {id} is still linked");

        let base = self.reservation.chunk_base(id.index());
        // Safety: the chunk is carved and not in any bucket.
        let header = unsafe { ChunkHeader::read(base) };
        let bucket = self.release_bucket(&header);
        self.buckets.set_state(id, ChunkState::InFreeList);
        self.buckets.push(bucket, id);
        stats::RECYCLED_CHUNKS.add(1);
        log::trace!(
            "recycled chunk {id} (object size {}, {} live) into bucket {bucket}",
            header.object_size(),
            header.live()
        );
    }

    /// Whether `chunk` was carved from this source's reservation.
    fn owns(&self, chunk: &Chunk) -> bool {
        let (id, base) = (chunk.id(), chunk.as_ptr());
        self.chunk_for(base.as_ptr()) == Some(id)
            && self.reservation.chunk_base(id.index()) == base
    }

    fn release_bucket(&self, header: &ChunkHeader) -> usize {
        let class = self.buckets.index_for(header.object_size());
        if header.live() != 0 {
            return class;
        }
        match self.config.empty_policy {
            EmptyChunkPolicy::KeepSizeClass => class,
            EmptyChunkPolicy::Overflow => self.buckets.overflow(),
            EmptyChunkPolicy::OverflowWhenStocked { min_stocked } => {
                if self.buckets.len(class) >= min_stocked {
                    self.buckets.overflow()
                } else {
                    class
                }
            }
        }
    }

    /// Mark a checked-out chunk as in use by the outer allocator.
    pub fn attach(&mut self, chunk: &Chunk) {
        if self.owns(chunk) {
            self.buckets.set_state(chunk.id(), ChunkState::Attached);
        }
    }

    /// Re-format an empty checked-out chunk for objects of `size` bytes.
    ///
    /// The old handle is consumed, so nothing can keep using the chunk under
    /// its previous size class. A chunk from another source is reformatted
    /// without touching this source's bookkeeping.
    ///
    /// # Errors
    ///
    /// `ReformatError` hands the chunk back untouched if it still holds live
    /// objects.
    pub fn reformat(&mut self, chunk: Chunk, size: usize) -> Result<Chunk, ReformatError> {
        debug_assert!(
            size.is_multiple_of(self.config.size_step),
            "Size {size} is not a multiple of the size-class step {}",
            self.config.size_step
        );
        debug_assert!(
            size != 0 && size <= self.config.max_class_size,
            "Size {size} too large for size classes"
        );
        let live = chunk.live_objects();
        if live != 0 {
            return Err(ReformatError { chunk, live });
        }
        // Safety: the handle owns the chunk exclusively, and it holds no objects.
        unsafe { ChunkHeader::format(chunk.as_ptr(), size) };
        stats::REFORMATTED_CHUNKS.add(1);
        if self.owns(&chunk) {
            self.buckets.set_state(chunk.id(), ChunkState::Unattached);
        }
        Ok(chunk)
    }

    /// Id of the carved chunk containing `ptr`.
    #[must_use]
    pub fn chunk_for(&self, ptr: *const u8) -> Option<ChunkId> {
        self.reservation.index_of(ptr).map(ChunkId::new)
    }

    /// Base address of carved chunk `id`.
    #[must_use]
    pub fn chunk_base(&self, id: ChunkId) -> Option<NonNull<u8>> {
        self.buckets
            .slot(id)
            .map(|_| self.reservation.chunk_base(id.index()))
    }

    #[must_use]
    pub fn state(&self, id: ChunkId) -> Option<ChunkState> {
        self.buckets.slot(id).map(|slot| slot.state)
    }

    /// Chunks waiting in the bucket for size class `size`.
    #[must_use]
    pub fn bucket_len(&self, size: usize) -> usize {
        self.buckets.len(self.buckets.index_for(size))
    }

    /// Chunks waiting in the overflow bucket.
    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.buckets.len(self.buckets.overflow())
    }

    #[must_use]
    pub fn stats(&self) -> SourceStats {
        SourceStats {
            capacity: self.reservation.heap_size(),
            slack: self.reservation.slack(),
            chunk_bytes: self.config.granularity,
            carved_bytes: self.reservation.carved(),
            carved_chunks: self.buckets.chunk_count(),
            resident_chunks: self.buckets.resident(),
            remaining_bytes: self.reservation.remaining(),
        }
    }
}
