use super::reservation::ScratchBlock;
use crate::sync::Arc;
use std::fmt;
use std::ptr::NonNull;

/// Marks a formatted chunk header.
const CHUNK_MAGIC: u64 = 0x4348_554E_4B53_5243;

/// Header written at the base of every carved chunk.
///
/// It belongs to the chunk's occupant (the object-level allocator). Bucket
/// bookkeeping (state, next link) lives in the source's slot table instead.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChunkHeader {
    magic: u64,
    object_size: usize,
    live: usize,
    formats: u64,
}

/// Bytes reserved at the start of each chunk for its header. Keeps the
/// payload aligned to the smallest size-class step.
pub const HEADER_SIZE: usize = (std::mem::size_of::<ChunkHeader>() + 15) & !15;

impl ChunkHeader {
    pub(crate) fn is_formatted(&self) -> bool {
        self.magic == CHUNK_MAGIC
    }

    pub(crate) fn object_size(&self) -> usize {
        self.object_size
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn formats(&self) -> u64 {
        self.formats
    }

    /// Self-consistency of a formatted header inside a chunk of `len` bytes.
    pub(crate) fn is_consistent(&self, len: usize) -> bool {
        let payload = len.saturating_sub(HEADER_SIZE);
        self.is_formatted()
            && self.object_size != 0
            && self.object_size <= payload
            && self.live <= payload / self.object_size
    }

    /// Copy the header out of chunk memory.
    ///
    /// # Safety
    /// `base` must be the base of a chunk carved from a live reservation.
    pub(crate) unsafe fn read(base: NonNull<u8>) -> Self {
        // Safety: chunk bases are granularity-aligned and at least HEADER_SIZE long.
        unsafe { base.cast::<Self>().as_ptr().read() }
    }

    /// Format the chunk at `base` for `object_size`, discarding any previous
    /// occupant's bookkeeping.
    ///
    /// # Safety
    /// `base` must be the base of a carved chunk, and no live object or
    /// outside reference into the previous format may survive this call.
    pub(crate) unsafe fn format(base: NonNull<u8>, object_size: usize) {
        // Safety: upheld by caller.
        let previous = unsafe { Self::read(base) };
        // Fresh reservation memory is zero-filled, so a never-formatted chunk
        // has no magic and starts its format count at one.
        let formats = if previous.is_formatted() {
            previous.formats + 1
        } else {
            1
        };
        let header = Self {
            magic: CHUNK_MAGIC,
            object_size,
            live: 0,
            formats,
        };
        // Safety: upheld by caller.
        unsafe { base.cast::<Self>().as_ptr().write(header) };
    }

    /// # Safety
    /// Caller must own the formatted chunk at `base` exclusively.
    unsafe fn set_live(base: NonNull<u8>, live: usize) {
        let header = base.cast::<Self>().as_ptr();
        // Safety: upheld by caller; only the `live` field is written.
        unsafe { std::ptr::addr_of_mut!((*header).live).write(live) };
    }
}

/// Stable identity of a chunk: its carve order within the reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u32);

impl ChunkId {
    pub(crate) fn new(index: usize) -> Self {
        // Config validation caps the chunk count at u32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        Self(index as u32)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a carved chunk as seen by the chunk source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// Checked out to (or freshly produced for) the outer allocator.
    Unattached,
    /// Linked into a free-list bucket.
    InFreeList,
    /// Marked in use by the outer allocator. Treated like `Unattached`
    /// everywhere except that it is not `InFreeList`.
    Attached,
}

/// Exclusive handle to a checked-out chunk.
///
/// Not `Clone`: while a `Chunk` exists, no bucket links the chunk it names.
/// Hand it back with `ChunkSource::release`. Dropping the handle leaves the
/// chunk checked out for the rest of the process.
///
/// A handle carved from a scratch source keeps that source's memory alive,
/// so it stays usable after the source itself is dropped.
#[must_use = "dropping a Chunk leaks it until the process exits"]
pub struct Chunk {
    id: ChunkId,
    base: NonNull<u8>,
    len: usize,
    _backing: Option<Arc<ScratchBlock>>,
}

// Safety: a Chunk is the sole owner of its memory range while it exists.
unsafe impl Send for Chunk {}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("object_size", &self.object_size())
            .field("live", &self.live_objects())
            .finish()
    }
}

impl Chunk {
    /// # Safety
    /// `base..base + len` must be a formatted chunk that nothing else owns,
    /// inside memory that lives as long as the process or as `backing`.
    pub(crate) unsafe fn from_raw(
        id: ChunkId,
        base: NonNull<u8>,
        len: usize,
        backing: Option<Arc<ScratchBlock>>,
    ) -> Self {
        Self {
            id,
            base,
            len,
            _backing: backing,
        }
    }

    /// Give up the handle. The keep-alive token is dropped with it, so the
    /// pointer is only good while the issuing source is.
    pub(crate) fn into_raw(self) -> (ChunkId, NonNull<u8>, usize) {
        (self.id, self.base, self.len)
    }

    fn header(&self) -> ChunkHeader {
        // Safety: the handle owns a formatted chunk.
        unsafe { ChunkHeader::read(self.base) }
    }

    #[must_use]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Base address of the chunk (where its header lives).
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.base
    }

    /// First object slot, just past the header.
    #[must_use]
    pub fn payload(&self) -> NonNull<u8> {
        // Safety: len > HEADER_SIZE is guaranteed by config validation.
        unsafe { self.base.add(HEADER_SIZE) }
    }

    /// Total bytes spanned by the chunk, header included.
    #[must_use]
    pub fn chunk_bytes(&self) -> usize {
        self.len
    }

    /// Object size class the chunk is currently formatted for.
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.header().object_size()
    }

    /// How many objects of `object_size` fit in the payload.
    #[must_use]
    pub fn capacity(&self) -> usize {
        (self.len - HEADER_SIZE) / self.object_size()
    }

    /// Address of object slot `slot`, if the chunk has that many slots.
    #[must_use]
    pub fn object_ptr(&self, slot: usize) -> Option<NonNull<u8>> {
        if slot >= self.capacity() {
            return None;
        }
        // Safety: slot < capacity keeps the offset inside the chunk.
        Some(unsafe { self.payload().add(slot * self.object_size()) })
    }

    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.header().live()
    }

    /// True when no objects are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_objects() == 0
    }

    /// Number of times this chunk's memory has been formatted.
    #[must_use]
    pub fn formats(&self) -> u64 {
        self.header().formats()
    }

    /// Count one more live object. Returns `false` if the chunk is full.
    pub fn record_alloc(&mut self) -> bool {
        let live = self.live_objects();
        if live >= self.capacity() {
            return false;
        }
        // Safety: &mut self is exclusive ownership of the chunk.
        unsafe { ChunkHeader::set_live(self.base, live + 1) };
        true
    }

    /// Count one object as freed.
    pub fn record_free(&mut self) {
        let live = self.live_objects();
        debug_assert!(live > 0, "record_free on empty chunk {}", self.id);
        // Safety: &mut self is exclusive ownership of the chunk.
        unsafe { ChunkHeader::set_live(self.base, live.saturating_sub(1)) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const LEN: usize = 4096;

    fn scratch_chunk(object_size: usize) -> (Chunk, std::alloc::Layout) {
        let layout = std::alloc::Layout::from_size_align(LEN, LEN).unwrap();
        // Safety: Test code.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap();
        // Safety: Test code; fresh allocation owned by this test.
        let chunk = unsafe {
            ChunkHeader::format(base, object_size);
            Chunk::from_raw(ChunkId::new(0), base, LEN, None)
        };
        (chunk, layout)
    }

    fn free_chunk(chunk: Chunk, layout: std::alloc::Layout) {
        // Safety: Test code.
        unsafe { std::alloc::dealloc(chunk.as_ptr().as_ptr(), layout) };
    }

    #[test]
    fn test_header_size_keeps_payload_aligned() {
        assert!(HEADER_SIZE >= std::mem::size_of::<ChunkHeader>());
        assert_eq!(HEADER_SIZE % 16, 0);
    }

    #[test]
    fn test_fresh_format() {
        let (chunk, layout) = scratch_chunk(64);
        assert_eq!(chunk.object_size(), 64);
        assert_eq!(chunk.live_objects(), 0);
        assert!(chunk.is_empty());
        assert_eq!(chunk.formats(), 1);
        assert_eq!(chunk.capacity(), (LEN - HEADER_SIZE) / 64);
        assert_eq!(
            chunk.payload().as_ptr() as usize - chunk.as_ptr().as_ptr() as usize,
            HEADER_SIZE
        );
        free_chunk(chunk, layout);
    }

    #[test]
    fn test_reformat_counts_and_resets() {
        let (mut chunk, layout) = scratch_chunk(32);
        assert!(chunk.record_alloc());
        // Safety: Test code; the chunk holds no real objects.
        unsafe { ChunkHeader::format(chunk.as_ptr(), 128) };
        assert_eq!(chunk.object_size(), 128);
        assert_eq!(chunk.live_objects(), 0);
        assert_eq!(chunk.formats(), 2);
        free_chunk(chunk, layout);
    }

    #[test]
    fn test_record_alloc_until_full() {
        let (mut chunk, layout) = scratch_chunk(512);
        let capacity = chunk.capacity();
        for _ in 0..capacity {
            assert!(chunk.record_alloc());
        }
        assert!(!chunk.record_alloc(), "full chunk must refuse");
        assert_eq!(chunk.live_objects(), capacity);
        chunk.record_free();
        assert_eq!(chunk.live_objects(), capacity - 1);
        assert!(!chunk.is_empty());
        free_chunk(chunk, layout);
    }

    #[test]
    fn test_object_ptr_bounds() {
        let (chunk, layout) = scratch_chunk(256);
        let first = chunk.object_ptr(0).unwrap();
        assert_eq!(first, chunk.payload());
        let last = chunk.capacity() - 1;
        let last_ptr = chunk.object_ptr(last).unwrap().as_ptr() as usize;
        assert!(last_ptr + 256 <= chunk.as_ptr().as_ptr() as usize + LEN);
        assert!(chunk.object_ptr(chunk.capacity()).is_none());
        free_chunk(chunk, layout);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "record_free on empty chunk")]
    fn test_record_free_on_empty_panics() {
        let (mut chunk, _layout) = scratch_chunk(16);
        chunk.record_free();
    }

    #[test]
    fn test_header_consistency() {
        let (mut chunk, layout) = scratch_chunk(1024);
        // Safety: Test code.
        let header = unsafe { ChunkHeader::read(chunk.as_ptr()) };
        assert!(header.is_consistent(LEN));
        assert!(!header.is_consistent(512), "object larger than the payload");
        while chunk.record_alloc() {}
        // Safety: Test code.
        let full = unsafe { ChunkHeader::read(chunk.as_ptr()) };
        assert!(full.is_consistent(LEN));
        assert_eq!(full.live(), chunk.capacity());
        free_chunk(chunk, layout);
    }

    #[test]
    fn test_zeroed_memory_is_unformatted() {
        let layout = std::alloc::Layout::from_size_align(LEN, LEN).unwrap();
        // Safety: Test code.
        let base = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
        // Safety: Test code.
        let header = unsafe { ChunkHeader::read(base) };
        assert!(!header.is_formatted());
        assert!(!header.is_consistent(LEN));
        // Safety: Test code.
        unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
    }

    #[test]
    fn test_chunk_id_display() {
        assert_eq!(ChunkId::new(7).to_string(), "#7");
        assert_eq!(ChunkId::new(7).index(), 7);
    }
}
