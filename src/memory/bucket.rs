use super::chunk::{ChunkId, ChunkState};

/// Bucket bookkeeping for one carved chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) state: ChunkState,
    /// Next chunk in the same bucket. Only meaningful while `InFreeList`.
    pub(crate) next: Option<ChunkId>,
}

/// Free-list buckets as index-linked stacks over a per-chunk slot table.
///
/// Bucket `i < overflow` holds chunks formatted for size class `i`; the last
/// bucket is the overflow bucket. Push and pop are O(1) head updates.
pub(crate) struct BucketTable {
    heads: Box<[Option<ChunkId>]>,
    lens: Box<[usize]>,
    slots: Vec<Slot>,
    size_step: usize,
    overflow: usize,
}

impl BucketTable {
    pub(crate) fn new(num_classes: usize, size_step: usize, max_chunks: usize) -> Self {
        Self {
            heads: vec![None; num_classes + 1].into_boxed_slice(),
            lens: vec![0; num_classes + 1].into_boxed_slice(),
            // Grows one slot per carve; never past the reservation's chunk count.
            slots: Vec::with_capacity(max_chunks.min(1 << 16)),
            size_step,
            overflow: num_classes,
        }
    }

    /// Bucket index of size class `size`: `size / step - 1`.
    ///
    /// Out-of-range sizes map one past the last bucket, so indexing with the
    /// result panics instead of landing on the overflow bucket.
    pub(crate) fn index_for(&self, size: usize) -> usize {
        debug_assert!(size != 0, "Size 0 has no size class");
        debug_assert!(
            size <= self.overflow * self.size_step,
            "Size {size} too large for size classes (max {})",
            self.overflow * self.size_step
        );
        self.class_index(size).unwrap_or(self.heads.len())
    }

    /// Non-asserting size-to-class mapping; `None` outside `(0, max]`.
    pub(crate) fn class_index(&self, size: usize) -> Option<usize> {
        if size > self.overflow * self.size_step {
            return None;
        }
        (size / self.size_step).checked_sub(1)
    }

    pub(crate) fn overflow(&self) -> usize {
        self.overflow
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    /// Register a freshly carved chunk. Ids follow carve order.
    pub(crate) fn register(&mut self) -> ChunkId {
        let id = ChunkId::new(self.slots.len());
        self.slots.push(Slot {
            state: ChunkState::Unattached,
            next: None,
        });
        id
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, id: ChunkId) -> Option<&Slot> {
        self.slots.get(id.index())
    }

    /// Set the state of `id`, returning the previous one.
    pub(crate) fn set_state(&mut self, id: ChunkId, state: ChunkState) -> ChunkState {
        std::mem::replace(&mut self.slots[id.index()].state, state)
    }

    pub(crate) fn head(&self, bucket: usize) -> Option<ChunkId> {
        debug_assert!(bucket < self.heads.len(), "bucket {bucket} out of range");
        self.heads[bucket]
    }

    pub(crate) fn len(&self, bucket: usize) -> usize {
        self.lens[bucket]
    }

    /// Chunks resident in all buckets.
    pub(crate) fn resident(&self) -> usize {
        self.lens.iter().sum()
    }

    /// Prepend `id` to `bucket`.
    pub(crate) fn push(&mut self, bucket: usize, id: ChunkId) {
        debug_assert!(
            self.slots[id.index()].next.is_none(),
            "chunk {id} pushed while still linked"
        );
        self.slots[id.index()].next = self.heads[bucket];
        self.heads[bucket] = Some(id);
        self.lens[bucket] += 1;
    }

    /// Unlink and return the head of `bucket`.
    pub(crate) fn pop(&mut self, bucket: usize) -> Option<ChunkId> {
        let id = self.heads[bucket]?;
        let slot = &mut self.slots[id.index()];
        self.heads[bucket] = slot.next.take();
        self.lens[bucket] -= 1;
        Some(id)
    }

    /// Walk `bucket` from its head. Stops after `limit` links so a corrupted
    /// (cyclic) list cannot hang the caller.
    pub(crate) fn iter(&self, bucket: usize, limit: usize) -> impl Iterator<Item = ChunkId> + '_ {
        std::iter::successors(self.head(bucket), move |id| {
            self.slots.get(id.index()).and_then(|slot| slot.next)
        })
        .take(limit)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn table_with(chunks: usize) -> (BucketTable, Vec<ChunkId>) {
        let mut table = BucketTable::new(32, 16, 64);
        let ids = (0..chunks).map(|_| table.register()).collect();
        (table, ids)
    }

    #[test]
    fn test_index_for_boundaries() {
        let (table, _) = table_with(0);
        assert_eq!(table.index_for(16), 0);
        assert_eq!(table.index_for(32), 1);
        assert_eq!(table.index_for(512), 31);
        assert_eq!(table.overflow(), 32);
        assert_eq!(table.bucket_count(), 33);
    }

    #[test]
    fn test_class_index_rejects_out_of_range() {
        let (table, _) = table_with(0);
        assert_eq!(table.class_index(0), None);
        assert_eq!(table.class_index(8), None);
        assert_eq!(table.class_index(16), Some(0));
        assert_eq!(table.class_index(512), Some(31));
        // One step past the largest class must not alias the overflow bucket.
        assert_eq!(table.class_index(528), None);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_index_for_out_of_range_is_past_every_bucket() {
        let (table, _) = table_with(0);
        assert_eq!(table.index_for(528), table.bucket_count());
        assert_eq!(table.index_for(0), table.bucket_count());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "Size 0 has no size class")]
    fn test_index_for_zero() {
        let (table, _) = table_with(0);
        table.index_for(0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "too large")]
    fn test_index_for_too_large() {
        let (table, _) = table_with(0);
        table.index_for(528);
    }

    #[test]
    fn test_register_assigns_carve_order() {
        let (table, ids) = table_with(3);
        assert_eq!(ids.iter().map(|id| id.index()).collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(table.chunk_count(), 3);
        assert_eq!(table.slot(ids[1]).unwrap().state, ChunkState::Unattached);
        assert!(table.slot(ChunkId::new(3)).is_none());
    }

    #[test]
    fn test_push_pop_is_lifo() {
        let (mut table, ids) = table_with(3);
        for &id in &ids {
            table.push(4, id);
        }
        assert_eq!(table.len(4), 3);
        assert_eq!(table.resident(), 3);
        assert_eq!(table.iter(4, 10).collect::<Vec<_>>(), [ids[2], ids[1], ids[0]]);

        assert_eq!(table.pop(4), Some(ids[2]));
        assert_eq!(table.slot(ids[2]).unwrap().next, None);
        assert_eq!(table.head(4), Some(ids[1]));
        assert_eq!(table.pop(4), Some(ids[1]));
        assert_eq!(table.pop(4), Some(ids[0]));
        assert_eq!(table.pop(4), None);
        assert!(table.head(4).is_none());
        assert_eq!(table.len(4), 0);
    }

    #[test]
    fn test_tail_link_is_none() {
        let (mut table, ids) = table_with(2);
        table.push(0, ids[0]);
        table.push(0, ids[1]);
        assert_eq!(table.slot(ids[1]).unwrap().next, Some(ids[0]));
        assert_eq!(table.slot(ids[0]).unwrap().next, None);
    }

    #[test]
    fn test_buckets_are_independent() {
        let (mut table, ids) = table_with(2);
        table.push(0, ids[0]);
        table.push(table.overflow(), ids[1]);
        assert_eq!(table.pop(0), Some(ids[0]));
        assert!(table.head(0).is_none());
        assert_eq!(table.len(table.overflow()), 1);
    }

    #[test]
    fn test_set_state_returns_previous() {
        let (mut table, ids) = table_with(1);
        let old = table.set_state(ids[0], ChunkState::InFreeList);
        assert_eq!(old, ChunkState::Unattached);
        assert_eq!(table.slot(ids[0]).unwrap().state, ChunkState::InFreeList);
    }

    #[test]
    fn test_iter_limit_bounds_cycles() {
        let (mut table, ids) = table_with(1);
        table.push(0, ids[0]);
        // Corrupt: point the chunk at itself.
        table.slots[0].next = Some(ids[0]);
        assert_eq!(table.iter(0, 5).count(), 5);
    }
}
