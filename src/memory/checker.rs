//! Explicit consistency checking for chunk sources.
//!
//! Nothing here runs implicitly: tests, fuzzing harnesses and debugging
//! sessions call [`ChunkSource::check_consistency`] when they want it, in
//! any build mode.

use super::chunk::{ChunkHeader, ChunkId, ChunkState};
use super::source::{ChunkSource, SourceStats};
use fixedbitset::FixedBitSet;

/// First invariant violation found by [`ChunkSource::check_consistency`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Inconsistency {
    #[error("reservation bookkeeping is inconsistent")]
    Reservation,

    #[error("byte accounting does not add up: {0:?}")]
    Conservation(SourceStats),

    #[error("bucket {bucket} links chunk {id}, which was never carved")]
    UnknownLink { bucket: usize, id: ChunkId },

    #[error("chunk {id} is linked more than once (second time in bucket {bucket})")]
    LinkedTwice { bucket: usize, id: ChunkId },

    #[error("bucket {bucket} records {recorded} chunks but links {linked}")]
    BucketLength {
        bucket: usize,
        recorded: usize,
        linked: usize,
    },

    #[error("chunk {id} is {state:?} but linked = {linked}")]
    StateMismatch {
        id: ChunkId,
        state: ChunkState,
        linked: bool,
    },

    #[error("chunk {id} is out of every bucket but still links {next}")]
    StaleLink { id: ChunkId, next: ChunkId },

    #[error("chunk {id} has a corrupt header")]
    CorruptHeader { id: ChunkId },

    #[error("chunk {id} formatted for object size {object_size} sits in bucket {bucket}")]
    WrongBucket {
        id: ChunkId,
        bucket: usize,
        object_size: usize,
    },

    #[error("overflow chunk {id} still holds {live} live objects")]
    LiveInOverflow { id: ChunkId, live: usize },
}

impl ChunkSource {
    /// Walk every bucket and every carved chunk, verifying:
    ///
    /// - the reservation cursor, and that checked-out, resident and remaining
    ///   bytes add up to the capacity;
    /// - each chunk is linked at most once, and is `InFreeList` exactly when linked;
    /// - recorded bucket lengths match the links;
    /// - only linked chunks carry a next link;
    /// - every header is well formed, class buckets hold chunks of their
    ///   class, and the overflow bucket holds only empty chunks.
    ///
    /// # Errors
    ///
    /// The first [`Inconsistency`] encountered.
    pub fn check_consistency(&self) -> Result<(), Inconsistency> {
        if !self.reservation.is_valid() {
            return Err(Inconsistency::Reservation);
        }
        let chunks = self.buckets.chunk_count();
        let overflow = self.buckets.overflow();
        let mut linked = FixedBitSet::with_capacity(chunks);

        for bucket in 0..self.buckets.bucket_count() {
            let mut count = 0;
            // One past the chunk count is enough to expose any cycle.
            for id in self.buckets.iter(bucket, chunks + 1) {
                if id.index() >= chunks {
                    return Err(Inconsistency::UnknownLink { bucket, id });
                }
                if linked.put(id.index()) {
                    return Err(Inconsistency::LinkedTwice { bucket, id });
                }
                count += 1;

                let header = self.header(id)?;
                if bucket == overflow {
                    if header.live() != 0 {
                        return Err(Inconsistency::LiveInOverflow {
                            id,
                            live: header.live(),
                        });
                    }
                } else if self.buckets.class_index(header.object_size()) != Some(bucket) {
                    return Err(Inconsistency::WrongBucket {
                        id,
                        bucket,
                        object_size: header.object_size(),
                    });
                }
            }
            let recorded = self.buckets.len(bucket);
            if recorded != count {
                return Err(Inconsistency::BucketLength {
                    bucket,
                    recorded,
                    linked: count,
                });
            }
        }

        for index in 0..chunks {
            let id = ChunkId::new(index);
            let Some(slot) = self.buckets.slot(id) else {
                continue;
            };
            let is_linked = linked.contains(index);
            if (slot.state == ChunkState::InFreeList) != is_linked {
                return Err(Inconsistency::StateMismatch {
                    id,
                    state: slot.state,
                    linked: is_linked,
                });
            }
            if let (false, Some(next)) = (is_linked, slot.next) {
                return Err(Inconsistency::StaleLink { id, next });
            }
            self.header(id)?;
        }

        let stats = self.stats();
        if !stats.is_conserved() {
            return Err(Inconsistency::Conservation(stats));
        }
        Ok(())
    }

    fn header(&self, id: ChunkId) -> Result<ChunkHeader, Inconsistency> {
        let base = self.reservation.chunk_base(id.index());
        // Safety: `id` is below the carved chunk count.
        let header = unsafe { ChunkHeader::read(base) };
        if header.is_consistent(self.config.granularity) {
            Ok(header)
        } else {
            Err(Inconsistency::CorruptHeader { id })
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::config::{ChunkSourceConfig, EmptyChunkPolicy};

    const G: usize = 4096;

    fn source(policy: EmptyChunkPolicy) -> ChunkSource {
        ChunkSource::scratch(
            ChunkSourceConfig::default()
                .with_capacity(G * 8)
                .with_granularity(G)
                .with_empty_policy(policy),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_source_is_consistent() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        source(EmptyChunkPolicy::KeepSizeClass)
            .check_consistency()
            .unwrap();
    }

    #[test]
    fn test_mixed_workload_is_consistent() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = source(EmptyChunkPolicy::Overflow);
        let a = src.acquire(16).unwrap();
        let mut b = src.acquire(32).unwrap();
        assert!(b.record_alloc());
        let c = src.acquire(48).unwrap();
        src.attach(&c);
        src.release(a);
        src.release(b);
        src.check_consistency().unwrap();
        let d = src.acquire(512).unwrap();
        src.check_consistency().unwrap();
        src.release(c);
        src.release(d);
        src.check_consistency().unwrap();
    }

    #[test]
    fn test_detects_state_mismatch() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = source(EmptyChunkPolicy::KeepSizeClass);
        let chunk = src.acquire(16).unwrap();
        let id = chunk.id();
        src.buckets.set_state(id, ChunkState::InFreeList);
        assert_eq!(
            src.check_consistency(),
            Err(Inconsistency::StateMismatch {
                id,
                state: ChunkState::InFreeList,
                linked: false
            })
        );
    }

    #[test]
    fn test_detects_cycle() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = source(EmptyChunkPolicy::KeepSizeClass);
        let a = src.acquire(16).unwrap();
        let id = a.id();
        src.release(a);
        // Re-pushing the tail of a bucket links it to itself.
        src.buckets.push(0, id);
        assert!(matches!(
            src.check_consistency(),
            Err(Inconsistency::LinkedTwice { bucket: 0, .. })
        ));
    }

    #[test]
    fn test_detects_wrong_bucket() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = source(EmptyChunkPolicy::KeepSizeClass);
        let chunk = src.acquire(16).unwrap();
        let id = chunk.id();
        let _ = chunk.into_raw();
        src.buckets.set_state(id, ChunkState::InFreeList);
        src.buckets.push(5, id);
        assert_eq!(
            src.check_consistency(),
            Err(Inconsistency::WrongBucket {
                id,
                bucket: 5,
                object_size: 16
            })
        );
    }

    #[test]
    fn test_detects_live_chunk_in_overflow() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = source(EmptyChunkPolicy::KeepSizeClass);
        let mut chunk = src.acquire(16).unwrap();
        assert!(chunk.record_alloc());
        let id = chunk.id();
        let _ = chunk.into_raw();
        let overflow = src.buckets.overflow();
        src.buckets.set_state(id, ChunkState::InFreeList);
        src.buckets.push(overflow, id);
        assert_eq!(
            src.check_consistency(),
            Err(Inconsistency::LiveInOverflow { id, live: 1 })
        );
    }

    #[test]
    fn test_detects_corrupt_header() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = source(EmptyChunkPolicy::KeepSizeClass);
        let chunk = src.acquire(16).unwrap();
        let id = chunk.id();
        // Safety: Test code; clobber the magic of an owned chunk.
        unsafe { chunk.as_ptr().as_ptr().write_bytes(0, 8) };
        assert_eq!(
            src.check_consistency(),
            Err(Inconsistency::CorruptHeader { id })
        );
    }
}
