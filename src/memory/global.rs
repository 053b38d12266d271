use super::chunk::Chunk;
use super::config::ChunkSourceConfig;
use super::error::ChunkError;
use super::source::{ChunkSource, SourceStats};
use crate::sync::{Mutex, OnceLock};
use std::sync::PoisonError;

static GLOBAL_CHUNK_SOURCE: OnceLock<Mutex<ChunkSource>> = OnceLock::new();

/// The process chunk source behind one coarse lock.
///
/// `ChunkSource` itself is single-threaded; every call here serializes on
/// the global mutex for the duration of one `acquire` or `release`.
pub struct GlobalChunkSource;

impl GlobalChunkSource {
    /// Create the process chunk source with `config`.
    ///
    /// # Errors
    ///
    /// Whatever [`ChunkSource::new`] reports. A second call fails with
    /// `ChunkError::DuplicateReservation` because the process reservation
    /// is already claimed.
    pub fn init(config: ChunkSourceConfig) -> Result<(), ChunkError> {
        let source = ChunkSource::new(config)?;
        log::info!(
            "process chunk source ready: {} bytes in {} byte chunks",
            source.reservation().heap_size(),
            source.config().granularity
        );
        // Only the call that won the reservation gets this far.
        drop(GLOBAL_CHUNK_SOURCE.set(Mutex::new(source)));
        Ok(())
    }

    pub fn get() -> Option<&'static Mutex<ChunkSource>> {
        GLOBAL_CHUNK_SOURCE.get()
    }

    fn with_source<R>(f: impl FnOnce(&mut ChunkSource) -> R) -> Result<R, ChunkError> {
        let source = Self::get().ok_or(ChunkError::Uninitialized)?;
        let mut guard = source.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut guard))
    }

    /// Acquire a chunk for objects of `size` bytes from the process source.
    ///
    /// # Errors
    ///
    /// `ChunkError::Uninitialized` before [`GlobalChunkSource::init`], or
    /// `ChunkError::Exhausted`.
    pub fn acquire(size: usize) -> Result<Chunk, ChunkError> {
        Self::with_source(|source| source.acquire(size))?
    }

    /// Return a chunk to the process source.
    ///
    /// A chunk cannot exist before the source does, so this is a no-op when
    /// uninitialized.
    pub fn release(chunk: Chunk) {
        drop(Self::with_source(|source| source.release(chunk)));
    }

    /// # Errors
    ///
    /// `ChunkError::Uninitialized` before [`GlobalChunkSource::init`].
    pub fn stats() -> Result<SourceStats, ChunkError> {
        Self::with_source(|source| source.stats())
    }
}
