use super::chunk::Chunk;
use super::vm::VmError;

/// Errors surfaced by chunk sources.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The reservation cannot yield another chunk.
    #[error("chunk source exhausted: cannot carve a chunk for object size {object_size}, {remaining} bytes remain")]
    Exhausted { object_size: usize, remaining: usize },

    /// A process reservation already exists; at most one is allowed.
    #[error("process chunk reservation already exists ({existing} constructed before this one)")]
    DuplicateReservation { existing: usize },

    #[error("invalid chunk source configuration: {0}")]
    InvalidConfig(String),

    /// The global chunk source was used before `GlobalChunkSource::init`.
    #[error("global chunk source is not initialized")]
    Uninitialized,

    #[error(transparent)]
    Vm(#[from] VmError),
}

/// A reformat was refused because the chunk still holds live objects.
/// Ownership of the chunk goes back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("chunk {} still holds {live} live objects and cannot be reformatted", .chunk.id())]
pub struct ReformatError {
    pub chunk: Chunk,
    pub live: usize,
}

impl ReformatError {
    /// Take back the chunk that could not be reformatted.
    #[must_use]
    pub fn into_chunk(self) -> Chunk {
        self.chunk
    }
}
