#[cfg(not(target_pointer_width = "64"))]
compile_error!("chunk-source supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// sources/chunks
pub use memory::chunk::{Chunk, ChunkId, ChunkState, HEADER_SIZE};
pub use memory::global::GlobalChunkSource;
pub use memory::reservation::{MemoryReservation, ReservationKind};
pub use memory::source::{ChunkSource, SourceStats};

// config
pub use memory::config::{
    ChunkSourceConfig, DEFAULT_CAPACITY, DEFAULT_GRANULARITY, DEFAULT_MAX_CLASS_SIZE,
    DEFAULT_SIZE_STEP, EmptyChunkPolicy,
};

// diagnostics
pub use memory::checker::Inconsistency;
pub use memory::stats::{Diagnostics, diagnostics};

// errors
pub use memory::error::{ChunkError, ReformatError};
pub use memory::vm::VmError;
