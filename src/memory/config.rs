use super::chunk::HEADER_SIZE;
use super::error::ChunkError;

/// Total bytes requested from the OS for the process reservation (3 GiB).
pub const DEFAULT_CAPACITY: usize = 3 * 1024 * 1024 * 1024;
/// Bytes carved per chunk; also the alignment of the reservation base.
pub const DEFAULT_GRANULARITY: usize = 64 * 1024;
/// Distance between consecutive size classes.
pub const DEFAULT_SIZE_STEP: usize = 16;
/// Largest object size served from chunks.
pub const DEFAULT_MAX_CLASS_SIZE: usize = 512;

/// Where `release` files a chunk that holds no live objects.
///
/// Non-empty chunks always return to the bucket of their own size class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmptyChunkPolicy {
    /// Empty chunks stay with their size class.
    #[default]
    KeepSizeClass,
    /// Empty chunks always go to the overflow bucket, where any size class
    /// can pick them up.
    Overflow,
    /// Empty chunks go to the overflow bucket only once their own size-class
    /// bucket already holds `min_stocked` chunks.
    OverflowWhenStocked { min_stocked: usize },
}

/// Configuration for `ChunkSource`. All fields have sensible defaults.
/// Validated at construction; immutable afterwards.
#[derive(Clone, Debug)]
pub struct ChunkSourceConfig {
    /// Bytes reserved from the OS. Default: 3 GiB.
    pub capacity: usize,

    /// Chunk size in bytes. Must be a power of two. Default: 64 KiB.
    pub granularity: usize,

    /// Size-class step. Default: 16.
    pub size_step: usize,

    /// Largest size class; a multiple of `size_step`. Default: 512.
    pub max_class_size: usize,

    /// Routing of empty chunks on release. Default: `KeepSizeClass`.
    pub empty_policy: EmptyChunkPolicy,
}

impl Default for ChunkSourceConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            granularity: DEFAULT_GRANULARITY,
            size_step: DEFAULT_SIZE_STEP,
            max_class_size: DEFAULT_MAX_CLASS_SIZE,
            empty_policy: EmptyChunkPolicy::default(),
        }
    }
}

impl ChunkSourceConfig {
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    #[must_use]
    pub fn with_size_classes(mut self, size_step: usize, max_class_size: usize) -> Self {
        self.size_step = size_step;
        self.max_class_size = max_class_size;
        self
    }

    #[must_use]
    pub fn with_empty_policy(mut self, policy: EmptyChunkPolicy) -> Self {
        self.empty_policy = policy;
        self
    }

    /// Number of size-class buckets (the overflow bucket not included).
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.max_class_size / self.size_step
    }

    /// Number of buckets including the overflow bucket.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.num_classes() + 1
    }

    /// Index of the overflow bucket.
    #[must_use]
    pub fn overflow_bucket(&self) -> usize {
        self.num_classes()
    }

    /// Upper bound on the number of chunks the reservation can yield.
    #[must_use]
    pub fn max_chunks(&self) -> usize {
        self.capacity / self.granularity
    }

    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::InvalidConfig` describing the first violated rule.
    pub fn validate(&self) -> Result<(), ChunkError> {
        if !self.granularity.is_power_of_two() {
            return Err(ChunkError::InvalidConfig(format!(
                "granularity {} is not a power of two",
                self.granularity
            )));
        }
        if self.size_step == 0 {
            return Err(ChunkError::InvalidConfig("size step is zero".to_string()));
        }
        if self.max_class_size == 0 || !self.max_class_size.is_multiple_of(self.size_step) {
            return Err(ChunkError::InvalidConfig(format!(
                "max class size {} is not a positive multiple of step {}",
                self.max_class_size, self.size_step
            )));
        }
        if self.granularity < HEADER_SIZE + self.max_class_size {
            return Err(ChunkError::InvalidConfig(format!(
                "granularity {} cannot hold a {HEADER_SIZE}-byte header and one {}-byte object",
                self.granularity, self.max_class_size
            )));
        }
        if self.capacity < self.granularity {
            return Err(ChunkError::InvalidConfig(format!(
                "capacity {} is smaller than one chunk of {} bytes",
                self.capacity, self.granularity
            )));
        }
        if u32::try_from(self.max_chunks()).is_err() {
            return Err(ChunkError::InvalidConfig(format!(
                "capacity {} yields more than u32::MAX chunks",
                self.capacity
            )));
        }
        Ok(())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChunkSourceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capacity, 3 * 1024 * 1024 * 1024);
        assert_eq!(config.num_classes(), 32);
        assert_eq!(config.bucket_count(), 33);
        assert_eq!(config.overflow_bucket(), 32);
        assert_eq!(config.empty_policy, EmptyChunkPolicy::KeepSizeClass);
    }

    #[test]
    fn test_builders_chain() {
        let config = ChunkSourceConfig::default()
            .with_capacity(1 << 20)
            .with_granularity(4096)
            .with_size_classes(8, 256)
            .with_empty_policy(EmptyChunkPolicy::Overflow);
        config.validate().unwrap();
        assert_eq!(config.max_chunks(), 256);
        assert_eq!(config.num_classes(), 32);
        assert_eq!(config.empty_policy, EmptyChunkPolicy::Overflow);
    }

    #[test]
    fn test_rejects_non_power_of_two_granularity() {
        let config = ChunkSourceConfig::default().with_granularity(3 * 4096);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not a power of two"), "{err}");
    }

    #[test]
    fn test_rejects_zero_step() {
        let config = ChunkSourceConfig::default().with_size_classes(0, 512);
        assert!(matches!(config.validate(), Err(ChunkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_max_not_multiple_of_step() {
        let config = ChunkSourceConfig::default().with_size_classes(16, 500);
        assert!(matches!(config.validate(), Err(ChunkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_granularity_smaller_than_largest_object() {
        let config = ChunkSourceConfig::default()
            .with_granularity(512)
            .with_size_classes(16, 512);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot hold"), "{err}");
    }

    #[test]
    fn test_rejects_capacity_below_one_chunk() {
        let config = ChunkSourceConfig::default()
            .with_granularity(4096)
            .with_capacity(4095);
        assert!(matches!(config.validate(), Err(ChunkError::InvalidConfig(_))));
    }
}
