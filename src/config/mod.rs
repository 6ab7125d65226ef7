//! # Storage Configuration
//!
//! [`StorageConfig`] bundles the tunables consumed by the storage core.
//! Defaults live in [`constants`] and suit a general-purpose embedder;
//! the interesting knobs are `cache_capacity` (how many pages may be
//! referenced at once) and the spin budgets (how long waiters burn CPU
//! before yielding the OS thread).

mod constants;

pub use constants::{
    DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_SPIN_COUNT, DEFAULT_CACHE_CAPACITY,
    DEFAULT_PAGE_LOCK_SPIN_COUNT, DEFAULT_SHARED_LOCK_COUNT, DEFAULT_SPIN_COUNT_PER_LOCK,
    LOCK_NAME_PREFIX,
};

use crate::error::{Result, StorageError};

/// Tunables for one [`StorageFile`](crate::storage::StorageFile).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Shared-counter count in the resize mutex. Must be at least 1.
    pub shared_lock_count: usize,
    /// Page-cache bucket count. Must be at least 1; primes spread best.
    pub bucket_count: usize,
    /// Maximum page descriptors allocated per file. Must be at least 1.
    pub cache_capacity: usize,
    /// Resize-mutex spin budget per shared counter before yielding.
    pub spin_count_per_lock: usize,
    /// Spin budget while another thread maps the same page.
    pub page_lock_spin_count: usize,
    /// Spin budget while a bucket slot is owned by another traversal.
    pub bucket_spin_count: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shared_lock_count: DEFAULT_SHARED_LOCK_COUNT,
            bucket_count: DEFAULT_BUCKET_COUNT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            spin_count_per_lock: DEFAULT_SPIN_COUNT_PER_LOCK,
            page_lock_spin_count: DEFAULT_PAGE_LOCK_SPIN_COUNT,
            bucket_spin_count: DEFAULT_BUCKET_SPIN_COUNT,
        }
    }
}

impl StorageConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        fn at_least_one(value: usize, name: &str) -> Result<()> {
            if value == 0 {
                return Err(StorageError::InvalidConfig {
                    detail: format!("{name} must be at least 1"),
                });
            }
            Ok(())
        }

        at_least_one(self.shared_lock_count, "shared_lock_count")?;
        at_least_one(self.bucket_count, "bucket_count")?;
        at_least_one(self.cache_capacity, "cache_capacity")?;
        at_least_one(self.spin_count_per_lock, "spin_count_per_lock")?;
        at_least_one(self.page_lock_spin_count, "page_lock_spin_count")?;
        at_least_one(self.bucket_spin_count, "bucket_spin_count")?;
        Ok(())
    }
}
