//! # Storage File
//!
//! [`StorageFile`] composes the platform file, the resize mutex, and the
//! page cache into the surface the rest of an engine builds on: `size`,
//! `grow`, and `get_mapped_page`.
//!
//! The composition lives behind an `Arc` so that page handles can outlive
//! the `StorageFile` value itself; the interprocess claim and the
//! descriptor arena are released when the last handle (or the file) drops,
//! whichever comes later.

use std::path::Path;
use std::sync::Arc;

use super::cache::{CacheStats, PageCache};
use super::mmap::MmapFile;
use super::page::PageHandle;
use super::resize::ResizeMutex;
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};

/// Shared state of one open storage file.
pub(crate) struct StorageInner {
    pub(crate) file: MmapFile,
    pub(crate) resize: ResizeMutex,
    pub(crate) cache: PageCache,
    pub(crate) config: StorageConfig,
}

/// One open storage file: a growable byte array accessed through cached,
/// individually mapped pages.
///
/// All methods take `&self`; a `StorageFile` is shared across threads as-is
/// or via the handles it produces.
#[derive(Debug)]
pub struct StorageFile {
    inner: Arc<StorageInner>,
}

impl StorageFile {
    /// Opens or creates the file at `path` with default tunables.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, StorageConfig::default())
    }

    /// Opens or creates the file at `path` with explicit tunables.
    pub fn open_with<P: AsRef<Path>>(path: P, config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let file = MmapFile::open(path)?;
        let resize = ResizeMutex::new(config.shared_lock_count, config.spin_count_per_lock);
        let cache = PageCache::new(file.page_size(), &config);

        Ok(Self {
            inner: Arc::new(StorageInner {
                file,
                resize,
                cache,
                config,
            }),
        })
    }

    /// The resolved absolute path of the file.
    pub fn path(&self) -> &Path {
        self.inner.file.path()
    }

    /// The page size: the OS allocation granularity.
    pub fn page_size(&self) -> u64 {
        self.inner.file.page_size()
    }

    /// Current file length in bytes; a positive multiple of the page size.
    pub fn size(&self) -> u64 {
        self.inner.file.size()
    }

    /// True when opening created the file.
    pub fn newly_created(&self) -> bool {
        self.inner.file.newly_created()
    }

    /// Extends the file by one page and returns the new length.
    ///
    /// Blocks (spinning and yielding) until no page view is held anywhere.
    /// Must not be called by a thread holding a [`PageGuard`]: the guard's
    /// shared hold on the resize mutex would deadlock against the exclusive
    /// hold growth needs.
    ///
    /// [`PageGuard`]: super::PageGuard
    pub fn grow(&self) -> Result<u64> {
        let _exclusive = self.inner.resize.exclusive();
        let new_size = self.inner.file.grow()?;
        tracing::debug!(path = %self.path().display(), new_size, "storage file grown");
        Ok(new_size)
    }

    /// Extends the file by one page only if its length is still
    /// `expected_size`; `None` means another grower got there first and
    /// the caller should re-read [`size`](Self::size).
    ///
    /// This is the race-collapsing form of [`grow`](Self::grow): N threads
    /// that all found the file full and raced to extend it produce one
    /// page of growth, not N.
    pub fn grow_from(&self, expected_size: u64) -> Result<Option<u64>> {
        let _exclusive = self.inner.resize.exclusive();
        if self.inner.file.size() != expected_size {
            return Ok(None);
        }
        let new_size = self.inner.file.grow()?;
        tracing::debug!(path = %self.path().display(), new_size, "storage file grown");
        Ok(Some(new_size))
    }

    /// Returns a handle to the page covering `offset`.
    ///
    /// `offset` must be page-aligned and its page must lie inside the
    /// current file length; violations are logic-class errors. The handle
    /// pins a cache descriptor (bounded by `cache_capacity`) but maps
    /// nothing until [`PageHandle::lock`] is called.
    pub fn get_mapped_page(&self, offset: u64) -> Result<PageHandle> {
        let page_size = self.page_size();
        if offset % page_size != 0 {
            return Err(StorageError::MisalignedOffset { offset, page_size });
        }
        let size = self.size();
        if offset + page_size > size {
            return Err(StorageError::OffsetOutOfBounds { offset, size });
        }

        let page = self.inner.cache.get(offset)?;
        Ok(PageHandle::new(Arc::clone(&self.inner), page))
    }

    /// Descriptor-pool counters (allocated/used/capacity).
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }
}

impl std::fmt::Debug for StorageInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageInner")
            .field("path", &self.file.path())
            .field("size", &self.file.size())
            .field("cache", &self.cache)
            .finish()
    }
}
