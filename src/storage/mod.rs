//! # Storage Core
//!
//! The foundational layer of jotbase: one growable on-disk file per
//! [`StorageFile`], accessed through a bounded pool of lazily mapped page
//! views.
//!
//! ## Architecture
//!
//! ```text
//! StorageFile
//! ├── MmapFile      opens the file with machine-wide ownership (IpcLock),
//! │                 tracks its length, maps single pages on demand
//! ├── ResizeMutex   reader-biased lock: page views hold it shared,
//! │                 growth holds it exclusive
//! └── PageCache     offset → MappedPage descriptor; sorted lock-free
//!                   buckets, free list, bounded arena
//! ```
//!
//! A caller asks the file for the page covering an offset and gets a
//! [`PageHandle`], a counted reference to a cache descriptor. Locking the
//! handle maps the page (first locker) or joins the existing view, and
//! yields a [`PageGuard`] whose pointer is valid until the guard drops.
//! While any guard exists the file cannot grow; growth takes the resize
//! mutex exclusively, extends the file by one page, and republishes the
//! length before letting mappers back in.
//!
//! Dropping the last handle to a page sends its descriptor to the cache's
//! free list; the pool never exceeds `cache_capacity` descriptors and
//! reports `CacheExhausted` when every descriptor is pinned.
//!
//! ## Module Organization
//!
//! - `mmap`: platform file (open/create, length, growth, page mapping)
//! - `ipc`: interprocess ownership claim (`jb_<hex>` lock file)
//! - `resize`: the shared/exclusive resize mutex
//! - `page`: page descriptors, handles, and lock guards
//! - `cache`: the per-file page cache
//! - `file`: the `StorageFile` composition

mod cache;
mod file;
mod ipc;
mod mmap;
mod page;
mod resize;

pub use cache::CacheStats;
pub use file::StorageFile;
pub use mmap::MmapFile;
pub use page::{PageGuard, PageHandle};
pub use resize::{ExclusiveGuard, ResizeMutex, SharedGuard};
