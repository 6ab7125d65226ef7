//! # jotbase: Embedded Page Storage Core
//!
//! jotbase is the storage foundation of an embedded key-value engine: a
//! growable file exposed as fixed-size memory-mapped pages, with a
//! lock-free page cache that bounds how many pages are live at once and a
//! resize lock that lets the file grow safely under concurrent readers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use jotbase::StorageFile;
//!
//! let file = StorageFile::open("./data.jb")?;
//! assert_eq!(file.size(), file.page_size()); // auto-created with one page
//!
//! let page = file.get_mapped_page(0)?;
//! {
//!     let guard = page.lock()?;              // maps the page
//!     unsafe { guard.as_mut_slice()[0] = 42 };
//! }                                          // last guard unmaps
//!
//! file.grow()?;                              // safe: no guards held
//! ```
//!
//! ## Design
//!
//! - **One owner per file.** Opening takes a machine-wide claim keyed by a
//!   hash of the absolute path; a second open, same process or not,
//!   fails with `AlreadyInUse`.
//! - **Pages map lazily.** A [`PageHandle`] is just a pinned cache entry;
//!   the `mmap` happens on first [`lock`](PageHandle::lock) and the
//!   `munmap` when the last guard drops.
//! - **Growth never invalidates a view.** Page views hold the resize
//!   mutex shared; growth takes it exclusively, so it waits out every
//!   live view and no view ever spans a resize.
//! - **Bounded cache.** Descriptors come from a fixed arena and recycle
//!   through a free list; when every descriptor is referenced, requests
//!   fail with `CacheExhausted` until handles drop.
//!
//! Higher layers (namespaces, key trees, value encoding) sit on top of
//! this crate and see nothing but bytes inside pages.

pub mod config;
pub mod error;
pub mod storage;

pub use config::StorageConfig;
pub use error::{Result, RetCode, StorageError};
pub use storage::{CacheStats, PageGuard, PageHandle, StorageFile};
