//! # Memory-Mapped Storage File
//!
//! `MmapFile` is the platform layer of the storage core: it owns the OS
//! file handle, the interprocess claim, and the knowledge of how to turn an
//! aligned offset into a live page view.
//!
//! ## Page Views
//!
//! The file is mapped one page at a time. [`MmapFile::map`] produces an
//! [`MmapMut`] covering exactly one page at an aligned offset; dropping the
//! view unmaps it. Views are created lazily by the page-lock protocol in
//! the page module and never outlive the shared hold on the resize mutex
//! that was taken before mapping, so a view can never observe the file
//! shrinking or the mapping moving underneath it.
//!
//! ## Growth
//!
//! [`MmapFile::grow`] extends the file by exactly one page. Its contract is
//! that the caller holds the resize mutex exclusively: the sweep in
//! [`ResizeMutex::lock`](super::ResizeMutex::lock) has already proven no
//! page view exists, so `set_len` cannot invalidate live memory. The cached
//! length is republished before the exclusive hold is released, which is
//! what lets subsequent `map` calls observe the new size.
//!
//! ## Page Size
//!
//! The page size is the OS allocation granularity, queried once per
//! process. Offsets handed to `map` must be multiples of it, and the file
//! length is kept a positive multiple of it at all times: a newly created
//! file is extended to one page before use.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use super::ipc::IpcLock;
use crate::error::{Result, StorageError};

/// The OS allocation granularity, the unit of mapping and of file growth.
#[cfg(unix)]
pub(crate) fn allocation_granularity() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// The OS allocation granularity, the unit of mapping and of file growth.
#[cfg(not(unix))]
pub(crate) fn allocation_granularity() -> u64 {
    // Windows allocation granularity.
    64 * 1024
}

/// A storage file opened with exclusive machine-wide ownership.
#[derive(Debug)]
pub struct MmapFile {
    path: PathBuf,
    file: File,
    _ipc: IpcLock,
    page_size: u64,
    len: AtomicU64,
    newly_created: bool,
}

impl MmapFile {
    /// Opens or creates the storage file at `path`.
    ///
    /// The path is resolved to absolute form first; the interprocess claim
    /// is keyed by the resolved path, so `./foo.jb` and its absolute
    /// spelling contend for the same claim. A newly created file is
    /// extended to one page so the length is always positive.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path = std::path::absolute(path).map_err(|source| StorageError::InvalidPath {
            path: path.to_path_buf(),
            source,
        })?;

        let ipc = IpcLock::acquire(&path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| StorageError::CannotOpen {
                path: path.clone(),
                source,
            })?;

        let page_size = allocation_granularity();

        let mut len = file
            .metadata()
            .map_err(|source| StorageError::io("unable to query storage file size", source))?
            .len();

        let newly_created = len == 0;
        if newly_created {
            file.set_len(page_size)
                .map_err(|source| StorageError::io("unable to extend new storage file", source))?;
            len = page_size;
        } else if len % page_size != 0 {
            return Err(StorageError::Io {
                detail: format!(
                    "storage file '{}' length {len} is not a multiple of the page size {page_size}",
                    path.display()
                ),
                source: None,
            });
        }

        tracing::debug!(
            path = %path.display(),
            page_size,
            len,
            newly_created,
            "opened storage file"
        );

        Ok(Self {
            path,
            file,
            _ipc: ipc,
            page_size,
            len: AtomicU64::new(len),
            newly_created,
        })
    }

    /// The resolved absolute path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The OS allocation granularity; constant for the process lifetime.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Current file length in bytes. Always a positive multiple of the
    /// page size.
    pub fn size(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// True when `open` created the file (and extended it to one page).
    pub fn newly_created(&self) -> bool {
        self.newly_created
    }

    /// Extends the file by exactly one page and returns the new length.
    ///
    /// Contract: the caller holds the resize mutex exclusively, so no page
    /// view exists while the length changes. On failure the length and all
    /// previously created views are untouched.
    pub(crate) fn grow(&self) -> Result<u64> {
        let old = self.len.load(Ordering::Acquire);
        let new = old + self.page_size;

        self.file
            .set_len(new)
            .map_err(|source| StorageError::io("unable to extend storage file", source))?;

        // Republished before the exclusive hold is released, so every map
        // call that starts afterwards sees the new bound.
        self.len.store(new, Ordering::Release);
        tracing::trace!(path = %self.path.display(), old, new, "grew storage file");
        Ok(new)
    }

    /// Maps the single page at `offset` read-write.
    ///
    /// `offset` must be page-aligned and the page must lie inside the file;
    /// violations are programmer errors surfaced as logic-class errors
    /// without touching any state. Safe to call concurrently from any
    /// number of threads holding the resize mutex shared.
    pub fn map(&self, offset: u64) -> Result<MmapMut> {
        if offset % self.page_size != 0 {
            return Err(StorageError::MisalignedOffset {
                offset,
                page_size: self.page_size,
            });
        }
        let size = self.size();
        if offset + self.page_size > size {
            return Err(StorageError::OffsetOutOfBounds { offset, size });
        }

        // SAFETY: map_mut is unsafe because an externally modified file can
        // invalidate the mapping's contents. This is sound here because:
        // 1. The IpcLock gives this instance exclusive ownership of the
        //    file machine-wide; no other process writes it.
        // 2. The bounds were validated against the current length above and
        //    the length cannot shrink (growth is the only resize).
        // 3. Growth runs only under the resize mutex held exclusively,
        //    while this call runs under a shared hold, so the region being
        //    mapped is stable for the lifetime of the view.
        let view = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.page_size as usize)
                .map_mut(&self.file)
                .map_err(|source| StorageError::io("unable to map page into memory", source))?
        };

        Ok(view)
    }
}
