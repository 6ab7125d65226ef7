//! # Mapped Page Descriptors
//!
//! A [`MappedPage`] stands for one aligned page of the storage file and
//! mediates the life of its OS view through two counters:
//!
//! - `ref_count` counts strong references ([`PageHandle`]s). It drives
//!   recycling: the holder that drops the count to zero hands the
//!   descriptor back to the cache's free list.
//! - `lock_count` counts users of the mapped view and encodes a tri-state:
//!
//! ```text
//! UNLOCKED (-1) ──CAS──> LOCKING (0) ──map + publish──> LOCKED (1)
//!      ^                                                   │ n joiners
//!      └────────── last unlock drops the view <── LOCKED (n)
//! ```
//!
//! The thread that wins the `UNLOCKED → LOCKING` transition is the unique
//! mapper: it takes the resize mutex shared (so the file cannot grow while
//! the view lives), maps the page, stores the view, and publishes `LOCKED`.
//! Joiners arriving at `LOCKING` spin until the view is published; joiners
//! arriving at `LOCKED`+ increment and proceed. The last unlocker drops the
//! view (the scoped unmap), releases the shared hold, and republishes
//! `UNLOCKED`. Between its decrement-to-zero and that store the state reads
//! `LOCKING`, which correctly parks new lockers until the teardown is done.
//!
//! Each hot field sits on its own cache line; the bucket traversal hammers
//! `next` while lockers hammer `lock_count`, and neither should pay for the
//! other's writes.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use memmap2::MmapMut;

use super::file::StorageInner;
use super::mmap::MmapFile;
use super::resize::ResizeMutex;
use crate::error::{Result, StorageError};

/// Cache entry for one page of one storage file.
///
/// Allocated from the cache's monotonic arena and recycled through its free
/// list; never dropped individually.
pub(crate) struct MappedPage {
    offset: AtomicU64,
    /// Tagged successor link: either the next entry in a cache bucket or
    /// the next entry in the free list, with the low bit carrying the
    /// bucket-ownership tag.
    pub(crate) next: CachePadded<AtomicUsize>,
    ref_count: CachePadded<AtomicUsize>,
    lock_count: CachePadded<AtomicI32>,
    view: UnsafeCell<Option<MmapMut>>,
}

// SAFETY: all fields but `view` are atomics. `view` is written only at the
// two unique state transitions of the lock protocol (by the mapper between
// LOCKING and LOCKED, and by the last unlocker between its decrement to
// zero and the UNLOCKED store) and read only by threads holding a lock
// (lock_count >= 1), which the release/acquire pairs on lock_count order
// after the mapper's write and before the unlocker's teardown.
unsafe impl Send for MappedPage {}
unsafe impl Sync for MappedPage {}

impl MappedPage {
    pub(crate) const UNLOCKED: i32 = -1;
    pub(crate) const LOCKING: i32 = 0;
    pub(crate) const LOCKED: i32 = 1;

    pub(crate) fn new() -> Self {
        Self {
            offset: AtomicU64::new(0),
            next: CachePadded::new(AtomicUsize::new(0)),
            ref_count: CachePadded::new(AtomicUsize::new(0)),
            lock_count: CachePadded::new(AtomicI32::new(Self::UNLOCKED)),
            view: UnsafeCell::new(None),
        }
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Reinitializes a fresh or recycled descriptor for `offset` with
    /// `successor` as its untagged bucket link.
    ///
    /// Called only while the inserting thread owns the bucket slot the
    /// descriptor is about to be published into, so no other thread can
    /// reach it yet.
    pub(crate) fn reset(&self, offset: u64, successor: usize) {
        debug_assert!(
            // SAFETY: the descriptor is unpublished (owned slot, see above),
            // so reading the view cell races with nothing.
            unsafe { (*self.view.get()).is_none() },
            "recycled page still holds a view"
        );
        self.offset.store(offset, Ordering::Relaxed);
        self.ref_count.store(1, Ordering::Relaxed);
        self.lock_count.store(Self::UNLOCKED, Ordering::Relaxed);
        self.next.store(successor, Ordering::Relaxed);
    }

    pub(crate) fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one strong reference; returns true if this was the last one
    /// and the caller must recycle the descriptor.
    pub(crate) fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Acquires the page's view, mapping it if this is the first locker.
    /// Returns the view's base pointer, valid until the matching
    /// [`unlock`](Self::unlock).
    pub(crate) fn lock(
        &self,
        file: &MmapFile,
        resize: &ResizeMutex,
        spin_count: usize,
    ) -> Result<*mut u8> {
        let mut spin: usize = 0;
        loop {
            let state = self.lock_count.load(Ordering::Acquire);
            match state {
                Self::UNLOCKED => {
                    if self
                        .lock_count
                        .compare_exchange_weak(
                            Self::UNLOCKED,
                            Self::LOCKING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return self.map_view(file, resize);
                    }
                }
                Self::LOCKING => {
                    // Another thread is mapping (or tearing down); wait for
                    // it to publish a definite state.
                    spin += 1;
                    if spin % spin_count == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                holders => {
                    debug_assert!(holders >= Self::LOCKED);
                    if self
                        .lock_count
                        .compare_exchange_weak(
                            holders,
                            holders + 1,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Ok(self.view_ptr());
                    }
                }
            }
        }
    }

    /// The mapper path: holds the resize mutex shared for as long as the
    /// view lives, then publishes LOCKED.
    fn map_view(&self, file: &MmapFile, resize: &ResizeMutex) -> Result<*mut u8> {
        let offset = self.offset();
        let locker_id = (offset / file.page_size()) as usize;

        resize.lock_shared(locker_id);
        match file.map(offset) {
            Ok(view) => {
                let ptr = view.as_ptr() as *mut u8;
                // SAFETY: we hold the unique LOCKING state; no other thread
                // reads or writes the view cell until LOCKED is published.
                unsafe {
                    *self.view.get() = Some(view);
                }
                self.lock_count.store(Self::LOCKED, Ordering::Release);
                Ok(ptr)
            }
            Err(err) => {
                resize.unlock_shared(locker_id);
                self.lock_count.store(Self::UNLOCKED, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Releases one lock; the last locker unmaps the view and releases the
    /// shared hold on the resize mutex.
    pub(crate) fn unlock(&self, file: &MmapFile, resize: &ResizeMutex) {
        let prev = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= Self::LOCKED, "unlock without a matching lock");

        if prev == Self::LOCKED {
            // State now reads LOCKING: new lockers park until the teardown
            // below republishes UNLOCKED.
            // SAFETY: we performed the unique LOCKED -> 0 transition; every
            // other locker has unlocked and no new locker proceeds past
            // LOCKING, so the view cell is ours.
            unsafe {
                *self.view.get() = None;
            }
            resize.unlock_shared((self.offset() / file.page_size()) as usize);
            self.lock_count.store(Self::UNLOCKED, Ordering::Release);
        }
    }

    /// Base pointer of the published view. Caller must hold a lock.
    fn view_ptr(&self) -> *mut u8 {
        // SAFETY: lock_count >= 1 (caller holds a lock), so the view is
        // published and its cell is not concurrently written.
        let view = unsafe { (*self.view.get()).as_ref() };
        debug_assert!(view.is_some(), "locked page has no view");
        view.map_or(std::ptr::null_mut(), |view| view.as_ptr() as *mut u8)
    }

    /// Flushes the held view to disk. Caller must hold a lock.
    fn flush_view(&self) -> Result<()> {
        // SAFETY: as in view_ptr; lock_count >= 1 keeps the cell stable.
        let view = unsafe { (*self.view.get()).as_ref() };
        debug_assert!(view.is_some(), "locked page has no view");
        match view {
            Some(view) => view
                .flush()
                .map_err(|source| StorageError::io("unable to flush page view", source)),
            None => Ok(()),
        }
    }
}

/// Strong reference to a cached page of a storage file.
///
/// Obtained from [`StorageFile::get_mapped_page`]; cloning shares the
/// underlying descriptor. The descriptor returns to the cache's free list
/// when the last handle drops.
///
/// [`StorageFile::get_mapped_page`]: super::StorageFile::get_mapped_page
pub struct PageHandle {
    inner: Arc<StorageInner>,
    page: NonNull<MappedPage>,
}

// SAFETY: the handle is a counted reference to a MappedPage (Sync) plus an
// Arc keeping the arena that owns the descriptor alive; every operation on
// it goes through the atomic protocols above.
unsafe impl Send for PageHandle {}
unsafe impl Sync for PageHandle {}

impl PageHandle {
    /// Wraps a descriptor whose reference count the cache already bumped.
    pub(crate) fn new(inner: Arc<StorageInner>, page: NonNull<MappedPage>) -> Self {
        Self { inner, page }
    }

    fn page(&self) -> &MappedPage {
        // SAFETY: the descriptor lives in the cache arena owned (indirectly)
        // by `self.inner`, and our reference count keeps it out of reuse.
        unsafe { self.page.as_ref() }
    }

    /// File offset of this page. A multiple of the page size.
    pub fn offset(&self) -> u64 {
        self.page().offset()
    }

    /// Length of the page in bytes.
    pub fn len(&self) -> usize {
        self.inner.file.page_size() as usize
    }

    /// Maps the page (if not already mapped) and returns a guard for its
    /// memory. The file cannot grow while any guard exists.
    pub fn lock(&self) -> Result<PageGuard<'_>> {
        let data = self.page().lock(
            &self.inner.file,
            &self.inner.resize,
            self.inner.config.page_lock_spin_count,
        )?;
        Ok(PageGuard { handle: self, data })
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        self.page().add_ref();
        Self {
            inner: Arc::clone(&self.inner),
            page: self.page,
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if self.page().release() {
            self.inner.cache.mark_page_as_unused(self.page);
        }
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("offset", &self.offset())
            .field("ref_count", &self.page().ref_count())
            .finish()
    }
}

/// Locked view of one page; unmapping is deferred until the last guard on
/// the page drops.
///
/// The base pointer stays valid for the guard's lifetime. Concurrent guards
/// on the same page alias the same memory, so the slice accessors are
/// unsafe; callers that share a page across threads synchronize access
/// themselves, exactly as they would for any shared buffer.
pub struct PageGuard<'a> {
    handle: &'a PageHandle,
    data: *mut u8,
}

impl PageGuard<'_> {
    /// Base pointer of the mapped page.
    pub fn as_ptr(&self) -> *mut u8 {
        self.data
    }

    /// Length of the mapped page in bytes.
    pub fn len(&self) -> usize {
        self.handle.len()
    }

    /// Reads the whole page as a slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other thread writes the page while the
    /// returned slice is live.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.data, self.len())
    }

    /// Writes the whole page as a mutable slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other thread reads or writes the page
    /// while the returned slice is live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.data, self.len())
    }

    /// Synchronously flushes the page to disk.
    pub fn flush(&self) -> Result<()> {
        self.handle.page().flush_view()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.handle
            .page()
            .unlock(&self.handle.inner.file, &self.handle.inner.resize);
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("offset", &self.handle.offset())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn descriptor_alignment_leaves_the_tag_bit_free() {
        // Bucket links steal bit 0 of the descriptor address.
        assert!(std::mem::align_of::<MappedPage>() >= 2);

        let page = MappedPage::new();
        let addr = &page as *const MappedPage as usize;
        assert_eq!(addr & 1, 0);
    }

    #[test]
    fn lock_states_are_ordered() {
        assert!(MappedPage::UNLOCKED < MappedPage::LOCKING);
        assert!(MappedPage::LOCKING < MappedPage::LOCKED);
    }

    #[test]
    fn lock_maps_and_unlock_unmaps() {
        let dir = tempdir().unwrap();
        let file = MmapFile::open(dir.path().join("page.jb")).unwrap();
        let resize = ResizeMutex::default();

        let page = MappedPage::new();
        page.reset(0, 0);

        let data = page.lock(&file, &resize, 64).unwrap();
        assert!(!data.is_null());
        assert_eq!(page.lock_count.load(Ordering::Acquire), MappedPage::LOCKED);
        // The mapper holds the resize mutex shared.
        assert!(!resize.try_lock());

        // A second lock shares the same view.
        let again = page.lock(&file, &resize, 64).unwrap();
        assert_eq!(data, again);
        assert_eq!(page.lock_count.load(Ordering::Acquire), 2);

        page.unlock(&file, &resize);
        assert_eq!(page.lock_count.load(Ordering::Acquire), MappedPage::LOCKED);

        page.unlock(&file, &resize);
        assert_eq!(
            page.lock_count.load(Ordering::Acquire),
            MappedPage::UNLOCKED
        );
        // The shared hold is gone once the view is dropped.
        assert!(resize.try_lock());
        resize.unlock();
    }

    #[test]
    fn failed_map_restores_unlocked() {
        let dir = tempdir().unwrap();
        let file = MmapFile::open(dir.path().join("badoffset.jb")).unwrap();
        let resize = ResizeMutex::default();

        // An offset past EOF: the descriptor should never be constructed
        // for it by StorageFile, but the lock path must still fail safe.
        let page = MappedPage::new();
        page.reset(file.page_size() * 4, 0);

        let err = page.lock(&file, &resize, 64).unwrap_err();
        assert!(matches!(err, StorageError::OffsetOutOfBounds { .. }));
        assert_eq!(
            page.lock_count.load(Ordering::Acquire),
            MappedPage::UNLOCKED
        );
        // No shared hold leaked.
        assert!(resize.try_lock());
        resize.unlock();
    }

    #[test]
    fn concurrent_lockers_share_one_mapping() {
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let file = Arc::new(MmapFile::open(dir.path().join("contend.jb")).unwrap());
        let resize = Arc::new(ResizeMutex::default());
        let page = Arc::new(MappedPage::new());
        page.reset(0, 0);

        // Threads race the mapper election, joins, and teardowns. While a
        // thread holds a lock the view is pinned, so a nested lock must
        // return the same address, whatever everyone else is doing.
        let mut threads = Vec::new();
        for _ in 0..4 {
            let file = Arc::clone(&file);
            let resize = Arc::clone(&resize);
            let page = Arc::clone(&page);
            threads.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let outer = page.lock(&file, &resize, 64).unwrap();
                    let inner = page.lock(&file, &resize, 64).unwrap();
                    assert_eq!(outer, inner, "view changed under a held lock");
                    assert!(page.lock_count.load(Ordering::Acquire) >= 2);
                    page.unlock(&file, &resize);
                    page.unlock(&file, &resize);
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(
            page.lock_count.load(Ordering::Acquire),
            MappedPage::UNLOCKED
        );
        assert!(resize.try_lock(), "a shared hold leaked");
        resize.unlock();
    }

    #[test]
    fn writes_survive_remapping() {
        let dir = tempdir().unwrap();
        let file = MmapFile::open(dir.path().join("remap.jb")).unwrap();
        let resize = ResizeMutex::default();

        let page = MappedPage::new();
        page.reset(0, 0);

        let data = page.lock(&file, &resize, 64).unwrap();
        // SAFETY: single-threaded test; the view is live while locked.
        unsafe {
            *data = 0xA5;
            *data.add(1) = 0x5A;
        }
        page.unlock(&file, &resize);

        let data = page.lock(&file, &resize, 64).unwrap();
        // SAFETY: as above.
        unsafe {
            assert_eq!(*data, 0xA5);
            assert_eq!(*data.add(1), 0x5A);
        }
        page.unlock(&file, &resize);
    }
}
