//! # Page Cache
//!
//! Per-file map from page offset to [`MappedPage`] descriptor, built for
//! concurrent access without a global lock.
//!
//! ## Structure
//!
//! ```text
//! PageCache
//! ├── buckets[41]: tagged head pointers, one sorted singly linked
//! │                list of descriptors per bucket (offset ascending)
//! ├── free_list:   Treiber stack of unreferenced descriptors
//! └── arena:       bounded monotonic pool the descriptors are carved from
//! ```
//!
//! A page's bucket is its page index modulo the bucket count. Within a
//! bucket the list is strictly sorted by offset, so a lookup is one linear
//! probe that can stop early.
//!
//! ## Slot Ownership
//!
//! Every link slot (bucket head or a descriptor's `next`) is an atomic
//! word whose low bit is an ownership tag; descriptor alignment keeps that
//! bit free in real addresses. A traversal claims a slot with `fetch_or`,
//! and holds at most two adjacent slots at any instant: the next slot is
//! claimed before the previous one is published back (hand-over-hand).
//! Claiming a null slot is legal and means "end of list, under
//! modification" to anyone else probing it.
//!
//! All structural mutation (insertion, unlinking) happens through owned
//! slots, which is what makes the resurrect check in recycling sound: once
//! the recycler owns the slot pointing at a zero-referenced page, no
//! concurrent lookup can be between "found it" and "bumped the count" on
//! that same page, because that lookup would have had to own the slot
//! first.
//!
//! ## Descriptor Lifetime
//!
//! Descriptors are allocated from a bump arena, capped at
//! `cache_capacity`, and never freed individually; an unlinked descriptor
//! goes on the free list and is reinitialized on reuse. A stale free-list
//! head therefore always points at live (if possibly repurposed) memory,
//! which is the property the pop loop's correctness leans on.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use bumpalo::Bump;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::page::MappedPage;
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};

/// Low bit of a link slot: set while a traversal owns the slot.
const OWNED: usize = 1;

fn untagged(word: usize) -> *mut MappedPage {
    (word & !OWNED) as *mut MappedPage
}

/// Counters describing a cache's descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Descriptors carved from the arena so far. Monotonic.
    pub allocated: usize,
    /// Descriptors currently linked into a bucket (referenced pages).
    pub used: usize,
    /// Hard cap on `allocated`.
    pub capacity: usize,
}

/// Lock-free offset-to-descriptor map with a bounded descriptor pool.
pub(crate) struct PageCache {
    buckets: Box<[CachePadded<AtomicUsize>]>,
    free_list: CachePadded<AtomicUsize>,
    arena: Mutex<Bump>,
    allocated: CachePadded<AtomicUsize>,
    used: CachePadded<AtomicUsize>,
    capacity: usize,
    bucket_spin_count: usize,
    page_size: u64,
}

impl PageCache {
    pub(crate) fn new(page_size: u64, config: &StorageConfig) -> Self {
        let buckets = (0..config.bucket_count)
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();
        Self {
            buckets,
            free_list: CachePadded::new(AtomicUsize::new(0)),
            arena: Mutex::new(Bump::new()),
            allocated: CachePadded::new(AtomicUsize::new(0)),
            used: CachePadded::new(AtomicUsize::new(0)),
            capacity: config.cache_capacity,
            bucket_spin_count: config.bucket_spin_count,
            page_size,
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            allocated: self.allocated.load(Ordering::Acquire),
            used: self.used.load(Ordering::Acquire),
            capacity: self.capacity,
        }
    }

    fn bucket_index(&self, offset: u64) -> usize {
        ((offset / self.page_size) as usize) % self.buckets.len()
    }

    /// Claims a link slot, spinning while another traversal owns it.
    /// Returns the slot's untagged prior value.
    fn acquire_slot(&self, slot: &AtomicUsize) -> usize {
        let mut spin: usize = 0;
        loop {
            let prior = slot.fetch_or(OWNED, Ordering::AcqRel);
            if prior & OWNED == 0 {
                return prior;
            }
            spin += 1;
            if spin % self.bucket_spin_count == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Returns the descriptor for `offset`, with one strong reference
    /// counted on behalf of the caller. Inserts a recycled or fresh
    /// descriptor on a miss.
    pub(crate) fn get(&self, offset: u64) -> Result<NonNull<MappedPage>> {
        debug_assert_eq!(offset % self.page_size, 0);

        let mut p_current: &AtomicUsize = &self.buckets[self.bucket_index(offset)];
        let mut p_previous: Option<&AtomicUsize> = None;
        let mut previous: usize = 0;

        loop {
            let current = self.acquire_slot(p_current);

            // Holding the new slot, the previous one can serve others.
            if let Some(prev_slot) = p_previous.take() {
                prev_slot.store(previous, Ordering::Release);
            }

            let page_ptr = untagged(current);

            // SAFETY (for every dereference below): a non-null pointer read
            // from an owned slot refers to a descriptor in this cache's
            // arena. The arena never frees, and the descriptor cannot be
            // unlinked or recycled while we own the slot pointing at it.
            if page_ptr.is_null() || unsafe { (*page_ptr).offset() } > offset {
                // Miss: `current` becomes the successor of a new entry.
                let page = match self.take_unused_page() {
                    Ok(page) => page,
                    Err(err) => {
                        p_current.store(current, Ordering::Release);
                        return Err(err);
                    }
                };
                // The descriptor is invisible until the store below; the
                // reset needs no synchronization beyond it.
                unsafe { page.as_ref() }.reset(offset, current);
                self.used.fetch_add(1, Ordering::AcqRel);
                p_current.store(page.as_ptr() as usize, Ordering::Release);
                return Ok(page);
            }

            let page = unsafe { &*page_ptr };
            if page.offset() == offset {
                // Hit. The reference must be counted while the slot is
                // still owned: after the release a recycler could own this
                // slot, see zero, and unlink the page.
                page.add_ref();
                p_current.store(current, Ordering::Release);
                // SAFETY: non-null by the checks above.
                return Ok(unsafe { NonNull::new_unchecked(page_ptr) });
            }

            // page.offset() < offset: probe forward.
            p_previous = Some(p_current);
            previous = current;
            // SAFETY: extending the borrow beyond `page` is sound; the
            // arena outlives the traversal and the slot is reachable
            // regardless of what happens to the entry it lives in.
            p_current = unsafe { &(*page_ptr).next };
        }
    }

    /// Recycles a descriptor whose last strong reference was dropped:
    /// unlinks it from its bucket and pushes it onto the free list.
    ///
    /// Races resolve to exactly one outcome. A concurrent lookup that finds
    /// the page before we own its slot resurrects it (bumps the count from
    /// zero), and the re-check under ownership aborts the recycle. If that
    /// resurrected reference is dropped again, its own recycle walk and
    /// ours both run; whichever owns the slot first unlinks, and the other
    /// finds the page gone and returns.
    pub(crate) fn mark_page_as_unused(&self, page: NonNull<MappedPage>) {
        let target = page.as_ptr();
        // SAFETY: arena-backed; see the dereference note in `get`.
        let offset = unsafe { (*target).offset() };

        let mut p_current: &AtomicUsize = &self.buckets[self.bucket_index(offset)];
        let mut p_previous: Option<&AtomicUsize> = None;
        let mut previous: usize = 0;

        loop {
            let current = self.acquire_slot(p_current);
            if let Some(prev_slot) = p_previous.take() {
                prev_slot.store(previous, Ordering::Release);
            }

            let page_ptr = untagged(current);

            if page_ptr == target {
                let page = unsafe { &*page_ptr };

                // Owning the slot closes the resurrection window: a lookup
                // that would revive this page needs this slot first, so a
                // relaxed read is enough.
                if page.ref_count() != 0 {
                    p_current.store(current, Ordering::Release);
                    return;
                }

                // Unlink: claim the successor slot hand-over-hand, then
                // route the bucket around the page. The tag left on
                // page.next is dead; the push below overwrites the word.
                let successor = self.acquire_slot(&page.next);
                p_current.store(successor, Ordering::Release);
                self.used.fetch_sub(1, Ordering::AcqRel);

                self.push_unused_page(page);
                return;
            }

            if page_ptr.is_null() || unsafe { (*page_ptr).offset() } >= offset {
                // End of bucket, or another descriptor already serves this
                // offset: a competing recycle got here first.
                p_current.store(current, Ordering::Release);
                return;
            }

            p_previous = Some(p_current);
            previous = current;
            // SAFETY: as in `get`.
            p_current = unsafe { &(*page_ptr).next };
        }
    }

    /// Pops a descriptor from the free list, or carves a fresh one from
    /// the arena. Fails with `CacheExhausted` at capacity and with
    /// `OutOfMemory` when the allocator cannot back a fresh descriptor.
    fn take_unused_page(&self) -> Result<NonNull<MappedPage>> {
        loop {
            let head = self.free_list.load(Ordering::Acquire);
            if head == 0 {
                break;
            }
            let page = head as *mut MappedPage;
            // SAFETY: free-list entries are arena-backed and never freed,
            // so the read is always of live memory. If another thread pops
            // and repurposes this entry first, the CAS below fails and we
            // retry with a fresh head.
            let next = unsafe { (*page).next.load(Ordering::Acquire) };
            if self
                .free_list
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: non-null, checked above.
                return Ok(unsafe { NonNull::new_unchecked(page) });
            }
        }

        let arena = self.arena.lock();
        // Checked under the arena lock; allocations are serialized here.
        if self.allocated.load(Ordering::Acquire) >= self.capacity {
            return Err(StorageError::CacheExhausted {
                capacity: self.capacity,
            });
        }
        let page: &mut MappedPage =
            arena
                .try_alloc(MappedPage::new())
                .map_err(|_| StorageError::OutOfMemory {
                    detail: "unable to allocate a page descriptor".into(),
                })?;
        self.allocated.fetch_add(1, Ordering::AcqRel);
        // SAFETY: the arena neither moves nor frees allocations until it is
        // dropped, which happens only when the owning StorageInner drops,
        // and page handles keep that alive. Escaping the guard's borrow as
        // a raw pointer is therefore sound.
        Ok(NonNull::from(page))
    }

    /// Pushes an unlinked descriptor onto the free list.
    fn push_unused_page(&self, page: &MappedPage) {
        let word = page as *const MappedPage as usize;
        loop {
            let head = self.free_list.load(Ordering::Acquire);
            page.next.store(head, Ordering::Relaxed);
            if self
                .free_list
                .compare_exchange_weak(head, word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("PageCache")
            .field("buckets", &self.buckets.len())
            .field("allocated", &stats.allocated)
            .field("used", &stats.used)
            .field("capacity", &self.capacity)
            .finish()
    }
}
