//! # Resize Mutex
//!
//! A shared/exclusive lock tuned for the storage core's access pattern:
//! shared holds are taken on every page mapping (frequent, short), the
//! exclusive hold only while the file grows (rare).
//!
//! ## Why Not a Stock RwLock
//!
//! Every shared acquisition of a conventional reader-writer lock hits one
//! shared counter, so concurrent mappers on different cores invalidate each
//! other's cache line on every lock. Here the shared side is split across
//! `shared_lock_count` counters, each padded to its own cache line; a
//! mapper touches only the counter its locker id hashes to. Two mappers on
//! different counters never contend on memory.
//!
//! The price is paid by the writer: taking the exclusive lock means
//! setting the exclusive flag and then sweeping every shared counter until
//! each has been observed at zero at least once. A counter seen at zero
//! cannot rise again while the flag is set (readers that increment
//! afterwards see the flag and step back), so one zero observation per
//! counter is enough; the observations need not be simultaneous.
//!
//! ## Fairness
//!
//! Readers win. A sustained stream of shared holders can starve a writer
//! indefinitely, which is acceptable because growth is rare and the grower
//! retries forever. The reverse hazard, a reader parking its increment
//! while the writer's flag is up and never letting the sweep finish, is
//! avoided by having waiting readers step their counter back down before
//! retrying.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use smallvec::{smallvec, SmallVec};

use crate::config::{DEFAULT_SHARED_LOCK_COUNT, DEFAULT_SPIN_COUNT_PER_LOCK};

/// Reader-biased shared/exclusive lock with cache-line-disjoint shared
/// counters.
#[derive(Debug)]
pub struct ResizeMutex {
    exclusive: CachePadded<AtomicBool>,
    shared: Box<[CachePadded<AtomicUsize>]>,
    spin_count: usize,
}

impl Default for ResizeMutex {
    fn default() -> Self {
        Self::new(DEFAULT_SHARED_LOCK_COUNT, DEFAULT_SPIN_COUNT_PER_LOCK)
    }
}

impl ResizeMutex {
    /// Creates an unlocked mutex with `shared_lock_count` shared counters.
    ///
    /// `shared_lock_count` must be at least 1; [`StorageConfig`]
    /// validation enforces this before construction.
    ///
    /// [`StorageConfig`]: crate::config::StorageConfig
    pub fn new(shared_lock_count: usize, spin_count: usize) -> Self {
        debug_assert!(shared_lock_count >= 1);
        debug_assert!(spin_count >= 1);
        let shared = (0..shared_lock_count)
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();
        Self {
            exclusive: CachePadded::new(AtomicBool::new(false)),
            shared,
            spin_count,
        }
    }

    /// Number of shared counters.
    pub fn shared_count(&self) -> usize {
        self.shared.len()
    }

    /// Attempts a shared hold for `locker_id`, returning immediately.
    ///
    /// The id need not be unique; it only selects which counter the holder
    /// uses, and the same id must be passed to [`unlock_shared`].
    ///
    /// [`unlock_shared`]: ResizeMutex::unlock_shared
    pub fn try_lock_shared(&self, locker_id: usize) -> bool {
        let slot = &self.shared[locker_id % self.shared.len()];

        // Optimistic: announce the hold, then check for a writer. A writer
        // that completed its sweep before this increment has already seen
        // the counter at zero and owns the lock; the flag read below
        // observes it and steps back. A writer still sweeping cannot take
        // this counter's zero observation after the increment lands.
        slot.fetch_add(1, Ordering::AcqRel);

        if self.exclusive.load(Ordering::Acquire) {
            slot.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Takes a shared hold for `locker_id`, spinning while a writer is
    /// active and yielding each time the spin budget is consumed.
    pub fn lock_shared(&self, locker_id: usize) {
        let mut spin: usize = 0;
        while !self.try_lock_shared(locker_id) {
            spin += 1;
            if spin % self.spin_count == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Releases a shared hold taken with the same `locker_id`.
    pub fn unlock_shared(&self, locker_id: usize) {
        let prev = self.shared[locker_id % self.shared.len()].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unlock_shared without a matching hold");
    }

    /// Attempts the exclusive hold within the default spin budget
    /// (`spin_count * shared_count` attempts).
    pub fn try_lock(&self) -> bool {
        self.try_lock_bounded(self.spin_count * self.shared.len())
    }

    fn try_lock_bounded(&self, budget: usize) -> bool {
        let mut spin: usize = 0;

        // Phase one: claim the exclusive flag.
        while self
            .exclusive
            .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            spin += 1;
            if spin % budget == 0 {
                return false;
            }
            std::hint::spin_loop();
        }

        // Phase two: wait for every shared counter to drain. Once a counter
        // has been seen at zero it stays usable-as-seen: any reader that
        // increments it from here on observes the flag and backs out.
        let mut drained: SmallVec<[bool; 32]> = smallvec![false; self.shared.len()];
        loop {
            let mut all_drained = true;
            for (slot, seen) in self.shared.iter().zip(drained.iter_mut()) {
                if *seen {
                    continue;
                }
                if slot.load(Ordering::Acquire) == 0 {
                    *seen = true;
                } else {
                    all_drained = false;
                    spin += 1;
                    if spin % budget == 0 {
                        self.exclusive.store(false, Ordering::Release);
                        return false;
                    }
                    std::hint::spin_loop();
                }
            }
            if all_drained {
                return true;
            }
        }
    }

    /// Takes the exclusive hold, yielding between bounded attempts.
    pub fn lock(&self) {
        while !self.try_lock() {
            std::thread::yield_now();
        }
    }

    /// Releases the exclusive hold.
    pub fn unlock(&self) {
        debug_assert!(self.exclusive.load(Ordering::Relaxed));
        self.exclusive.store(false, Ordering::Release);
    }

    /// RAII shared hold.
    pub fn shared(&self, locker_id: usize) -> SharedGuard<'_> {
        self.lock_shared(locker_id);
        SharedGuard {
            mutex: self,
            locker_id,
        }
    }

    /// RAII exclusive hold.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        self.lock();
        ExclusiveGuard { mutex: self }
    }
}

/// Shared hold released on drop.
#[derive(Debug)]
pub struct SharedGuard<'a> {
    mutex: &'a ResizeMutex,
    locker_id: usize,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock_shared(self.locker_id);
    }
}

/// Exclusive hold released on drop.
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    mutex: &'a ResizeMutex,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
