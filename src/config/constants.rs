//! # Configuration Constants
//!
//! Centralized defaults for the storage core's tunables. Interdependent
//! values are co-located so a change to one prompts a look at the others.
//!
//! ```text
//! DEFAULT_SHARED_LOCK_COUNT (31)
//!       │
//!       └─> Writers sweep this many counters in ResizeMutex::try_lock, so
//!           DEFAULT_SPIN_COUNT_PER_LOCK is multiplied by it to size the
//!           exclusive-acquisition spin budget.
//!
//! DEFAULT_BUCKET_COUNT (41)
//!       │
//!       └─> Pages hash to a bucket by page index modulo this. Prime, so
//!           strided access patterns spread evenly.
//!
//! DEFAULT_CACHE_CAPACITY (1024)
//!       │
//!       └─> Upper bound on allocated page descriptors per file. With the
//!           typical 4 KiB granularity this caps concurrently referenced
//!           file coverage at 4 MiB; requests beyond it fail with
//!           CacheExhausted until handles drop.
//! ```

/// Number of cache-line-disjoint shared counters in the resize mutex.
pub const DEFAULT_SHARED_LOCK_COUNT: usize = 31;

/// Number of page-cache buckets. Prime.
pub const DEFAULT_BUCKET_COUNT: usize = 41;

/// Spin attempts per shared counter before a resize-mutex waiter yields.
pub const DEFAULT_SPIN_COUNT_PER_LOCK: usize = 4096;

/// Spin attempts before a thread waiting on a page's map-in-progress state
/// yields. Mapping a page is a syscall, so this budget is the largest.
pub const DEFAULT_PAGE_LOCK_SPIN_COUNT: usize = 1 << 16;

/// Spin attempts before a bucket traversal waiting on an owned slot yields.
pub const DEFAULT_BUCKET_SPIN_COUNT: usize = 1024;

/// Maximum page descriptors allocated per storage file.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Prefix of the interprocess lock name derived from the file path hash.
/// The spelling is a compatibility surface; external tooling looks for
/// exactly `jb_<hex>`.
pub const LOCK_NAME_PREFIX: &str = "jb_";
