//! # Interprocess File Ownership
//!
//! A [`StorageFile`](super::StorageFile) has exactly one owner across the
//! whole machine. Ownership is claimed through a lock file in the OS temp
//! directory whose name is derived from a stable 64-bit hash of the storage
//! file's absolute path, spelled `jb_<hex>`. The spelling is a
//! compatibility surface: external tooling and other storage frontends
//! identify a claimed file by that exact name.
//!
//! On unix the claim is a nonblocking `flock(LOCK_EX)`. `flock` conflicts
//! between two descriptors of the same file even within one process, so a
//! second `StorageFile` over the same path fails with `AlreadyInUse`
//! whether it lives in this process or another one.
//!
//! The lock file is never unlinked: removing it would race a concurrent
//! claimant into locking a dead inode, after which a third opener could
//! lock a fresh file with the same name and two owners would coexist.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_XZ};

use crate::config::LOCK_NAME_PREFIX;
use crate::error::{Result, StorageError};

const PATH_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Lock-file name for a storage path: `jb_<hex>` of the CRC-64 of the
/// absolute path bytes.
pub(crate) fn lock_name(path: &Path) -> String {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = path.to_string_lossy().into_owned().into_bytes();

    format!("{}{:x}", LOCK_NAME_PREFIX, PATH_HASH.checksum(&bytes))
}

/// Exclusive machine-wide claim on a storage file path.
///
/// Held for the lifetime of the owning [`MmapFile`](super::MmapFile);
/// dropping it releases the claim.
#[derive(Debug)]
pub(crate) struct IpcLock {
    file: File,
    lock_path: PathBuf,
}

impl IpcLock {
    /// Claims `target`, failing with `AlreadyInUse` if any other instance
    /// holds the claim.
    pub(crate) fn acquire(target: &Path) -> Result<Self> {
        let lock_path = std::env::temp_dir().join(lock_name(target));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| StorageError::Unknown {
                detail: format!(
                    "unable to create interprocess lock '{}': {source}",
                    lock_path.display()
                ),
            })?;

        try_lock_exclusive(&file, target)?;

        tracing::debug!(path = %target.display(), lock = %lock_path.display(), "claimed storage file");
        Ok(Self { file, lock_path })
    }

    pub(crate) fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for IpcLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File, target: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: flock is called on a descriptor we own for the lifetime of
    // the call; LOCK_NB makes it nonblocking, so there is no wait state to
    // interrupt. The claim outlives the call because `file` stays open in
    // the returned guard.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(StorageError::AlreadyInUse {
            path: target.to_path_buf(),
        });
    }
    Err(StorageError::Unknown {
        detail: format!("interprocess lock failed: {err}"),
    })
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File, _target: &Path) -> Result<()> {
    // No advisory locking off unix; ownership is not enforced there.
    Ok(())
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    // Best effort; closing the descriptor releases the lock regardless.
    // SAFETY: same descriptor-ownership argument as in try_lock_exclusive.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
