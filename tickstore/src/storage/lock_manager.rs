//! Partition Lock Manager
//!
//! Process-wide shared/exclusive locks keyed by canonical directory path.
//! Two layers, like the per-table write locks elsewhere in the engine:
//!
//! - Layer 1: an in-process registry (a sharded `DashMap`, so unrelated paths
//!   never contend on one mutex) with a reference count per path
//! - Layer 2: an fs2 `flock` on a `<dir>.lock` marker next to the directory,
//!   for cross-process safety
//!
//! Acquisition never blocks. A lock that cannot be taken is reported as
//! `Ok(None)`; errors are reserved for I/O failures.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs2::FileExt;
use once_cell::sync::Lazy;

use crate::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockEntry {
    mode: LockMode,
    ref_count: usize,
    /// Distinguishes successive locks on the same path
    id: u64,
    marker: PathBuf,
    file: File,
}

static LOCKS: Lazy<DashMap<PathBuf, LockEntry>> = Lazy::new(DashMap::new);
static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// A held lock. Hand it back to [`LockManager::release`] exactly once.
#[derive(Debug)]
pub struct PartitionLock {
    path: PathBuf,
    mode: LockMode,
    id: u64,
}

impl PartitionLock {
    /// Canonical path of the locked directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

pub struct LockManager;

impl LockManager {
    /// Take a shared lock, re-entrantly. Returns `None` while an exclusive
    /// lock is held on `location` (by this process or another).
    pub fn lock_shared(location: &Path) -> Result<Option<PartitionLock>> {
        let key = lock_key(location)?;
        match LOCKS.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.mode == LockMode::Exclusive {
                    log::debug!("Shared lock refused, exclusive holder: {}", key.display());
                    return Ok(None);
                }
                entry.ref_count += 1;
                log::debug!("Shared lock re-entered ({}): {}", entry.ref_count, key.display());
                Ok(Some(PartitionLock {
                    path: key,
                    mode: LockMode::Shared,
                    id: entry.id,
                }))
            }
            Entry::Vacant(vacant) => {
                let marker = marker_path(&key);
                let file = open_marker(&marker)?;
                if !os_try_lock(&file, LockMode::Shared)? {
                    log::debug!("Shared lock refused by another process: {}", key.display());
                    return Ok(None);
                }
                let id = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
                vacant.insert(LockEntry {
                    mode: LockMode::Shared,
                    ref_count: 1,
                    id,
                    marker,
                    file,
                });
                log::debug!("Shared lock successful: {}", key.display());
                Ok(Some(PartitionLock {
                    path: key,
                    mode: LockMode::Shared,
                    id,
                }))
            }
        }
    }

    /// Take an exclusive lock. Returns `None` if any lock is held on `location`.
    pub fn lock_exclusive(location: &Path) -> Result<Option<PartitionLock>> {
        let key = lock_key(location)?;
        match LOCKS.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                log::debug!(
                    "Exclusive lock refused, {:?} holder: {}",
                    occupied.get().mode,
                    key.display()
                );
                Ok(None)
            }
            Entry::Vacant(vacant) => {
                let marker = marker_path(&key);
                let file = open_marker(&marker)?;
                if !os_try_lock(&file, LockMode::Exclusive)? {
                    log::debug!("Exclusive lock refused by another process: {}", key.display());
                    return Ok(None);
                }
                let id = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
                vacant.insert(LockEntry {
                    mode: LockMode::Exclusive,
                    ref_count: 1,
                    id,
                    marker,
                    file,
                });
                log::debug!("Exclusive lock successful: {}", key.display());
                Ok(Some(PartitionLock {
                    path: key,
                    mode: LockMode::Exclusive,
                    id,
                }))
            }
        }
    }

    /// Like [`LockManager::lock_exclusive`] but unavailability is an error
    pub fn require_exclusive(location: &Path) -> Result<PartitionLock> {
        Self::lock_exclusive(location)?
            .ok_or_else(|| StoreError::LockUnavailable(location.to_path_buf()))
    }

    /// Like [`LockManager::lock_shared`] but unavailability is an error
    pub fn require_shared(location: &Path) -> Result<PartitionLock> {
        Self::lock_shared(location)?
            .ok_or_else(|| StoreError::LockUnavailable(location.to_path_buf()))
    }

    /// Drop one reference. The last release unlocks the marker file and, for
    /// exclusive locks, deletes it.
    pub fn release(lock: PartitionLock) {
        let Entry::Occupied(mut occupied) = LOCKS.entry(lock.path.clone()) else {
            log::warn!("Release of unknown lock: {}", lock.path.display());
            return;
        };
        if occupied.get().id != lock.id {
            log::warn!("Release of stale lock: {}", lock.path.display());
            return;
        }

        let entry = occupied.get_mut();
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }

        let entry = occupied.remove();
        if let Err(e) = FileExt::unlock(&entry.file) {
            log::warn!("Failed to unlock {}: {}", entry.marker.display(), e);
        }
        match entry.mode {
            LockMode::Shared => log::debug!("Shared lock released: {}", lock.path.display()),
            LockMode::Exclusive => {
                if let Err(e) = std::fs::remove_file(&entry.marker) {
                    if e.kind() != io::ErrorKind::NotFound {
                        log::warn!("Failed to remove {}: {}", entry.marker.display(), e);
                    }
                }
                log::debug!("Exclusive lock released: {}", lock.path.display());
            }
        }
    }

    /// Mode currently held on `location` by this process, if any
    pub fn held_mode(location: &Path) -> Option<LockMode> {
        let key = lock_key(location).ok()?;
        LOCKS.get(&key).map(|entry| entry.mode)
    }
}

/// Canonical registry key. The directory itself may not exist yet (a
/// partition about to be created), so fall back to its canonical parent.
fn lock_key(location: &Path) -> Result<PathBuf> {
    if let Ok(path) = location.canonicalize() {
        return Ok(path);
    }
    let name = location
        .file_name()
        .ok_or_else(|| StoreError::InvalidArgument(format!("cannot lock {}", location.display())))?;
    let parent = match location.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.canonicalize()?,
        _ => std::env::current_dir()?,
    };
    Ok(parent.join(name))
}

fn marker_path(key: &Path) -> PathBuf {
    let mut marker = key.to_path_buf();
    let name = key
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    marker.set_file_name(format!("{}.lock", name));
    marker
}

fn open_marker(marker: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(marker)?;
    Ok(file)
}

/// Non-blocking OS lock; `Ok(false)` when another process holds it
fn os_try_lock(file: &File, mode: LockMode) -> Result<bool> {
    let attempt = match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    };
    match attempt {
        Ok(()) => Ok(true),
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(StoreError::Io(e)),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
