//! Process-wide and cross-process file locks
//!
//! - [`LockRegistry`]: the set of paths managed by writers in this process.
//!   A path in the registry is never opened by a second writer.
//! - [`AdvisoryLock`]: an exclusive `flock` on the sibling `<path>.lock`
//!   marker, honoured by cooperating processes.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

#[allow(unused_imports)]
use tracing::{debug, trace, warn};

/// Suffix of the advisory lock marker next to a managed file.
pub const LOCK_SUFFIX: &str = ".lock";

/// Path of the lock marker for `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

fn registry_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Paths currently claimed by writers of this process (thread-safe)
#[derive(Debug, Default)]
pub struct LockRegistry {
    paths: Mutex<FxHashSet<PathBuf>>,
}

impl LockRegistry {
    /// Creates an empty, isolated registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every writer of this process that was not
    /// given one explicitly.
    pub fn process() -> Arc<LockRegistry> {
        static PROCESS: OnceLock<Arc<LockRegistry>> = OnceLock::new();
        PROCESS.get_or_init(|| Arc::new(LockRegistry::new())).clone()
    }

    /// Claims `path`. Returns false if it is already claimed.
    pub fn try_lock(&self, path: &Path) -> bool {
        let key = registry_key(path);
        let inserted = self.paths.lock().insert(key);

        if inserted {
            trace!("registry lock {:?}: success", path);
        } else {
            trace!("registry lock {:?}: already locked", path);
        }
        inserted
    }

    /// Releases `path`. Returns false if it was not claimed.
    pub fn unlock(&self, path: &Path) -> bool {
        let key = registry_key(path);
        let removed = self.paths.lock().remove(&key);

        if removed {
            trace!("registry unlock {:?}: success", path);
        } else {
            trace!("registry unlock {:?}: not locked", path);
        }
        removed
    }

    /// Returns true if `path` is claimed by a writer of this process.
    pub fn is_locked(&self, path: &Path) -> bool {
        let key = registry_key(path);
        self.paths.lock().contains(&key)
    }

    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Exclusive advisory lock held on `<path>.lock`.
///
/// The lock is released when this value is dropped.
#[derive(Debug)]
pub struct AdvisoryLock {
    path: PathBuf,
    file: File,
}

impl AdvisoryLock {
    /// Takes the lock for `path` without blocking.
    pub fn try_acquire(path: &Path) -> io::Result<Self> {
        let marker = lock_path(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&marker)?;

        fs2::FileExt::try_lock_exclusive(&file)?;
        debug!("advisory lock taken on {:?}", marker);

        Ok(Self { path: marker, file })
    }

    /// Path of the lock marker.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock, reporting unlock failures.
    pub fn release(self) -> io::Result<()> {
        fs2::FileExt::unlock(&self.file)?;
        debug!("advisory lock released on {:?}", self.path);
        Ok(())
    }

    /// Returns true if some open file description holds the lock for `path`.
    ///
    /// Probes with a non-blocking lock on the marker; a missing marker means
    /// nobody can hold it.
    pub fn is_held(path: &Path) -> bool {
        Self::is_marker_held(&lock_path(path))
    }

    /// Same as [`is_held`](Self::is_held) but takes the marker path itself.
    pub fn is_marker_held(marker: &Path) -> bool {
        let file = match OpenOptions::new().read(true).write(true).open(marker) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
            Err(e) => {
                warn!("cannot check lock marker {:?}: {}", marker, e);
                return true;
            }
        };

        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                if let Err(e) = fs2::FileExt::unlock(&file) {
                    warn!("cannot release test lock on {:?}: {}", marker, e);
                }
                false
            }
            Err(e) if is_contended(&e) => true,
            Err(e) => {
                warn!("cannot check lock marker {:?}: {}", marker, e);
                true
            }
        }
    }
}
