//! The file a writer is currently appending to
//!
//! A [`MutexHandle`] owns at most one open file (or the stdout sentinel) and
//! moves between files with [`HandleGuard::switch`]:
//!
//! 1. retire the open file (end-of-file marker, sync, close)
//! 2. rename the retired file to its dated name (errors are logged)
//! 3. claim the next active path in the [`LockRegistry`] (fatal)
//! 4. roll a stale or, under the zero-size policy, non-empty file away
//! 5. open the next file for appending (fatal)
//! 6. take the advisory lock when requested (errors are logged)
//!
//! When renaming is enabled the registry claim and the advisory lock on the
//! active path are kept across the transition.

use crate::log::Config;
use crate::naming::{FilePolicy, rename_away};
use crate::registry::{AdvisoryLock, LockRegistry};
use crate::tasks::Tasks;
use crate::{Result, WriterError};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

/// Times a non-empty next file is rolled away before appending to it anyway.
const MAX_ROLL_ATTEMPTS: usize = 3;

#[derive(Debug)]
enum Output {
    /// Nothing initialized yet, writes go to stdout
    Stdout,
    Open { path: PathBuf, file: File },
    /// The previous file is closed and no successor could be opened
    Retired { path: PathBuf, renamed: bool },
    Closed,
}

#[derive(Debug)]
struct Marker {
    path: PathBuf,
    advisory: Option<AdvisoryLock>,
}

#[derive(Debug)]
struct HandleState {
    output: Output,
    marker: Option<Marker>,
}

/// Result of a successful switch.
#[derive(Debug)]
pub(crate) struct Opened {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub(crate) struct MutexHandle {
    registry: Arc<LockRegistry>,
    tasks: Arc<Tasks>,
    state: Mutex<HandleState>,
}

impl MutexHandle {
    pub(crate) fn new(registry: Arc<LockRegistry>, tasks: Arc<Tasks>) -> Self {
        Self {
            registry,
            tasks,
            state: Mutex::new(HandleState {
                output: Output::Stdout,
                marker: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> HandleGuard<'_> {
        HandleGuard {
            registry: &self.registry,
            tasks: &self.tasks,
            state: self.state.lock(),
        }
    }
}

impl Drop for MutexHandle {
    fn drop(&mut self) {
        if let Some(marker) = self.state.get_mut().marker.take() {
            release_marker(&self.registry, marker);
        }
    }
}

fn release_marker(registry: &LockRegistry, marker: Marker) {
    if let Some(advisory) = marker.advisory {
        if let Err(e) = advisory.release() {
            warn!("failed to release advisory lock for {:?}: {}", marker.path, e);
        }
    }
    registry.unlock(&marker.path);
}

/// Writes the end-of-file marker and syncs the file.
fn finish_file(file: &mut File, file_eof: &[u8]) -> io::Result<()> {
    if !file_eof.is_empty() {
        file.write_all(file_eof)?;
    }
    file.sync_data()
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let size = file.metadata()?.len();
    Ok((file, size))
}

/// Exclusive access to the handle; dropping it unlocks.
pub(crate) struct HandleGuard<'a> {
    registry: &'a LockRegistry,
    tasks: &'a Tasks,
    state: MutexGuard<'a, HandleState>,
}

impl HandleGuard<'_> {
    pub(crate) fn is_stdout(&self) -> bool {
        matches!(self.state.output, Output::Stdout)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state.output, Output::Closed)
    }

    /// The previous switch closed the old file without opening a new one.
    pub(crate) fn needs_reopen(&self) -> bool {
        matches!(self.state.output, Output::Retired { .. })
    }

    pub(crate) fn write_all(&mut self, buf: &[u8], sync: bool) -> Result<()> {
        match &mut self.state.output {
            Output::Stdout => {
                io::stdout().lock().write_all(buf)?;
            }
            Output::Open { file, .. } => {
                file.write_all(buf)?;
                if sync {
                    file.sync_data()?;
                }
            }
            Output::Retired { path, .. } => return Err(WriterError::MissingFile(path.clone())),
            Output::Closed => return Err(WriterError::Closed),
        }
        Ok(())
    }

    /// Syncs the open file to disk. Nothing to do for stdout.
    pub(crate) fn flush(&mut self) -> Result<()> {
        match &mut self.state.output {
            Output::Open { file, .. } => file.sync_data()?,
            Output::Stdout | Output::Retired { .. } => {}
            Output::Closed => return Err(WriterError::Closed),
        }
        Ok(())
    }

    /// Moves the handle to the next active file.
    pub(crate) fn switch(&mut self, config: &Config, policy: &dyn FilePolicy) -> Result<Opened> {
        if self.is_closed() {
            return Err(WriterError::Closed);
        }

        self.retire(config);
        if config.rotation.rename {
            self.rename_retired(config, policy);
        }

        match self.open_next(config, policy) {
            Ok(opened) => Ok(opened),
            Err(e) => {
                self.release_marker();
                Err(e)
            }
        }
    }

    fn retire(&mut self, config: &Config) {
        let output = std::mem::replace(&mut self.state.output, Output::Closed);

        self.state.output = match output {
            Output::Open { path, mut file } => {
                if let Err(e) = finish_file(&mut file, &config.file_eof) {
                    error!("failed to finish {:?}: {}", path, e);
                }
                drop(file);
                debug!("retired {:?}", path);
                Output::Retired {
                    path,
                    renamed: false,
                }
            }
            other => other,
        };

        if !config.rotation.rename {
            self.release_marker();
        }
    }

    fn rename_retired(&mut self, config: &Config, policy: &dyn FilePolicy) {
        let path = match &self.state.output {
            Output::Retired {
                path,
                renamed: false,
            } => path.clone(),
            _ => return,
        };

        match rename_away(config, policy, self.tasks, &path) {
            Ok(_) => {
                if let Output::Retired { renamed, .. } = &mut self.state.output {
                    *renamed = true;
                }
            }
            Err(e) => {
                error!("failed to rename {:?}, opening a new file anyway: {}", path, e);
            }
        }
    }

    fn open_next(&mut self, config: &Config, policy: &dyn FilePolicy) -> Result<Opened> {
        let next = policy.active_file_name(config)?;

        self.claim(&next)?;
        self.roll_existing(config, policy, &next);

        let (file, size) = open_append(&next)?;
        self.lock_advisory(config, &next);

        debug!("opened {:?} at {} bytes", next, size);
        self.state.output = Output::Open {
            path: next.clone(),
            file,
        };

        Ok(Opened { path: next, size })
    }

    fn claim(&mut self, next: &Path) -> Result<()> {
        if self.state.marker.as_ref().is_some_and(|m| m.path == next) {
            return Ok(());
        }

        self.release_marker();
        if !self.registry.try_lock(next) {
            return Err(WriterError::AlreadyLocked(next.to_path_buf()));
        }

        self.state.marker = Some(Marker {
            path: next.to_path_buf(),
            advisory: None,
        });
        Ok(())
    }

    /// Renames a file left at `next` by an earlier day, or any non-empty
    /// file when new files must start empty.
    fn roll_existing(&mut self, config: &Config, policy: &dyn FilePolicy, next: &Path) {
        let today = Local::now().date_naive();

        for _ in 0..MAX_ROLL_ATTEMPTS {
            let metadata = match fs::metadata(next) {
                Ok(metadata) if metadata.len() > 0 => metadata,
                _ => return,
            };

            let stale = config.rotation.rename
                && metadata
                    .modified()
                    .is_ok_and(|m| DateTime::<Local>::from(m).date_naive() != today);
            if !stale && !config.rotation.zero_size {
                return;
            }

            if self.held_elsewhere(next) {
                warn!("{:?} is locked by another process, appending to it", next);
                return;
            }

            if let Err(e) = rename_away(config, policy, self.tasks, next) {
                warn!("failed to roll {:?} away: {}", next, e);
                return;
            }
        }

        if fs::metadata(next).is_ok_and(|m| m.len() > 0) {
            warn!(
                "{:?} is still not empty after {} attempts, appending to it",
                next, MAX_ROLL_ATTEMPTS
            );
        }
    }

    fn held_elsewhere(&self, path: &Path) -> bool {
        let held_here = self
            .state
            .marker
            .as_ref()
            .is_some_and(|m| m.path == path && m.advisory.is_some());

        !held_here && AdvisoryLock::is_held(path)
    }

    fn lock_advisory(&mut self, config: &Config, path: &Path) {
        let Some(marker) = self.state.marker.as_mut() else {
            return;
        };

        if config.file_lock {
            if marker.advisory.is_none() {
                match AdvisoryLock::try_acquire(path) {
                    Ok(lock) => marker.advisory = Some(lock),
                    Err(e) => warn!("failed to take advisory lock on {:?}: {}", path, e),
                }
            }
        } else if let Some(lock) = marker.advisory.take() {
            if let Err(e) = lock.release() {
                warn!("failed to release advisory lock for {:?}: {}", path, e);
            }
        }
    }

    fn release_marker(&mut self) {
        if let Some(marker) = self.state.marker.take() {
            release_marker(self.registry, marker);
        }
    }

    /// Retires the open file for good. A second call returns `Closed`.
    pub(crate) fn close(&mut self, config: Option<&Config>, policy: &dyn FilePolicy) -> Result<()> {
        let output = std::mem::replace(&mut self.state.output, Output::Closed);

        let result = match output {
            Output::Closed => return Err(WriterError::Closed),
            Output::Stdout => Ok(()),
            Output::Open { path, mut file } => {
                let file_eof = config.map(|c| c.file_eof.as_slice()).unwrap_or_default();
                let finished = finish_file(&mut file, file_eof);
                drop(file);
                self.release_marker();

                let renamed = self.rename_closed(config, policy, &path);
                finished.map_err(WriterError::from).and(renamed)
            }
            Output::Retired { path, renamed } => {
                self.release_marker();
                if renamed {
                    Ok(())
                } else {
                    self.rename_closed(config, policy, &path)
                }
            }
        };

        self.release_marker();
        debug!("handle closed");
        result
    }

    fn rename_closed(
        &self,
        config: Option<&Config>,
        policy: &dyn FilePolicy,
        path: &Path,
    ) -> Result<()> {
        let Some(config) = config.filter(|c| c.rotation.rename) else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        rename_away(config, policy, self.tasks, path).map(|_| ())
    }
}
