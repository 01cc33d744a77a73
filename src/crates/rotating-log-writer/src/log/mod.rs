mod config;
pub use config::{Config, MIN_RETENTION_DAYS, RetentionPolicy, RotationPolicy};

use crate::handle::{HandleGuard, MutexHandle};
use crate::naming::{DefaultPolicy, FilePolicy, path_exists};
use crate::registry::LockRegistry;
use crate::retention::Sweeper;
use crate::tasks::Tasks;
use crate::{Position, Result, WriterError};
use chrono::{Local, NaiveDate};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, span, warn};

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Tracks what has been written to the active file
struct RotationState {
    file: PathBuf,
    lines: u64,
    size: u64,
    day: NaiveDate,
}

impl RotationState {
    fn should_rotate(&self, config: &Config, handle: &HandleGuard<'_>) -> bool {
        let rotation = &config.rotation;

        let limits = rotation.enabled
            && !handle.is_stdout()
            && ((rotation.max_lines > 0 && self.lines >= rotation.max_lines)
                || (rotation.max_size > 0 && self.size >= rotation.max_size)
                || (rotation.day_rollover && today() != self.day));

        limits || handle.needs_reopen()
    }
}

/// Append-only writer over a rotating set of files.
///
/// Until [`Log::init`] succeeds everything goes to stdout. Once initialized,
/// records are appended to `<prefix><write_suffix>`, which is retired and
/// renamed whenever a line, size or day limit is reached.
///
/// All methods take `&self`; a `Log` is meant to be shared between threads.
pub struct Log {
    name: String,
    config: RwLock<Option<Arc<Config>>>,
    policy: Arc<dyn FilePolicy>,
    state: Mutex<RotationState>,
    handle: MutexHandle,
    sweeper: Arc<Sweeper>,
    tasks: Arc<Tasks>,
}

impl Log {
    /// Creates a writer that uses the default naming policy and the
    /// process-wide lock registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_parts(name, Arc::new(DefaultPolicy), LockRegistry::process())
    }

    /// Creates a writer with a custom naming policy and lock registry.
    pub fn with_parts(
        name: impl Into<String>,
        policy: Arc<dyn FilePolicy>,
        registry: Arc<LockRegistry>,
    ) -> Self {
        let tasks = Arc::new(Tasks::new());

        Self {
            name: name.into(),
            config: RwLock::new(None),
            policy,
            state: Mutex::new(RotationState {
                file: PathBuf::new(),
                lines: 0,
                size: 0,
                day: today(),
            }),
            handle: MutexHandle::new(registry.clone(), tasks.clone()),
            sweeper: Arc::new(Sweeper::new(registry, tasks.clone())),
            tasks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The active configuration, if initialized.
    pub fn config(&self) -> Option<Arc<Config>> {
        self.config.read().clone()
    }

    /// Applies `config` and returns the active file name.
    ///
    /// Re-applying the current configuration does nothing. The first
    /// successful call leaves stdout for the active file and starts a
    /// background sweep of orphaned lock markers. When that first switch
    /// fails the writer stays on stdout, uninitialized.
    pub fn init(&self, config: Config) -> Result<PathBuf> {
        let config = config.normalized();
        config.validate()?;

        let mut state = self.state.lock();
        let mut handle = self.handle.lock();

        if handle.is_closed() {
            return Err(WriterError::Closed);
        }

        let config = Arc::new(config);
        let previous = {
            let mut current = self.config.write();
            if current.as_deref() == Some(&*config) {
                return Ok(state.file.clone());
            }
            current.replace(config.clone())
        };

        if !handle.is_stdout() {
            info!("log {}: configuration updated", self.name);
            return Ok(state.file.clone());
        }

        match self.transition(&mut state, &mut handle, &config) {
            Ok(path) => {
                drop(handle);
                drop(state);
                self.schedule_lock_sweep(config, path.clone());
                Ok(path)
            }
            Err(e) => {
                *self.config.write() = previous;
                Err(e)
            }
        }
    }

    /// Closes the active file and opens its successor.
    #[instrument(skip_all, fields(log = %self.name, file = tracing::field::Empty))]
    fn transition(
        &self,
        state: &mut RotationState,
        handle: &mut HandleGuard<'_>,
        config: &Arc<Config>,
    ) -> Result<PathBuf> {
        let opened = handle.switch(config, self.policy.as_ref())?;
        tracing::Span::current().record("file", tracing::field::debug(&opened.path));

        let lines = if opened.size == 0 || config.rotation.zero_size {
            0
        } else {
            match self.policy.line_count(&opened.path) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("cannot count lines of {:?}: {}", opened.path, e);
                    0
                }
            }
        };

        *state = RotationState {
            file: opened.path.clone(),
            lines,
            size: opened.size,
            day: today(),
        };
        info!(
            "log {} writing to {:?} ({} lines, {} bytes)",
            self.name, state.file, state.lines, state.size
        );

        if config.retention.enabled {
            self.schedule_sweep(config.clone(), opened.path.clone());
        }

        Ok(opened.path)
    }

    /// Appends `buf` and returns where it was written.
    ///
    /// Rotates first when a limit has been reached. A failed rotation is
    /// logged and the record goes to the current handle.
    pub fn write(&self, buf: &[u8]) -> Result<Position> {
        let mut state = self.state.lock();
        let config = self.config();
        let mut handle = self.handle.lock();

        if let Some(config) = &config {
            if state.should_rotate(config, &handle) {
                if let Err(e) = self.transition(&mut state, &mut handle, config) {
                    error!("log {}: rotation failed: {}", self.name, e);
                }
            }
        }

        state.lines += 1;
        state.size += buf.len() as u64;
        let position = Position {
            file: state.file.clone(),
            line: state.lines,
        };
        drop(state);

        let sync = config.as_ref().is_some_and(|c| c.file_sync);
        match handle.write_all(buf, sync) {
            Ok(()) => Ok(position),
            Err(source) => Err(WriterError::Write {
                position,
                source: Box::new(source),
            }),
        }
    }

    pub fn write_str(&self, s: &str) -> Result<Position> {
        self.write(s.as_bytes())
    }

    /// Forces a rotation and returns the new active file name.
    pub fn rotate(&self) -> Result<PathBuf> {
        let mut state = self.state.lock();
        let Some(config) = self.config() else {
            return Err(WriterError::NotInitialized);
        };
        let mut handle = self.handle.lock();

        if handle.is_closed() {
            return Err(WriterError::Closed);
        }
        if handle.is_stdout() {
            return Err(WriterError::NotInitialized);
        }

        self.transition(&mut state, &mut handle, &config)
    }

    /// Runs the retention sweep now and returns the deleted files.
    pub fn file_clean(&self) -> Result<Vec<PathBuf>> {
        let Some(config) = self.config() else {
            return Err(WriterError::NotInitialized);
        };
        let active = self.file_name();

        if active.as_os_str().is_empty() {
            return Err(WriterError::NotInitialized);
        }
        if !path_exists(&active) {
            return Err(WriterError::MissingFile(active));
        }

        self.sweeper.sweep(&config, self.policy.as_ref(), &active)
    }

    /// Deletes lock markers of files no writer holds anymore.
    pub fn reclaim_locks(&self) -> Result<Vec<PathBuf>> {
        let Some(config) = self.config() else {
            return Err(WriterError::NotInitialized);
        };
        let active = self.file_name();

        if active.as_os_str().is_empty() {
            return Err(WriterError::NotInitialized);
        }

        self.sweeper.reclaim_locks(&config, &active)
    }

    fn schedule_sweep(&self, config: Arc<Config>, active: PathBuf) {
        let sweeper = self.sweeper.clone();
        let policy = self.policy.clone();
        let name = self.name.clone();

        self.tasks.spawn("log-retention", move || {
            match sweeper.sweep(&config, policy.as_ref(), &active) {
                Ok(removed) if removed.is_empty() => {}
                Ok(removed) => info!("log {}: retention removed {} files", name, removed.len()),
                Err(e) if e.is_busy() => debug!("log {}: {}", name, e),
                Err(e) => error!("log {}: retention sweep failed: {}", name, e),
            }
        });
    }

    fn schedule_lock_sweep(&self, config: Arc<Config>, active: PathBuf) {
        let sweeper = self.sweeper.clone();
        let name = self.name.clone();

        self.tasks.spawn("log-locks", move || {
            match sweeper.reclaim_locks(&config, &active) {
                Ok(removed) if removed.is_empty() => {}
                Ok(removed) => info!("log {}: removed {} orphan locks", name, removed.len()),
                Err(e) if e.is_busy() => debug!("log {}: {}", name, e),
                Err(e) => error!("log {}: lock sweep failed: {}", name, e),
            }
        });
    }

    /// Syncs written data to disk. Does nothing while writing to stdout.
    pub fn flush(&self) -> Result<()> {
        self.handle.lock().flush()
    }

    /// Retires the active file. Writes after this fail with
    /// [`WriterError::Closed`], and so does a second `close`.
    pub fn close(&self) -> Result<()> {
        let _state = self.state.lock();
        let config = self.config();
        let mut handle = self.handle.lock();

        handle.close(config.as_deref(), self.policy.as_ref())?;
        info!("log {} closed", self.name);
        Ok(())
    }

    /// Closes the writer, logging failures instead of returning them.
    pub fn destroy(&self) {
        match self.close() {
            Ok(()) => {}
            Err(WriterError::Closed) => debug!("log {} already closed", self.name),
            Err(e) => error!("log {}: close failed: {}", self.name, e),
        }
    }

    /// Blocks until background compression and sweeps have finished.
    pub fn wait_background(&self) {
        self.tasks.wait();
    }

    /// The active file and the number of records written to it.
    pub fn position(&self) -> Position {
        let state = self.state.lock();
        Position {
            file: state.file.clone(),
            line: state.lines,
        }
    }

    /// The active file name; empty until initialized.
    pub fn file_name(&self) -> PathBuf {
        self.state.lock().file.clone()
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("name", &self.name)
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

fn into_io_error(e: WriterError) -> io::Error {
    match e {
        WriterError::Io(e) => e,
        e => io::Error::other(e),
    }
}

impl io::Write for &Log {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Log::write(*self, buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    /// Formats the whole record first so it is written and counted once.
    fn write_fmt(&mut self, args: std::fmt::Arguments<'_>) -> io::Result<()> {
        let record = std::fmt::format(args);
        Log::write(*self, record.as_bytes()).map_err(into_io_error)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Log::flush(*self).map_err(into_io_error)
    }
}
