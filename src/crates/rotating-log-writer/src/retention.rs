//! Retention sweep of the output directory
//!
//! Files are bucketed by the local calendar day of their modification time.
//! The sweep keeps the most recent `keep_days` buckets that hold data, so a
//! writer that was idle for a week does not lose its history on restart.

use crate::log::Config;
use crate::naming::{FilePolicy, rename_away};
use crate::registry::{AdvisoryLock, LOCK_SUFFIX, LockRegistry};
use crate::tasks::Tasks;
use crate::{Result, WriterError};
use chrono::{DateTime, Days, Local, NaiveDate, NaiveTime, TimeZone};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use walkdir::WalkDir;

#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};

/// Local midnight at the start of `date`.
pub(crate) fn local_midnight(date: NaiveDate) -> DateTime<Local> {
    let midnight = date.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&midnight))
}

/// Single-slot, non-blocking gate. Open again when dropped.
struct Gate<'a>(&'a AtomicBool);

impl<'a> Gate<'a> {
    fn enter(flag: &'a AtomicBool, kind: &'static str, dir: &Path) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| WriterError::Busy {
                kind,
                dir: dir.to_path_buf(),
            })?;
        Ok(Gate(flag))
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    name: String,
    modified: DateTime<Local>,
    bucket: DateTime<Local>,
}

/// Deletes expired files and orphaned lock markers next to the active file.
#[derive(Debug)]
pub(crate) struct Sweeper {
    registry: Arc<LockRegistry>,
    tasks: Arc<Tasks>,
    sweeping: AtomicBool,
    reclaiming: AtomicBool,
}

fn output_dir(active: &Path) -> Result<PathBuf> {
    match active.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(PathBuf::from(".")),
        Some(parent) => Ok(parent.to_path_buf()),
        None => Err(WriterError::InvalidPath(format!(
            "{} has no parent directory",
            active.display()
        ))),
    }
}

impl Sweeper {
    pub(crate) fn new(registry: Arc<LockRegistry>, tasks: Arc<Tasks>) -> Self {
        Self {
            registry,
            tasks,
            sweeping: AtomicBool::new(false),
            reclaiming: AtomicBool::new(false),
        }
    }

    /// Runs the retention sweep. Returns the deleted files.
    pub fn sweep(
        &self,
        config: &Config,
        policy: &dyn FilePolicy,
        active: &Path,
    ) -> Result<Vec<PathBuf>> {
        self.sweep_at(config, policy, active, Local::now())
    }

    #[instrument(skip_all, fields(active = ?active))]
    pub(crate) fn sweep_at(
        &self,
        config: &Config,
        policy: &dyn FilePolicy,
        active: &Path,
        now: DateTime<Local>,
    ) -> Result<Vec<PathBuf>> {
        let dir = output_dir(active)?;
        let _gate = Gate::enter(&self.sweeping, "retention sweep", &dir)?;

        let active_name = active
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = config.base_prefix();
        let yesterday_date = now.date_naive() - Days::new(1);
        let yesterday = local_midnight(yesterday_date);

        let mut candidates = Vec::new();

        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(base) || name == active_name {
                continue;
            }

            if name.ends_with(LOCK_SUFFIX) {
                if self.is_orphan_marker(config, entry.path(), &name, &active_name) {
                    self.remove_marker(entry.path());
                }
                continue;
            }

            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(modified)) => DateTime::<Local>::from(modified),
                Ok(Err(e)) => {
                    warn!("cannot read mtime of {:?}: {}", entry.path(), e);
                    continue;
                }
                Err(e) => {
                    warn!("cannot stat {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            let bucket = local_midnight(modified.date_naive());
            if bucket < yesterday {
                candidates.push(Candidate {
                    path: entry.into_path(),
                    name,
                    modified,
                    bucket,
                });
            }
        }

        let keep_days = config.retention.keep_days();

        // Oldest day bucket that still belongs to the `keep_days` most recent
        // days with data.
        let mut keep_time = Some(yesterday);
        for _ in 0..keep_days {
            keep_time = keep_time.and_then(|limit| {
                candidates
                    .iter()
                    .map(|c| c.bucket)
                    .filter(|bucket| *bucket < limit)
                    .max()
            });
        }
        let cutoff = local_midnight(yesterday_date - Days::new(u64::from(keep_days)));

        debug!(
            "{} candidates, keep_time={:?}, cutoff={}",
            candidates.len(),
            keep_time,
            cutoff
        );

        let mut removed = Vec::new();

        for candidate in candidates {
            let expired = candidate.modified < cutoff
                && keep_time.is_some_and(|keep| candidate.modified < keep);

            if expired && candidate.name.ends_with(&config.clean_suffix) {
                match fs::remove_file(&candidate.path) {
                    Ok(()) => {
                        info!("deleted {:?}", candidate.path);
                        removed.push(candidate.path);
                    }
                    Err(e) => error!("failed to remove {:?}: {}", candidate.path, e),
                }
                continue;
            }

            if config.renames_on_clean()
                && candidate.name.ends_with(&config.write_suffix)
                && candidate.modified < yesterday
                && !self.registry.is_locked(&candidate.path)
                && !AdvisoryLock::is_held(&candidate.path)
            {
                if let Err(e) = rename_away(config, policy, &self.tasks, &candidate.path) {
                    error!("failed to rename {:?}: {}", candidate.path, e);
                }
            }
        }

        Ok(removed)
    }

    /// Deletes lock markers left behind by writers that no longer run.
    #[instrument(skip_all, fields(active = ?active))]
    pub fn reclaim_locks(&self, config: &Config, active: &Path) -> Result<Vec<PathBuf>> {
        let dir = output_dir(active)?;
        let _gate = Gate::enter(&self.reclaiming, "lock sweep", &dir)?;

        let active_name = active
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = config.base_prefix();
        let mut removed = Vec::new();

        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(base)
                && self.is_orphan_marker(config, entry.path(), &name, &active_name)
                && self.remove_marker(entry.path())
            {
                removed.push(entry.into_path());
            }
        }

        Ok(removed)
    }

    /// A lock marker of a write-suffixed file other than the active one that
    /// nobody holds.
    fn is_orphan_marker(&self, config: &Config, marker: &Path, name: &str, active: &str) -> bool {
        let Some(data_name) = name.strip_suffix(LOCK_SUFFIX) else {
            return false;
        };
        if data_name == active || !data_name.ends_with(&config.write_suffix) {
            return false;
        }

        let data_path = marker.with_file_name(data_name);
        !self.registry.is_locked(&data_path) && !AdvisoryLock::is_marker_held(marker)
    }

    fn remove_marker(&self, marker: &Path) -> bool {
        match fs::remove_file(marker) {
            Ok(()) => {
                debug!("removed orphan lock marker {:?}", marker);
                true
            }
            Err(e) => {
                warn!("failed to remove lock marker {:?}: {}", marker, e);
                false
            }
        }
    }
}
