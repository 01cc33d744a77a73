//! File naming policy
//!
//! The active file is `<prefix><write_suffix>`. A retired file is renamed to
//! `<active>.<YYYY-MM-DD>.<NNN><rename_suffix>`, where the date is the local
//! modification date and `NNN` is the first free sequence number, starting at
//! `001`. A sequence number is taken when either the rotated name or its
//! archive exists.

use crate::compress::{self, archive_path};
use crate::log::Config;
use crate::tasks::Tasks;
use crate::{Result, WriterError};
use chrono::{DateTime, Local, NaiveDate};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

#[allow(unused_imports)]
use tracing::{debug, info};

/// Highest sequence number tried for one day.
pub const MAX_RENAME_SEQUENCE: i16 = i16::MAX;

/// Naming and line counting used by a [`Log`](crate::Log).
///
/// Every method has a default implementation; implementors override the
/// pieces they need to change.
pub trait FilePolicy: Send + Sync {
    /// Path of the file that receives writes.
    fn active_file_name(&self, config: &Config) -> Result<PathBuf> {
        config.active_path()
    }

    /// Free rotated name for `path`, based on its modification date.
    fn rename_target(&self, config: &Config, path: &Path) -> Result<PathBuf> {
        let modified = match fs::metadata(path) {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WriterError::MissingFile(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let date = DateTime::<Local>::from(modified).date_naive();
        rename_target_for(path, date, &config.rename_suffix)
    }

    /// Number of records already present in `path`.
    fn line_count(&self, path: &Path) -> io::Result<u64> {
        count_lines(path)
    }
}

/// The stock naming policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

impl FilePolicy for DefaultPolicy {}

/// Returns true unless the filesystem positively reports the path missing.
pub(crate) fn path_exists(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(_) => true,
        Err(e) => e.kind() != io::ErrorKind::NotFound,
    }
}

/// Finds the first free `<path>.<date>.<NNN><rename_suffix>` name.
pub fn rename_target_for(path: &Path, date: NaiveDate, rename_suffix: &str) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(WriterError::InvalidPath(String::from(
            "cannot rename an empty path",
        )));
    }
    if rename_suffix.is_empty() {
        return Err(WriterError::InvalidPath(String::from(
            "rename suffix is empty",
        )));
    }

    let date = date.format("%Y-%m-%d").to_string();

    for sequence in 1..=MAX_RENAME_SEQUENCE {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{}.{:03}{}", date, sequence, rename_suffix));
        let candidate = PathBuf::from(name);

        if !path_exists(&candidate) && !path_exists(&archive_path(&candidate)) {
            return Ok(candidate);
        }
    }

    Err(WriterError::NameExhausted(path.to_path_buf()))
}

/// Renames `path` to its rotated name and schedules compression when enabled.
pub(crate) fn rename_away(
    config: &Config,
    policy: &dyn FilePolicy,
    tasks: &Tasks,
    path: &Path,
) -> Result<PathBuf> {
    let target = policy.rename_target(config, path)?;
    fs::rename(path, &target)?;
    info!("renamed {:?} to {:?}", path, target);

    if config.compress {
        compress::schedule(tasks, target.clone());
    }

    Ok(target)
}

/// Counts `\n` bytes in a file.
pub fn count_lines(path: &Path) -> io::Result<u64> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; 32 * 1024];
    let mut count = 0u64;

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        count += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }

    Ok(count)
}
