use crate::{Result, WriterError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Retention never keeps fewer than this many days with data.
pub const MIN_RETENTION_DAYS: u32 = 3;

/// Controls when the active file should be rotated
///
/// A file rotates when *any* enabled limit is reached. A limit of `0` is
/// unbounded; when `enabled` is set at least one of `max_lines`/`max_size`
/// must be non-zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RotationPolicy {
    /// Rotate automatically on the limits below
    pub enabled: bool,
    /// Rotate when the local calendar day changes
    pub day_rollover: bool,
    /// A freshly rotated-to file must start empty
    pub zero_size: bool,
    /// Rename the retired file to its dated name on rotation
    pub rename: bool,
    /// Maximum number of records per file
    pub max_lines: u64,
    /// Maximum file size in bytes
    pub max_size: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            day_rollover: true,
            zero_size: false,
            rename: true,
            max_lines: 1_000_000,
            max_size: 256 * 1024 * 1024,
        }
    }
}

impl RotationPolicy {
    /// Enables or disables threshold based rotation.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Specifies whether crossing local midnight rotates the file.
    pub fn with_day_rollover(mut self, day_rollover: bool) -> Self {
        self.day_rollover = day_rollover;
        self
    }

    /// Specifies whether new files must start empty.
    pub fn with_zero_size(mut self, zero_size: bool) -> Self {
        self.zero_size = zero_size;
        self
    }

    /// Specifies whether retired files get renamed.
    pub fn with_rename(mut self, rename: bool) -> Self {
        self.rename = rename;
        self
    }

    /// Specifies maximum number of records per file.
    pub fn with_max_lines(mut self, max_lines: u64) -> Self {
        self.max_lines = max_lines;
        self
    }

    /// Specifies the maximum file size.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }
}

/// Controls when old files should be deleted.
///
/// The sweep always keeps the `max_days` most recent days that actually hold
/// data, so a sparse directory keeps more calendar days of history.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionPolicy {
    /// Run the retention sweep after rotations
    pub enabled: bool,
    /// Number of days with data to keep (at least 3)
    pub max_days: u32,
    /// Rename stale write-suffixed files found by the sweep
    pub rename: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_days: 7,
            rename: false,
        }
    }
}

impl RetentionPolicy {
    /// Enables or disables the retention sweep.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Specifies the number of days with data to keep.
    pub fn with_max_days(mut self, max_days: u32) -> Self {
        self.max_days = max_days;
        self
    }

    /// Specifies whether stale write-suffixed files get renamed by the sweep.
    pub fn with_rename(mut self, rename: bool) -> Self {
        self.rename = rename;
        self
    }

    /// Days kept by the sweep, never below [`MIN_RETENTION_DAYS`].
    pub fn keep_days(&self) -> u32 {
        self.max_days.max(MIN_RETENTION_DAYS)
    }
}

/// Configuration for a rotating log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path prefix of every file, e.g. `/var/log/app/access`
    pub prefix: String,
    /// Suffix of the file being written
    pub write_suffix: String,
    /// Suffix of rotated files
    pub rename_suffix: String,
    /// Only files with this suffix are deleted by retention
    pub clean_suffix: String,
    /// Bytes appended to a file right before it is retired
    pub file_eof: Vec<u8>,
    /// Sync data to disk after every write
    pub file_sync: bool,
    /// Take an advisory lock on `<file>.lock`
    pub file_lock: bool,
    /// Compress rotated files
    pub compress: bool,
    /// Policy for when to rotate the active file
    pub rotation: RotationPolicy,
    /// Policy for when to remove old files
    pub retention: RetentionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            write_suffix: String::from(".log"),
            rename_suffix: String::from(".log"),
            clean_suffix: String::from(".log"),
            file_eof: Vec::new(),
            file_sync: false,
            file_lock: false,
            compress: false,
            rotation: RotationPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

fn normalize_prefix(s: &str) -> String {
    let s = s.trim();
    String::from(s.strip_suffix('.').unwrap_or(s))
}

fn normalize_suffix(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() || s.starts_with('.') {
        String::from(s)
    } else {
        format!(".{}", s)
    }
}

impl Config {
    /// Creates a configuration with default policies for the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Specifies the write, rename and clean suffixes.
    pub fn with_suffixes(
        mut self,
        write_suffix: impl Into<String>,
        rename_suffix: impl Into<String>,
        clean_suffix: impl Into<String>,
    ) -> Self {
        self.write_suffix = write_suffix.into();
        self.rename_suffix = rename_suffix.into();
        self.clean_suffix = clean_suffix.into();
        self
    }

    /// Specifies the end-of-file marker.
    pub fn with_file_eof(mut self, file_eof: impl Into<Vec<u8>>) -> Self {
        self.file_eof = file_eof.into();
        self
    }

    /// Specifies whether every write is synced to disk.
    pub fn with_file_sync(mut self, file_sync: bool) -> Self {
        self.file_sync = file_sync;
        self
    }

    /// Specifies whether the advisory lock is taken.
    pub fn with_file_lock(mut self, file_lock: bool) -> Self {
        self.file_lock = file_lock;
        self
    }

    /// Specifies whether rotated files are compressed.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Specifies the rotation policy
    pub fn with_rotation_policy(mut self, policy: RotationPolicy) -> Self {
        self.rotation = policy;
        self
    }

    /// Specifies the retention policy
    pub fn with_retention_policy(mut self, policy: RetentionPolicy) -> Self {
        self.retention = policy;
        self
    }

    /// Returns a copy with trimmed affixes: the prefix loses one trailing dot
    /// and every suffix starts with a dot.
    pub fn normalized(&self) -> Self {
        Self {
            prefix: normalize_prefix(&self.prefix),
            write_suffix: normalize_suffix(&self.write_suffix),
            rename_suffix: normalize_suffix(&self.rename_suffix),
            clean_suffix: normalize_suffix(&self.clean_suffix),
            ..self.clone()
        }
    }

    /// Checks the policy combination. Expects a normalized configuration.
    pub fn validate(&self) -> Result<()> {
        let empty = [
            ("prefix", &self.prefix),
            ("write suffix", &self.write_suffix),
            ("rename suffix", &self.rename_suffix),
            ("clean suffix", &self.clean_suffix),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty());

        if let Some((name, _)) = empty {
            return Err(WriterError::InvalidConfig(format!("{} is empty", name)));
        }

        if self.base_prefix().is_empty() {
            return Err(WriterError::InvalidConfig(format!(
                "prefix {:?} has no file name",
                self.prefix
            )));
        }

        if self.rotation.enabled && self.rotation.max_lines == 0 && self.rotation.max_size == 0 {
            return Err(WriterError::InvalidConfig(String::from(
                "rotation needs max_lines or max_size",
            )));
        }

        if self.retention.enabled && self.retention.max_days < MIN_RETENTION_DAYS {
            return Err(WriterError::InvalidConfig(format!(
                "max_days must be at least {}",
                MIN_RETENTION_DAYS
            )));
        }

        Ok(())
    }

    /// Path of the file being written: `<prefix><write_suffix>`.
    pub fn active_path(&self) -> Result<PathBuf> {
        if self.prefix.is_empty() {
            return Err(WriterError::InvalidPath(String::from("prefix is empty")));
        }
        if self.write_suffix.is_empty() {
            return Err(WriterError::InvalidPath(String::from(
                "write suffix is empty",
            )));
        }
        Ok(PathBuf::from(format!("{}{}", self.prefix, self.write_suffix)))
    }

    /// Base name every managed file starts with.
    pub fn base_prefix(&self) -> &str {
        self.prefix
            .rsplit(['/', std::path::MAIN_SEPARATOR])
            .next()
            .unwrap_or(&self.prefix)
    }

    /// Rename-on-clean only applies when renamed files stop carrying the write suffix.
    pub fn renames_on_clean(&self) -> bool {
        self.retention.rename && self.write_suffix != self.rename_suffix
    }
}
