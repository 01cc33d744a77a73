//! Append-only file writer with rotation, locking, compression and retention
//!
//! A [`Log`] appends records to `<prefix><write_suffix>` and rotates the file
//! when a line, size or calendar-day limit is reached. Retired files are
//! renamed to `<active>.<YYYY-MM-DD>.<NNN><rename_suffix>`, optionally
//! gzip-compressed in the background, and expired by a retention sweep that
//! keeps the most recent days with data.
//!
//! ## Usage
//!
//! ```no_run
//! use rotating_log_writer::{Config, Log, RetentionPolicy, RotationPolicy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rotation = RotationPolicy::default()
//!     .with_max_lines(100_000)
//!     .with_max_size(64 * 1024 * 1024); // 64 MiB per file
//!
//! let retention = RetentionPolicy::default().with_max_days(14);
//!
//! let config = Config::new("/var/log/myapp/access")
//!     .with_file_lock(true)
//!     .with_compress(true)
//!     .with_rotation_policy(rotation)
//!     .with_retention_policy(retention);
//!
//! let log = Log::new("access");
//! let active = log.init(config)?;
//! println!("writing to {}", active.display());
//!
//! let position = log.write_str("GET /index.html 200\n")?;
//! println!("line {} of {}", position.line, position.file.display());
//!
//! log.flush()?;
//! log.close()?;
//! log.wait_background();
//! # Ok(())
//! # }
//! ```

mod compress;
mod error;
mod handle;
mod log;
mod naming;
mod registry;
mod retention;
mod tasks;

pub use compress::{ARCHIVE_SUFFIX, archive_path, compress_file};
pub use error::{Position, Result, WriterError};
pub use log::{Config, Log, MIN_RETENTION_DAYS, RetentionPolicy, RotationPolicy};
pub use naming::{DefaultPolicy, FilePolicy, MAX_RENAME_SEQUENCE, count_lines, rename_target_for};
pub use registry::{AdvisoryLock, LOCK_SUFFIX, LockRegistry, lock_path};
