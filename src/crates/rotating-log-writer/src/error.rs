use std::path::PathBuf;
use thiserror::Error;

/// Location of a record: the file it went to and its line number in that file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    /// Active file the record was written to (empty while writing to stdout)
    pub file: PathBuf,
    /// Line number of the record within `file`, starting at 1
    pub line: u64,
}

/// Errors that can occur during rotating writer operations.
#[derive(Error, Debug)]
pub enum WriterError {
    /// Configuration rejected by `init`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The active file (or a file about to be renamed) does not exist
    #[error("file is missing: {}", .0.display())]
    MissingFile(PathBuf),

    /// The handle has been closed and accepts no more writes
    #[error("file is closed")]
    Closed,

    /// Operation requires a successful `init` first
    #[error("writer is not initialized")]
    NotInitialized,

    /// Another writer in this process already manages the path
    #[error("file is already locked by this process: {}", .0.display())]
    AlreadyLocked(PathBuf),

    /// Every rotated-name sequence number for the day is taken
    #[error("cannot find a free rename sequence number for {}", .0.display())]
    NameExhausted(PathBuf),

    /// Path is empty, has no parent directory, or is otherwise unusable
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A sweep of the same kind is already running for this writer
    #[error("{kind} already running in {}", .dir.display())]
    Busy { kind: &'static str, dir: PathBuf },

    /// Write failed; carries the best-effort position the record was assigned
    #[error("write to {} (line {}) failed: {source}", .position.file.display(), .position.line)]
    Write {
        position: Position,
        #[source]
        source: Box<WriterError>,
    },

    /// Error from walkdir when scanning the output directory
    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// I/O error when interacting with the filesystem
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WriterError {
    /// Returns true if this error (or the error it wraps) reports a closed handle.
    pub fn is_closed(&self) -> bool {
        match self {
            WriterError::Closed => true,
            WriterError::Write { source, .. } => source.is_closed(),
            _ => false,
        }
    }

    /// Returns true if a sweep was rejected because another one is running.
    pub fn is_busy(&self) -> bool {
        matches!(self, WriterError::Busy { .. })
    }
}

pub type Result<T> = std::result::Result<T, WriterError>;
