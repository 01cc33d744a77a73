//! Compression of retired files into gzip archives

use crate::Result;
use crate::tasks::Tasks;
use filetime::FileTime;
use flate2::{Compression, GzBuilder};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

/// Extension appended to a file when it is archived.
pub const ARCHIVE_SUFFIX: &str = ".gz";

/// Path of the archive for `path`.
pub fn archive_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(ARCHIVE_SUFFIX);
    PathBuf::from(name)
}

/// Compresses `path` into `<path>.gz` and removes the source.
///
/// The archive carries the source's name, permissions and modification time.
/// On any failure the partial archive is removed and the source is left
/// untouched.
pub fn compress_file(path: &Path) -> Result<PathBuf> {
    let target = archive_path(path);
    let source = File::open(path)?;
    let output = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)?;

    if let Err(e) = write_archive(path, source, output, &target) {
        if let Err(rm) = fs::remove_file(&target) {
            warn!("failed to remove partial archive {:?}: {}", target, rm);
        }
        return Err(e);
    }

    fs::remove_file(path)?;
    debug!("compressed {:?} into {:?}", path, target);

    Ok(target)
}

fn write_archive(path: &Path, source: File, output: File, target: &Path) -> Result<()> {
    let metadata = source.metadata()?;
    let modified = metadata.modified()?;

    let mtime = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut encoder = GzBuilder::new()
        .filename(name)
        .mtime(mtime)
        .write(BufWriter::new(output), Compression::default());

    let copied = io::copy(&mut BufReader::new(source), &mut encoder)?;
    if copied != metadata.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "copied {} bytes from {:?}, expected {}",
                copied,
                path,
                metadata.len()
            ),
        )
        .into());
    }

    let output = encoder.finish()?;
    let output = output.into_inner().map_err(|e| e.into_error())?;
    output.sync_all()?;
    drop(output);

    fs::set_permissions(target, metadata.permissions())?;
    filetime::set_file_mtime(target, FileTime::from_system_time(modified))?;

    Ok(())
}

/// Compresses `path` on a background task, logging the outcome.
pub(crate) fn schedule(tasks: &Tasks, path: PathBuf) {
    tasks.spawn("log-compress", move || match compress_file(&path) {
        Ok(archive) => info!("archived {:?}", archive),
        Err(e) => error!("failed to compress {:?}: {}", path, e),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_compress_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log.2024-06-01.001.log");
        let content = "first line\nsecond line\n".repeat(100);
        fs::write(&path, &content).unwrap();

        let modified = FileTime::from_unix_time(1_717_243_200, 0);
        filetime::set_file_mtime(&path, modified).unwrap();

        let archive = compress_file(&path).unwrap();
        assert_eq!(archive, dir.path().join("app.log.2024-06-01.001.log.gz"));
        assert!(!path.exists());

        let metadata = fs::metadata(&archive).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&metadata), modified);

        let mut decoder = GzDecoder::new(File::open(&archive).unwrap());
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, content);

        let header = decoder.header().unwrap();
        assert_eq!(header.filename(), Some(&b"app.log.2024-06-01.001.log"[..]));
        assert_eq!(header.mtime(), 1_717_243_200);
    }

    #[test]
    fn test_existing_archive_keeps_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, b"keep me\n").unwrap();
        fs::write(archive_path(&path), b"already here").unwrap();

        assert!(compress_file(&path).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"keep me\n");
        assert_eq!(fs::read(archive_path(&path)).unwrap(), b"already here");
    }

    #[test]
    fn test_missing_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.log");

        assert!(compress_file(&path).is_err());
        assert!(!archive_path(&path).exists());
    }
}
