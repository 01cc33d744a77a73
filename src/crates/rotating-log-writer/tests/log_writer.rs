//! Integration tests for the rotating log writer
//!
//! Tests cover:
//! - Line numbering across line-count rotations
//! - Rotation with end-of-file markers and compression
//! - Close semantics
//! - Concurrent writers
//! - In-process and advisory locking
//! - Retention through `file_clean`
//! - Rename failures during rotation and close

use chrono::{Days, Local, NaiveTime};
use filetime::FileTime;
use flate2::read::GzDecoder;
use rotating_log_writer::{
    AdvisoryLock, Config, DefaultPolicy, FilePolicy, Log, LockRegistry, RetentionPolicy,
    RotationPolicy, WriterError,
};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Helper to create a config under `dir` with retention disabled
fn test_config(dir: &TempDir) -> Config {
    Config::new(dir.path().join("app").to_string_lossy())
        .with_retention_policy(RetentionPolicy::default().with_enabled(false))
}

/// Helper to create a writer with its own lock registry
fn isolated_log(name: &str) -> Log {
    Log::with_parts(name, Arc::new(DefaultPolicy), Arc::new(LockRegistry::new()))
}

/// Helper to list rotated files (not the active file, not lock markers)
fn rotated_files(dir: &TempDir) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().unwrap().to_string_lossy();
            name.starts_with("app.log.") && !name.ends_with(".lock")
        })
        .collect();
    files.sort();
    files
}

fn all_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Creates `name` with its modification time at local noon `days_ago` days back
fn aged_file(dir: &TempDir, name: &str, days_ago: u64) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, name).unwrap();

    let date = Local::now().date_naive() - Days::new(days_ago);
    let noon = date
        .and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap())
        .and_local_timezone(Local)
        .earliest()
        .unwrap();
    filetime::set_file_mtime(&path, FileTime::from_unix_time(noon.timestamp(), 0)).unwrap();
    path
}

#[test]
fn test_line_numbers_wrap_at_max_lines() {
    let dir = TempDir::new().unwrap();
    let log = isolated_log("lines");

    let rotation = RotationPolicy::default()
        .with_max_lines(4)
        .with_max_size(0)
        .with_day_rollover(false);
    log.init(test_config(&dir).with_rotation_policy(rotation))
        .unwrap();

    for k in 1..=10u64 {
        let position = log.write_str(&format!("record {}\n", k)).unwrap();
        assert_eq!(position.line, ((k - 1) % 4) + 1, "write {}", k);
        assert_eq!(position.file, dir.path().join("app.log"));
    }

    // Rotations happened before writes 5 and 9
    let rotated = rotated_files(&dir);
    assert_eq!(rotated.len(), 2);
    assert_eq!(
        fs::read_to_string(&rotated[0]).unwrap(),
        "record 1\nrecord 2\nrecord 3\nrecord 4\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("app.log")).unwrap(),
        "record 9\nrecord 10\n"
    );

    log.close().unwrap();
    log.wait_background();
}

#[test]
fn test_rotate_then_compress() {
    let dir = TempDir::new().unwrap();
    let log = isolated_log("compress");

    let config = test_config(&dir)
        .with_file_eof("-- end of file --\n")
        .with_compress(true);
    log.init(config).unwrap();

    let mut expected = String::new();
    for i in 0..100 {
        let record = format!("request {} served\n", i);
        log.write_str(&record).unwrap();
        expected.push_str(&record);
    }
    expected.push_str("-- end of file --\n");

    let active = log.rotate().unwrap();
    assert_eq!(active, dir.path().join("app.log"));
    assert_eq!(log.position().line, 0);
    log.wait_background();

    let names = all_files(dir.path());
    let archives: Vec<&String> = names.iter().filter(|n| n.ends_with(".001.log.gz")).collect();
    assert_eq!(archives.len(), 1, "{:?}", names);

    // The uncompressed rotated file is gone
    let source = archives[0].trim_end_matches(".gz");
    assert!(!dir.path().join(source).exists());

    let mut decoder = GzDecoder::new(fs::File::open(dir.path().join(archives[0])).unwrap());
    let mut content = String::new();
    decoder.read_to_string(&mut content).unwrap();
    assert_eq!(content, expected);

    log.close().unwrap();
    log.wait_background();
}

#[test]
fn test_close_twice() {
    let dir = TempDir::new().unwrap();
    let log = isolated_log("close");
    log.init(test_config(&dir)).unwrap();
    log.write_str("only record\n").unwrap();

    log.close().unwrap();
    log.wait_background();
    let after_close = all_files(dir.path());
    assert!(!dir.path().join("app.log").exists());
    assert_eq!(rotated_files(&dir).len(), 1);

    let err = log.close().unwrap_err();
    assert!(matches!(err, WriterError::Closed));

    let err = log.write_str("too late\n").unwrap_err();
    assert!(err.is_closed());
    assert!(matches!(log.rotate(), Err(WriterError::Closed)));

    log.wait_background();
    assert_eq!(all_files(dir.path()), after_close);
}

#[test]
fn test_concurrent_writes() {
    const THREADS: usize = 8;
    const WRITES: usize = 200;

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.log"), "existing 0\nexisting 1\nexisting 2\n").unwrap();

    let log = isolated_log("concurrent");
    log.init(test_config(&dir)).unwrap();
    assert_eq!(log.position().line, 3);

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let log = &log;
            s.spawn(move || {
                for i in 0..WRITES {
                    let record = format!("thread {:02} write {:04} {}\n", t, i, "x".repeat(64));
                    log.write_str(&record).unwrap();
                }
            });
        }
    });

    let position = log.position();
    assert_eq!(position.line, (THREADS * WRITES + 3) as u64);

    let content = fs::read_to_string(dir.path().join("app.log")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), THREADS * WRITES + 3);

    // Every record landed whole
    let unique: HashSet<&str> = lines[3..].iter().copied().collect();
    assert_eq!(unique.len(), THREADS * WRITES);
    for line in &lines[3..] {
        assert!(line.starts_with("thread "), "interleaved line: {}", line);
        assert!(line.ends_with(&"x".repeat(64)), "interleaved line: {}", line);
    }

    log.close().unwrap();
    log.wait_background();
}

#[test]
fn test_concurrent_writes_across_rotations() {
    const THREADS: u64 = 4;
    const WRITES: u64 = 250;

    let dir = TempDir::new().unwrap();
    let log = isolated_log("concurrent-rotation");

    let rotation = RotationPolicy::default()
        .with_max_lines(100)
        .with_max_size(0)
        .with_day_rollover(false);
    log.init(test_config(&dir).with_rotation_policy(rotation))
        .unwrap();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let log = &log;
            s.spawn(move || {
                for i in 0..WRITES {
                    let position = log.write_str(&format!("{} {}\n", t, i)).unwrap();
                    assert!((1..=100).contains(&position.line));
                }
            });
        }
    });

    // 1000 records at 100 per file: 9 rotated files plus a full active file
    assert_eq!(rotated_files(&dir).len(), 9);
    for path in rotated_files(&dir) {
        assert_eq!(rotating_log_writer::count_lines(&path).unwrap(), 100);
    }
    assert_eq!(log.position().line, 100);

    log.close().unwrap();
    log.wait_background();
}

#[test]
fn test_same_path_is_claimed_once() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LockRegistry::new());

    let first = Log::with_parts("first", Arc::new(DefaultPolicy), registry.clone());
    let second = Log::with_parts("second", Arc::new(DefaultPolicy), registry.clone());

    first.init(test_config(&dir)).unwrap();
    let err = second.init(test_config(&dir)).unwrap_err();
    assert!(matches!(err, WriterError::AlreadyLocked(_)));
    assert!(second.config().is_none());

    // Until initialized the second writer goes to stdout
    let position = second.write_str("").unwrap();
    assert_eq!(position.file, PathBuf::new());

    first.close().unwrap();
    assert!(registry.is_empty());
    assert_eq!(
        second.init(test_config(&dir)).unwrap(),
        dir.path().join("app.log")
    );

    second.close().unwrap();
    first.wait_background();
    second.wait_background();
}

#[test]
fn test_process_registry_is_shared() {
    let dir = TempDir::new().unwrap();

    let first = Log::new("first");
    let second = Log::new("second");

    first.init(test_config(&dir)).unwrap();
    assert!(matches!(
        second.init(test_config(&dir)),
        Err(WriterError::AlreadyLocked(_))
    ));

    drop(first);
    second.init(test_config(&dir)).unwrap();
    second.close().unwrap();
    second.wait_background();
}

#[test]
fn test_advisory_lock() {
    let dir = TempDir::new().unwrap();
    let log = isolated_log("advisory");
    let active = log
        .init(test_config(&dir).with_file_lock(true))
        .unwrap();

    assert!(AdvisoryLock::is_held(&active));
    assert!(AdvisoryLock::try_acquire(&active).is_err());

    // The lock survives a rotation
    log.write_str("before\n").unwrap();
    log.rotate().unwrap();
    assert!(AdvisoryLock::is_held(&active));

    log.close().unwrap();
    assert!(!AdvisoryLock::is_held(&active));
    log.wait_background();
}

#[test]
fn test_stale_file_rolled_on_init() {
    let dir = TempDir::new().unwrap();
    let stale = aged_file(&dir, "app.log", 3);
    let date = Local::now().date_naive() - Days::new(3);

    let log = isolated_log("stale");
    log.init(test_config(&dir)).unwrap();

    assert!(!stale.exists() || fs::metadata(&stale).unwrap().len() == 0);
    let rolled = dir
        .path()
        .join(format!("app.log.{}.001.log", date.format("%Y-%m-%d")));
    assert_eq!(fs::read_to_string(&rolled).unwrap(), "app.log");
    assert_eq!(log.position().line, 0);

    log.close().unwrap();
    log.wait_background();
}

#[test]
fn test_file_clean() {
    let dir = TempDir::new().unwrap();
    let log = isolated_log("clean");

    let retention = RetentionPolicy::default().with_max_days(3);
    log.init(test_config(&dir).with_retention_policy(retention))
        .unwrap();
    log.write_str("active\n").unwrap();
    log.wait_background();

    let expired = aged_file(&dir, "app.log.x.001.log", 30);
    let kept: Vec<PathBuf> = [2, 3, 4]
        .into_iter()
        .map(|days| aged_file(&dir, &format!("app.log.k{}.001.log", days), days))
        .collect();
    let foreign = aged_file(&dir, "other.log", 30);

    let removed = log.file_clean().unwrap();
    assert_eq!(removed, vec![expired]);
    for path in kept.iter().chain([&foreign]) {
        assert!(path.exists(), "{:?}", path);
    }
    assert!(dir.path().join("app.log").exists());

    log.close().unwrap();
    log.wait_background();

    // The active file is gone after close
    assert!(matches!(log.file_clean(), Err(WriterError::MissingFile(_))));
}

/// Policy whose name search never finds a free sequence number
struct ExhaustedPolicy;

impl FilePolicy for ExhaustedPolicy {
    fn rename_target(&self, _config: &Config, path: &Path) -> rotating_log_writer::Result<PathBuf> {
        Err(WriterError::NameExhausted(path.to_path_buf()))
    }
}

#[test]
fn test_exhausted_names_keep_writing_to_active_file() {
    let dir = TempDir::new().unwrap();
    let log = Log::with_parts(
        "exhausted",
        Arc::new(ExhaustedPolicy),
        Arc::new(LockRegistry::new()),
    );

    let rotation = RotationPolicy::default()
        .with_max_lines(2)
        .with_max_size(0)
        .with_day_rollover(false);
    log.init(test_config(&dir).with_rotation_policy(rotation))
        .unwrap();

    let active = dir.path().join("app.log");
    let mut expected = String::new();
    for k in 1..=5 {
        let record = format!("record {}\n", k);
        let position = log.write_str(&record).unwrap();
        assert_eq!(position.file, active);
        expected.push_str(&record);
    }

    // Every rotation failed to rename, so all records stay in the active file
    assert!(rotated_files(&dir).is_empty());
    assert_eq!(fs::read_to_string(&active).unwrap(), expected);

    let err = log.close().unwrap_err();
    assert!(matches!(err, WriterError::NameExhausted(ref path) if path == &active));
    assert_eq!(fs::read_to_string(&active).unwrap(), expected);

    assert!(log.write_str("after close\n").unwrap_err().is_closed());
    log.wait_background();
}
