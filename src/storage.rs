//! File access for the data directory.
//! Layout: `<root>/<lang-pair>/<file>.jsonl` and `<root>/user/...`.
//! Writes go to a sibling temp file that is fsynced and renamed over the
//! destination, so readers only ever see the old or the complete new file.
//! Lock files are advisory and best-effort: they serialize writers inside one
//! process and cooperating processes, but do not prevent cross-process races.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StorageSection;
use crate::error::{RepositoryError, RepositoryResult};
use crate::repository::normalize::is_valid_language_pair;

pub const USER_DIR: &str = "user";
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Records parsed from a JSONL file plus the count of malformed lines skipped.
#[derive(Debug)]
pub struct JsonlLoad<T> {
    pub records: Vec<T>,
    pub skipped: usize,
}

/// Handle to the data directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    use_lock_files: bool,
    lock_timeout: Duration,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, section: &StorageSection) -> Self {
        Self {
            root: root.into(),
            use_lock_files: section.use_lock_files,
            lock_timeout: Duration::from_millis(section.lock_timeout_ms),
        }
    }

    /// Create the directory tree if needed and prove it is writable.
    pub fn ensure_writable(&self) -> RepositoryResult<()> {
        fs::create_dir_all(self.root.join(USER_DIR))
            .map_err(|e| RepositoryError::io(&self.root, e))?;
        let probe = self.root.join(format!(".write-probe-{}", std::process::id()));
        fs::write(&probe, b"ok").map_err(|e| RepositoryError::io(&probe, e))?;
        fs::remove_file(&probe).map_err(|e| RepositoryError::io(&probe, e))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pair_file(&self, language_pair: &str, file_name: &str) -> PathBuf {
        self.root.join(language_pair).join(file_name)
    }

    pub fn user_file(&self, file_name: &str) -> PathBuf {
        self.root.join(USER_DIR).join(file_name)
    }

    /// Language-pair directories present on disk, sorted.
    pub fn language_pairs_on_disk(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pairs: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| is_valid_language_pair(name))
            .collect();
        pairs.sort();
        pairs
    }

    /// Parse a JSONL file. A missing file is empty; malformed lines are skipped.
    /// Any read error other than bad UTF-8 aborts the load.
    pub fn read_jsonl<T: DeserializeOwned>(&self, path: &Path) -> RepositoryResult<JsonlLoad<T>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(JsonlLoad {
                    records: Vec::new(),
                    skipped: 0,
                })
            }
            Err(e) => return Err(RepositoryError::io(path, e)),
        };

        let mut records = Vec::new();
        let mut skipped = 0;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    // invalid UTF-8: skip the line, keep going
                    warn!(path = %path.display(), line = line_no + 1, error = %e, "unreadable line skipped");
                    skipped += 1;
                    continue;
                }
                // anything else repeats on every read
                Err(e) => return Err(RepositoryError::io(path, e)),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!(path = %path.display(), line = line_no + 1, error = %e, "malformed record skipped");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!(path = %path.display(), skipped, loaded = records.len(), "skipped malformed lines");
        }
        Ok(JsonlLoad { records, skipped })
    }

    /// Rewrite the whole file atomically, one JSON object per line.
    pub fn write_jsonl<T: Serialize>(&self, path: &Path, records: &[T]) -> RepositoryResult<()> {
        self.stage_jsonl(path, records)?.commit()
    }

    /// Write the full file to a temp sibling without replacing `path`.
    /// The lock is held until the returned write is committed or dropped.
    pub fn stage_jsonl<T: Serialize>(&self, path: &Path, records: &[T]) -> RepositoryResult<PendingWrite> {
        let mut buf = Vec::with_capacity(records.len() * 128);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let lock = self.lock(path);
        let staged = StagedWrite::stage(path, &buf)?;
        Ok(PendingWrite { staged, _lock: lock })
    }

    /// Append one line. A crash mid-append leaves at most one torn line,
    /// which the loader skips.
    pub fn append_jsonl<T: Serialize>(&self, path: &Path, record: &T) -> RepositoryResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        ensure_parent(path)?;
        let _lock = self.lock(path);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| RepositoryError::io(path, e))?;
        file.write_all(&line).map_err(|e| RepositoryError::io(path, e))?;
        Ok(())
    }

    /// Read a single JSON document, or `T::default()` if the file is missing or corrupt.
    pub fn read_json<T: DeserializeOwned + Default>(&self, path: &Path) -> RepositoryResult<T> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt JSON document, using default");
                T::default()
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(RepositoryError::io(path, e)),
        }
    }

    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> RepositoryResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(path, &bytes)
    }

    pub fn remove(&self, path: &Path) -> RepositoryResult<()> {
        let _lock = self.lock(path);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepositoryError::io(path, e)),
        }
    }

    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> RepositoryResult<()> {
        let _lock = self.lock(path);
        let staged = StagedWrite::stage(path, bytes)?;
        staged.commit()
    }

    fn lock(&self, path: &Path) -> Option<FileLock> {
        if !self.use_lock_files {
            return None;
        }
        FileLock::acquire(path, self.lock_timeout)
    }
}

fn ensure_parent(path: &Path) -> RepositoryResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RepositoryError::io(parent, e))?;
    }
    Ok(())
}

/// New content written and fsynced to a temp file next to `dest`, not yet visible.
/// Dropping without `commit` discards the temp file.
pub struct StagedWrite {
    temp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub fn stage(dest: &Path, bytes: &[u8]) -> RepositoryResult<Self> {
        ensure_parent(dest)?;
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let temp = dest.with_file_name(format!(
            ".{file_name}.{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = File::create(&temp).map_err(|e| RepositoryError::io(&temp, e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                let _ = fs::remove_file(&temp);
                RepositoryError::io(&temp, e)
            })?;

        Ok(Self {
            temp,
            dest: dest.to_path_buf(),
            committed: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Rename over the destination and fsync the directory (best effort).
    pub fn commit(mut self) -> RepositoryResult<()> {
        fs::rename(&self.temp, &self.dest).map_err(|e| RepositoryError::io(&self.dest, e))?;
        self.committed = true;
        if let Some(parent) = self.dest.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

/// A staged rewrite that still holds its advisory lock.
pub struct PendingWrite {
    staged: StagedWrite,
    _lock: Option<FileLock>,
}

impl PendingWrite {
    pub fn commit(self) -> RepositoryResult<()> {
        self.staged.commit()
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// Advisory sibling lock file (`<dest>.lock`), removed on drop.
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock until `timeout`. A lock older than `timeout` is
    /// considered abandoned and broken. Returns None if the lock could not be
    /// taken; callers proceed without it.
    pub fn acquire(target: &Path, timeout: Duration) -> Option<Self> {
        let path = lock_path(target);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Some(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, timeout) {
                        warn!(lock = %path.display(), "breaking stale lock file");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        warn!(lock = %path.display(), "lock busy, writing without it");
                        return None;
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    warn!(lock = %path.display(), error = %e, "lock file unavailable");
                    return None;
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

fn is_stale(path: &Path, max_age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}
