use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::TerraError;

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub attempts: u32,
    pub interval: Duration,
    /// A lock file older than this is treated as left behind by a dead
    /// process and removed.
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            attempts: 600,
            interval: Duration::from_millis(100),
            stale_after: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Cooperative lock between terra-dm processes: `<target>.lock` created
/// exclusively, removed on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

impl FileLock {
    pub fn lock_path_for(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        target.with_file_name(name)
    }

    pub fn acquire(target: &Path, options: LockOptions) -> Result<Self, TerraError> {
        let path = Self::lock_path_for(target);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| TerraError::Filesystem(format!("{}: {err}", parent.display())))?;
        }
        for attempt in 0..options.attempts.max(1) {
            if let Some(lock) = Self::try_acquire(&path)? {
                debug!(lock = %path.display(), attempt, "lock acquired");
                return Ok(lock);
            }
            if let Some(seen) = stale_snapshot(&path, options.stale_after) {
                break_stale(&path, &seen);
                continue;
            }
            thread::sleep(options.interval);
        }
        Err(TerraError::LockTimeout(path))
    }

    fn try_acquire(path: &Path) -> Result<Option<Self>, TerraError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => {
                return Err(TerraError::Filesystem(format!("{}: {err}", path.display())));
            }
        };
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Some(Self {
            path: path.to_path_buf(),
            _file: file,
        }))
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

/// What a waiter saw when it judged a lock stale: the lock file's mtime
/// and the holder PID written into it.
#[derive(Debug, PartialEq, Eq)]
struct LockSnapshot {
    modified: SystemTime,
    holder: String,
}

fn snapshot(path: &Path) -> Option<LockSnapshot> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    let holder = fs::read_to_string(path).ok()?;
    Some(LockSnapshot { modified, holder })
}

fn stale_snapshot(path: &Path, stale_after: Duration) -> Option<LockSnapshot> {
    let seen = snapshot(path)?;
    let age = SystemTime::now().duration_since(seen.modified).ok()?;
    (age > stale_after).then_some(seen)
}

/// Removes the lock only if it is still the one judged stale. Another waiter
/// may have broken it and taken a fresh lock in the meantime.
fn break_stale(path: &Path, seen: &LockSnapshot) {
    if snapshot(path).as_ref() != Some(seen) {
        debug!(lock = %path.display(), "stale lock changed hands; not removing");
        return;
    }
    warn!(lock = %path.display(), holder = seen.holder.trim(), "removing stale lock");
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(lock = %path.display(), error = %err, "failed to remove stale lock"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_retaken_after_staleness_check_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gedi.lock");
        fs::write(&path, "111\n").unwrap();
        thread::sleep(Duration::from_millis(20));
        let seen = stale_snapshot(&path, Duration::from_millis(1)).unwrap();
        assert_eq!(seen.holder, "111\n");

        // Another waiter broke it and now holds a fresh lock.
        fs::remove_file(&path).unwrap();
        fs::write(&path, "222\n").unwrap();
        break_stale(&path, &seen);
        assert_eq!(fs::read_to_string(&path).unwrap(), "222\n");

        let current = snapshot(&path).unwrap();
        break_stale(&path, &current);
        assert!(!path.exists());
    }

    #[test]
    fn fresh_lock_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gedi.lock");
        fs::write(&path, "111\n").unwrap();
        assert!(stale_snapshot(&path, Duration::from_secs(3600)).is_none());
        assert!(stale_snapshot(&dir.path().join("missing.lock"), Duration::ZERO).is_none());
    }
}
