//! Single-instance pid-file lock.
//!
//! Two orchestrator processes racing on the same robot hardware would be
//! dangerous, so startup takes an exclusive pid file. A leftover file whose
//! pid is no longer alive is reclaimed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock is held by pid {pid}")]
    Held { pid: u32 },
    #[error("lock file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Held for the lifetime of the process; the file is removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(path)
                        .ok()
                        .and_then(|content| content.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if process_alive(pid) => {
                            return Err(LockError::Held { pid });
                        }
                        _ => {
                            tracing::warn!(path = %path.display(), "reclaiming stale lock file");
                            fs::remove_file(path)?;
                        }
                    }
                }
                Err(err) => return Err(LockError::Io(err)),
            }
        }
        Err(LockError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "could not acquire lock after reclaiming stale file",
        )))
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("labcell-lock-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn test_acquire_and_release() {
        let path = temp_lock_path("basic");
        let lock = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let path = temp_lock_path("held");
        let _lock = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let path = temp_lock_path("stale");
        // No live process has this pid on any sane system.
        fs::write(&path, "4294967294").unwrap();
        let lock = InstanceLock::acquire(&path).unwrap();
        drop(lock);
        assert!(!path.exists());
    }
}
