use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use crate::core::error::{Error, ErrorKind, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Advisory lock on a sidecar file, released on drop.
/// Shared for readers, exclusive for writers.
pub struct FileLock {
    pub file: File,
    pub exclusive: bool,
    pub path: PathBuf,
}

impl FileLock {
    /// Block until the lock is granted or `timeout` elapses
    pub fn acquire(path: &Path, exclusive: bool, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path, exclusive)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(Error::new(
                    ErrorKind::StorageUnavailable,
                    format!("timed out waiting for lock {}", path.display()),
                ));
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Single non-blocking attempt; `None` means somebody else holds it
    pub fn try_acquire(path: &Path, exclusive: bool) -> Result<Option<Self>> {
        // Both modes open read+write so that the lock file can be created lazily
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_EX, LOCK_NB, LOCK_SH};

            let fd = file.as_raw_fd();
            let operation = if exclusive { LOCK_EX } else { LOCK_SH } | LOCK_NB;

            let rc = unsafe { flock(fd, operation) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Ok(None);
                }
                return Err(Error::new(
                    ErrorKind::StorageUnavailable,
                    format!("failed to lock {}: {}", path.display(), err),
                ));
            }
        }

        Ok(Some(FileLock {
            file,
            exclusive,
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_UN};

            let fd = self.file.as_raw_fd();
            unsafe {
                flock(fd, LOCK_UN);
            }
        }
    }
}
