use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::core::error::Result;

/// Contents of a `<slug>.pid` marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidInfo {
    pub pid: u32,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
}

impl PidInfo {
    /// Marker for a producer running in this process
    pub fn current(task_id: &str) -> Self {
        PidInfo {
            pid: std::process::id(),
            task_id: task_id.to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// What a reader finds at a pidfile path
#[derive(Debug, Clone, PartialEq)]
pub enum PidState {
    Missing,
    Present(PidInfo),
    Unreadable,
}

pub struct PidFile;

impl PidFile {
    /// Exclusive create with content. The content goes to a private temp file
    /// first and is hard-linked into place, so readers never see a half-written
    /// marker. Returns false when the marker already exists.
    pub fn create(path: &Path, info: &PidInfo) -> Result<bool> {
        let tmp = temp_path(path);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(info)?)?;
            file.sync_all()?;
        }

        let linked = match fs::hard_link(&tmp, path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        };
        let _ = fs::remove_file(&tmp);
        linked
    }

    pub fn read(path: &Path) -> Result<PidState> {
        match fs::read(path) {
            Ok(data) => match serde_json::from_slice::<PidInfo>(&data) {
                Ok(info) => Ok(PidState::Present(info)),
                Err(_) => Ok(PidState::Unreadable),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PidState::Missing),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Remove the marker only if it still belongs to `task_id`
    pub fn remove_if_owned(path: &Path, task_id: &str) -> Result<bool> {
        match Self::read(path)? {
            PidState::Present(info) if info.task_id == task_id => {
                Self::remove(path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("marker");
    path.with_file_name(format!(".{}.tmp-{}", name, Uuid::new_v4().simple()))
}

/// True when a process with this pid exists (or exists but belongs to someone else)
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_create_loses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aword.pid");

        assert!(PidFile::create(&path, &PidInfo::current("t1")).unwrap());
        assert!(!PidFile::create(&path, &PidInfo::current("t2")).unwrap());

        match PidFile::read(&path).unwrap() {
            PidState::Present(info) => assert_eq!(info.task_id, "t1"),
            other => panic!("unexpected {:?}", other),
        }
        // no temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_remove_if_owned_checks_task() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aword.pid");
        PidFile::create(&path, &PidInfo::current("t1")).unwrap();

        assert!(!PidFile::remove_if_owned(&path, "t2").unwrap());
        assert!(path.exists());
        assert!(PidFile::remove_if_owned(&path, "t1").unwrap());
        assert_eq!(PidFile::read(&path).unwrap(), PidState::Missing);
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
