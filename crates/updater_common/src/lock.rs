//! Run lock
//!
//! One run at a time: a lock file holding the owner's PID and acquisition
//! time. A lock is recovered when it is older than five minutes, its owner
//! process no longer exists, or its content is unreadable.

use crate::events::EventCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock file name inside the install root
pub const LOCK_FILE_NAME: &str = "agent-updater.lock";

/// Maximum age of a lock before it's considered stale (5 minutes)
const MAX_LOCK_AGE_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    /// Unix epoch seconds
    pub acquired_at: u64,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: process::id(),
            acquired_at: now_secs(),
        }
    }

    pub fn age_secs(&self) -> u64 {
        now_secs().saturating_sub(self.acquired_at)
    }

    fn is_stale(&self) -> bool {
        self.age_secs() > MAX_LOCK_AGE_SECS
    }

    fn process_exists(&self) -> bool {
        if self.pid == process::id() {
            return true;
        }
        Path::new(&format!("/proc/{}", self.pid)).exists()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock (pid {}, {}s old)", .holder.pid, .holder.age_secs())]
    AlreadyLocked { holder: LockInfo },

    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    pub fn code(&self) -> EventCode {
        EventCode::GeneralError
    }
}

/// Held lock; the file is removed on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock in `dir`, recovering stale or dead-owner locks
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE_NAME);
        let io_err = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;

        if path.exists() {
            let content = fs::read_to_string(&path).map_err(io_err)?;
            match serde_json::from_str::<LockInfo>(&content) {
                Ok(holder) if holder.is_stale() => {
                    warn!(
                        "Recovering stale lock (pid {}, {}s old)",
                        holder.pid,
                        holder.age_secs()
                    );
                    fs::remove_file(&path).map_err(io_err)?;
                }
                Ok(holder) if !holder.process_exists() => {
                    warn!("Recovering lock of dead process {}", holder.pid);
                    fs::remove_file(&path).map_err(io_err)?;
                }
                Ok(holder) => return Err(LockError::AlreadyLocked { holder }),
                Err(e) => {
                    warn!("Recovering corrupted lock: {}", e);
                    fs::remove_file(&path).map_err(io_err)?;
                }
            }
        }

        let info = LockInfo::current();
        let content = serde_json::to_string(&info)
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        // create_new loses the race cleanly if another run got here first
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        debug!("Acquired run lock {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not release lock {}: {}", self.path.display(), e);
            }
        }
    }
}
