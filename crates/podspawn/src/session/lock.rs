//! Per-sandbox provisioning lock.
//!
//! Two connections for the same identity would otherwise race between the
//! existence check and create. Holding an exclusive `flock` across
//! exists/create/start serializes them; the second one reattaches.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Exclusive lock, released when dropped (the fd is closed).
#[derive(Debug)]
pub struct ProvisionLock {
    path: PathBuf,
    _file: File,
}

impl ProvisionLock {
    /// Block until the lock for `sandbox` under `dir` is held.
    pub async fn acquire(dir: &Path, sandbox: &str) -> io::Result<Self> {
        let path = dir.join(format!("{sandbox}.lock"));
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(io::Error::other)?
    }

    fn acquire_blocking(path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
