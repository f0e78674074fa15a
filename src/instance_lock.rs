use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cross-process lock serialising jobs that must not overlap, such as
/// aggregation runs started by separate schedulers
pub struct InstanceLock {
    lock_file: File,
    lock_path: PathBuf,
}

impl InstanceLock {
    /// Try to take the lock named `name` in the runtime directory.
    /// Returns `None` when another process holds it.
    pub fn try_acquire(name: &str) -> Result<Option<Self>> {
        Self::try_acquire_in(&runtime_dir(), name)
    }

    pub fn try_acquire_in(dir: &Path, name: &str) -> Result<Option<Self>> {
        std::fs::create_dir_all(dir).context("Failed to create lock directory")?;
        let lock_path = dir.join(format!("{}.lock", name));

        // No truncate here: the holder's PID must survive a failed attempt
        let mut lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

        if !try_flock(&lock_file)? {
            debug!("Lock {} is held by another process", lock_path.display());
            return Ok(None);
        }

        lock_file
            .set_len(0)
            .context("Failed to reset lock file")?;
        writeln!(lock_file, "{}", std::process::id()).context("Failed to write PID to lock file")?;

        debug!("Acquired lock {}", lock_path.display());

        Ok(Some(Self {
            lock_file,
            lock_path,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

fn runtime_dir() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::temp_dir(),
    }
}

/// Non-blocking exclusive flock; `false` when already held elsewhere
#[cfg(unix)]
fn try_flock(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err).context("Failed to acquire lock")
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> Result<bool> {
    Ok(true)
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }

        debug!("Released lock {}", self.lock_path.display());
    }
}
