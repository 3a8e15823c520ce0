use crate::common::{FacegateError, Result};
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers (authentication) may overlap each other.
    Shared,
    /// Writers (enrollment) exclude everyone else.
    Exclusive,
}

/// Advisory per-user `flock` under `<data_dir>/.locks`. Released when dropped.
///
/// `flock` locks belong to the open file description, so two sessions conflict
/// whether they run in separate processes or separate threads.
#[derive(Debug)]
pub struct UserLock {
    _file: File,
    mode: LockMode,
}

impl UserLock {
    /// Take the lock without waiting; contention is reported as `UserBusy`.
    pub fn try_acquire(data_dir: &Path, user: &str, mode: LockMode) -> Result<Self> {
        let lock_dir = data_dir.join(".locks");
        fs::create_dir_all(&lock_dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_dir.join(format!("{}.lock", user)))?;

        let operation = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        } | libc::LOCK_NB;

        let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK => {
                    Err(FacegateError::UserBusy(user.to_string()))
                }
                _ => Err(err.into()),
            };
        }

        tracing::debug!("Acquired {:?} lock for {}", mode, user);
        Ok(Self { _file: file, mode })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}
