use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

/// How long to sleep between attempts to take a contended lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An exclusive advisory lock on a sidecar file, released when dropped.
///
/// The lock only coordinates writers. Readers on the fast path never take it.
#[derive(Debug)]
pub struct FlockGuard {
    file: File,
    path: PathBuf,
}

impl FlockGuard {
    /// Block until the lock on `path` is ours, creating the file if needed.
    ///
    /// Contention is polled rather than waited on so the thread never sits in
    /// an uninterruptible `flock()` call. A holder that dies releases the lock
    /// along with its file descriptor.
    pub fn lock_exclusive(path: &Path) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let mut waited = 0_u32;
        loop {
            match try_lock(&file) {
                Ok(()) => break,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    if waited == 0 {
                        tracing::debug!(lock.path = %path.display(), "Waiting for another writer");
                    }
                    waited += 1;
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::trace!(lock.path = %path.display(), polls = waited, "Lock acquired");

        Ok(FlockGuard {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        if let Err(e) = unlock(&self.file) {
            tracing::warn!(
                lock.path = %self.path.display(),
                error = &e as &dyn std::error::Error,
                "Unable to release the lock",
            );
        }
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<(), std::io::Error> {
    use std::os::fd::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> Result<(), std::io::Error> {
    use std::os::fd::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<(), std::io::Error> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "advisory file locks are only available on unix",
    ))
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> Result<(), std::io::Error> {
    Ok(())
}
