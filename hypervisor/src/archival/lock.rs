//! At most one archival worker across cooperating host processes, elected
//! with an exclusive non-blocking `flock` on a well-known file.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use tracing::debug;

/// Held for as long as this process hosts the worker; the lock is released
/// when the guard drops or the process dies.
#[derive(Debug)]
pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl SingletonLock {
    /// `Ok(None)` when another process already holds the lock.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        if !try_flock_exclusive(&file)? {
            debug!(path = %path.display(), "archival lock held elsewhere");
            return Ok(None);
        }
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        // SAFETY: the fd is owned by `self.file` and still open.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    // SAFETY: flock on a valid fd owned by `file`.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("archival.lock");

        let first = SingletonLock::try_acquire(&path).unwrap().expect("first wins");
        assert!(SingletonLock::try_acquire(&path).unwrap().is_none());
        assert_eq!(
            std::fs::read_to_string(first.path()).unwrap(),
            std::process::id().to_string()
        );

        drop(first);
        assert!(SingletonLock::try_acquire(&path).unwrap().is_some());
    }
}
