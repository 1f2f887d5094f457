//! Writer locking for container files.
//!
//! A container may have any number of readers but at most one writer.
//! Writers take an exclusive, non-blocking lock on a sidecar file named
//! `<container>.lock`; readers never lock. The sidecar outlives the lock
//! and is never removed.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Exclusive writer lock on a container file.
///
/// Held for the lifetime of this struct.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Attempts to take the writer lock for `container`.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another writer holds the lock
    /// - `ErrorKind::PermissionDenied` if the sidecar cannot be created
    pub fn acquire(container: &Path) -> IoResult<Self> {
        let lock_path = sidecar_path(container);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        Self::try_lock(&file)?;

        Ok(Self {
            _file: file,
            path: lock_path,
        })
    }

    /// Path of the sidecar lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        // SAFETY: `fd` is a valid descriptor owned by `file` for the whole call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let errno = IoError::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(IoError::new(
                    ErrorKind::WouldBlock,
                    "container is locked by another writer",
                ));
            }
            return Err(errno);
        }

        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` is owned by `file`; OVERLAPPED is plain data.
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };

        if result == 0 {
            let err = IoError::last_os_error();
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("container is locked by another writer: {err}"),
            ));
        }

        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        #[cfg(feature = "allow_no_lock")]
        {
            tracing::warn!("file locking not supported on this platform; proceeding without lock");
            Ok(())
        }

        #[cfg(not(feature = "allow_no_lock"))]
        {
            Err(IoError::new(
                ErrorKind::Unsupported,
                "file locking not supported on this platform",
            ))
        }
    }
}

fn sidecar_path(container: &Path) -> PathBuf {
    let mut name = container
        .file_name()
        .map_or_else(OsString::new, OsString::from);
    name.push(".lock");
    container.with_file_name(name)
}
