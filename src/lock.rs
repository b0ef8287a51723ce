//! Exclusive lock covering all account-database mutation.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::ProvisionError;
use crate::rooted;

/// Holds the write lock on the password-database sentinel file. Dropping
/// the guard closes the descriptor and releases the lock on every exit
/// path.
pub struct LockGuard {
    _file: File,
}

/// Take the conventional account-database write lock, blocking until it
/// becomes available. This uses the same sentinel file as lckpwdf(), so
/// shadow-utils and friends interoperate. Per-table locks are
/// deliberately not taken on top, they would be redundant here.
pub fn take_lock(root: Option<&Path>) -> Result<LockGuard, ProvisionError> {
    let path = rooted(root, "/etc/.pwd.lock");
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY | libc::O_NOFOLLOW)
        .open(&path)
        .map_err(|e| ProvisionError::io(&path, e))?;

    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;

    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &fl) };
    if rc < 0 {
        return Err(ProvisionError::io(&path, io::Error::last_os_error()));
    }
    Ok(LockGuard { _file: file })
}
