//! Durable file replacement
//!
//! Datafiles are never rewritten in place. [`replace_file`] writes a sibling
//! temp file, syncs it with the strongest primitive the platform offers,
//! renames it over the original and then syncs the directory entry. A crash
//! at any point leaves either the old file or the new one, never a mix.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{DataError, DataResult};

/// Flush a file's data to stable storage.
///
/// Uses `fdatasync` on Linux, `F_FULLFSYNC` on Apple platforms and
/// `FlushFileBuffers` on Windows; elsewhere `sync_data`. Can block for a
/// long time, so never call it with cell or table locks held.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor belongs to `file`, which is open for the whole call.
        os_result(unsafe { libc::fdatasync(file.as_raw_fd()) } == 0)
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // plain fsync only reaches the drive's volatile cache here
        use std::os::unix::io::AsRawFd;
        // SAFETY: as above; F_FULLFSYNC takes no argument.
        os_result(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) } == 0)
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle belongs to `file`, which is open for the whole call.
        os_result(unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) } != 0)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows"))]
fn os_result(ok: bool) -> io::Result<()> {
    if ok {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Sibling path a replacement is staged in before the rename.
pub fn staging_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{}.saving", name))
}

/// Atomically replace `path` with `contents`.
///
/// On error the original file is untouched; a stale staging file may be
/// left behind and is overwritten by the next attempt.
pub fn replace_file(path: &Path, contents: &[u8]) -> DataResult<()> {
    let staging = staging_path(path);

    {
        let mut file = File::create(&staging).map_err(|e| DataError::io_at(&staging, &e, "create staging file"))?;
        file.write_all(contents).map_err(|e| DataError::io_at(&staging, &e, "write staging file"))?;
        durable_sync(&file).map_err(|e| DataError::io_at(&staging, &e, "sync staging file"))?;
    }

    fs::rename(&staging, path).map_err(|e| DataError::io_at(path, &e, "rename staging file"))?;

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = File::open(parent).map_err(|e| DataError::io_at(parent, &e, "open directory"))?;
            durable_sync(&dir).map_err(|e| DataError::io_at(parent, &e, "sync directory"))?;
        }
    }
    Ok(())
}
