pub mod archive;

use std::path::Path;
use std::time::Duration;

use anyhow::{format_err, Error};

use proxmox_sys::fs::{replace_file, CreateOptions};

/// Name of the lock file placed into every locked directory.
pub const STAF_LOCK_FILENAME: &str = ".staf_lock";

pub struct ArchiveLockGuard(std::fs::File);

/// Open or create a lock file and lock it.
///
/// File mode is 0660.
/// Default timeout is 10 seconds.
pub fn open_archive_lockfile<P: AsRef<Path>>(
    path: P,
    timeout: Option<Duration>,
    exclusive: bool,
) -> Result<ArchiveLockGuard, Error> {
    let options =
        CreateOptions::new().perm(nix::sys::stat::Mode::from_bits_truncate(0o660));

    let timeout = timeout.unwrap_or(Duration::new(10, 0));

    let file = proxmox_sys::fs::open_file_locked(&path, timeout, exclusive, options)
        .map_err(|err| format_err!("unable to lock {:?} - {}", path.as_ref(), err))?;
    Ok(ArchiveLockGuard(file))
}

/// Lock a directory by locking the [STAF_LOCK_FILENAME] inside it.
pub fn lock_directory<P: AsRef<Path>>(
    dir: P,
    exclusive: bool,
) -> Result<ArchiveLockGuard, Error> {
    open_archive_lockfile(dir.as_ref().join(STAF_LOCK_FILENAME), None, exclusive)
}

/// Atomically write a state file with permission "0640"
pub fn replace_state_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let mode = nix::sys::stat::Mode::from_bits_truncate(0o0640);
    let options = CreateOptions::new().perm(mode);

    replace_file(path, data, options, false)?;

    Ok(())
}

/// Atomically write data to a file with permission "0600"
///
/// Only the owner can read and write those files.
pub fn replace_secret_config<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let mode = nix::sys::stat::Mode::from_bits_truncate(0o0600);
    let options = CreateOptions::new().perm(mode);

    replace_file(path, data, options, true)?;

    Ok(())
}
