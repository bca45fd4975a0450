//! File system helper utilities.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

/// Returns a path inside `dir` named `name` which does not exist yet.
///
/// If `name` is already taken, `_1`, `_2`, ... is appended to the file
/// stem until a free name is found.
pub fn available_file_name<P: AsRef<Path>>(dir: P, name: &str) -> PathBuf {
    let dir = dir.as_ref();
    let mut path = dir.join(name);
    if !path.exists() {
        return path;
    }

    let (stem, extension) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };

    let mut counter = 1;
    loop {
        path = dir.join(format!("{}_{}{}", stem, counter, extension));
        if !path.exists() {
            return path;
        }
        counter += 1;
    }
}

/// Copy `length` bytes starting at `offset` from `source` into a new file `target`.
pub fn copy_file_range(source: &Path, offset: u64, length: u64, target: &Path) -> Result<(), Error> {
    let mut input =
        File::open(source).map_err(|err| format_err!("unable to open {:?} - {}", source, err))?;
    input.seek(SeekFrom::Start(offset))?;

    let mut output = File::create(target)
        .map_err(|err| format_err!("unable to create {:?} - {}", target, err))?;

    let copied = std::io::copy(&mut input.take(length), &mut output)?;
    if copied != length {
        bail!(
            "short read on {:?} (got {} of {} bytes at offset {})",
            source,
            copied,
            length,
            offset
        );
    }
    output.flush()?;

    Ok(())
}

/// Concatenate `parts` (in order) into the new file `target`.
pub fn concat_files(parts: &[PathBuf], target: &Path) -> Result<u64, Error> {
    let mut output = File::create(target)
        .map_err(|err| format_err!("unable to create {:?} - {}", target, err))?;

    let mut size = 0;
    for part in parts {
        let mut input =
            File::open(part).map_err(|err| format_err!("unable to open {:?} - {}", part, err))?;
        size += std::io::copy(&mut input, &mut output)?;
    }
    output.flush()?;

    Ok(size)
}

/// List the regular files directly inside `dir`, sorted by file name.
pub fn list_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>, Error> {
    let mut list = Vec::new();
    for entry in walkdir::WalkDir::new(dir.as_ref())
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if entry.file_type().is_file() {
            list.push(entry.into_path());
        }
    }
    Ok(list)
}

/// Remove a directory tree, ignoring it if it does not exist.
pub fn remove_dir_if_exists<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => bail!("unable to remove directory {:?} - {}", path, err),
    }
}

/// Remove a file, ignoring it if it does not exist.
pub fn remove_file_if_exists<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => bail!("unable to remove file {:?} - {}", path, err),
    }
}

/// Check that we can create, write and remove files inside `dir`.
pub fn check_dir_writable<P: AsRef<Path>>(dir: P) -> Result<(), Error> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        bail!("{:?} is not a directory", dir);
    }
    let probe = dir.join(format!(".staf-probe-{}", std::process::id()));
    File::create(&probe)
        .and_then(|mut file| file.write_all(b"probe"))
        .map_err(|err| format_err!("directory {:?} is not writable - {}", dir, err))?;
    std::fs::remove_file(&probe)
        .map_err(|err| format_err!("unable to remove {:?} - {}", probe, err))?;
    Ok(())
}
