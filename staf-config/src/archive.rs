//! STAF archive configuration
//!
//! A configuration directory contains two JSON files:
//!
//! - `staf.json`: the archive settings ([StafConfiguration]). Missing
//!   properties use their defaults, a missing file means "all defaults".
//!
//! - `archive.json`: name and (base64 encoded) password of the remote
//!   archive ([StafArchive]). This file is written with mode 0600.
//!
//! Writers need to hold the lock returned by [lock_config].

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use staf_api_types::{StafArchive, StafConfiguration, STAF_SAFE_ID_REGEX};

use crate::{open_archive_lockfile, replace_secret_config, replace_state_file, ArchiveLockGuard};

pub const STAF_CFG_FILENAME: &str = "staf.json";
pub const ARCHIVE_CFG_FILENAME: &str = "archive.json";
pub const STAF_CFG_LOCKFILE: &str = ".staf.lck";

fn config_file(dir: &Path, name: &str) -> PathBuf {
    let mut path = dir.to_owned();
    path.push(name);
    path
}

/// Get exclusive lock
pub fn lock_config<P: AsRef<Path>>(dir: P) -> Result<ArchiveLockGuard, Error> {
    open_archive_lockfile(config_file(dir.as_ref(), STAF_CFG_LOCKFILE), None, true)
}

/// Read and validate the archive settings.
pub fn config<P: AsRef<Path>>(dir: P) -> Result<StafConfiguration, Error> {
    let path = config_file(dir.as_ref(), STAF_CFG_FILENAME);

    let data = proxmox_sys::fs::file_get_json(&path, Some(serde_json::json!({})))?;
    let config: StafConfiguration = serde_json::from_value(data)
        .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;

    config
        .validate()
        .map_err(|err| format_err!("invalid configuration {:?} - {}", path, err))?;

    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(dir: P, config: &StafConfiguration) -> Result<(), Error> {
    config.validate()?;

    let path = config_file(dir.as_ref(), STAF_CFG_FILENAME);
    let raw = serde_json::to_string_pretty(config)?;
    replace_state_file(&path, raw.as_bytes())?;

    log::info!("updated archive settings in {:?}", path);

    Ok(())
}

/// Read the remote archive access configuration.
pub fn archive_config<P: AsRef<Path>>(dir: P) -> Result<StafArchive, Error> {
    let path = config_file(dir.as_ref(), ARCHIVE_CFG_FILENAME);

    let raw = match proxmox_sys::fs::file_read_optional_string(&path)? {
        Some(raw) => raw,
        None => bail!("archive is not configured (missing {:?})", path),
    };

    let archive: StafArchive = serde_json::from_str(&raw)
        .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;

    check_archive_name(&archive.name)?;

    Ok(archive)
}

pub fn save_archive_config<P: AsRef<Path>>(dir: P, archive: &StafArchive) -> Result<(), Error> {
    check_archive_name(&archive.name)?;

    let path = config_file(dir.as_ref(), ARCHIVE_CFG_FILENAME);
    let raw = serde_json::to_string_pretty(archive)?;
    replace_secret_config(path, raw.as_bytes())
}

fn check_archive_name(name: &str) -> Result<(), Error> {
    if !STAF_SAFE_ID_REGEX.is_match(name) {
        bail!("invalid archive name '{}'", name);
    }
    Ok(())
}
