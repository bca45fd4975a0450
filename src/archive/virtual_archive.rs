//! Directory based archive transport
//!
//! Note: This is only for test and debug. Remote files are plain files
//! below `<path>/<archive>/`. Handles are cheap to clone and share their
//! state, so a test can keep one to inject failures and to look at the
//! call statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};

use staf_tools::fs::remove_file_if_exists;

use super::ArchiveTransport;

/// Call statistics
#[derive(Clone, Debug, Default)]
pub struct VirtualArchiveStats {
    pub open_calls: usize,
    pub close_calls: usize,
    pub put_calls: usize,
    pub put_files: usize,
    pub get_calls: usize,
    pub get_files: usize,
    pub delete_calls: usize,
    /// Service class of each bulk put call
    pub service_classes: Vec<String>,
}

struct VirtualArchiveState {
    path: PathBuf,
    password: Option<String>,
    current_archive: Option<String>,
    stats: VirtualArchiveStats,
    fail_open: usize,
    fail_put: bool,
    fail_get: bool,
    rejected: BTreeSet<String>,
}

impl VirtualArchiveState {
    fn archive_dir(&self) -> Result<PathBuf, Error> {
        match &self.current_archive {
            Some(archive) => Ok(self.path.join(archive)),
            None => bail!("archive is not open"),
        }
    }
}

fn remote_file(archive_dir: &Path, remote_path: &str) -> PathBuf {
    archive_dir.join(remote_path.trim_start_matches('/'))
}

#[derive(Clone)]
pub struct VirtualArchive {
    state: Arc<Mutex<VirtualArchiveState>>,
}

impl VirtualArchive {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            state: Arc::new(Mutex::new(VirtualArchiveState {
                path: path.as_ref().to_owned(),
                password: None,
                current_archive: None,
                stats: VirtualArchiveStats::default(),
                fail_open: 0,
                fail_put: false,
                fail_get: false,
                rejected: BTreeSet::new(),
            })),
        }
    }

    /// Require this password to open any archive.
    pub fn set_password(&self, password: &str) {
        self.state.lock().unwrap().password = Some(password.to_string());
    }

    pub fn stats(&self) -> VirtualArchiveStats {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().unwrap().stats = VirtualArchiveStats::default();
    }

    /// Fail the next `count` open calls.
    pub fn fail_open(&self, count: usize) {
        self.state.lock().unwrap().fail_open = count;
    }

    /// Fail all bulk put calls.
    pub fn fail_bulk_put(&self, fail: bool) {
        self.state.lock().unwrap().fail_put = fail;
    }

    /// Fail all bulk get calls.
    pub fn fail_bulk_get(&self, fail: bool) {
        self.state.lock().unwrap().fail_get = fail;
    }

    /// Refuse to store this remote path (the bulk call itself succeeds).
    pub fn reject_remote_path(&self, remote_path: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected
            .insert(remote_path.to_string());
    }

    /// Local file backing a remote file.
    pub fn remote_file_path(&self, archive: &str, remote_path: &str) -> PathBuf {
        let state = self.state.lock().unwrap();
        remote_file(&state.path.join(archive), remote_path)
    }

    /// List all remote paths of an archive.
    pub fn list_remote_files(&self, archive: &str) -> Result<Vec<String>, Error> {
        let base = self.state.lock().unwrap().path.join(archive);
        let mut list = Vec::new();
        if !base.is_dir() {
            return Ok(list);
        }
        for entry in walkdir::WalkDir::new(&base).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&base)?;
            list.push(format!("/{}", rel.to_string_lossy()));
        }
        Ok(list)
    }
}

impl ArchiveTransport for VirtualArchive {
    fn open(&mut self, archive: &str, password: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.stats.open_calls += 1;

        if state.current_archive.is_some() {
            bail!("archive already open");
        }
        if state.fail_open > 0 {
            state.fail_open -= 1;
            bail!("connection to archive {} failed", archive);
        }
        if let Some(expected) = &state.password {
            if expected != password {
                bail!("access denied to archive {}", archive);
            }
        }

        let dir = state.path.join(archive);
        std::fs::create_dir_all(&dir)
            .map_err(|err| format_err!("unable to create {:?} - {}", dir, err))?;

        state.current_archive = Some(archive.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.stats.close_calls += 1;
        if state.current_archive.take().is_none() {
            bail!("archive is not open");
        }
        Ok(())
    }

    fn bulk_put(
        &mut self,
        files: &BTreeMap<PathBuf, String>,
        service_class: &str,
        _replicate: bool,
    ) -> Result<Vec<String>, Error> {
        let mut state = self.state.lock().unwrap();
        let dir = state.archive_dir()?;

        state.stats.put_calls += 1;
        state.stats.service_classes.push(service_class.to_string());

        if state.fail_put {
            bail!("bulk put failed (simulated)");
        }

        let mut stored = Vec::new();
        for (local_path, remote_path) in files {
            state.stats.put_files += 1;
            if state.rejected.contains(remote_path) {
                log::debug!("reject {}", remote_path);
                continue;
            }
            let target = remote_file(&dir, remote_path);
            let result = target
                .parent()
                .map(std::fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| std::fs::copy(local_path, &target));
            match result {
                Ok(_) => stored.push(remote_path.clone()),
                Err(err) => log::debug!("unable to store {:?} - {}", local_path, err),
            }
        }
        Ok(stored)
    }

    fn bulk_get(&mut self, files: &BTreeMap<String, PathBuf>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let dir = state.archive_dir()?;

        state.stats.get_calls += 1;

        if state.fail_get {
            bail!("bulk get failed (simulated)");
        }

        for (remote_path, local_path) in files {
            let source = remote_file(&dir, remote_path);
            match std::fs::copy(&source, local_path) {
                Ok(_) => state.stats.get_files += 1,
                Err(err) => log::debug!("unable to retrieve {} - {}", remote_path, err),
            }
        }
        Ok(())
    }

    fn delete(&mut self, files: &[String]) -> Result<Vec<String>, Error> {
        let mut state = self.state.lock().unwrap();
        let dir = state.archive_dir()?;

        state.stats.delete_calls += 1;

        let mut deleted = Vec::new();
        for remote_path in files {
            let path = remote_file(&dir, remote_path);
            if path.is_file() {
                remove_file_if_exists(&path)?;
                deleted.push(remote_path.clone());
            }
        }
        Ok(deleted)
    }
}
