// Archive controller tests, using the directory based VirtualArchive
//
// # cargo test archive::test

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Error;

use staf_api_types::{StafArchive, StafConfiguration};

use super::virtual_archive::VirtualArchive;
use super::{
    ArchivalController, ArchiveAddress, RestorationController, RestoreListener,
    SessionPoolManager,
};

mod archive_files;
mod restore_files;
mod session_pool;

const NODE: &str = "/data";

fn create_testdir(name: &str) -> Result<PathBuf, Error> {
    let mut testdir: PathBuf = String::from("./target/testout").into();
    testdir.push(std::module_path!());
    testdir.push(name);

    let _ = std::fs::remove_dir_all(&testdir);
    let _ = std::fs::create_dir_all(&testdir);

    Ok(testdir)
}

fn test_archive() -> StafArchive {
    StafArchive {
        name: String::from("ARCH1"),
        password: String::from("secret"),
    }
}

// direct: 1000..=10000 bytes, containers get closed at 1500 bytes
fn test_config() -> StafConfiguration {
    StafConfiguration {
        min_file_size: 1000,
        max_file_size: 10000,
        container_size_threshold: 1500,
        container_max_size: 1_000_000,
        max_archiving_stream_files: 10,
        ..Default::default()
    }
}

/// Write `size` bytes of a pattern depending on `seed`.
fn write_test_file(dir: &Path, name: &str, size: usize, seed: u8) -> Result<PathBuf, Error> {
    let data: Vec<u8> = (0..size)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect();
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, data)?;
    Ok(path)
}

fn files_by_node(files: &[PathBuf]) -> BTreeMap<String, Vec<PathBuf>> {
    let mut map = BTreeMap::new();
    map.insert(NODE.to_string(), files.to_vec());
    map
}

struct TestSetup {
    testdir: PathBuf,
    remote: VirtualArchive,
    sessions: Arc<SessionPoolManager>,
    config: StafConfiguration,
}

impl TestSetup {
    fn new(name: &str, config: StafConfiguration) -> Result<Self, Error> {
        let testdir = create_testdir(name)?;
        let remote = VirtualArchive::new(testdir.join("remote"));
        remote.set_password("secret");
        let sessions = Arc::new(SessionPoolManager::new(&config));
        Ok(Self {
            testdir,
            remote,
            sessions,
            config,
        })
    }

    fn source_dir(&self) -> PathBuf {
        self.testdir.join("source")
    }

    fn restore_dir(&self) -> PathBuf {
        self.testdir.join("restore")
    }

    fn archival(&self) -> Result<ArchivalController, Error> {
        ArchivalController::new(
            test_archive(),
            self.config.clone(),
            self.testdir.join("workspace"),
            Arc::clone(&self.sessions),
            Box::new(self.remote.clone()),
        )
    }

    fn restoration(&self) -> Result<RestorationController, Error> {
        RestorationController::new(
            test_archive(),
            self.config.clone(),
            self.testdir.join("workspace"),
            Arc::clone(&self.sessions),
            Box::new(self.remote.clone()),
        )
    }
}

#[derive(Default)]
struct RecordingListener {
    retrieved: Vec<(ArchiveAddress, PathBuf)>,
    errors: Vec<(ArchiveAddress, String)>,
}

impl RestoreListener for RecordingListener {
    fn file_retrieved(&mut self, address: &ArchiveAddress, path: &Path) {
        self.retrieved.push((address.clone(), path.to_owned()));
    }

    fn file_retrieve_error(&mut self, address: &ArchiveAddress, error: &Error) {
        self.errors.push((address.clone(), error.to_string()));
    }
}
