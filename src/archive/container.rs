//! Aggregate containers
//!
//! Small files are bundled into tar containers. Each node has its own
//! container directory inside the workspace:
//!
//! ```text
//! .staf_lock          lock file
//! .last_id            highest container id ever used on this node
//! <id>_current/       staging directory of the open container
//! <id>.json           container state (creation time and members)
//! <id>.tar            closed container, waiting for transfer
//! ```
//!
//! The `<id>` is the creation time, but always above any id used before
//! on the node, and the remote file name of the container is `<id>.tar`.
//! Stored containers are removed locally, so `.last_id` is what keeps a
//! new container from replacing a stored one on the archive.
//!
//! There is at most one open container per node. It is closed (turned
//! into a tar) as soon as its content reaches the size threshold, or
//! when it gets older than the maximum age. A file which does not fit
//! below the maximum container size closes the open container first and
//! goes into a new one. Closed containers stay on
//! disk until they are stored, so a failed transfer gets retried by
//! the next preparation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use staf_api_types::{PhysicalFileStatus, StafConfiguration};
use staf_config::{lock_directory, replace_state_file, ArchiveLockGuard};
use staf_tools::fs::{available_file_name, remove_dir_if_exists, remove_file_if_exists};

use super::{
    ArchiveError, ArchiveWorkspace, ContainerFile, ContainerMember, PhysicalFile,
    PhysicalFileKind,
};

lazy_static! {
    static ref CLOSED_CONTAINER_REGEX: Regex = Regex::new(r"^(\d+)\.tar$").unwrap();
    static ref OPEN_CONTAINER_REGEX: Regex = Regex::new(r"^(\d+)_current$").unwrap();
}

fn container_id(name: &str) -> &str {
    name.strip_suffix(".tar").unwrap_or(name)
}

fn tar_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.tar", id))
}

fn tmp_tar_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.tar.tmp", id))
}

fn staging_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}_current", id))
}

fn state_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id))
}

const LAST_ID_FILE_NAME: &str = ".last_id";

fn load_last_id(dir: &Path) -> Result<Option<i64>, Error> {
    let path = dir.join(LAST_ID_FILE_NAME);
    match proxmox_sys::fs::file_read_optional_string(&path)? {
        Some(raw) => {
            let id = raw
                .trim()
                .parse()
                .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ContainerState {
    creation_time: i64,
    members: Vec<ContainerMember>,
}

fn load_state(path: &Path) -> Result<Option<ContainerState>, Error> {
    match proxmox_sys::fs::file_read_optional_string(path)? {
        Some(raw) => {
            let state = serde_json::from_str(&raw)
                .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;
            Ok(Some(state))
        }
        None => Ok(None),
    }
}

fn store_state(dir: &Path, container: &ContainerFile) -> Result<(), Error> {
    let state = ContainerState {
        creation_time: container.creation_time,
        members: container.members.clone(),
    };
    let raw = serde_json::to_string_pretty(&state)?;
    replace_state_file(
        state_path(dir, container_id(&container.name)),
        raw.as_bytes(),
    )
}

fn update_layout(container: &mut ContainerFile) {
    let mut offset = 0;
    for member in container.members.iter_mut() {
        member.offset = offset;
        offset += member.size;
    }
    container.size = offset;
}

fn open_container(dir: &Path, id: &str) -> Result<ContainerFile, Error> {
    let staging = staging_path(dir, id);

    let mut container = ContainerFile {
        name: format!("{}.tar", id),
        creation_time: id.parse()?,
        size: 0,
        members: Vec::new(),
        closed: false,
        local_path: staging.clone(),
    };

    match load_state(&state_path(dir, id))? {
        Some(state) => {
            container.creation_time = state.creation_time;
            container.members = state.members;
        }
        None => {
            log::warn!("missing state for container {:?} - rebuild member list", staging);
            for path in staf_tools::fs::list_files(&staging)? {
                let entry = match path.file_name().and_then(|n| n.to_str()) {
                    Some(entry) => entry.to_string(),
                    None => continue,
                };
                container.members.push(ContainerMember {
                    entry,
                    source: None,
                    offset: 0,
                    size: std::fs::metadata(&path)?.len(),
                });
            }
        }
    }
    update_layout(&mut container);

    Ok(container)
}

fn closed_container(dir: &Path, id: &str) -> Result<ContainerFile, Error> {
    let path = tar_path(dir, id);

    let mut container = ContainerFile {
        name: format!("{}.tar", id),
        creation_time: id.parse()?,
        size: 0,
        members: Vec::new(),
        closed: true,
        local_path: path.clone(),
    };

    match load_state(&state_path(dir, id))? {
        Some(state) => {
            container.creation_time = state.creation_time;
            container.members = state.members;
        }
        None => {
            log::warn!("missing state for container {:?} - rebuild member list", path);
            for (entry, size) in list_tar(&path)? {
                container.members.push(ContainerMember {
                    entry,
                    source: None,
                    offset: 0,
                    size,
                });
            }
        }
    }
    update_layout(&mut container);

    Ok(container)
}

/// Write the members (files inside `staging`) into a new tar file.
fn create_tar(staging: &Path, members: &[ContainerMember], target: &Path) -> Result<(), Error> {
    let output =
        File::create(target).map_err(|err| format_err!("unable to create {:?} - {}", target, err))?;
    let mut builder = tar::Builder::new(output);

    for member in members {
        let path = staging.join(&member.entry);
        let mut file =
            File::open(&path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
        let metadata = file.metadata()?;

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(0o644);
        header.set_mtime(metadata.mtime().max(0) as u64);
        builder.append_data(&mut header, &member.entry, &mut file)?;
    }

    builder.into_inner()?.sync_all()?;

    Ok(())
}

fn list_tar(path: &Path) -> Result<Vec<(String, u64)>, Error> {
    let file = File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
    let mut archive = tar::Archive::new(file);

    let mut list = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        list.push((name, entry.size()));
    }
    Ok(list)
}

/// Extract the named entries of a tar file into `target_dir`.
///
/// Existing files are not overwritten (see [available_file_name]).
/// Returns the extracted files, entries missing in the tar are not
/// part of the result.
pub(crate) fn extract_entries(
    path: &Path,
    entries: &BTreeSet<String>,
    target_dir: &Path,
) -> Result<BTreeMap<String, PathBuf>, Error> {
    let file = File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
    let mut archive = tar::Archive::new(file);

    let mut extracted = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if !entries.contains(&name) || extracted.contains_key(&name) {
            continue;
        }
        let target = available_file_name(target_dir, &name);
        entry
            .unpack(&target)
            .map_err(|err| ArchiveError::local_io(&target, err))?;
        extracted.insert(name, target);
    }
    Ok(extracted)
}

/// Copy a tar file without the entries listed in `remove`.
///
/// Returns the number of kept entries and the removed entry names.
pub(crate) fn rewrite_tar(
    source: &Path,
    target: &Path,
    remove: &BTreeSet<String>,
) -> Result<(usize, BTreeSet<String>), Error> {
    let input =
        File::open(source).map_err(|err| format_err!("unable to open {:?} - {}", source, err))?;
    let mut archive = tar::Archive::new(input);

    let output =
        File::create(target).map_err(|err| format_err!("unable to create {:?} - {}", target, err))?;
    let mut builder = tar::Builder::new(output);

    let mut kept = 0;
    let mut removed = BTreeSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if remove.contains(&name) {
            removed.insert(name);
            continue;
        }
        let mut header = entry.header().clone();
        builder.append_data(&mut header, &name, &mut entry)?;
        kept += 1;
    }

    builder.into_inner()?.sync_all()?;

    Ok((kept, removed))
}

/// Where a not yet stored container lives
pub(crate) enum LocalContainer {
    /// Open, entries are files inside the staging directory
    Open(PathBuf),
    /// Closed, waiting for transfer
    Closed(PathBuf),
}

/// Manages the containers of one archive workspace
pub struct ContainerManager {
    archive: String,
    workspace: ArchiveWorkspace,
    size_threshold: u64,
    max_size: u64,
    max_age: i64,
}

impl ContainerManager {
    pub fn new(archive: &str, workspace: ArchiveWorkspace, config: &StafConfiguration) -> Self {
        Self {
            archive: archive.to_string(),
            workspace,
            size_threshold: config.container_size_threshold,
            max_size: config.container_max_size,
            max_age: config.container_max_age(),
        }
    }

    /// Check if a container is big or old enough to be closed.
    pub fn is_eligible(&self, container: &ContainerFile, current_time: i64) -> bool {
        container.size >= self.size_threshold
            || current_time.saturating_sub(container.creation_time) >= self.max_age
    }

    /// Check if there are containers (open or closed) on disk for `node`.
    pub fn has_local_containers(&self, node: &str) -> Result<bool, Error> {
        let dir = self.workspace.container_dir(node);
        if !dir.is_dir() {
            return Ok(false);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if CLOSED_CONTAINER_REGEX.is_match(name) || OPEN_CONTAINER_REGEX.is_match(name) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Lock the container directory of `node` and load its containers.
    ///
    /// Closed containers left over from earlier runs are ready to store
    /// again. The open container is closed if it got too old meanwhile.
    pub fn open_node(&self, node: &str, current_time: i64) -> Result<NodeContainers<'_>, Error> {
        let dir = self.workspace.container_dir(node);
        proxmox_sys::fs::create_path(&dir, None, None)
            .map_err(|err| ArchiveError::local_io(&dir, err))?;

        let lock = lock_directory(&dir, true)?;

        let mut closed = Vec::new();
        let mut open = Vec::new();

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = match file_name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let result = if let Some(caps) = CLOSED_CONTAINER_REGEX.captures(name) {
                closed_container(&dir, &caps[1]).map(|c| closed.push(c))
            } else if let Some(caps) = OPEN_CONTAINER_REGEX.captures(name) {
                open_container(&dir, &caps[1]).map(|c| open.push(c))
            } else {
                Ok(())
            };
            if let Err(err) = result {
                log::error!("skip container {:?} - {}", entry.path(), err);
            }
        }

        closed.sort_by_key(|c| c.creation_time);
        open.sort_by_key(|c| c.creation_time);

        let mut containers = NodeContainers {
            manager: self,
            node: node.to_string(),
            dir,
            current: None,
            closed,
            _lock: lock,
        };

        if !containers.closed.is_empty() {
            log::info!(
                "found {} closed container(s) waiting for transfer on node {}",
                containers.closed.len(),
                node
            );
        }

        let current = open.pop();
        for mut container in open {
            log::warn!("closing additional open container {} on node {}", container.name, node);
            containers.close(&mut container)?;
            containers.closed.push(container);
        }

        if let Some(mut container) = current {
            if self.is_eligible(&container, current_time) {
                log::info!("open container {} on node {} is old enough", container.name, node);
                containers.close(&mut container)?;
                containers.closed.push(container);
            } else {
                containers.current = Some(container);
            }
        }

        Ok(containers)
    }

    /// Remove the local files of a stored container.
    pub fn remove_stored(&self, node: &str, container: &ContainerFile) -> Result<(), Error> {
        let dir = self.workspace.container_dir(node);
        let _lock = lock_directory(&dir, true)?;

        let id = container_id(&container.name);
        remove_file_if_exists(tar_path(&dir, id))?;
        remove_file_if_exists(state_path(&dir, id))?;

        Ok(())
    }

    /// Lock the container directory of `node`, if there is one.
    pub(crate) fn lock_node(
        &self,
        node: &str,
        exclusive: bool,
    ) -> Result<Option<ArchiveLockGuard>, Error> {
        let dir = self.workspace.container_dir(node);
        if !dir.is_dir() {
            return Ok(None);
        }
        lock_directory(&dir, exclusive).map(Some)
    }

    /// Look up a container which is not stored remotely yet.
    ///
    /// Callers need to hold the node lock.
    pub(crate) fn local_container(&self, node: &str, name: &str) -> Option<LocalContainer> {
        if !CLOSED_CONTAINER_REGEX.is_match(name) {
            return None;
        }
        let dir = self.workspace.container_dir(node);
        let id = container_id(name);

        let staging = staging_path(&dir, id);
        if staging.is_dir() {
            return Some(LocalContainer::Open(staging));
        }
        let tar = tar_path(&dir, id);
        if tar.is_file() {
            return Some(LocalContainer::Closed(tar));
        }
        None
    }

    /// Remove entries from a container which is not stored remotely yet.
    ///
    /// Returns `None` if there is no such local container, else the
    /// removed entries. Containers without members are removed.
    pub(crate) fn delete_local_entries(
        &self,
        node: &str,
        name: &str,
        entries: &BTreeSet<String>,
    ) -> Result<Option<BTreeSet<String>>, Error> {
        let _lock = match self.lock_node(node, true)? {
            Some(lock) => lock,
            None => return Ok(None),
        };

        let dir = self.workspace.container_dir(node);
        let id = container_id(name);

        let removed = match self.local_container(node, name) {
            None => return Ok(None),
            Some(LocalContainer::Open(staging)) => {
                let mut container = open_container(&dir, id)?;
                let mut removed = BTreeSet::new();
                container.members.retain(|member| {
                    if entries.contains(&member.entry) {
                        removed.insert(member.entry.clone());
                        false
                    } else {
                        true
                    }
                });
                for entry in removed.iter() {
                    remove_file_if_exists(staging.join(entry))?;
                }
                update_layout(&mut container);

                if container.members.is_empty() {
                    remove_dir_if_exists(&staging)?;
                    remove_file_if_exists(state_path(&dir, id))?;
                } else {
                    store_state(&dir, &container)?;
                }
                removed
            }
            Some(LocalContainer::Closed(path)) => {
                let mut container = closed_container(&dir, id)?;
                let tmp_path = tmp_tar_path(&dir, id);
                let (kept, removed) = rewrite_tar(&path, &tmp_path, entries)?;

                if kept == 0 {
                    remove_file_if_exists(&tmp_path)?;
                    remove_file_if_exists(&path)?;
                    remove_file_if_exists(state_path(&dir, id))?;
                } else {
                    std::fs::rename(&tmp_path, &path)?;
                    container.members.retain(|member| !removed.contains(&member.entry));
                    update_layout(&mut container);
                    store_state(&dir, &container)?;
                }
                removed
            }
        };

        log::info!(
            "removed {} entries from local container {} on node {}",
            removed.len(),
            name,
            node
        );

        Ok(Some(removed))
    }
}

/// Containers of one node, locked for preparation
///
/// Created by [ContainerManager::open_node]. Callers must not prepare the
/// same node from two places at once.
pub struct NodeContainers<'a> {
    manager: &'a ContainerManager,
    node: String,
    dir: PathBuf,
    current: Option<ContainerFile>,
    closed: Vec<ContainerFile>,
    _lock: ArchiveLockGuard,
}

impl NodeContainers<'_> {
    /// The open container, if any.
    pub fn current(&self) -> Option<&ContainerFile> {
        self.current.as_ref()
    }

    fn create(&self, current_time: i64) -> Result<ContainerFile, Error> {
        let mut id = match load_last_id(&self.dir)? {
            Some(last_id) => current_time.max(last_id.saturating_add(1)),
            None => current_time,
        }
        .max(0);
        loop {
            let id_str = id.to_string();
            if !tar_path(&self.dir, &id_str).exists()
                && !staging_path(&self.dir, &id_str).exists()
                && !state_path(&self.dir, &id_str).exists()
            {
                break;
            }
            id += 1;
        }

        replace_state_file(self.dir.join(LAST_ID_FILE_NAME), id.to_string().as_bytes())?;

        let id = id.to_string();
        let staging = staging_path(&self.dir, &id);
        std::fs::create_dir(&staging).map_err(|err| ArchiveError::local_io(&staging, err))?;

        let container = ContainerFile {
            name: format!("{}.tar", id),
            creation_time: current_time,
            size: 0,
            members: Vec::new(),
            closed: false,
            local_path: staging,
        };
        store_state(&self.dir, &container)?;

        log::info!("created container {} on node {}", container.name, self.node);

        Ok(container)
    }

    fn add_member(
        &self,
        container: &mut ContainerFile,
        source: &Path,
        entry: String,
    ) -> Result<(), Error> {
        if container.members.iter().any(|member| member.entry == entry) {
            return Err(ArchiveError::EntryNameCollision {
                container: container.name.clone(),
                entry,
            }
            .into());
        }

        let target = container.local_path.join(&entry);
        let size = match std::fs::copy(source, &target) {
            Ok(size) => size,
            Err(err) => {
                let _ = std::fs::remove_file(&target);
                return Err(ArchiveError::local_io(source, err).into());
            }
        };

        container.members.push(ContainerMember {
            entry,
            source: Some(source.to_owned()),
            offset: container.size,
            size,
        });
        container.size += size;

        store_state(&self.dir, container)
    }

    /// Turn the open container into a tar file.
    fn close(&self, container: &mut ContainerFile) -> Result<(), Error> {
        let id = container_id(&container.name).to_string();
        let staging = container.local_path.clone();
        let path = tar_path(&self.dir, &id);
        let tmp_path = tmp_tar_path(&self.dir, &id);

        proxmox_lang::try_block!({
            create_tar(&staging, &container.members, &tmp_path)?;
            std::fs::rename(&tmp_path, &path)?;
            store_state(&self.dir, container)?;
            remove_dir_if_exists(&staging)
        })
        .map_err(|err: Error| {
            let _ = std::fs::remove_file(&tmp_path);
            format_err!("closing container {} failed - {}", container.name, err)
        })?;

        container.closed = true;
        container.local_path = path;

        log::info!(
            "closed container {} on node {} ({} files, {} bytes)",
            container.name,
            self.node,
            container.members.len(),
            container.size
        );

        Ok(())
    }

    /// Add a file to the open container (creating one if needed).
    ///
    /// Returns [PhysicalFileStatus::ReadyToStore] if the container got
    /// closed by this, else [PhysicalFileStatus::PendingLocal]. A container
    /// which fails to close stays open and is retried by the next run.
    pub fn assign(&mut self, source: &Path, current_time: i64) -> Result<PhysicalFileStatus, Error> {
        let metadata = std::fs::metadata(source).map_err(|err| ArchiveError::local_io(source, err))?;
        if !metadata.is_file() {
            bail!("{:?} is not a regular file", source);
        }

        let entry = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| format_err!("unsupported file name {:?}", source))?
            .to_string();

        if let Some(mut container) = self.current.take() {
            if !container.members.is_empty()
                && container.size.saturating_add(metadata.len()) > self.manager.max_size
            {
                log::info!(
                    "{:?} does not fit into container {} on node {}",
                    source,
                    container.name,
                    self.node
                );
                if let Err(err) = self.close(&mut container) {
                    self.current = Some(container);
                    return Err(err);
                }
                self.closed.push(container);
            } else {
                self.current = Some(container);
            }
        }

        let mut container = match self.current.take() {
            Some(container) => container,
            None => self.create(current_time)?,
        };

        if let Err(err) = self.add_member(&mut container, source, entry) {
            self.current = Some(container);
            return Err(err);
        }

        if !self.manager.is_eligible(&container, current_time) {
            self.current = Some(container);
            return Ok(PhysicalFileStatus::PendingLocal);
        }

        // the file is part of the container now, even if closing fails
        match self.close(&mut container) {
            Ok(()) => {
                self.closed.push(container);
                Ok(PhysicalFileStatus::ReadyToStore)
            }
            Err(err) => {
                log::error!("{} - keep it open", err);
                self.current = Some(container);
                Ok(PhysicalFileStatus::PendingLocal)
            }
        }
    }

    /// Release the lock and return all containers of the node.
    pub fn finish(self) -> Vec<PhysicalFile> {
        let archive = &self.manager.archive;

        let mut list: Vec<PhysicalFile> = self
            .closed
            .into_iter()
            .map(|container| {
                PhysicalFile::new(archive, &self.node, PhysicalFileKind::Container(container))
                    .with_status(PhysicalFileStatus::ReadyToStore)
            })
            .collect();

        if let Some(container) = self.current {
            if container.members.is_empty() {
                let id = container_id(&container.name);
                if let Err(err) = remove_dir_if_exists(&container.local_path)
                    .and_then(|_| remove_file_if_exists(state_path(&self.dir, id)))
                {
                    log::warn!("unable to remove empty container {} - {}", container.name, err);
                }
            } else {
                log::info!(
                    "container {} on node {} not ready yet ({} bytes)",
                    container.name,
                    self.node,
                    container.size
                );
                list.push(
                    PhysicalFile::new(archive, &self.node, PhysicalFileKind::Container(container))
                        .with_status(PhysicalFileStatus::PendingLocal),
                );
            }
        }

        list
    }
}
