use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Error;

use staf_api_types::{ArchiveAccessMode, PhysicalFileStatus, StafArchive, StafConfiguration};

use super::{
    check_node_path, ArchiveAddress, ArchiveConnection, ArchiveError, ArchiveTransport,
    ArchiveWorkspace, ContainerManager, DirectFile, PhysicalFile, PhysicalFileKind,
    SessionPoolManager, SplitManager, TransferUnit,
};

/// Sends local files to the archive
///
/// Usage: [prepare_files_to_archive](Self::prepare_files_to_archive)
/// classifies the files and creates the [PhysicalFile] list,
/// [archive_files](Self::archive_files) sends everything which is ready,
/// and [get_raw_files_archived](Self::get_raw_files_archived) tells where
/// each source file ended up.
pub struct ArchivalController {
    pub(super) archive: StafArchive,
    pub(super) config: StafConfiguration,
    pub(super) workspace: ArchiveWorkspace,
    pub(super) containers: ContainerManager,
    splitter: SplitManager,
    pub(super) sessions: Arc<SessionPoolManager>,
    pub(super) transport: Box<dyn ArchiveTransport>,
}

impl ArchivalController {
    pub fn new<P: AsRef<Path>>(
        archive: StafArchive,
        config: StafConfiguration,
        workspace_base: P,
        sessions: Arc<SessionPoolManager>,
        transport: Box<dyn ArchiveTransport>,
    ) -> Result<Self, Error> {
        config
            .validate()
            .map_err(|err| ArchiveError::Configuration(err.to_string()))?;

        let workspace = ArchiveWorkspace::new(workspace_base, &archive.name);
        workspace.init()?;

        Ok(Self {
            containers: ContainerManager::new(&archive.name, workspace.clone(), &config),
            splitter: SplitManager::new(workspace.clone(), &config),
            archive,
            config,
            workspace,
            sessions,
            transport,
        })
    }

    pub fn workspace(&self) -> &ArchiveWorkspace {
        &self.workspace
    }

    pub fn container_manager(&self) -> &ContainerManager {
        &self.containers
    }

    /// Check that the workspace exists and is writable.
    pub fn init_workspace(&self) -> Result<(), Error> {
        self.workspace.init()
    }

    fn prepare_file(&self, node: &str, source: &Path, size: u64) -> Result<PhysicalFile, Error> {
        let (stored_name, _) = staf_tools::checksum::file_md5_hex(source)?;

        let kind = if size > self.config.max_file_size {
            PhysicalFileKind::Split(self.splitter.split(node, source, &stored_name, size)?)
        } else {
            PhysicalFileKind::Direct(DirectFile {
                source: source.to_owned(),
                stored_name,
                size,
            })
        };

        Ok(PhysicalFile::new(&self.archive.name, node, kind)
            .with_status(PhysicalFileStatus::ReadyToStore))
    }

    /// Classify and prepare files, grouped by destination node.
    ///
    /// Files smaller than `min-file-size` go into the node's container,
    /// files bigger than `max-file-size` get split, others are stored
    /// directly. Files we cannot read are skipped (and logged).
    ///
    /// Returned files are either ready to store, or (containers only)
    /// pending on local disk.
    pub fn prepare_files_to_archive(
        &self,
        files_by_node: &BTreeMap<String, Vec<PathBuf>>,
        current_time: i64,
    ) -> Result<Vec<PhysicalFile>, Error> {
        let mut list = Vec::new();

        for (node, files) in files_by_node {
            if let Err(err) = check_node_path(node) {
                log::error!("skip {} files of invalid node '{}' - {}", files.len(), node, err);
                continue;
            }

            let mut small_files = Vec::new();

            for source in files {
                let size = match std::fs::metadata(source) {
                    Ok(metadata) if metadata.is_file() => metadata.len(),
                    Ok(_) => {
                        log::error!("skip {:?} - not a regular file", source);
                        continue;
                    }
                    Err(err) => {
                        log::error!("skip {:?} - {}", source, err);
                        continue;
                    }
                };

                if size < self.config.min_file_size {
                    small_files.push(source);
                    continue;
                }

                match self.prepare_file(node, source, size) {
                    Ok(file) => list.push(file),
                    Err(err) => log::error!("skip {:?} - {}", source, err),
                }
            }

            if small_files.is_empty() && !self.containers.has_local_containers(node)? {
                continue;
            }

            let mut containers = self.containers.open_node(node, current_time)?;
            for source in small_files {
                if let Err(err) = containers.assign(source, current_time) {
                    log::error!("skip {:?} - {}", source, err);
                }
            }
            list.extend(containers.finish());
        }

        Ok(list)
    }

    fn send_files(
        &mut self,
        units: &[(usize, TransferUnit)],
        replicate: bool,
        stored: &mut HashSet<String>,
    ) -> Result<(), Error> {
        let limits = self.config.session_limits(ArchiveAccessMode::Archiving);

        let mut connection =
            ArchiveConnection::open(self.transport.as_mut(), &self.archive, self.config.max_attempts)?;

        for (flow_nr, flow) in units.chunks(limits.max_stream_files.max(1)).enumerate() {
            let biggest = flow.iter().map(|(_, unit)| unit.size).max().unwrap_or(0);
            let service_class = self.config.service_class(biggest);

            let files: BTreeMap<PathBuf, String> = flow
                .iter()
                .map(|(_, unit)| (unit.local_path.clone(), unit.remote_path.clone()))
                .collect();

            log::info!(
                "send flow {} to archive {} ({} files, class {})",
                flow_nr,
                self.archive.name,
                files.len(),
                service_class
            );

            stored.extend(connection.bulk_put(&files, service_class, replicate)?);
        }

        if let Err(err) = connection.close() {
            log::warn!("closing archive {} failed - {}", self.archive.name, err);
        }

        Ok(())
    }

    fn remove_temporary_files(&self, file: &PhysicalFile) {
        let result = match &file.kind {
            PhysicalFileKind::Direct(_) => Ok(()),
            PhysicalFileKind::Split(split) => self.splitter.cleanup(&file.node, split),
            PhysicalFileKind::Container(container) if file.status == PhysicalFileStatus::Stored => {
                self.containers.remove_stored(&file.node, container)
            }
            // keep the tar, so that the next run retries it
            PhysicalFileKind::Container(_) => Ok(()),
        };
        if let Err(err) = result {
            log::warn!("unable to remove temporary files of {} - {}", file.stored_name(), err);
        }
    }

    /// Send all files of `node` which are ready to store.
    ///
    /// Uses one archive session and connection. Files are sent in flows
    /// of at most `max-archiving-stream-files` remote objects. A file is
    /// stored if all its remote objects are stored (all parts for split
    /// files), else it is marked as failed.
    ///
    /// Returns the number of stored files. If the transfer itself fails,
    /// files not confirmed until then are marked as failed and the error
    /// is returned.
    pub fn archive_files(
        &mut self,
        files: &mut [PhysicalFile],
        node: &str,
        replicate: bool,
    ) -> Result<usize, Error> {
        let ready: Vec<usize> = files
            .iter()
            .enumerate()
            .filter(|(_, file)| file.status == PhysicalFileStatus::ReadyToStore && file.node == node)
            .map(|(index, _)| index)
            .collect();

        if ready.is_empty() {
            log::debug!("nothing to archive for node {}", node);
            return Ok(0);
        }

        let mut units = Vec::new();
        for &index in ready.iter() {
            for unit in files[index].transfer_units() {
                units.push((index, unit));
            }
        }

        let mut stored_paths = HashSet::new();
        let result = {
            let sessions = Arc::clone(&self.sessions);
            let _session = sessions.reserve_session(ArchiveAccessMode::Archiving);
            self.send_files(&units, replicate, &mut stored_paths)
        };

        let mut stored = 0;
        for &index in ready.iter() {
            let file = &mut files[index];
            let complete = file
                .transfer_units()
                .iter()
                .all(|unit| stored_paths.contains(&unit.remote_path));
            if complete {
                file.status = PhysicalFileStatus::Stored;
                stored += 1;
            } else {
                log::error!("storing {} on node {} failed", file.stored_name(), node);
                file.status = PhysicalFileStatus::Failed;
            }
            self.remove_temporary_files(file);
        }

        log::info!(
            "stored {} of {} files on node {} of archive {}",
            stored,
            ready.len(),
            node,
            self.archive.name
        );

        result?;

        Ok(stored)
    }

    /// Map each source file of the stored files to its archive address.
    pub fn get_raw_files_archived(
        &self,
        files: &[PhysicalFile],
    ) -> BTreeMap<PathBuf, ArchiveAddress> {
        let mut map = BTreeMap::new();
        for file in files
            .iter()
            .filter(|file| file.status == PhysicalFileStatus::Stored)
        {
            match file.source_addresses() {
                Ok(list) => map.extend(list),
                Err(err) => log::error!("unable to get address of {} - {}", file.stored_name(), err),
            }
        }
        map
    }
}
