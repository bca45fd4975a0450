use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{format_err, Error};

use staf_api_types::{ArchiveAccessMode, StafArchive, StafConfiguration};
use staf_tools::fs::{available_file_name, check_dir_writable, concat_files, remove_dir_if_exists};

use super::container::{extract_entries, LocalContainer};
use super::{
    group_addresses, AddressMode, ArchiveAddress, ArchiveConnection, ArchiveError,
    ArchiveTransport, ArchiveWorkspace, ContainerManager, ObjectRequest, RequestKind,
    SessionPoolManager,
};

/// Receives the result of each restored address
///
/// Exactly one of the two methods gets called for every address passed
/// to [RestorationController::restore_files].
pub trait RestoreListener {
    /// The file is available at `path`.
    fn file_retrieved(&mut self, address: &ArchiveAddress, path: &Path);

    fn file_retrieve_error(&mut self, address: &ArchiveAddress, error: &Error);
}

/// Addresses grouped by the remote object to retrieve
pub type RestoreRequest = ObjectRequest;

fn notify_error(listener: &mut dyn RestoreListener, request: &RestoreRequest, error: &Error) {
    for address in request.addresses.iter() {
        log::error!("unable to restore {} - {}", address, error);
        listener.file_retrieve_error(address, error);
    }
}

fn notify_container_result(
    listener: &mut dyn RestoreListener,
    request: &RestoreRequest,
    extracted: &BTreeMap<String, PathBuf>,
) {
    for address in request.addresses.iter() {
        let path = match &address.mode {
            AddressMode::Container { entry } => extracted.get(entry),
            _ => None,
        };
        match path {
            Some(path) => listener.file_retrieved(address, path),
            None => {
                let err: Error = ArchiveError::MissingRemoteObject(address.to_string()).into();
                log::error!("unable to restore {} - {}", address, err);
                listener.file_retrieve_error(address, &err);
            }
        }
    }
}

/// Retrieves archived files into a local directory
pub struct RestorationController {
    archive: StafArchive,
    config: StafConfiguration,
    containers: ContainerManager,
    sessions: Arc<SessionPoolManager>,
    transport: Box<dyn ArchiveTransport>,
}

impl RestorationController {
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
            containers: ContainerManager::new(&archive.name, workspace, &config),
            archive,
            config,
            sessions,
            transport,
        })
    }

    /// Group addresses, so that every remote object is retrieved once.
    pub fn prepare_files_to_restore(&self, addresses: &[ArchiveAddress]) -> Vec<RestoreRequest> {
        group_addresses(addresses)
    }

    // Serve entries of containers not sent yet from the workspace.
    // Returns false if the container is not available locally.
    fn restore_local(
        &self,
        request: &RestoreRequest,
        entries: &BTreeSet<String>,
        destination: &Path,
        listener: &mut dyn RestoreListener,
    ) -> Result<bool, Error> {
        let _lock = match self.containers.lock_node(&request.key.node, false)? {
            Some(lock) => lock,
            None => return Ok(false),
        };

        let extracted = match self
            .containers
            .local_container(&request.key.node, &request.key.file_name)
        {
            None => return Ok(false),
            Some(LocalContainer::Open(staging)) => {
                let mut extracted = BTreeMap::new();
                for entry in entries.iter() {
                    let source = staging.join(entry);
                    if !source.is_file() {
                        continue;
                    }
                    let target = available_file_name(destination, entry);
                    std::fs::copy(&source, &target)
                        .map_err(|err| ArchiveError::local_io(&target, err))?;
                    extracted.insert(entry.clone(), target);
                }
                extracted
            }
            Some(LocalContainer::Closed(path)) => extract_entries(&path, entries, destination)?,
        };

        log::info!(
            "restored {} entries from local container {}",
            extracted.len(),
            request.key
        );

        notify_container_result(listener, request, &extracted);

        Ok(true)
    }

    fn retrieve(&mut self, files: &BTreeMap<String, PathBuf>) -> Result<(), Error> {
        let sessions = Arc::clone(&self.sessions);
        let _session = sessions.reserve_session(ArchiveAccessMode::Restitution);

        let mut connection =
            ArchiveConnection::open(self.transport.as_mut(), &self.archive, self.config.max_attempts)?;

        log::info!("retrieve {} files from archive {}", files.len(), self.archive.name);
        connection.bulk_get(files)?;

        if let Err(err) = connection.close() {
            log::warn!("closing archive {} failed - {}", self.archive.name, err);
        }

        Ok(())
    }

    // Turn the retrieved remote objects of a request into result files.
    fn deliver(
        request: &RestoreRequest,
        staged: &[PathBuf],
        destination: &Path,
        listener: &mut dyn RestoreListener,
    ) {
        let remote_paths = request.remote_paths();
        if let Some((_, remote)) = staged
            .iter()
            .zip(remote_paths.iter())
            .find(|(path, _)| !path.is_file())
        {
            let err: Error = ArchiveError::MissingRemoteObject(remote.clone()).into();
            notify_error(listener, request, &err);
            return;
        }

        match &request.kind {
            RequestKind::Direct => {
                let count = request.addresses.len();
                for (index, address) in request.addresses.iter().enumerate() {
                    let target = available_file_name(destination, &request.key.file_name);
                    let result = if index + 1 == count {
                        std::fs::rename(&staged[0], &target)
                    } else {
                        std::fs::copy(&staged[0], &target).map(|_| ())
                    };
                    match result {
                        Ok(()) => listener.file_retrieved(address, &target),
                        Err(err) => {
                            let err: Error = ArchiveError::local_io(&target, err).into();
                            listener.file_retrieve_error(address, &err);
                        }
                    }
                }
            }
            RequestKind::Split { .. } => {
                for address in request.addresses.iter() {
                    let target = available_file_name(destination, &request.key.file_name);
                    match concat_files(staged, &target) {
                        Ok(_) => listener.file_retrieved(address, &target),
                        Err(err) => {
                            let _ = std::fs::remove_file(&target);
                            listener.file_retrieve_error(address, &err);
                        }
                    }
                }
            }
            RequestKind::Container { entries } => {
                match extract_entries(&staged[0], entries, destination) {
                    Ok(extracted) => notify_container_result(listener, request, &extracted),
                    Err(err) => notify_error(listener, request, &err),
                }
            }
        }
    }

    /// Restore files into `destination`.
    ///
    /// All remote objects are retrieved with a single bulk get. The
    /// listener gets a result for every address of every request. Files
    /// already existing in `destination` are not overwritten, restored
    /// files get a `_<n>` suffix instead.
    ///
    /// Returns an error if the destination is unusable, or if the
    /// transfer failed as a whole (all addresses got an error callback
    /// in both cases).
    pub fn restore_files(
        &mut self,
        requests: &[RestoreRequest],
        destination: &Path,
        listener: &mut dyn RestoreListener,
    ) -> Result<(), Error> {
        let usable = proxmox_sys::fs::create_path(destination, None, None)
            .map_err(Error::from)
            .and_then(|_| check_dir_writable(destination));
        if let Err(err) = usable {
            let err: Error = ArchiveError::local_io(destination, err).into();
            for request in requests {
                notify_error(listener, request, &err);
            }
            return Err(err);
        }

        let mut remote = Vec::new();

        for request in requests {
            if request.key.archive != self.archive.name {
                let err = format_err!(
                    "address belongs to archive '{}', not '{}'",
                    request.key.archive,
                    self.archive.name
                );
                notify_error(listener, request, &err);
                continue;
            }

            if let RequestKind::Container { entries } = &request.kind {
                match self.restore_local(request, entries, destination, listener) {
                    Ok(true) => continue,
                    Ok(false) => (),
                    Err(err) => {
                        notify_error(listener, request, &err);
                        continue;
                    }
                }
            }

            remote.push(request);
        }

        if remote.is_empty() {
            return Ok(());
        }

        let staging = available_file_name(destination, ".staf-restore");

        let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut staged = Vec::with_capacity(remote.len());

        let prepared: Result<(), Error> = proxmox_lang::try_block!({
            for (index, request) in remote.iter().enumerate() {
                let dir = staging.join(index.to_string());
                std::fs::create_dir_all(&dir)?;

                let paths: Vec<PathBuf> = request
                    .remote_paths()
                    .into_iter()
                    .map(|remote_path| {
                        let name = remote_path.rsplit('/').next().unwrap_or("file").to_string();
                        files
                            .entry(remote_path)
                            .or_insert_with(|| dir.join(name))
                            .clone()
                    })
                    .collect();
                staged.push(paths);
            }
            Ok(())
        })
        .map_err(|err: Error| ArchiveError::local_io(&staging, err).into());

        let result = prepared.and_then(|_| self.retrieve(&files));

        if let Err(err) = result {
            for request in remote {
                notify_error(listener, request, &err);
            }
            let _ = remove_dir_if_exists(&staging);
            return Err(err);
        }

        for (request, paths) in remote.iter().zip(staged.iter()) {
            Self::deliver(request, paths, destination, listener);
        }

        if let Err(err) = remove_dir_if_exists(&staging) {
            log::warn!("unable to remove {:?} - {}", staging, err);
        }

        Ok(())
    }
}
