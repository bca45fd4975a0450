use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Error};

use staf_api_types::{ArchiveAccessMode, StafConfiguration};
use staf_tools::fs::remove_dir_if_exists;

use super::container::rewrite_tar;
use super::{
    group_addresses, AddressMode, ArchivalController, ArchiveAddress, ArchiveConnection,
    ObjectRequest, RequestKind,
};

/// Addresses grouped by the remote object they live in
pub type DeleteRequest = ObjectRequest;

fn container_addresses<'a>(
    request: &'a DeleteRequest,
    removed: &'a BTreeSet<String>,
) -> impl Iterator<Item = ArchiveAddress> + 'a {
    request
        .addresses
        .iter()
        .filter(move |address| match &address.mode {
            AddressMode::Container { entry } => removed.contains(entry),
            _ => false,
        })
        .cloned()
}

impl ArchivalController {
    /// Group addresses, so that every remote object is handled once.
    pub fn prepare_files_to_delete(&self, addresses: &[ArchiveAddress]) -> Vec<DeleteRequest> {
        group_addresses(addresses)
    }

    // Remove entries from a remote container: get it, rewrite it without
    // the entries, and store it again (or delete it if nothing is left).
    fn delete_container_entries(
        connection: &mut ArchiveConnection<'_>,
        config: &StafConfiguration,
        request: &DeleteRequest,
        tar: &Path,
    ) -> Result<Vec<ArchiveAddress>, Error> {
        let entries = match &request.kind {
            RequestKind::Container { entries } => entries,
            _ => bail!("{} is no container", request.key),
        };

        if !tar.is_file() {
            bail!("unable to retrieve container {}", request.key);
        }

        let rewritten = tar.with_extension("new");
        let (kept, removed) = rewrite_tar(tar, &rewritten, entries)?;
        if removed.is_empty() {
            return Ok(Vec::new());
        }

        let remote = request.key.remote_path();

        let done = if kept == 0 {
            connection.delete(&[remote.clone()])?.contains(&remote)
        } else {
            let size = std::fs::metadata(&rewritten)?.len();
            let mut files = BTreeMap::new();
            files.insert(rewritten.clone(), remote.clone());
            connection
                .bulk_put(&files, config.service_class(size), false)?
                .contains(&remote)
        };

        if !done {
            bail!("unable to update container {}", request.key);
        }

        log::info!(
            "removed {} entries from container {} ({} left)",
            removed.len(),
            request.key,
            kept
        );

        Ok(container_addresses(request, &removed).collect())
    }

    fn delete_remote(
        &mut self,
        objects: &[&DeleteRequest],
        containers: &[&DeleteRequest],
        tmpdir: &Path,
        deleted: &mut Vec<ArchiveAddress>,
    ) -> Result<(), Error> {
        let sessions = Arc::clone(&self.sessions);
        let _session = sessions.reserve_session(ArchiveAccessMode::Archiving);

        let config = &self.config;
        let mut connection =
            ArchiveConnection::open(self.transport.as_mut(), &self.archive, config.max_attempts)?;

        if !objects.is_empty() {
            let paths: Vec<String> = objects.iter().flat_map(|r| r.remote_paths()).collect();
            let removed: HashSet<String> = connection.delete(&paths)?.into_iter().collect();

            for request in objects {
                if request.remote_paths().iter().all(|path| removed.contains(path)) {
                    deleted.extend(request.addresses.iter().cloned());
                } else {
                    log::error!("unable to delete {}", request.key);
                }
            }
        }

        if !containers.is_empty() {
            let files: BTreeMap<String, _> = containers
                .iter()
                .enumerate()
                .map(|(index, request)| {
                    (request.key.remote_path(), tmpdir.join(format!("{}.tar", index)))
                })
                .collect();
            connection.bulk_get(&files)?;

            for (index, request) in containers.iter().enumerate() {
                let tar = tmpdir.join(format!("{}.tar", index));
                match Self::delete_container_entries(&mut connection, config, request, &tar) {
                    Ok(list) => deleted.extend(list),
                    Err(err) => log::error!("{}", err),
                }
            }
        }

        if let Err(err) = connection.close() {
            log::warn!("closing archive {} failed - {}", self.archive.name, err);
        }

        Ok(())
    }

    /// Delete archived files.
    ///
    /// Direct files are removed, split files with all their parts.
    /// Container entries are removed from the container, which is
    /// deleted when it gets empty. Containers which are not stored yet
    /// are updated inside the workspace.
    ///
    /// Returns the deleted addresses.
    pub fn delete_files(&mut self, requests: &[DeleteRequest]) -> Result<Vec<ArchiveAddress>, Error> {
        let mut deleted = Vec::new();
        let mut objects = Vec::new();
        let mut containers = Vec::new();

        for request in requests {
            if request.key.archive != self.archive.name {
                log::error!(
                    "skip deleting {} - not in archive '{}'",
                    request.key,
                    self.archive.name
                );
                continue;
            }

            let entries = match &request.kind {
                RequestKind::Container { entries } => entries,
                _ => {
                    objects.push(request);
                    continue;
                }
            };

            match self
                .containers
                .delete_local_entries(&request.key.node, &request.key.file_name, entries)
            {
                Ok(Some(removed)) => deleted.extend(container_addresses(request, &removed)),
                Ok(None) => containers.push(request),
                Err(err) => log::error!("unable to delete entries of {} - {}", request.key, err),
            }
        }

        if objects.is_empty() && containers.is_empty() {
            return Ok(deleted);
        }

        let tmpdir = self.workspace.create_tmp_dir("delete")?;
        let result = self.delete_remote(&objects, &containers, &tmpdir, &mut deleted);
        if let Err(err) = remove_dir_if_exists(&tmpdir) {
            log::warn!("unable to remove {:?} - {}", tmpdir, err);
        }
        result?;

        Ok(deleted)
    }
}
