use std::path::PathBuf;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use staf_api_types::PhysicalFileStatus;

use super::{remote_path, split_part_name, AddressMode, ArchiveAddress};

/// A file stored as it is
#[derive(Clone, Debug)]
pub struct DirectFile {
    pub source: PathBuf,
    /// md5sum of the content, used as remote file name
    pub stored_name: String,
    pub size: u64,
}

/// One source file inside a container
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerMember {
    /// Entry name inside the tar
    pub entry: String,
    /// The original file (unknown if the member state got lost)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Byte offset of the member inside the container content
    pub offset: u64,
    pub size: u64,
}

/// A tar container bundling small files
#[derive(Clone, Debug)]
pub struct ContainerFile {
    /// Remote file name (`<ctime>.tar`)
    pub name: String,
    pub creation_time: i64,
    pub size: u64,
    pub members: Vec<ContainerMember>,
    pub closed: bool,
    /// The tar file when closed, otherwise the staging directory
    pub local_path: PathBuf,
}

/// One part of a split file
#[derive(Clone, Debug)]
pub struct SplitPart {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    pub local_path: PathBuf,
}

/// A big file cut into parts
#[derive(Clone, Debug)]
pub struct SplitFile {
    pub source: PathBuf,
    /// md5sum of the content, part names are derived from it
    pub stored_name: String,
    pub size: u64,
    pub parts: Vec<SplitPart>,
}

#[derive(Clone, Debug)]
pub enum PhysicalFileKind {
    Direct(DirectFile),
    Container(ContainerFile),
    Split(SplitFile),
}

/// Something we send to the archive as one or more remote objects
#[derive(Clone, Debug)]
pub struct PhysicalFile {
    pub status: PhysicalFileStatus,
    pub archive: String,
    pub node: String,
    pub kind: PhysicalFileKind,
}

/// One local file to transfer, and its remote path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferUnit {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
}

impl PhysicalFile {
    pub fn new(archive: &str, node: &str, kind: PhysicalFileKind) -> Self {
        Self {
            status: PhysicalFileStatus::PendingPrepare,
            archive: archive.to_string(),
            node: node.to_string(),
            kind,
        }
    }

    pub fn with_status(mut self, status: PhysicalFileStatus) -> Self {
        self.status = status;
        self
    }

    /// Remote file name of the object (split files: name without part suffix)
    pub fn stored_name(&self) -> &str {
        match &self.kind {
            PhysicalFileKind::Direct(file) => &file.stored_name,
            PhysicalFileKind::Container(container) => &container.name,
            PhysicalFileKind::Split(file) => &file.stored_name,
        }
    }

    /// Local files to send, one per remote object.
    pub fn transfer_units(&self) -> Vec<TransferUnit> {
        match &self.kind {
            PhysicalFileKind::Direct(file) => vec![TransferUnit {
                local_path: file.source.clone(),
                remote_path: remote_path(&self.node, &file.stored_name),
                size: file.size,
            }],
            PhysicalFileKind::Container(container) => vec![TransferUnit {
                local_path: container.local_path.clone(),
                remote_path: remote_path(&self.node, &container.name),
                size: container.size,
            }],
            PhysicalFileKind::Split(file) => file
                .parts
                .iter()
                .map(|part| TransferUnit {
                    local_path: part.local_path.clone(),
                    remote_path: remote_path(
                        &self.node,
                        &split_part_name(&file.stored_name, part.index),
                    ),
                    size: part.length,
                })
                .collect(),
        }
    }

    /// Addresses of all original source files now held by this file.
    ///
    /// Container members without known source are skipped.
    pub fn source_addresses(&self) -> Result<Vec<(PathBuf, ArchiveAddress)>, Error> {
        let mut list = Vec::new();
        match &self.kind {
            PhysicalFileKind::Direct(file) => {
                let address = ArchiveAddress::new(
                    &self.archive,
                    &self.node,
                    &file.stored_name,
                    AddressMode::Direct,
                )?;
                list.push((file.source.clone(), address));
            }
            PhysicalFileKind::Split(file) => {
                let address = ArchiveAddress::new(
                    &self.archive,
                    &self.node,
                    &file.stored_name,
                    AddressMode::Split {
                        parts: file.parts.len() as u32,
                    },
                )?;
                list.push((file.source.clone(), address));
            }
            PhysicalFileKind::Container(container) => {
                for member in container.members.iter() {
                    if let Some(source) = &member.source {
                        let address = ArchiveAddress::new(
                            &self.archive,
                            &self.node,
                            &container.name,
                            AddressMode::Container {
                                entry: member.entry.clone(),
                            },
                        )?;
                        list.push((source.clone(), address));
                    }
                }
            }
        }
        Ok(list)
    }
}
