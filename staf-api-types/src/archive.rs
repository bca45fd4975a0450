use serde::{Deserialize, Serialize};

use proxmox_schema::api;

use crate::{STAF_ARCHIVE_NAME_SCHEMA, STAF_PASSWORD_SCHEMA};

#[api()]
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Access mode of an archive session
pub enum ArchiveAccessMode {
    /// Sessions used to store files
    Archiving,
    /// Sessions used to retrieve files
    Restitution,
}
serde_plain::derive_display_from_serialize!(ArchiveAccessMode);
serde_plain::derive_fromstr_from_deserialize!(ArchiveAccessMode);

#[api()]
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Lifecycle status of a physical file
pub enum PhysicalFileStatus {
    /// Created, but not yet prepared
    PendingPrepare,
    /// Prepared and ready to be sent to the archive
    ReadyToStore,
    /// Kept on local disk (container not big or old enough yet)
    PendingLocal,
    /// Successfully stored
    Stored,
    /// Transfer failed
    Failed,
}
serde_plain::derive_display_from_serialize!(PhysicalFileStatus);

#[api(
    properties: {
        name: {
            schema: STAF_ARCHIVE_NAME_SCHEMA,
        },
        password: {
            schema: STAF_PASSWORD_SCHEMA,
        },
    },
)]
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Remote STAF archive access.
pub struct StafArchive {
    pub name: String,
    // Note: The stored password is base64 encoded
    #[serde(default, skip_serializing_if = "String::is_empty")]
    #[serde(with = "proxmox_serde::string_as_base64")]
    pub password: String,
}

impl std::fmt::Debug for StafArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StafArchive")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
