//! STAF archive management
//!
//! Local files are sent to a remote STAF archive using one of three
//! storage modes, selected by file size:
//!
//! - files between `min-file-size` and `max-file-size` are stored
//!   directly, using the md5sum of their content as remote file name.
//!
//! - smaller files are bundled into tar containers. There is at most one
//!   open container per node. It stays on local disk until it is big or
//!   old enough (see [ContainerManager]).
//!
//! - bigger files are cut into `split-parts` parts (see [SplitManager]).
//!
//! Every stored file is addressed by an [ArchiveAddress], which encodes
//! the storage mode (see [address]).
//!
//! Sessions
//!
//! Connections to the archive are limited per access mode. Controllers
//! reserve a session from the shared [SessionPoolManager] for each call
//! which talks to the archive, and open exactly one connection with it.
//!
//! Workspace Locking
//!
//! Each node directory in the local workspace has its own lock file.
//! Container preparation takes the exclusive lock, local restores take
//! a shared one.

use std::path::PathBuf;

pub mod address;
pub use address::*;

mod session_pool;
pub use session_pool::*;

mod physical_file;
pub use physical_file::*;

mod workspace;
pub use workspace::*;

mod container;
pub use container::*;

mod split;
pub use split::*;

mod transport;
pub use transport::*;

mod request;
pub use request::*;

mod controller;
pub use controller::*;

mod restore;
pub use restore::*;

mod delete;

pub mod virtual_archive;

#[cfg(test)]
mod test;

/// URL scheme used for archive addresses
pub const STAF_URL_SCHEME: &str = "staf";

/// Name of the container directory inside the workspace
pub const CONTAINER_DIR_NAME: &str = "tar";

/// Name of the temporary directory inside the workspace
pub const TMP_DIR_NAME: &str = "tmp";

/// Errors callers may want to distinguish
///
/// Controllers return [anyhow::Error]; use `downcast_ref::<ArchiveError>()`
/// to get at these.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("malformed archive address '{address}' - {reason}")]
    MalformedAddress { address: String, reason: String },
    #[error("archive transport failed - {0}")]
    Transport(String),
    #[error("remote object '{0}' is missing")]
    MissingRemoteObject(String),
    #[error("local I/O error on {path:?} - {reason}")]
    LocalIo { path: PathBuf, reason: String },
    #[error("entry '{entry}' already exists in container '{container}'")]
    EntryNameCollision { container: String, entry: String },
    #[error("invalid configuration - {0}")]
    Configuration(String),
    #[error("session {0} is not reserved")]
    SessionNotReserved(SessionId),
}

impl ArchiveError {
    pub(crate) fn malformed<A: Into<String>, R: ToString>(address: A, reason: R) -> Self {
        Self::MalformedAddress {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn local_io<P: Into<PathBuf>, R: ToString>(path: P, reason: R) -> Self {
        Self::LocalIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
