use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Error;

use staf_api_types::StafArchive;

use super::ArchiveError;

/// Remote archive access
///
/// Implementations are not required to be thread safe; controllers issue
/// all calls of one connection sequentially.
pub trait ArchiveTransport: Send {
    /// Open a connection to the archive.
    fn open(&mut self, archive: &str, password: &str) -> Result<(), Error>;

    /// Close the connection.
    fn close(&mut self) -> Result<(), Error>;

    /// Store files (local path => remote path), replacing existing ones.
    ///
    /// Returns the remote paths stored successfully. An error means the
    /// whole call failed.
    fn bulk_put(
        &mut self,
        files: &BTreeMap<PathBuf, String>,
        service_class: &str,
        replicate: bool,
    ) -> Result<Vec<String>, Error>;

    /// Retrieve files (remote path => local path).
    ///
    /// Files which cannot be retrieved are simply missing afterwards. An
    /// error means the whole call failed.
    fn bulk_get(&mut self, files: &BTreeMap<String, PathBuf>) -> Result<(), Error>;

    /// Delete remote files, returns the remote paths actually deleted.
    fn delete(&mut self, files: &[String]) -> Result<Vec<String>, Error>;
}

/// An open archive connection, closed on drop
pub struct ArchiveConnection<'a> {
    transport: &'a mut dyn ArchiveTransport,
    archive: String,
    closed: bool,
}

impl<'a> ArchiveConnection<'a> {
    /// Open the archive, trying up to `attempts` times.
    pub fn open(
        transport: &'a mut dyn ArchiveTransport,
        archive: &StafArchive,
        attempts: u64,
    ) -> Result<Self, Error> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match transport.open(&archive.name, &archive.password) {
                Ok(()) => break,
                Err(err) if attempt < attempts => {
                    log::warn!(
                        "opening archive {} failed (attempt {}/{}) - {}",
                        archive.name,
                        attempt,
                        attempts,
                        err
                    );
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ArchiveError::Transport(format!(
                        "unable to open archive {} - {}",
                        archive.name, err
                    ))
                    .into());
                }
            }
        }

        Ok(Self {
            transport,
            archive: archive.name.clone(),
            closed: false,
        })
    }

    pub fn bulk_put(
        &mut self,
        files: &BTreeMap<PathBuf, String>,
        service_class: &str,
        replicate: bool,
    ) -> Result<Vec<String>, Error> {
        self.transport
            .bulk_put(files, service_class, replicate)
            .map_err(|err| ArchiveError::Transport(format!("bulk put failed - {}", err)).into())
    }

    pub fn bulk_get(&mut self, files: &BTreeMap<String, PathBuf>) -> Result<(), Error> {
        self.transport
            .bulk_get(files)
            .map_err(|err| ArchiveError::Transport(format!("bulk get failed - {}", err)).into())
    }

    pub fn delete(&mut self, files: &[String]) -> Result<Vec<String>, Error> {
        self.transport
            .delete(files)
            .map_err(|err| ArchiveError::Transport(format!("delete failed - {}", err)).into())
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        self.transport.close()
    }
}

impl Drop for ArchiveConnection<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.transport.close() {
                log::warn!("closing archive {} failed - {}", self.archive, err);
            }
        }
    }
}
