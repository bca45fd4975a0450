use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use super::{ArchiveError, CONTAINER_DIR_NAME, TMP_DIR_NAME};

/// Local working directory of one archive
///
/// Layout:
///
/// ```text
/// <base>/<archive>/tar/<node>/   containers (see ContainerManager)
/// <base>/<archive>/tmp/<node>/   split file parts
/// ```
#[derive(Clone, Debug)]
pub struct ArchiveWorkspace {
    root: PathBuf,
}

fn node_relative(node: &str) -> &Path {
    Path::new(node.trim_start_matches('/'))
}

impl ArchiveWorkspace {
    pub fn new<P: AsRef<Path>>(base: P, archive: &str) -> Self {
        let mut root = base.as_ref().to_owned();
        root.push(archive);
        Self { root }
    }

    /// Create the workspace directories and check that we can write there.
    pub fn init(&self) -> Result<(), Error> {
        for dir in [self.container_root(), self.tmp_root()] {
            proxmox_sys::fs::create_path(&dir, None, None)
                .map_err(|err| ArchiveError::local_io(&dir, err))?;
            staf_tools::fs::check_dir_writable(&dir)
                .map_err(|err| ArchiveError::local_io(&dir, err))?;
        }
        log::debug!("initialized workspace {:?}", self.root);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_root(&self) -> PathBuf {
        self.root.join(CONTAINER_DIR_NAME)
    }

    pub fn tmp_root(&self) -> PathBuf {
        self.root.join(TMP_DIR_NAME)
    }

    /// Container directory of `node`.
    pub fn container_dir(&self, node: &str) -> PathBuf {
        self.container_root().join(node_relative(node))
    }

    /// Temporary directory of `node`.
    pub fn tmp_dir(&self, node: &str) -> PathBuf {
        self.tmp_root().join(node_relative(node))
    }

    /// Create a fresh, empty directory inside the temporary area.
    pub fn create_tmp_dir(&self, prefix: &str) -> Result<PathBuf, Error> {
        let dir = staf_tools::fs::available_file_name(
            self.tmp_root(),
            &format!("{}-{}", prefix, proxmox_time::epoch_i64()),
        );
        std::fs::create_dir_all(&dir)
            .map_err(|err| format_err!("unable to create {:?} - {}", dir, err))?;
        Ok(dir)
    }
}
