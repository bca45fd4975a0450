use std::path::Path;

use anyhow::{bail, Error};

use staf_api_types::StafConfiguration;
use staf_tools::fs::{copy_file_range, remove_dir_if_exists};

use super::{split_part_name, ArchiveError, ArchiveWorkspace, SplitFile, SplitPart};

/// Cuts big files into parts
///
/// Every file is cut into the configured number of parts. All parts have
/// the same length, except the last one which also gets the remainder.
/// Parts are written to `<tmp>/<node>/<stored_name>/<stored_name>_0<i>`.
pub struct SplitManager {
    parts: usize,
    workspace: ArchiveWorkspace,
}

/// Compute `(offset, length)` of each part.
pub fn split_ranges(size: u64, parts: usize) -> Vec<(u64, u64)> {
    let parts = parts.max(1) as u64;
    let length = size / parts;
    (0..parts)
        .map(|i| {
            let offset = i * length;
            if i == parts - 1 {
                (offset, size - offset)
            } else {
                (offset, length)
            }
        })
        .collect()
}

impl SplitManager {
    pub fn new(workspace: ArchiveWorkspace, config: &StafConfiguration) -> Self {
        Self {
            parts: config.split_parts as usize,
            workspace,
        }
    }

    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Write the parts of `source` into the temporary area of `node`.
    pub fn split(
        &self,
        node: &str,
        source: &Path,
        stored_name: &str,
        size: u64,
    ) -> Result<SplitFile, Error> {
        if self.parts == 0 {
            bail!("invalid split part count 0");
        }

        let dir = self.workspace.tmp_dir(node).join(stored_name);
        remove_dir_if_exists(&dir)?;
        std::fs::create_dir_all(&dir).map_err(|err| ArchiveError::local_io(&dir, err))?;

        let mut parts = Vec::with_capacity(self.parts);
        for (index, (offset, length)) in split_ranges(size, self.parts).into_iter().enumerate() {
            let local_path = dir.join(split_part_name(stored_name, index));
            if let Err(err) = copy_file_range(source, offset, length, &local_path) {
                let _ = remove_dir_if_exists(&dir);
                return Err(ArchiveError::local_io(source, err).into());
            }
            parts.push(SplitPart {
                index,
                offset,
                length,
                local_path,
            });
        }

        log::debug!("split {:?} into {} parts", source, parts.len());

        Ok(SplitFile {
            source: source.to_owned(),
            stored_name: stored_name.to_string(),
            size,
            parts,
        })
    }

    /// Remove the part files.
    pub fn cleanup(&self, node: &str, file: &SplitFile) -> Result<(), Error> {
        remove_dir_if_exists(self.workspace.tmp_dir(node).join(&file.stored_name))
    }
}
