//! Archive addresses
//!
//! Every file stored in the archive is addressed by an URL:
//!
//! `staf://<archive><node>/<file_name>[?parts=<N>|?filename=<entry>]`
//!
//! The node is an absolute path (the root node `/` is omitted), the file
//! name is the name of the remote object. `parts=N` means the remote
//! object was cut into N parts, `filename=<entry>` addresses the entry
//! `<entry>` inside the remote tar container. Path segments and the entry
//! name are percent encoded.

use std::fmt;
use std::str::FromStr;

use anyhow::Error;
use lazy_static::lazy_static;
use percent_encoding::percent_decode_str;
use regex::Regex;

use staf_api_types::percent_encoding::{percent_encode_query_value, percent_encode_segment};
use staf_api_types::STAF_SAFE_ID_REGEX;

use super::{ArchiveError, STAF_URL_SCHEME};

lazy_static! {
    static ref ARCHIVE_ADDRESS_REGEX: Regex =
        Regex::new(r"^staf://([^/?#]+)(/[^?#]*)(?:\?([^#]*))?$").unwrap();
}

/// How the addressed file is stored inside the remote object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressMode {
    /// The remote object is the file itself
    Direct,
    /// The file was cut into `parts` remote objects
    Split { parts: u32 },
    /// The file is the entry `entry` of a tar container
    Container { entry: String },
}

/// Decoded archive URL
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveAddress {
    pub archive: String,
    pub node: String,
    pub file_name: String,
    pub mode: AddressMode,
}

/// Identifies one remote object: (archive, node, file_name)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalKey {
    pub archive: String,
    pub node: String,
    pub file_name: String,
}

impl PhysicalKey {
    /// Path of the object inside the archive, as used by the transport.
    pub fn remote_path(&self) -> String {
        remote_path(&self.node, &self.file_name)
    }
}

impl fmt::Display for PhysicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.archive, self.remote_path())
    }
}

/// Path of a remote object inside the archive.
pub fn remote_path(node: &str, file_name: &str) -> String {
    if node == "/" {
        format!("/{}", file_name)
    } else {
        format!("{}/{}", node, file_name)
    }
}

/// Remote file name of part `index` of a split file.
pub fn split_part_name(file_name: &str, index: usize) -> String {
    format!("{}_0{}", file_name, index)
}

fn check_segment(segment: &str) -> Result<(), String> {
    if segment.is_empty() {
        return Err(String::from("empty path component"));
    }
    if segment == "." || segment == ".." {
        return Err(format!("invalid path component '{}'", segment));
    }
    if segment.contains('/') || segment.contains('\0') {
        return Err(format!("path component '{}' contains invalid characters", segment));
    }
    Ok(())
}

/// Check that `node` is a normalized absolute path.
pub fn check_node_path(node: &str) -> Result<(), String> {
    if node == "/" {
        return Ok(());
    }
    match node.strip_prefix('/') {
        Some(rest) => rest.split('/').try_for_each(check_segment),
        None => Err(format!("node '{}' is not an absolute path", node)),
    }
}

fn decode_component(raw: &str) -> Result<String, String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|err| format!("invalid percent encoding in '{}' - {}", raw, err))
}

impl ArchiveAddress {
    /// Create a new address, checking all components.
    pub fn new<A, N, F>(archive: A, node: N, file_name: F, mode: AddressMode) -> Result<Self, Error>
    where
        A: Into<String>,
        N: Into<String>,
        F: Into<String>,
    {
        let address = Self {
            archive: archive.into(),
            node: node.into(),
            file_name: file_name.into(),
            mode,
        };
        address
            .check()
            .map_err(|reason| ArchiveError::malformed(address.to_string(), reason))?;
        Ok(address)
    }

    fn check(&self) -> Result<(), String> {
        if !STAF_SAFE_ID_REGEX.is_match(&self.archive) {
            return Err(format!("invalid archive name '{}'", self.archive));
        }
        check_node_path(&self.node)?;
        check_segment(&self.file_name)?;
        match &self.mode {
            AddressMode::Direct => Ok(()),
            AddressMode::Split { parts } if *parts == 0 => {
                Err(String::from("part count must be positive"))
            }
            AddressMode::Split { .. } => Ok(()),
            AddressMode::Container { entry } => check_segment(entry),
        }
    }

    pub fn physical_key(&self) -> PhysicalKey {
        PhysicalKey {
            archive: self.archive.clone(),
            node: self.node.clone(),
            file_name: self.file_name.clone(),
        }
    }

    /// Encode as `staf://` URL.
    pub fn encode(&self) -> String {
        let mut url = format!("{}://{}", STAF_URL_SCHEME, self.archive);
        if self.node != "/" {
            for segment in self.node.split('/').skip(1) {
                url.push('/');
                url.push_str(&percent_encode_segment(segment));
            }
        }
        url.push('/');
        url.push_str(&percent_encode_segment(&self.file_name));

        match &self.mode {
            AddressMode::Direct => {}
            AddressMode::Split { parts } => {
                url.push_str(&format!("?parts={}", parts));
            }
            AddressMode::Container { entry } => {
                url.push_str("?filename=");
                url.push_str(&percent_encode_query_value(entry));
            }
        }
        url
    }

    /// Decode a `staf://` URL.
    pub fn decode(url: &str) -> Result<Self, Error> {
        Self::decode_raw(url).map_err(|reason| ArchiveError::malformed(url, reason).into())
    }

    fn decode_raw(url: &str) -> Result<Self, String> {
        let caps = ARCHIVE_ADDRESS_REGEX
            .captures(url)
            .ok_or_else(|| String::from("not a valid staf url"))?;

        let archive = caps[1].to_string();
        let path = &caps[2];

        // path always starts with '/'
        let pos = path.rfind('/').unwrap_or(0);
        let (node_raw, file_raw) = (&path[..pos], &path[pos + 1..]);

        let node = if node_raw.is_empty() {
            String::from("/")
        } else {
            let mut node = String::new();
            for segment in node_raw.split('/').skip(1) {
                let segment = decode_component(segment)?;
                check_segment(&segment)?;
                node.push('/');
                node.push_str(&segment);
            }
            node
        };

        let file_name = decode_component(file_raw)?;

        let mode = match caps.get(3).map(|m| m.as_str()) {
            None => AddressMode::Direct,
            Some(query) => {
                if query.contains('&') {
                    return Err(String::from("only one query parameter is allowed"));
                }
                let (key, value) = query
                    .split_once('=')
                    .ok_or_else(|| format!("invalid query '{}'", query))?;
                match key {
                    "parts" => {
                        let parts: u32 = value
                            .parse()
                            .map_err(|_| format!("invalid part count '{}'", value))?;
                        AddressMode::Split { parts }
                    }
                    "filename" => AddressMode::Container {
                        entry: decode_component(value)?,
                    },
                    _ => return Err(format!("unknown query parameter '{}'", key)),
                }
            }
        };

        let address = Self {
            archive,
            node,
            file_name,
            mode,
        };
        address.check()?;

        Ok(address)
    }
}

impl fmt::Display for ArchiveAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ArchiveAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
