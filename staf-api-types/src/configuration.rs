use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use proxmox_schema::api;

use crate::{ArchiveAccessMode, STAF_SERVICE_CLASS_FORMAT};

pub const DEFAULT_MIN_FILE_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_CONTAINER_SIZE_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const DEFAULT_CONTAINER_MAX_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_CONTAINER_MAX_AGE_HOURS: u64 = 24;
pub const DEFAULT_SPLIT_PARTS: u64 = 4;
pub const DEFAULT_MAX_ATTEMPTS: u64 = 3;
pub const DEFAULT_MAX_SESSIONS: u64 = 2;
pub const DEFAULT_MAX_SESSION_STREAMS: u64 = 2;
pub const DEFAULT_MAX_STREAM_FILES: u64 = 50;
pub const DEFAULT_SERVICE_CLASS_THRESHOLD: u64 = 50_000_000;

fn default_min_file_size() -> u64 {
    DEFAULT_MIN_FILE_SIZE
}
fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}
fn default_container_size_threshold() -> u64 {
    DEFAULT_CONTAINER_SIZE_THRESHOLD
}
fn default_container_max_size() -> u64 {
    DEFAULT_CONTAINER_MAX_SIZE
}
fn default_container_max_age_hours() -> u64 {
    DEFAULT_CONTAINER_MAX_AGE_HOURS
}
fn default_split_parts() -> u64 {
    DEFAULT_SPLIT_PARTS
}
fn default_max_attempts() -> u64 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_max_sessions() -> u64 {
    DEFAULT_MAX_SESSIONS
}
fn default_max_session_streams() -> u64 {
    DEFAULT_MAX_SESSION_STREAMS
}
fn default_max_stream_files() -> u64 {
    DEFAULT_MAX_STREAM_FILES
}
fn default_little_file_class() -> String {
    String::from("CS1")
}
fn default_bigger_file_class() -> String {
    String::from("CS3")
}
fn default_service_class_threshold() -> u64 {
    DEFAULT_SERVICE_CLASS_THRESHOLD
}

/// Concurrency limits for one archive access mode
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionLimits {
    /// Number of sessions which can be open at the same time
    pub max_sessions: usize,
    /// Number of transfer streams per session (checked, bulk calls of a
    /// session are sequential)
    pub max_session_streams: usize,
    /// Number of files sent with a single bulk put
    pub max_stream_files: usize,
}

#[api(
    properties: {
        "min-file-size": {
            type: u64,
            optional: true,
            default: 1_048_576,
        },
        "max-file-size": {
            type: u64,
            optional: true,
            default: 1_073_741_824,
        },
        "container-size-threshold": {
            type: u64,
            optional: true,
            default: 104_857_600,
        },
        "container-max-size": {
            type: u64,
            optional: true,
            default: 1_073_741_824,
        },
        "container-max-age-hours": {
            type: u64,
            optional: true,
            default: 24,
        },
        "split-parts": {
            type: u64,
            minimum: 1,
            maximum: 999,
            optional: true,
            default: 4,
        },
        "max-attempts": {
            type: u64,
            minimum: 1,
            optional: true,
            default: 3,
        },
        "max-archiving-sessions": {
            type: u64,
            minimum: 1,
            maximum: 256,
            optional: true,
            default: 2,
        },
        "max-archiving-session-streams": {
            type: u64,
            minimum: 1,
            optional: true,
            default: 2,
        },
        "max-archiving-stream-files": {
            type: u64,
            minimum: 1,
            optional: true,
            default: 50,
        },
        "max-restitution-sessions": {
            type: u64,
            minimum: 1,
            maximum: 256,
            optional: true,
            default: 2,
        },
        "max-restitution-session-streams": {
            type: u64,
            minimum: 1,
            optional: true,
            default: 2,
        },
        "max-restitution-stream-files": {
            type: u64,
            minimum: 1,
            optional: true,
            default: 50,
        },
        "little-file-class": {
            type: String,
            format: &STAF_SERVICE_CLASS_FORMAT,
            optional: true,
            default: "CS1",
        },
        "bigger-file-class": {
            type: String,
            format: &STAF_SERVICE_CLASS_FORMAT,
            optional: true,
            default: "CS3",
        },
        "service-class-threshold": {
            type: u64,
            optional: true,
            default: 50_000_000,
        },
    },
)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// STAF archive settings
///
/// Files smaller than `min-file-size` are bundled into containers, files
/// bigger than `max-file-size` are cut into `split-parts` parts, and
/// everything in between is stored as it is.
pub struct StafConfiguration {
    /// Files below this size are bundled into containers.
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,
    /// Files above this size are split into parts.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// A container gets closed once it reaches this size.
    #[serde(default = "default_container_size_threshold")]
    pub container_size_threshold: u64,
    /// Upper size limit for a single container.
    ///
    /// A file which would push the open container above this size closes
    /// it and starts a new one. Only a container holding a single file can
    /// be bigger, and never by more than `min-file-size`.
    #[serde(default = "default_container_max_size")]
    pub container_max_size: u64,
    /// A container gets closed once it is older than this (in hours).
    #[serde(default = "default_container_max_age_hours")]
    pub container_max_age_hours: u64,
    /// Number of parts for split files.
    #[serde(default = "default_split_parts")]
    pub split_parts: u64,
    /// Number of attempts to open the archive before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,
    /// Number of concurrent archiving sessions.
    #[serde(default = "default_max_sessions")]
    pub max_archiving_sessions: u64,
    /// Number of transfer streams per archiving session. Checked only,
    /// bulk calls within a session are sequential.
    #[serde(default = "default_max_session_streams")]
    pub max_archiving_session_streams: u64,
    /// Number of files per archiving bulk call.
    #[serde(default = "default_max_stream_files")]
    pub max_archiving_stream_files: u64,
    /// Number of concurrent restitution sessions.
    #[serde(default = "default_max_sessions")]
    pub max_restitution_sessions: u64,
    /// Number of transfer streams per restitution session. Checked only,
    /// bulk calls within a session are sequential.
    #[serde(default = "default_max_session_streams")]
    pub max_restitution_session_streams: u64,
    /// Number of files per restitution stream. Checked only, a restore
    /// always fetches all its objects with one bulk get.
    #[serde(default = "default_max_stream_files")]
    pub max_restitution_stream_files: u64,
    /// Service class for flows of small files.
    #[serde(default = "default_little_file_class")]
    pub little_file_class: String,
    /// Service class for flows containing big files.
    #[serde(default = "default_bigger_file_class")]
    pub bigger_file_class: String,
    /// Flows containing a file above this size use the bigger file class.
    #[serde(default = "default_service_class_threshold")]
    pub service_class_threshold: u64,
}

impl Default for StafConfiguration {
    fn default() -> Self {
        Self {
            min_file_size: DEFAULT_MIN_FILE_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            container_size_threshold: DEFAULT_CONTAINER_SIZE_THRESHOLD,
            container_max_size: DEFAULT_CONTAINER_MAX_SIZE,
            container_max_age_hours: DEFAULT_CONTAINER_MAX_AGE_HOURS,
            split_parts: DEFAULT_SPLIT_PARTS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_archiving_sessions: DEFAULT_MAX_SESSIONS,
            max_archiving_session_streams: DEFAULT_MAX_SESSION_STREAMS,
            max_archiving_stream_files: DEFAULT_MAX_STREAM_FILES,
            max_restitution_sessions: DEFAULT_MAX_SESSIONS,
            max_restitution_session_streams: DEFAULT_MAX_SESSION_STREAMS,
            max_restitution_stream_files: DEFAULT_MAX_STREAM_FILES,
            little_file_class: default_little_file_class(),
            bigger_file_class: default_bigger_file_class(),
            service_class_threshold: DEFAULT_SERVICE_CLASS_THRESHOLD,
        }
    }
}

impl StafConfiguration {
    /// Check the cross-field constraints the schema cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_file_size > self.max_file_size {
            bail!(
                "min-file-size ({}) is bigger than max-file-size ({})",
                self.min_file_size,
                self.max_file_size
            );
        }
        if self.container_size_threshold > self.container_max_size {
            bail!(
                "container-size-threshold ({}) is bigger than container-max-size ({})",
                self.container_size_threshold,
                self.container_max_size
            );
        }
        if self.min_file_size > self.container_max_size {
            bail!(
                "min-file-size ({}) is bigger than container-max-size ({})",
                self.min_file_size,
                self.container_max_size
            );
        }
        if self.split_parts == 0 {
            bail!("split-parts must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max-attempts must be at least 1");
        }
        for mode in [ArchiveAccessMode::Archiving, ArchiveAccessMode::Restitution] {
            let limits = self.session_limits(mode);
            if limits.max_sessions == 0
                || limits.max_session_streams == 0
                || limits.max_stream_files == 0
            {
                bail!("{} session limits must be at least 1", mode);
            }
        }
        if self.little_file_class.is_empty() || self.bigger_file_class.is_empty() {
            bail!("service classes must not be empty");
        }
        Ok(())
    }

    pub fn session_limits(&self, mode: ArchiveAccessMode) -> SessionLimits {
        match mode {
            ArchiveAccessMode::Archiving => SessionLimits {
                max_sessions: self.max_archiving_sessions as usize,
                max_session_streams: self.max_archiving_session_streams as usize,
                max_stream_files: self.max_archiving_stream_files as usize,
            },
            ArchiveAccessMode::Restitution => SessionLimits {
                max_sessions: self.max_restitution_sessions as usize,
                max_session_streams: self.max_restitution_session_streams as usize,
                max_stream_files: self.max_restitution_stream_files as usize,
            },
        }
    }

    /// Service class used for a flow whose biggest file has `size` bytes.
    pub fn service_class(&self, size: u64) -> &str {
        if size > self.service_class_threshold {
            &self.bigger_file_class
        } else {
            &self.little_file_class
        }
    }

    /// Container age limit in seconds.
    pub fn container_max_age(&self) -> i64 {
        (self.container_max_age_hours as i64).saturating_mul(3600)
    }
}
