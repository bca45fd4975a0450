//! Basic API types used by most of the STAF archive code.

use proxmox_schema::{const_regex, ApiStringFormat, Schema, StringSchema};

pub mod percent_encoding;

mod archive;
pub use archive::*;

mod configuration;
pub use configuration::*;

#[rustfmt::skip]
#[macro_export]
macro_rules! STAF_SAFE_ID_REGEX_STR { () => { r"(?:[A-Za-z0-9_][A-Za-z0-9._\-]*)" }; }

#[rustfmt::skip]
#[macro_export]
macro_rules! STAF_SERVICE_CLASS_REGEX_STR { () => { r"(?:[A-Z][A-Z0-9]{1,7})" }; }

const_regex! {
    pub STAF_SAFE_ID_REGEX = concat!(r"^", STAF_SAFE_ID_REGEX_STR!(), r"$");
    pub STAF_SERVICE_CLASS_REGEX = concat!(r"^", STAF_SERVICE_CLASS_REGEX_STR!(), r"$");
    pub PASSWORD_REGEX = r"^[[:^cntrl:]]*$"; // everything but control characters
}

pub const STAF_SAFE_ID_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&STAF_SAFE_ID_REGEX);

pub const STAF_SERVICE_CLASS_FORMAT: ApiStringFormat =
    ApiStringFormat::Pattern(&STAF_SERVICE_CLASS_REGEX);

pub const PASSWORD_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&PASSWORD_REGEX);

pub const STAF_ARCHIVE_NAME_SCHEMA: Schema = StringSchema::new("STAF archive name.")
    .format(&STAF_SAFE_ID_FORMAT)
    .min_length(1)
    .max_length(64)
    .schema();

pub const STAF_PASSWORD_SCHEMA: Schema = StringSchema::new("STAF archive password.")
    .format(&PASSWORD_FORMAT)
    .min_length(1)
    .max_length(1024)
    .schema();
