//! Tiered archival storage on top of a STAF tape archive.
//!
//! Files are stored directly, bundled into tar containers or cut into
//! parts depending on their size. See [archive] for details.

pub mod archive;
