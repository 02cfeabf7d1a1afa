//! Filesystem and network helpers.

pub mod fs;
pub mod net;

pub use fs::ensure_dir_exists;
