//! Data models for tagshelf-ingest
//!
//! - `ScannedFile`: one observed file in one scan run
//! - `AlbumGroup`: computed view over files sharing a group id
//! - `CapacityStatus`: probe state for one monitored path

pub mod album_group;
pub mod capacity;
pub mod scanned_file;

pub use album_group::AlbumGroup;
pub use capacity::{CapacityLevel, CapacityStatus};
pub use scanned_file::{album_relative_paths, ScannedFile, TagFields};
