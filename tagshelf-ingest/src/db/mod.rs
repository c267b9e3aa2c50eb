//! Database access
//!
//! The long-lived catalog (`artists`, `artist_directory_codes`, `jobs`,
//! `capacity_status`) is created by `tagshelf_common::db::init`. Each scan
//! run writes to its own [`staging::StagingStore`].

pub mod artists;
pub mod capacity;
pub mod directory_codes;
pub mod jobs;
pub mod staging;

pub use jobs::SqliteJobQueue;
pub use staging::StagingStore;
