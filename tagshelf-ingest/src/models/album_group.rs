//! Album group view
//!
//! Never persisted on its own: always recomputable from the staged files
//! sharing a group id.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Files sharing one group id, summarized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumGroup {
    pub group_id: String,
    pub group_hash: String,
    /// Most common effective artist among the members
    pub artist: String,
    /// Most common album title among the members
    pub album: String,
    /// Year chosen by the year vote (None when no member had a year)
    pub year: Option<i32>,
    pub track_count: usize,
    pub total_size: u64,
    /// Member paths, sorted
    pub member_paths: Vec<PathBuf>,
}
