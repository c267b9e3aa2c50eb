//! Album grouping engine
//!
//! Clusters staged files into album groups in two deterministic passes over
//! records addressed by their staging row id:
//!
//! 1. Identity key: `lowercase(trim(effective artist)) + "::" + normalize(album)`
//! 2. Year refinement: the most frequent year within each identity group
//!    becomes part of the group id (`<key>_<year>`)
//!
//! Both passes are pure functions of the input records, so re-running
//! grouping on unchanged data reproduces identical assignments.

use crate::db::staging::StagingStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tagshelf_common::Result;
use tracing::info;

/// Effective artist used when neither artist nor album artist is set
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Year token for groups where no member carries a year
pub const UNKNOWN_YEAR: &str = "unknown";

/// Bracketed edition/remaster markers, e.g. "(Remastered 2011)", "[Deluxe Edition]"
static EDITION_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[\(\[\{][^\)\]\}]*\b(remaster|remastered|deluxe|edition|expanded|anniversary|bonus|reissue|special|limited)\b[^\)\]\}]*[\)\]\}]",
    )
    .expect("edition marker regex should compile")
});

/// Dash-separated trailing markers, e.g. "Abbey Road - 2019 Remaster"
static TRAILING_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s+-\s+[^-]*\b(remaster|remastered|deluxe|edition|expanded|anniversary)\b[^-]*$")
        .expect("trailing marker regex should compile")
});

static LEADING_THE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^the\s+").expect("leading article regex should compile"));

/// Year tie-break policy for the stage-2 vote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearTieBreak {
    /// Prefer the larger year
    #[default]
    MostRecent,
    /// Prefer the smaller year
    Oldest,
}

/// Grouping input: the fields of one valid staged file the passes look at
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingRecord {
    pub id: i64,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<i32>,
}

/// Grouping output for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAssignment {
    pub id: i64,
    pub group_id: String,
    pub group_hash: String,
}

/// Album artist if non-empty, else artist, else [`UNKNOWN_ARTIST`]
pub fn effective_artist<'a>(artist: Option<&'a str>, album_artist: Option<&'a str>) -> &'a str {
    album_artist
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| artist.map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or(UNKNOWN_ARTIST)
}

/// Normalize an album title for the identity key
///
/// Lowercases, strips edition/remaster/deluxe markers and a leading "the",
/// then removes all whitespace. An empty title normalizes to an empty string,
/// which groups by artist alone.
pub fn normalize_album(album: &str) -> String {
    let lowered = album.trim().to_lowercase();
    let without_brackets = EDITION_MARKER.replace_all(&lowered, " ");
    let without_trailing = TRAILING_MARKER.replace(without_brackets.trim(), "");
    let without_the = LEADING_THE.replace(without_trailing.trim(), "");
    without_the.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Stage-1 identity key for one record
pub fn identity_key(record: &GroupingRecord) -> String {
    let artist = effective_artist(record.artist.as_deref(), record.album_artist.as_deref());
    format!(
        "{}::{}",
        artist.to_lowercase(),
        normalize_album(record.album.as_deref().unwrap_or(""))
    )
}

/// Stable short hash of a group id (first 16 hex chars of its SHA-256)
pub fn group_hash(group_id: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(group_id.as_bytes()));
    digest[..16].to_string()
}

/// Winning year of a stage-1 group; `None` when no member has a year
pub fn vote_year(years: impl IntoIterator<Item = Option<i32>>, tie_break: YearTieBreak) -> Option<i32> {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for year in years.into_iter().flatten() {
        *counts.entry(year).or_default() += 1;
    }

    counts
        .into_iter()
        .max_by(|(year_a, count_a), (year_b, count_b)| {
            count_a.cmp(count_b).then_with(|| match tie_break {
                YearTieBreak::MostRecent => year_a.cmp(year_b),
                YearTieBreak::Oldest => year_b.cmp(year_a),
            })
        })
        .map(|(year, _)| year)
}

/// Run both grouping passes; output is ordered by record id
pub fn group_records(records: &[GroupingRecord], tie_break: YearTieBreak) -> Vec<GroupAssignment> {
    // Stage 1
    let mut provisional: BTreeMap<String, Vec<&GroupingRecord>> = BTreeMap::new();
    for record in records {
        provisional.entry(identity_key(record)).or_default().push(record);
    }

    // Stage 2
    let mut assignments = Vec::with_capacity(records.len());
    for (key, members) in provisional {
        let year = vote_year(members.iter().map(|r| r.year), tie_break);
        let token = year.map_or_else(|| UNKNOWN_YEAR.to_string(), |y| y.to_string());
        let group_id = format!("{}_{}", key, token);
        let hash = group_hash(&group_id);

        assignments.extend(members.into_iter().map(|record| GroupAssignment {
            id: record.id,
            group_id: group_id.clone(),
            group_hash: hash.clone(),
        }));
    }

    assignments.sort_by_key(|a| a.id);
    assignments
}

/// Year encoded in a group id, if any
pub fn year_from_group_id(group_id: &str) -> Option<i32> {
    group_id.rsplit_once('_').and_then(|(_, year)| year.parse().ok())
}

/// Summary of one grouping run
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupingSummary {
    pub records: usize,
    pub groups: usize,
}

/// Applies the grouping passes to a staging store
#[derive(Debug, Clone, Default)]
pub struct AlbumGroupingEngine {
    tie_break: YearTieBreak,
}

impl AlbumGroupingEngine {
    pub fn new(tie_break: YearTieBreak) -> Self {
        Self { tie_break }
    }

    /// Group every valid record in the store and write the assignments back
    /// in one transaction
    pub async fn run(&self, store: &StagingStore) -> Result<GroupingSummary> {
        let records = store.grouping_records().await?;
        let assignments = group_records(&records, self.tie_break);

        let mut group_ids: Vec<&str> = assignments.iter().map(|a| a.group_id.as_str()).collect();
        group_ids.sort_unstable();
        group_ids.dedup();
        let summary = GroupingSummary {
            records: assignments.len(),
            groups: group_ids.len(),
        };

        store.assign_groups(&assignments).await?;

        info!(
            scan_id = store.scan_id(),
            records = summary.records,
            groups = summary.groups,
            "Album grouping complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, artist: &str, album: &str, year: Option<i32>) -> GroupingRecord {
        GroupingRecord {
            id,
            artist: Some(artist.to_string()),
            album_artist: None,
            album: Some(album.to_string()),
            year,
        }
    }

    #[test]
    fn test_remaster_and_case_variants_share_key() {
        let a = record(1, "Pink Floyd", "The Wall (Remastered)", Some(1979));
        let b = record(2, "Pink Floyd", "the wall", Some(1979));
        assert_eq!(identity_key(&a), identity_key(&b));
        assert_eq!(identity_key(&a), "pink floyd::wall");
    }

    #[test]
    fn test_normalize_album_markers() {
        assert_eq!(normalize_album("Rumours [Deluxe Edition]"), "rumours");
        assert_eq!(normalize_album("Abbey Road - 2019 Remaster"), "abbeyroad");
        assert_eq!(normalize_album("The Bends"), "bends");
        assert_eq!(normalize_album("  "), "");
        // Non-edition parentheticals are part of the title
        assert_eq!(normalize_album("Music (For Films)"), "music(forfilms)");
    }

    #[test]
    fn test_album_artist_wins_over_artist() {
        let rec = GroupingRecord {
            id: 1,
            artist: Some("Guest Singer".to_string()),
            album_artist: Some("Various Artists".to_string()),
            album: Some("Hits".to_string()),
            year: None,
        };
        assert_eq!(identity_key(&rec), "various artists::hits");
    }

    #[test]
    fn test_missing_artist_defaults() {
        assert_eq!(effective_artist(None, Some("  ")), UNKNOWN_ARTIST);
    }

    #[test]
    fn test_year_vote_majority_and_tie_break() {
        let years = [Some(1999), Some(2001), Some(1999), None];
        assert_eq!(vote_year(years, YearTieBreak::MostRecent), Some(1999));

        let tied = [Some(1999), Some(2001)];
        assert_eq!(vote_year(tied, YearTieBreak::MostRecent), Some(2001));
        assert_eq!(vote_year(tied, YearTieBreak::Oldest), Some(1999));

        assert_eq!(vote_year([None, None], YearTieBreak::MostRecent), None);
    }

    #[test]
    fn test_yearless_members_join_winning_year() {
        let records = vec![
            record(1, "Low", "Secret Name", Some(1999)),
            record(2, "Low", "Secret Name", None),
            record(3, "Low", "Secret Name", Some(1999)),
        ];
        let assignments = group_records(&records, YearTieBreak::MostRecent);
        assert!(assignments.iter().all(|a| a.group_id == "low::secretname_1999"));
    }

    #[test]
    fn test_no_year_uses_unknown_token() {
        let assignments = group_records(&[record(5, "Low", "Drums and Guns", None)], YearTieBreak::MostRecent);
        assert_eq!(assignments[0].group_id, "low::drumsandguns_unknown");
        assert_eq!(year_from_group_id(&assignments[0].group_id), None);
    }

    #[test]
    fn test_grouping_is_deterministic_under_reordering() {
        let records = vec![
            record(1, "Pink Floyd", "The Wall (Remastered)", Some(1979)),
            record(2, "Pink Floyd", "the wall", Some(1979)),
            record(3, "Pink Floyd", "Animals", Some(1977)),
            record(4, "Low", "Trust", None),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        let first = group_records(&records, YearTieBreak::MostRecent);
        let second = group_records(&reversed, YearTieBreak::MostRecent);
        assert_eq!(first, second);
        assert_eq!(first[0].group_id, first[1].group_id);
        assert_ne!(first[0].group_id, first[2].group_id);
        assert_eq!(first[0].group_hash, group_hash(&first[0].group_id));
        assert_eq!(first[0].group_hash.len(), 16);
    }
}
