//! Ingest services
//!
//! - `fingerprinter` / `file_scanner`: discovery into a staging store
//! - `album_grouping`: two-pass album identity and year vote
//! - `directory_codes`: per-artist sharding codes
//! - `path_templates`: safe relative paths per resolution mode
//! - `capacity_probe`: disk usage state machine
//! - `sidecar`: per-album audit records
//! - `ingest_pipeline`: scan → group → plan, and gated placement

pub mod album_grouping;
pub mod capacity_probe;
pub mod directory_codes;
pub mod file_scanner;
pub mod fingerprinter;
pub mod ingest_pipeline;
pub mod path_templates;
pub mod sidecar;

pub use album_grouping::{AlbumGroupingEngine, GroupingSummary, YearTieBreak};
pub use capacity_probe::{CapacityProbe, SysinfoSampler, UsageSampler};
pub use directory_codes::{CodeError, DirectoryCodeGenerator, DirectoryCodeSession};
pub use file_scanner::{FileScanner, ScanError, ScanStatistics};
pub use fingerprinter::{ContentFingerprinter, LoftyTagReader, TagReader};
pub use ingest_pipeline::{IngestPipeline, IngestReport, PipelineError, Placement, PlannedAlbum};
pub use path_templates::{PathError, PathTemplateResolver, PathValues, ResolutionMode, ResolvedPath};
pub use sidecar::{SidecarRecord, SIDECAR_FILE_NAME};
