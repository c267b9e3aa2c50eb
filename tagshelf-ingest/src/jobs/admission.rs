//! Placement admission
//!
//! Placement (`move`) work for a library is withheld while the monitored
//! path covering the library root is alerting. Libraries outside every
//! monitored path fall back to the aggregate "any path alerting" check.
//! `unknown` never withholds.

use crate::models::CapacityLevel;
use crate::services::capacity_probe::CapacityProbe;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Gate decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    Withheld { reason: String },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Capacity-based admission check for placement jobs
#[derive(Clone)]
pub struct PlacementGate {
    probe: Arc<CapacityProbe>,
}

impl PlacementGate {
    pub fn new(probe: Arc<CapacityProbe>) -> Self {
        Self { probe }
    }

    pub async fn admit(&self, library_root: &Path) -> Admission {
        let admission = match self.probe.covering_status(library_root).await {
            Some(status) if status.status == CapacityLevel::Alert => Admission::Withheld {
                reason: format!(
                    "{} is alerting ({:.1}% used)",
                    status.path.display(),
                    status.used_percent.unwrap_or_default()
                ),
            },
            Some(_) => Admission::Admitted,
            None if self.probe.any_alerting().await => Admission::Withheld {
                reason: "a monitored path is alerting".to_string(),
            },
            None => Admission::Admitted,
        };

        if let Admission::Withheld { reason } = &admission {
            info!(library_root = %library_root.display(), reason = %reason, "Placement withheld");
        }
        admission
    }
}
