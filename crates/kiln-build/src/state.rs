//! Build lifecycle state.

use serde::{Deserialize, Serialize};

/// Phase of a build.
///
/// ```text
/// Pending -> Parsing -> Scheduled -> Executing -> Packaging -> Complete
///                 \            \            \            \
///                  +------------+------------+------------+--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPhase {
    /// Created, nothing done yet.
    Pending,
    /// Reading the descriptor and building the stage graph.
    Parsing,
    /// Graph validated, stages ordered.
    Scheduled,
    /// Running stages.
    Executing,
    /// Writing the image manifest.
    Packaging,
    /// Image produced.
    Complete,
    /// Stopped on an error or cancellation.
    Failed,
}

impl BuildPhase {
    /// Returns true if the build may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Parsing)
                | (Self::Parsing, Self::Scheduled)
                | (Self::Scheduled, Self::Executing)
                | (Self::Executing, Self::Packaging)
                | (Self::Packaging, Self::Complete)
                | (
                    Self::Parsing | Self::Scheduled | Self::Executing | Self::Packaging,
                    Self::Failed
                )
        )
    }

    /// Returns true for `Complete` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Parsing => write!(f, "parsing"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Executing => write!(f, "executing"),
            Self::Packaging => write!(f, "packaging"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
