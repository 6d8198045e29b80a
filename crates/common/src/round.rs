//! Round lifecycle phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of a mix round's lifecycle.
///
/// Phases only move forward through the declaration order, with `Failed`
/// reachable sideways from any non-terminal phase. The derived `Ord`
/// therefore doubles as the forward-progress check.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    Pending,
    Precomputing,
    Standby,
    Queued,
    Realtime,
    Completed,
    Failed,
}

/// Number of round phases; sizes the per-round timestamp array.
pub const NUM_PHASES: usize = 7;

/// All phases in declaration order.
pub const ALL_PHASES: [RoundPhase; NUM_PHASES] = [
    RoundPhase::Pending,
    RoundPhase::Precomputing,
    RoundPhase::Standby,
    RoundPhase::Queued,
    RoundPhase::Realtime,
    RoundPhase::Completed,
    RoundPhase::Failed,
];

impl RoundPhase {
    /// Index into the per-round timestamp array.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundPhase::Pending => "PENDING",
            RoundPhase::Precomputing => "PRECOMPUTING",
            RoundPhase::Standby => "STANDBY",
            RoundPhase::Queued => "QUEUED",
            RoundPhase::Realtime => "REALTIME",
            RoundPhase::Completed => "COMPLETED",
            RoundPhase::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}
