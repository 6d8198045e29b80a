//! The activity transition table.
//!
//! One fixed table shared by every node answers three questions:
//!
//! - may a node arrive at activity `to` when it is currently at `from`
//!   ([`is_valid_transition`]),
//! - is a reported activity consistent with the phase of the node's round
//!   ([`is_valid_round_state`]),
//! - does an activity expect the node to have a round at all
//!   ([`needs_round`]).
//!
//! The table is indexed destination-first: for each activity it lists the
//! activities a node may be coming *from*.

use crate::activity::Activity;
use crate::round::RoundPhase;

/// Whether an activity expects the reporting node to hold a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundRequirement {
    /// No round expected (NOT_STARTED, WAITING).
    None,
    /// The node must hold a round and its phase must match.
    Required,
    /// Post-completion report (ERROR, CRASH): a round may or may not remain.
    AfterCompletion,
}

/// Returns true when a node currently at `from` may report `to`.
pub fn is_valid_transition(from: Activity, to: Activity) -> bool {
    use Activity::*;
    match to {
        // Nothing ever arrives at NOT_STARTED or CRASH.
        NotStarted | Crash => false,
        Waiting => matches!(from, NotStarted | Completed | Error),
        Precomputing => matches!(from, Waiting),
        Standby => matches!(from, Waiting | Precomputing),
        Realtime => matches!(from, Standby),
        Completed => matches!(from, Realtime),
        Error => !matches!(from, Error | Crash),
    }
}

/// Returns true when `activity` is consistent with the node's round being
/// in `phase`.
///
/// REALTIME and COMPLETED accept two phases because only the first
/// reporter advances the round; later team members observe the advanced
/// phase and must still be accepted.
pub fn is_valid_round_state(activity: Activity, phase: RoundPhase) -> bool {
    use Activity::*;
    match activity {
        Precomputing => phase == RoundPhase::Precomputing,
        // Nodes report standby while the team as a whole is still precomputing.
        Standby => phase == RoundPhase::Precomputing,
        Realtime => matches!(phase, RoundPhase::Queued | RoundPhase::Realtime),
        Completed => matches!(phase, RoundPhase::Realtime | RoundPhase::Completed),
        NotStarted | Waiting | Error | Crash => false,
    }
}

/// Round-holding expectation for `activity`.
pub fn needs_round(activity: Activity) -> RoundRequirement {
    use Activity::*;
    match activity {
        NotStarted | Waiting => RoundRequirement::None,
        Precomputing | Standby | Realtime | Completed => RoundRequirement::Required,
        Error | Crash => RoundRequirement::AfterCompletion,
    }
}
