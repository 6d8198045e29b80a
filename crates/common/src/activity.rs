//! Self-reported mix node activity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a node reports it is doing in its heartbeat poll.
///
/// A node moves through these activities over its lifetime; the legal
/// edges are defined by [`crate::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Activity {
    NotStarted,
    Waiting,
    Precomputing,
    Standby,
    Realtime,
    Completed,
    Error,
    Crash,
}

/// Number of activity variants.
pub const NUM_ACTIVITIES: usize = 8;

/// All activities in declaration order, for exhaustive table tests.
pub const ALL_ACTIVITIES: [Activity; NUM_ACTIVITIES] = [
    Activity::NotStarted,
    Activity::Waiting,
    Activity::Precomputing,
    Activity::Standby,
    Activity::Realtime,
    Activity::Completed,
    Activity::Error,
    Activity::Crash,
];

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Activity::NotStarted => "NOT_STARTED",
            Activity::Waiting => "WAITING",
            Activity::Precomputing => "PRECOMPUTING",
            Activity::Standby => "STANDBY",
            Activity::Realtime => "REALTIME",
            Activity::Completed => "COMPLETED",
            Activity::Error => "ERROR",
            Activity::Crash => "CRASH",
        };
        write!(f, "{}", s)
    }
}
