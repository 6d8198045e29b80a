//! Error kinds surfaced by the permissioning server.
//!
//! Caller-attributable errors are returned to the polling node verbatim so
//! it can self-correct; internal errors are logged and collapsed into a
//! generic failure at the HTTP boundary.

use thiserror::Error;

use mixnet_common::crypto::CryptoError;
use mixnet_common::{Activity, NodeId, RoundPhase};
use mixnet_storage::StorageError;

#[derive(Debug, Error)]
pub enum RegistrarError {
    /// The scheduler has not yet published a full NDF. Expected during
    /// startup; nodes retry silently.
    #[error("the network definition is not ready")]
    NdfNotReady,

    #[error("caller {0} is not authenticated")]
    AuthFailed(String),

    #[error("node {0} could not be found in the network state")]
    UnknownNode(NodeId),

    #[error("node {0} has been banned from the network")]
    Banned(NodeId),

    #[error("waiting pool holds {have} online nodes, {need} required")]
    PoolInsufficient { have: usize, need: usize },

    #[error("{component} version {found} is incompatible with required version {required}")]
    VersionIncompatible {
        component: &'static str,
        found: String,
        required: String,
    },

    #[error("could not order the team: {0}")]
    BadOrdering(String),

    #[error("node {node} without a round should not be moving to {activity}")]
    OrphanActivity { node: NodeId, activity: Activity },

    #[error("illegal transition from {from} to {to} (round phase: {phase:?})")]
    IllegalTransition {
        from: Activity,
        to: Activity,
        phase: Option<RoundPhase>,
    },

    /// A reported round error failed signature or round-id validation.
    #[error("bad round error report: {0}")]
    BadError(String),

    #[error("{0}")]
    PortFailed(String),

    #[error("round {round} timed out in phase {phase}")]
    RoundTimeout { round: u64, phase: RoundPhase },

    #[error("round {round} cannot move from {from} to {to}")]
    IllegalRoundUpdate {
        round: u64,
        from: RoundPhase,
        to: RoundPhase,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl RegistrarError {
    /// True for errors the polling node caused and can act on; these are
    /// returned to the caller verbatim.
    pub fn is_caller_attributable(&self) -> bool {
        !matches!(
            self,
            RegistrarError::Storage(_) | RegistrarError::Crypto(_) | RegistrarError::Fatal(_)
        )
    }
}
