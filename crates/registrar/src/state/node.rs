//! Per-node live state.
//!
//! One [`NodeState`] exists per registered node id, permanently. Field
//! access goes through an internal read/write lock; the separate polling
//! lock is used only for the poll-to-scheduler handoff (see
//! [`UpdateNotification::polling_token`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use mixnet_common::{transition, Activity, NodeId, RoundRequirement};
use mixnet_storage::Status;

use crate::error::RegistrarError;
use crate::state::round::RoundState;
use crate::wire::{ClientError, RoundError};

/// Result of probing a node's advertised ports.
///
/// `Unknown → Verifying → {Successful, NodeFailed, GatewayFailed,
/// BothFailed}`. Failed terminals are periodically reset to `Unknown` by
/// the poll handler to retry probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Unknown,
    Verifying,
    Successful,
    NodeFailed,
    GatewayFailed,
    BothFailed,
}

impl Connectivity {
    /// True for the three failed terminals.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Connectivity::NodeFailed | Connectivity::GatewayFailed | Connectivity::BothFailed
        )
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Connectivity::Unknown => "Unknown",
            Connectivity::Verifying => "Verifying",
            Connectivity::Successful => "Successful",
            Connectivity::NodeFailed => "NodeFailed",
            Connectivity::GatewayFailed => "GatewayFailed",
            Connectivity::BothFailed => "BothFailed",
        };
        write!(f, "{}", s)
    }
}

/// A state change observed by the poll handler, queued to the scheduler.
///
/// When a transition occurred, `polling_token` carries ownership of the
/// node's polling lock: the scheduler holds off all further polls from
/// this node until it finishes processing, and the guard's `Drop` releases
/// the lock on every consumer exit path. Leaking the token would wedge the
/// node's polling permanently.
pub struct UpdateNotification {
    pub node: NodeId,
    pub from_activity: Activity,
    pub to_activity: Activity,
    pub from_status: Status,
    pub to_status: Status,
    /// Signed error payload accompanying an ERROR activity.
    pub round_error: Option<RoundError>,
    /// Client errors to attach to the node's current round.
    pub client_errors: Vec<ClientError>,
    /// The polling-lock handoff token.
    pub polling_token: Option<OwnedMutexGuard<()>>,
}

impl fmt::Debug for UpdateNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateNotification")
            .field("node", &self.node)
            .field("from_activity", &self.from_activity)
            .field("to_activity", &self.to_activity)
            .field("from_status", &self.from_status)
            .field("to_status", &self.to_status)
            .field("has_error", &self.round_error.is_some())
            .field("has_token", &self.polling_token.is_some())
            .finish()
    }
}

struct NodeInner {
    activity: Activity,
    status: Status,
    connectivity: Connectivity,
    current_round: Option<Arc<RoundState>>,
    server_address: String,
    gateway_address: String,
    node_certificate: String,
    gateway_certificate: String,
    /// Raw Ed25519 public key the node signs round errors with.
    public_key: Vec<u8>,
    /// Ordering tag: numeric index for simple teaming, or a country code.
    ordering: String,
    /// Unix nanos of the node's last poll.
    last_poll: u64,
}

/// Live record of one registered mix node.
pub struct NodeState {
    id: NodeId,
    application_id: u64,
    inner: RwLock<NodeInner>,
    num_polls: AtomicU64,
    polling_lock: Arc<AsyncMutex<()>>,
}

impl NodeState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        application_id: u64,
        server_address: String,
        gateway_address: String,
        node_certificate: String,
        gateway_certificate: String,
        public_key: Vec<u8>,
        ordering: String,
    ) -> Self {
        NodeState {
            id,
            application_id,
            inner: RwLock::new(NodeInner {
                activity: Activity::NotStarted,
                status: Status::Active,
                connectivity: Connectivity::Unknown,
                current_round: None,
                server_address,
                gateway_address,
                node_certificate,
                gateway_certificate,
                public_key,
                ordering,
                last_poll: 0,
            }),
            num_polls: AtomicU64::new(0),
            polling_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Rebuild a node state from its storage row. Fails when the row has
    /// never completed registration (no id).
    pub fn from_record(record: &mixnet_storage::Node) -> Result<Self, RegistrarError> {
        let id = record.id.ok_or_else(|| {
            RegistrarError::Fatal(format!("node row {} has no id", record.code))
        })?;
        let public_key = hex::decode(&record.public_key).unwrap_or_default();
        let node = NodeState::new(
            id,
            record.application_id,
            record.server_address.clone(),
            record.gateway_address.clone(),
            record.node_certificate.clone(),
            record.gateway_certificate.clone(),
            public_key,
            record.sequence.clone(),
        );
        node.inner.write().status = record.status;
        Ok(node)
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn application_id(&self) -> u64 {
        self.application_id
    }

    /// Submit a reported activity.
    ///
    /// Performs the edge check against the transition table and the
    /// node's round (when the activity requires one). Returns `Ok(None)`
    /// when nothing changed, `Ok(Some(notification))` when a transition
    /// was recorded. A poll from an `Inactive` or `Stale` node promotes
    /// it back to `Active`; with an unchanged activity that promotion is
    /// only reported for WAITING (the pool re-entry signal), and skips
    /// the edge check since the activity is not moving.
    pub fn update(
        &self,
        new_activity: Activity,
    ) -> Result<Option<UpdateNotification>, RegistrarError> {
        let mut inner = self.inner.write();
        let from_activity = inner.activity;
        let from_status = inner.status;
        let to_status = match from_status {
            Status::Inactive | Status::Stale => Status::Active,
            other => other,
        };

        if from_activity == new_activity {
            inner.status = to_status;
            // A pure status change only matters to the scheduler as a
            // pool re-entry signal; any other repeat report is a no-op.
            if from_status == to_status || new_activity != Activity::Waiting {
                return Ok(None);
            }
        }

        if from_activity != new_activity {
            if !transition::is_valid_transition(from_activity, new_activity) {
                return Err(RegistrarError::IllegalTransition {
                    from: from_activity,
                    to: new_activity,
                    phase: None,
                });
            }

            match transition::needs_round(new_activity) {
                RoundRequirement::Required => {
                    let round = inner.current_round.as_ref().ok_or(
                        RegistrarError::OrphanActivity {
                            node: self.id,
                            activity: new_activity,
                        },
                    )?;
                    let phase = round.phase();
                    if !transition::is_valid_round_state(new_activity, phase) {
                        return Err(RegistrarError::IllegalTransition {
                            from: from_activity,
                            to: new_activity,
                            phase: Some(phase),
                        });
                    }
                }
                RoundRequirement::None | RoundRequirement::AfterCompletion => {}
            }
        }

        inner.activity = new_activity;
        inner.status = to_status;

        Ok(Some(UpdateNotification {
            node: self.id,
            from_activity,
            to_activity: new_activity,
            from_status,
            to_status,
            round_error: None,
            client_errors: Vec::new(),
            polling_token: None,
        }))
    }

    /// Mark the node banned. Idempotent: returns a notification only on
    /// the first call.
    pub fn ban(&self) -> Option<UpdateNotification> {
        let mut inner = self.inner.write();
        if inner.status == Status::Banned {
            return None;
        }
        let from_status = inner.status;
        inner.status = Status::Banned;
        Some(UpdateNotification {
            node: self.id,
            from_activity: inner.activity,
            to_activity: inner.activity,
            from_status,
            to_status: Status::Banned,
            round_error: None,
            client_errors: Vec::new(),
            polling_token: None,
        })
    }

    pub fn is_banned(&self) -> bool {
        self.inner.read().status == Status::Banned
    }

    pub fn activity(&self) -> Activity {
        self.inner.read().activity
    }

    pub fn status(&self) -> Status {
        self.inner.read().status
    }

    /// Direct status override for the metric and disabled-node trackers.
    /// Banning must go through [`NodeState::ban`].
    pub fn set_status(&self, status: Status) {
        let mut inner = self.inner.write();
        if inner.status != Status::Banned {
            inner.status = status;
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        self.inner.read().connectivity
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.inner.write().connectivity = connectivity;
    }

    pub fn current_round(&self) -> Option<Arc<RoundState>> {
        self.inner.read().current_round.clone()
    }

    pub fn set_round(&self, round: Arc<RoundState>) {
        self.inner.write().current_round = Some(round);
    }

    pub fn clear_round(&self) -> Option<Arc<RoundState>> {
        self.inner.write().current_round.take()
    }

    pub fn server_address(&self) -> String {
        self.inner.read().server_address.clone()
    }

    pub fn gateway_address(&self) -> String {
        self.inner.read().gateway_address.clone()
    }

    pub fn node_certificate(&self) -> String {
        self.inner.read().node_certificate.clone()
    }

    pub fn gateway_certificate(&self) -> String {
        self.inner.read().gateway_certificate.clone()
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.inner.read().public_key.clone()
    }

    pub fn ordering(&self) -> String {
        self.inner.read().ordering.clone()
    }

    /// Replace the server address; true when it actually changed.
    pub fn update_server_address(&self, addr: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.server_address == addr {
            return false;
        }
        inner.server_address = addr.to_string();
        true
    }

    /// Replace the gateway address; true when it actually changed. An
    /// empty report leaves the stored address alone.
    pub fn update_gateway_address(&self, addr: &str) -> bool {
        if addr.is_empty() {
            return false;
        }
        let mut inner = self.inner.write();
        if inner.gateway_address == addr {
            return false;
        }
        inner.gateway_address = addr.to_string();
        true
    }

    pub fn last_poll(&self) -> u64 {
        self.inner.read().last_poll
    }

    pub fn stamp_last_poll(&self, now: u64) {
        self.inner.write().last_poll = now;
    }

    /// Bump the poll counter, returning the new count.
    pub fn increment_poll_count(&self) -> u64 {
        self.num_polls.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn poll_count(&self) -> u64 {
        self.num_polls.load(Ordering::SeqCst)
    }

    /// Atomically read and zero the poll counter (metric tracker tick).
    pub fn poll_count_and_reset(&self) -> u64 {
        self.num_polls.swap(0, Ordering::SeqCst)
    }

    /// The lock serializing this node's poll-to-scheduler pipeline.
    pub fn polling_lock(&self) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.polling_lock)
    }
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("NodeState")
            .field("id", &self.id)
            .field("activity", &inner.activity)
            .field("status", &inner.status)
            .field("connectivity", &inner.connectivity)
            .field("round", &inner.current_round.as_ref().map(|r| r.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixnet_common::RoundPhase;

    fn nid(b: u8) -> NodeId {
        NodeId::new([b; 32])
    }

    fn node(b: u8) -> NodeState {
        NodeState::new(
            nid(b),
            b as u64,
            format!("10.0.0.{}:11420", b),
            format!("10.0.0.{}:8443", b),
            String::new(),
            String::new(),
            Vec::new(),
            (b as usize).saturating_sub(1).to_string(),
        )
    }

    #[test]
    fn test_update_same_activity_is_noop() {
        let n = node(1);
        n.update(Activity::Waiting).expect("first waiting").expect("update");
        let second = n.update(Activity::Waiting).expect("second waiting");
        assert!(second.is_none());
    }

    #[test]
    fn test_update_rejects_illegal_edge() {
        let n = node(1);
        let result = n.update(Activity::Realtime);
        assert!(matches!(
            result,
            Err(RegistrarError::IllegalTransition { phase: None, .. })
        ));
        // Nothing recorded.
        assert_eq!(n.activity(), Activity::NotStarted);
    }

    #[test]
    fn test_update_requires_round_for_precomputing() {
        let n = node(1);
        n.update(Activity::Waiting).expect("waiting");
        let result = n.update(Activity::Precomputing);
        assert!(matches!(result, Err(RegistrarError::OrphanActivity { .. })));
    }

    #[test]
    fn test_update_checks_round_phase() {
        let n = node(1);
        n.update(Activity::Waiting).expect("waiting");
        let round = Arc::new(RoundState::new(1, vec![nid(1)], 32, 0));
        n.set_round(round.clone());

        // Round still pending: PRECOMPUTING not yet legal.
        let result = n.update(Activity::Precomputing);
        assert!(matches!(
            result,
            Err(RegistrarError::IllegalTransition {
                phase: Some(RoundPhase::Pending),
                ..
            })
        ));

        round.update(RoundPhase::Precomputing, 1).expect("advance");
        let notification = n
            .update(Activity::Precomputing)
            .expect("precomputing")
            .expect("update");
        assert_eq!(notification.from_activity, Activity::Waiting);
        assert_eq!(notification.to_activity, Activity::Precomputing);
    }

    #[test]
    fn test_error_activity_needs_no_round() {
        let n = node(1);
        n.update(Activity::Waiting).expect("waiting");
        let notification = n.update(Activity::Error).expect("error").expect("update");
        assert_eq!(notification.to_activity, Activity::Error);
    }

    #[test]
    fn test_inactive_node_promoted_on_poll() {
        let n = node(1);
        n.update(Activity::Waiting).expect("waiting");
        n.set_status(Status::Inactive);

        // Same activity, but the status flip alone produces an update.
        let notification = n.update(Activity::Waiting).expect("waiting").expect("update");
        assert_eq!(notification.from_status, Status::Inactive);
        assert_eq!(notification.to_status, Status::Active);
        assert_eq!(notification.from_activity, Activity::Waiting);
        assert_eq!(notification.to_activity, Activity::Waiting);
    }

    #[test]
    fn test_ban_is_idempotent_and_wins() {
        let n = node(1);
        let first = n.ban();
        assert!(first.is_some());
        assert!(n.is_banned());
        assert!(n.ban().is_none());

        // Status overrides do not resurrect a banned node.
        n.set_status(Status::Active);
        assert!(n.is_banned());
    }

    #[test]
    fn test_poll_count_read_and_reset() {
        let n = node(1);
        assert_eq!(n.increment_poll_count(), 1);
        assert_eq!(n.increment_poll_count(), 2);
        assert_eq!(n.poll_count_and_reset(), 2);
        assert_eq!(n.poll_count(), 0);
    }

    #[test]
    fn test_address_updates_report_changes() {
        let n = node(1);
        assert!(!n.update_server_address("10.0.0.1:11420"));
        assert!(n.update_server_address("10.9.9.9:11420"));
        assert_eq!(n.server_address(), "10.9.9.9:11420");

        assert!(!n.update_gateway_address(""));
        assert!(n.update_gateway_address("10.9.9.9:8443"));
        assert!(!n.update_gateway_address("10.9.9.9:8443"));
    }

    #[test]
    fn test_clear_round_returns_round() {
        let n = node(1);
        let round = Arc::new(RoundState::new(5, vec![nid(1)], 8, 0));
        n.set_round(round);
        let cleared = n.clear_round().expect("round");
        assert_eq!(cleared.id(), 5);
        assert!(n.current_round().is_none());
        assert!(n.clear_round().is_none());
    }
}
