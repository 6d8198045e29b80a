//! Per-round live state and the round map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use mixnet_common::round::NUM_PHASES;
use mixnet_common::{NodeId, RoundPhase};

use crate::error::RegistrarError;
use crate::wire::{ClientError, RoundError, RoundInfo};

struct RoundInner {
    phase: RoundPhase,
    /// Unix-nano stamp of when each phase was entered (QUEUED carries the
    /// scheduled realtime start instead).
    timestamps: [u64; NUM_PHASES],
    errors: Vec<RoundError>,
    client_errors: Vec<ClientError>,
    /// Stamped when the last topology member reports COMPLETED.
    realtime_completed_ts: u64,
}

/// One active round.
///
/// The topology is fixed at creation and holds node ids only, never node
/// references; nodes point at their round, so keeping this direction
/// id-based breaks the cycle and makes round removal safe.
///
/// ## Invariants
///
/// - The phase only moves forward through the declaration order of
///   [`RoundPhase`], or sideways to `Failed` from any non-terminal phase.
/// - Once `Failed`, only error accumulation is allowed.
/// - All phase updates happen on the scheduler task, so they are totally
///   ordered.
pub struct RoundState {
    id: u64,
    topology: Vec<NodeId>,
    batch_size: u32,
    inner: RwLock<RoundInner>,
    /// Counts team members ready for the next collective transition;
    /// resets when the whole team has reported.
    ready: AtomicUsize,
    /// Disarm handle for the currently armed timeout supervisor.
    timeout_disarm: Mutex<Option<oneshot::Sender<()>>>,
}

impl RoundState {
    pub fn new(id: u64, topology: Vec<NodeId>, batch_size: u32, now: u64) -> Self {
        let mut timestamps = [0u64; NUM_PHASES];
        timestamps[RoundPhase::Pending.index()] = now;
        RoundState {
            id,
            topology,
            batch_size,
            inner: RwLock::new(RoundInner {
                phase: RoundPhase::Pending,
                timestamps,
                errors: Vec::new(),
                client_errors: Vec::new(),
                realtime_completed_ts: 0,
            }),
            ready: AtomicUsize::new(0),
            timeout_disarm: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    #[inline]
    pub fn topology(&self) -> &[NodeId] {
        &self.topology
    }

    #[inline]
    pub fn team_size(&self) -> usize {
        self.topology.len()
    }

    pub fn phase(&self) -> RoundPhase {
        self.inner.read().phase
    }

    /// Move the round to `to`, stamping the phase timestamp.
    ///
    /// Forward-only; `Failed` is reachable from any non-terminal phase.
    pub fn update(&self, to: RoundPhase, ts: u64) -> Result<(), RegistrarError> {
        let mut inner = self.inner.write();
        let from = inner.phase;
        let legal = from != RoundPhase::Failed && (to == RoundPhase::Failed || to > from);
        if !legal {
            return Err(RegistrarError::IllegalRoundUpdate {
                round: self.id,
                from,
                to,
            });
        }
        inner.phase = to;
        inner.timestamps[to.index()] = ts;
        Ok(())
    }

    /// Record one team member as ready for the next collective
    /// transition. Returns true exactly once per full team, then resets.
    pub fn node_ready(&self) -> bool {
        let count = self.ready.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.topology.len() {
            self.ready.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn append_error(&self, error: RoundError) {
        self.inner.write().errors.push(error);
    }

    pub fn append_client_errors(&self, errors: Vec<ClientError>) {
        self.inner.write().client_errors.extend(errors);
    }

    pub fn errors(&self) -> Vec<RoundError> {
        self.inner.read().errors.clone()
    }

    pub fn client_errors(&self) -> Vec<ClientError> {
        self.inner.read().client_errors.clone()
    }

    pub fn timestamp(&self, phase: RoundPhase) -> u64 {
        self.inner.read().timestamps[phase.index()]
    }

    /// True when `id` occupies the last topology position.
    pub fn is_last_node(&self, id: &NodeId) -> bool {
        self.topology.last() == Some(id)
    }

    pub fn set_realtime_completed_ts(&self, ts: u64) {
        self.inner.write().realtime_completed_ts = ts;
    }

    pub fn realtime_completed_ts(&self) -> u64 {
        self.inner.read().realtime_completed_ts
    }

    /// Snapshot this round as an unsigned [`RoundInfo`]; the update log
    /// assigns the update id and signature.
    pub fn build_round_info(&self) -> RoundInfo {
        let inner = self.inner.read();
        RoundInfo {
            id: self.id,
            update_id: 0,
            phase: inner.phase,
            batch_size: self.batch_size,
            topology: self.topology.clone(),
            timestamps: inner.timestamps,
            errors: inner.errors.clone(),
            signature: Vec::new(),
        }
    }

    /// Install the disarm handle of a freshly armed timeout supervisor,
    /// replacing (and thereby cancelling) any previous one.
    pub fn set_timeout_disarm(&self, tx: oneshot::Sender<()>) {
        *self.timeout_disarm.lock() = Some(tx);
    }

    /// Signal the armed timeout supervisor, if any, that its phase
    /// completed first.
    pub fn disarm_timeout(&self) {
        if let Some(tx) = self.timeout_disarm.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// The set of rounds that still have live records.
///
/// Holders of the map lock must not call back into the node map; lock
/// ordering is always node-map first.
#[derive(Default)]
pub struct RoundMap {
    rounds: Mutex<HashMap<u64, Arc<RoundState>>>,
}

impl RoundMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, round: Arc<RoundState>) {
        self.rounds.lock().insert(round.id(), round);
    }

    pub fn get(&self, id: u64) -> Option<Arc<RoundState>> {
        self.rounds.lock().get(&id).cloned()
    }

    pub fn delete(&self, id: u64) -> Option<Arc<RoundState>> {
        self.rounds.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.rounds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.lock().is_empty()
    }
}
