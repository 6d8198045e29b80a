//! The scheduler: the single background driver of the round lifecycle.
//!
//! One task consumes [`UpdateNotification`]s from the poll handlers,
//! advances rounds through their phases, composes new teams out of the
//! waiting pool between updates, and reacts to round timeouts. Because
//! everything round-mutating funnels through this task, round phase
//! transitions are totally ordered.

pub mod create_round;
pub mod node_updates;
pub mod round_tracker;
pub mod timeout;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use mixnet_common::{Activity, NodeId, RoundPhase};
use mixnet_storage::Storage;

use crate::config::{Params, SchedulingAlgorithm};
use crate::error::RegistrarError;
use crate::now_nanos;
use crate::state::network::NetworkState;
use crate::state::node::UpdateNotification;
use crate::state::pool::WaitingPool;
use crate::wire::RoundError;

pub use create_round::{ProtoRound, SecureComposer, SimpleComposer, TeamComposer};
pub use round_tracker::RoundTracker;

use node_updates::{kill_round, StateChanger};
use timeout::arm_round_timeout;

/// The scheduler task and its wiring.
pub struct Scheduler {
    params: Params,
    state: Arc<NetworkState>,
    storage: Storage,
    pool: Arc<WaitingPool>,
    tracker: Arc<RoundTracker>,
    composer: Box<dyn TeamComposer>,
    changer: StateChanger,
    update_rx: mpsc::UnboundedReceiver<UpdateNotification>,
    timeout_rx: mpsc::UnboundedReceiver<u64>,
    quit_rx: watch::Receiver<bool>,
    stopped: Arc<AtomicBool>,
    /// Unix nanos of the last round creation, for `minimum_delay` spacing.
    last_round_created: u64,
}

impl Scheduler {
    /// Build the scheduler. Returns the sender poll handlers enqueue
    /// update notifications on.
    pub fn new(
        params: Params,
        state: Arc<NetworkState>,
        storage: Storage,
        pool: Arc<WaitingPool>,
        tracker: Arc<RoundTracker>,
        quit_rx: watch::Receiver<bool>,
        stopped: Arc<AtomicBool>,
    ) -> (Self, mpsc::UnboundedSender<UpdateNotification>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();

        let composer: Box<dyn TeamComposer> = match params.scheduling_algorithm {
            SchedulingAlgorithm::Simple => Box::new(SimpleComposer),
            SchedulingAlgorithm::Secure => Box::new(SecureComposer),
        };

        let changer = StateChanger {
            state: Arc::clone(&state),
            storage: storage.clone(),
            pool: Arc::clone(&pool),
            tracker: Arc::clone(&tracker),
            timeout_tx,
            realtime_delay: params.realtime_delay(),
            realtime_delta: params.minimum_delay(),
            round_timeout: params.round_timeout(),
            last_realtime: 0,
        };

        let scheduler = Scheduler {
            params,
            state,
            storage,
            pool,
            tracker,
            composer,
            changer,
            update_rx,
            timeout_rx,
            quit_rx,
            stopped,
            last_round_created: 0,
        };
        (scheduler, update_tx)
    }

    /// The scheduler control loop. Runs until the quit channel flips or
    /// every notification sender is dropped.
    pub async fn run(mut self) {
        info!("scheduler started");
        loop {
            tokio::select! {
                changed = self.quit_rx.changed() => {
                    if changed.is_err() || *self.quit_rx.borrow() {
                        break;
                    }
                }
                maybe_update = self.update_rx.recv() => {
                    let Some(update) = maybe_update else { break };
                    let node = update.node;
                    // The notification (and its polling-lock token) drops
                    // here whatever the outcome.
                    if let Err(e) = self.changer.handle_node_update(update) {
                        warn!(node = %node, error = %e, "node update rejected");
                        // The rejection is not propagated upward: the node
                        // is converted to ERROR and the loop continues.
                        if !matches!(e, RegistrarError::UnknownNode(_)) {
                            self.demote_to_error(node);
                        }
                    }
                }
                maybe_timeout = self.timeout_rx.recv() => {
                    if let Some(round_id) = maybe_timeout {
                        self.handle_timeout(round_id);
                    }
                }
            }

            // Team creation runs between updates.
            self.try_create_rounds();
        }
        // New polls observe the stop and return without taking the
        // polling lock; in-flight ones have already been drained above.
        self.stopped.store(true, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    /// Form teams while the pool can support them, spaced by
    /// `minimum_delay`.
    fn try_create_rounds(&mut self) {
        let need = self.composer.pool_requirement(&self.params);
        while self.pool.online_len() >= need {
            let now = now_nanos();
            let spacing = self.params.minimum_delay().as_nanos() as u64;
            if now < self.last_round_created.saturating_add(spacing) {
                break;
            }
            if !self.create_round() {
                break;
            }
            self.last_round_created = now;
        }
    }

    /// Compose and publish one round. False when the pool could not
    /// support it.
    fn create_round(&mut self) -> bool {
        let round_id = match self.state.next_round_id() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "could not allocate round id");
                return false;
            }
        };

        let proto = match self.composer.compose(&self.params, &self.pool, round_id) {
            Ok(proto) => proto,
            Err(RegistrarError::PoolInsufficient { .. }) => return false,
            Err(e) => {
                warn!(round = round_id, error = %e, "team composition failed");
                return false;
            }
        };

        let round =
            self.state
                .create_round(proto.id, proto.topology, proto.batch_size, now_nanos());
        for node in &proto.node_states {
            node.set_round(Arc::clone(&round));
        }

        if let Err(e) = round
            .update(RoundPhase::Precomputing, now_nanos())
            .and_then(|_| self.state.add_round_update(round.build_round_info()).map(|_| ()))
        {
            error!(round = round_id, error = %e, "could not publish new round");
            return false;
        }

        self.tracker.add(round_id);
        arm_round_timeout(
            &round,
            self.params.round_timeout(),
            self.changer.timeout_tx.clone(),
        );
        info!(
            round = round_id,
            team = round.team_size(),
            "created round"
        );
        true
    }

    /// A node whose update could not be applied (for example a report
    /// whose round was failed or advanced by an earlier-queued
    /// notification) is moved to ERROR so its round is killed and it can
    /// re-enter through WAITING.
    fn demote_to_error(&mut self, node_id: NodeId) {
        let Some(node) = self.state.node_map().get(&node_id) else {
            return;
        };
        match node.update(Activity::Error) {
            Ok(Some(notification)) => {
                if let Err(e) = self.changer.handle_node_update(notification) {
                    error!(node = %node_id, error = %e, "could not demote node to ERROR");
                }
            }
            // Already at ERROR.
            Ok(None) => {}
            Err(e) => {
                warn!(node = %node_id, error = %e, "node not demotable to ERROR");
            }
        }
    }

    /// A round failed to reach its next phase in time: fail it with an
    /// error signed by the scheduler's own identity.
    fn handle_timeout(&mut self, round_id: u64) {
        let Some(round) = self.state.round_map().get(round_id) else {
            return;
        };
        let phase = round.phase();
        if matches!(phase, RoundPhase::Completed | RoundPhase::Failed) {
            return;
        }
        warn!(round = round_id, phase = %phase, "round timed out");

        let timeout_error = RoundError::signed(
            round_id,
            NodeId::SCHEDULER,
            RegistrarError::RoundTimeout {
                round: round_id,
                phase,
            }
            .to_string(),
            self.state.signing_key(),
        );
        if let Err(e) = kill_round(
            &self.state,
            &self.storage,
            &round,
            Some(timeout_error),
            &self.tracker,
        ) {
            error!(round = round_id, error = %e, "could not kill timed-out round");
        }
    }
}
