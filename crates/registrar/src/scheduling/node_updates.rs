//! Handling of node state-change notifications on the scheduler task.
//!
//! All round phase transitions happen here, on one task, so they are
//! totally ordered and the update log is an exact serialization of them.
//! The polling-lock token inside each notification is dropped when the
//! notification goes out of scope at the end of handling, releasing the
//! node's polling pipeline on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use mixnet_common::{Activity, NodeId, RoundPhase};
use mixnet_storage::{RoundMetric, Status, Storage};

use crate::error::RegistrarError;
use crate::now_nanos;
use crate::scheduling::round_tracker::RoundTracker;
use crate::scheduling::timeout::arm_round_timeout;
use crate::state::network::NetworkState;
use crate::state::node::UpdateNotification;
use crate::state::pool::WaitingPool;
use crate::state::round::RoundState;
use crate::wire::{RoundError, RoundInfo};

/// Consumes update notifications and advances rounds.
pub(crate) struct StateChanger {
    pub state: Arc<NetworkState>,
    pub storage: Storage,
    pub pool: Arc<WaitingPool>,
    pub tracker: Arc<RoundTracker>,
    pub timeout_tx: mpsc::UnboundedSender<u64>,
    pub realtime_delay: Duration,
    /// Minimum spacing between consecutive realtime starts.
    pub realtime_delta: Duration,
    pub round_timeout: Duration,
    /// Scheduled start of the most recent realtime phase, unix nanos.
    pub last_realtime: u64,
}

impl StateChanger {
    /// Handle one node state change.
    ///
    /// A node in WAITING is added to the pool in preparation for
    /// precomputing; a node in STANDBY counts toward its round's
    /// realtime transition; a node in COMPLETED waits for the rest of
    /// the team before the round completes.
    pub fn handle_node_update(
        &mut self,
        mut update: UpdateNotification,
    ) -> Result<(), RegistrarError> {
        let node = self
            .state
            .node_map()
            .get(&update.node)
            .ok_or(RegistrarError::UnknownNode(update.node))?;
        let round = node.current_round();

        // Only error updates are allowed against a failed round.
        if let Some(r) = &round {
            if r.phase() == RoundPhase::Failed && update.to_activity != Activity::Error {
                warn!(
                    round = r.id(),
                    node = %update.node,
                    activity = %update.to_activity,
                    "round has failed, rewriting activity to ERROR"
                );
                update.to_activity = Activity::Error;
            }

            if !update.client_errors.is_empty() {
                r.append_client_errors(std::mem::take(&mut update.client_errors));
            }
        }

        if update.to_status == Status::Banned {
            return self.handle_ban(&update, round);
        }

        match update.to_activity {
            Activity::NotStarted | Activity::Crash => {}

            Activity::Waiting => {
                if update.from_status == Status::Inactive && update.to_status == Status::Active
                {
                    self.pool.set_online(node);
                } else {
                    self.pool.add(node);
                }
            }

            Activity::Precomputing => {
                if round.is_none() {
                    return Err(RegistrarError::OrphanActivity {
                        node: update.node,
                        activity: Activity::Precomputing,
                    });
                }
            }

            Activity::Standby => {
                let r = round.ok_or(RegistrarError::OrphanActivity {
                    node: update.node,
                    activity: Activity::Standby,
                })?;
                if r.node_ready() {
                    let now = now_nanos();
                    r.update(RoundPhase::Standby, now)?;
                    self.state.add_round_update(r.build_round_info())?;

                    // Precomp finished in time; hand supervision over to
                    // the realtime timer.
                    r.disarm_timeout();
                    arm_round_timeout(&r, self.round_timeout, self.timeout_tx.clone());

                    let delayed = now + self.realtime_delay.as_nanos() as u64;
                    let spaced = self.last_realtime + self.realtime_delta.as_nanos() as u64;
                    let start_time = delayed.max(spaced);
                    self.last_realtime = start_time;

                    r.update(RoundPhase::Queued, start_time)?;
                    self.state.add_round_update(r.build_round_info())?;
                }
            }

            Activity::Realtime => {
                let r = round.ok_or(RegistrarError::OrphanActivity {
                    node: update.node,
                    activity: Activity::Realtime,
                })?;
                // Advance on the first report only; later team members are
                // ignored to avoid distributed synchronicity issues.
                if r.phase() != RoundPhase::Realtime {
                    r.update(RoundPhase::Realtime, now_nanos())?;
                    self.state.add_round_update(r.build_round_info())?;
                }
            }

            Activity::Completed => {
                let r = round.ok_or(RegistrarError::OrphanActivity {
                    node: update.node,
                    activity: Activity::Completed,
                })?;
                node.clear_round();

                if r.is_last_node(&update.node) {
                    r.set_realtime_completed_ts(now_nanos());
                }

                if r.node_ready() {
                    let now = now_nanos();
                    r.update(RoundPhase::Completed, now)?;
                    let round_info = r.build_round_info();
                    self.state.add_round_update(round_info.clone())?;

                    r.disarm_timeout();
                    self.tracker.remove(r.id());
                    self.state.round_map().delete(r.id());

                    let storage = self.storage.clone();
                    let realtime_end = r.realtime_completed_ts();
                    tokio::spawn(async move {
                        store_round_metric(
                            &storage,
                            &round_info,
                            RoundPhase::Completed,
                            realtime_end,
                        );
                    });
                }
            }

            Activity::Error => {
                if let Some(r) = round {
                    node.clear_round();
                    r.disarm_timeout();
                    kill_round(
                        &self.state,
                        &self.storage,
                        &r,
                        update.round_error.take(),
                        &self.tracker,
                    )?;
                }
            }
        }

        Ok(())
    }

    /// A banned node kills its round (with an error signed by the
    /// scheduler itself); without a round it is simply dropped from the
    /// pool.
    fn handle_ban(
        &mut self,
        update: &UpdateNotification,
        round: Option<Arc<RoundState>>,
    ) -> Result<(), RegistrarError> {
        info!(node = %update.node, "processing ban");
        match round {
            Some(r) => {
                let ban_error = RoundError::signed(
                    r.id(),
                    NodeId::SCHEDULER,
                    format!(
                        "round killed due to participation of banned node {}",
                        update.node
                    ),
                    self.state.signing_key(),
                );
                if let Some(node) = self.state.node_map().get(&update.node) {
                    node.clear_round();
                }
                r.disarm_timeout();
                kill_round(
                    &self.state,
                    &self.storage,
                    &r,
                    Some(ban_error),
                    &self.tracker,
                )
            }
            None => {
                self.pool.ban(&update.node);
                Ok(())
            }
        }
    }
}

/// Fail a round: append the error, transition to FAILED, publish, and
/// clean up the record exactly once even under concurrent error reports.
///
/// The walk over the topology counts members whose round pointer is
/// already cleared (or points elsewhere): when all are clear the record
/// is deleted from the round map, and the first clearer persists the
/// round metric and the formatted error.
pub(crate) fn kill_round(
    state: &Arc<NetworkState>,
    storage: &Storage,
    round: &Arc<RoundState>,
    round_error: Option<RoundError>,
    tracker: &RoundTracker,
) -> Result<(), RegistrarError> {
    let round_id = round.id();
    if let Some(e) = &round_error {
        round.append_error(e.clone());
    }
    // A second killer finds the round already FAILED; the phase stays
    // put, the fresh error is recorded, and no duplicate FAILED entry
    // reaches the log.
    let newly_failed = round.update(RoundPhase::Failed, now_nanos()).is_ok();
    if newly_failed {
        tracker.remove(round_id);
    }
    let round_info = round.build_round_info();
    if newly_failed {
        state.add_round_update(round_info.clone())?;
    }

    let mut cleared = 0usize;
    for member in round.topology() {
        let still_assigned = state
            .node_map()
            .get(member)
            .and_then(|n| n.current_round())
            .map(|r| r.id() == round_id)
            .unwrap_or(false);
        if !still_assigned {
            cleared += 1;
        }
    }

    if cleared == round.team_size() {
        // Every member is done with the round; the record can finally go.
        state.round_map().delete(round_id);
    }
    if cleared == 1 {
        let storage = storage.clone();
        tokio::spawn(async move {
            store_round_metric(&storage, &round_info, RoundPhase::Failed, 0);

            let Some(e) = round_error else { return };
            let formatted = format!("Round Error from {}: {}", e.node_id, e.error);
            info!(round = round_id, "{}", formatted);
            if let Err(err) = storage.insert_round_error(round_id, &formatted) {
                warn!(round = round_id, error = %err, "could not insert round error");
            }
        });
    }

    Ok(())
}

/// Persist the timing summary of a finished round. Storage failures are
/// logged and dropped; metrics are best-effort.
pub(crate) fn store_round_metric(
    storage: &Storage,
    round_info: &RoundInfo,
    end_phase: RoundPhase,
    realtime_end: u64,
) {
    let metric = RoundMetric {
        id: round_info.id,
        precomp_start: round_info.timestamps[RoundPhase::Precomputing.index()],
        precomp_end: round_info.timestamps[RoundPhase::Standby.index()],
        realtime_start: round_info.timestamps[RoundPhase::Realtime.index()],
        realtime_end,
        round_end: round_info.timestamps[end_phase.index()],
        batch_size: round_info.batch_size,
    };

    if let Err(e) = storage.insert_round_metric(metric, &round_info.topology) {
        error!(round = round_info.id, error = %e, "failed to insert round metric");
    }
}
