//! Per-round timeout supervision.
//!
//! Each armed supervisor is one task racing a timer against the round's
//! disarm channel. If the timer wins, the round id is emitted on the
//! scheduler's timeout channel and the scheduler feeds a self-signed
//! round error into `kill_round`. Completing the phase first (or arming
//! a new supervisor, which replaces the disarm handle) cancels the timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::state::round::RoundState;

/// Arm a timeout supervisor for the round's current phase.
pub fn arm_round_timeout(
    round: &Arc<RoundState>,
    timeout: Duration,
    timeout_tx: mpsc::UnboundedSender<u64>,
) {
    let (disarm_tx, disarm_rx) = oneshot::channel();
    round.set_timeout_disarm(disarm_tx);

    let round = Arc::clone(round);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                trace!(round = round.id(), "round timeout fired");
                // Scheduler gone means shutdown; nothing left to kill.
                let _ = timeout_tx.send(round.id());
            }
            // Fires on disarm or when the handle is replaced/dropped.
            _ = disarm_rx => {
                trace!(round = round.id(), "round timeout disarmed");
            }
        }
    });
}
