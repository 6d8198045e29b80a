//! The node metric tracker.
//!
//! Runs on a fixed ticker. Each tick reads and resets every node's poll
//! counter into a `NodeMetric` row, shelves nodes that went a whole
//! interval without polling (marked `Stale`, moved offline in the pool,
//! and pruned from the advertised NDF when pruning is enabled), and
//! republishes the NDF accordingly. A pruned node is restored by the
//! poll handler on its next successful poll.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use mixnet_common::NodeId;
use mixnet_storage::{NodeMetric, Status, Storage};

use crate::config::Params;
use crate::ndf::export_ndf;
use crate::now_nanos;
use crate::state::network::NetworkState;
use crate::state::pool::WaitingPool;

/// One tick of the tracker; split out for tests.
pub fn record_node_metrics(
    state: &Arc<NetworkState>,
    storage: &Storage,
    pool: &Arc<WaitingPool>,
    params: &Params,
    start_time: u64,
) {
    let end_time = now_nanos();
    let mut to_prune: HashSet<NodeId> = HashSet::new();

    for node in state.node_map().all() {
        let num_pings = node.poll_count_and_reset();
        let metric = NodeMetric {
            node_id: node.id(),
            start_time,
            end_time,
            num_pings,
        };
        if let Err(e) = storage.insert_node_metric(metric) {
            // Metric persistence is best-effort.
            error!(node = %node.id(), error = %e, "unable to store node metric");
        }

        if num_pings == 0 {
            to_prune.insert(node.id());
            if node.status() == Status::Active {
                node.set_status(Status::Stale);
            }
            pool.set_offline(node);
        }
    }

    if !params.disable_ndf_pruning {
        debug!(pruned = to_prune.len(), "setting pruned nodes");
        if let Err(e) = state.ndf().set_pruned(to_prune, state.signing_key()) {
            error!(error = %e, "failed to regenerate the NDF after pruning");
        } else if let Err(e) = export_ndf(state.ndf(), &params.ndf_output_path) {
            warn!(error = %e, "could not export NDF");
        }
    }
}

/// Background loop: persist per-node ping counts every
/// `node_metric_interval` and prune absentees until the quit channel
/// flips.
pub async fn track_node_metrics(
    state: Arc<NetworkState>,
    storage: Storage,
    pool: Arc<WaitingPool>,
    params: Params,
    mut quit_rx: watch::Receiver<bool>,
) {
    debug!(
        interval_s = params.node_metric_interval_s,
        "beginning storage of node metrics"
    );
    let mut ticker = tokio::time::interval(params.node_metric_interval());
    // The first tick fires immediately; skip it so the first interval is
    // a full one.
    ticker.tick().await;
    let mut start_time = now_nanos();

    loop {
        tokio::select! {
            changed = quit_rx.changed() => {
                if changed.is_err() || *quit_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                record_node_metrics(&state, &storage, &pool, &params, start_time);
                start_time = now_nanos();
            }
        }
    }
}
