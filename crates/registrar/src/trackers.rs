//! Background trackers for operator-driven node state: bans recorded in
//! storage and the on-disk disabled-nodes list.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use mixnet_common::NodeId;
use mixnet_storage::{Status, Storage};

use crate::config::Params;
use crate::state::network::NetworkState;
use crate::state::node::UpdateNotification;
use crate::state::pool::WaitingPool;

/// Poll storage for operator-banned nodes and feed ban notifications to
/// the scheduler. `NodeState::ban` is idempotent, so re-observing a ban
/// is harmless.
pub async fn track_banned_nodes(
    state: Arc<NetworkState>,
    storage: Storage,
    update_tx: mpsc::UnboundedSender<UpdateNotification>,
    params: Params,
    mut quit_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(params.ban_tracker_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = quit_rx.changed() => {
                if changed.is_err() || *quit_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                apply_bans(&state, &storage, &update_tx);
            }
        }
    }
}

/// One ban-tracker sweep; split out for tests.
pub fn apply_bans(
    state: &Arc<NetworkState>,
    storage: &Storage,
    update_tx: &mpsc::UnboundedSender<UpdateNotification>,
) {
    let rows = match storage.get_nodes_by_status(Status::Banned) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "could not query banned nodes");
            return;
        }
    };
    for row in rows {
        let Some(id) = row.id else { continue };
        let Some(node) = state.node_map().get(&id) else {
            continue;
        };
        if let Some(notification) = node.ban() {
            debug!(node = %id, "banning node");
            if update_tx.send(notification).is_err() {
                return;
            }
        }
    }
}

/// Poll the disabled-nodes file: listed nodes are set `Inactive` and
/// shelved from the pool until the operator removes them, after which
/// their next poll restores them.
pub async fn track_disabled_nodes(
    state: Arc<NetworkState>,
    pool: Arc<WaitingPool>,
    params: Params,
    mut quit_rx: watch::Receiver<bool>,
) {
    let Some(path) = params.disabled_nodes_path.clone() else {
        return;
    };
    let mut ticker = tokio::time::interval(params.disabled_nodes_poll_duration());
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = quit_rx.changed() => {
                if changed.is_err() || *quit_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                apply_disabled_list(&state, &pool, &path);
            }
        }
    }
}

/// One disabled-list sweep; split out for tests. The file holds one hex
/// node id per line; blank lines and `#` comments are skipped.
pub fn apply_disabled_list(state: &Arc<NetworkState>, pool: &Arc<WaitingPool>, path: &Path) {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read disabled nodes list");
            return;
        }
    };

    let mut disabled: HashSet<NodeId> = HashSet::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match NodeId::from_hex(line) {
            Ok(id) => {
                disabled.insert(id);
            }
            Err(e) => warn!(line, error = %e, "bad entry in disabled nodes list"),
        }
    }

    for node in state.node_map().all() {
        if disabled.contains(&node.id()) && node.status() == Status::Active {
            debug!(node = %node.id(), "disabling node");
            node.set_status(Status::Inactive);
            pool.set_offline(node);
        }
    }
}
