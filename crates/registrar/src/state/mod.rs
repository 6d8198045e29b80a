//! Live network state: nodes, rounds, the waiting pool, the update log
//! and the aggregate [`network::NetworkState`].

pub mod network;
pub mod node;
pub mod pool;
pub mod round;
pub mod updates;

pub use network::{NetworkState, NodeMap};
pub use node::{Connectivity, NodeState, UpdateNotification};
pub use pool::WaitingPool;
pub use round::{RoundMap, RoundState};
pub use updates::{MonotonicCounter, UpdateLog};
