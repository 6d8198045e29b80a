//! # Mixnet Registrar
//!
//! The control plane of the mix network. The registrar holds the
//! authoritative view of every registered node, accepts their heartbeat
//! polls, composes teams out of the waiting pool, drives rounds through
//! the precompute/realtime lifecycle, and publishes the signed network
//! definition plus an ordered stream of round updates that every node
//! consumes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           REGISTRAR                              │
//! │                                                                  │
//! │  ┌────────────┐  notifications   ┌───────────────┐               │
//! │  │ PollHandler│─────────────────▶│   Scheduler   │               │
//! │  │ (per node) │   (+ lock token) │ (single task) │               │
//! │  └─────┬──────┘                  └──────┬────────┘               │
//! │        │                                │                        │
//! │        │ read                           │ write                  │
//! │        ▼                                ▼                        │
//! │  ┌──────────────────────────────────────────────┐                │
//! │  │ NetworkState: node map · round map · NDF ·   │                │
//! │  │ update log · monotonic counters · signing key│                │
//! │  └──────────────────────────────────────────────┘                │
//! │        ▲                                ▲                        │
//! │        │ ticks                          │ timeouts               │
//! │  ┌─────┴──────┐                  ┌──────┴────────┐               │
//! │  │MetricTracker│                 │ Round timers  │               │
//! │  └────────────┘                  └───────────────┘               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The wire transport, TLS material handling and the relational storage
//! backend are external collaborators; this crate consumes their seams
//! ([`connectivity::ConnectivityProber`], [`registration::GeoLookup`],
//! `mixnet_storage::Database`).

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod connectivity;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod ndf;
pub mod poll;
pub mod registration;
pub mod scheduling;
pub mod state;
pub mod trackers;
pub mod wire;

pub use config::Params;
pub use error::RegistrarError;
pub use poll::Registrar;

/// Current wall-clock time as unix nanoseconds.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
