//! # Mixnet Common Crate
//!
//! Shared primitives used by the permissioning server and its tests.
//!
//! ## Modules
//! - `activity`: the self-reported node activity enum
//! - `round`: round lifecycle phases
//! - `transition`: the activity transition table and round-phase checks
//! - `node_id`: opaque 32-byte node identifiers
//! - `crypto`: Ed25519 sign/verify and hex helpers
//! - `version`: semantic version parsing and compatibility

pub mod activity;
pub mod crypto;
pub mod node_id;
pub mod round;
pub mod transition;
pub mod version;

pub use activity::Activity;
pub use node_id::NodeId;
pub use round::RoundPhase;
pub use transition::RoundRequirement;
pub use version::Version;
