//! # Mixnet Storage Crate
//!
//! The persistence seam of the permissioning server. The scheduler and
//! poll handler only ever talk to [`Storage`], which wraps an object-safe
//! [`Database`] trait; [`MapImpl`] is the in-memory variant used by
//! default and by every test. A relational backend is a drop-in
//! implementation of the same trait.

pub mod database;
pub mod map_impl;
pub mod models;

pub use database::{Database, Storage, StorageError};
pub use map_impl::MapImpl;
pub use models::{
    Application, GeoBin, Node, NodeMetric, RoundErrorRecord, RoundMetric, Status,
};
