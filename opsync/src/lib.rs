//! `opsync`: offline-first synchronization of shared tasks and messages.
//!
//! One canonical, deduplicated, retention-bounded collection per record
//! type, fed by a durable local store, a same-network peer channel, and a
//! remote realtime store. Start from [`client::SyncClient`].

pub mod client;
pub mod config;
pub mod identity;
pub mod peer;
pub mod remote;
pub mod store;
pub mod sync;
