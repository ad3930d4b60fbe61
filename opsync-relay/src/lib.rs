//! `opsync` relay library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! holds the shared tables in memory, answers client requests, and pushes
//! row changes to every connection subscribed to the table.

pub mod config;
pub mod relay;
pub mod store;
