//! Canonical merge of records from every transport.
//!
//! [`Synchronizer`] holds one ordered, deduplicated, retention-bounded
//! collection per record type and mirrors it to the durable store. The
//! per-type rules live behind the [`Record`] trait.

pub mod collection;
pub mod engine;
pub mod messages;
pub mod record;
pub mod retention;

pub use collection::{Collection, signature};
pub use engine::{Applied, Origin, Subscription, SyncEvent, SyncPolicy, Synchronizer};
pub use record::Record;
pub use retention::RetentionPolicy;
