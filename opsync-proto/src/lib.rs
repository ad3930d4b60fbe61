//! Shared record model and wire formats for `opsync`.

pub mod codec;
pub mod message;
pub mod peer;
pub mod remote;
pub mod stamp;
pub mod table;
pub mod task;

pub use message::{Message, MessageKind};
pub use task::Task;
