//! WebSocket relay support.
//!
//! Clients join one or more database names and publish committed change
//! envelopes. The relay forwards each envelope to every other connection
//! joined to the same database.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
