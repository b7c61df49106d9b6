pub mod connection;
pub mod protocol;
pub mod replication;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{ConnectionManager, ControlClient, ReplicationConnection, ReplicationTransport};
pub use replication::{ReplicationSession, ReplicationStarter, SystemInfo};
pub use types::*;
