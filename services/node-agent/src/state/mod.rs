//! Local state persistence for the node agent.
//!
//! SQLite holds every instance placed on this node and its full event log.
//! Event rows and the aggregate columns they change are written in one
//! transaction, so after a crash the store never holds an event without its
//! aggregate update or the other way around.

mod store;

pub use store::{StateStore, StateStoreError, StoreTx, StoredInstance};
