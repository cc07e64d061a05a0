//! Fleet Node Agent Library
//!
//! The node agent runs on each host and drives the lifecycle of the workload
//! instances placed on it. Every instance is event sourced: lifecycle
//! operations append events to a local SQLite log, the aggregate is folded
//! from those events, and each event is delivered to the control plane
//! through a durable per-instance outbox.
//!
//! ## Architecture
//!
//! ```text
//! Agent
//! └── Manager(id)             (serialized lifecycle operations)
//!     ├── EventLog            (transactional event + aggregate writes)
//!     │   ├── Eventer         (ordered, at-least-once event delivery)
//!     │   └── Replication     (best-effort snapshot upserts)
//!     └── Runtime             (host-side workload operations)
//! ```
//!
//! ## Modules
//!
//! - `agent`: Registry of instance managers, creation and startup recovery
//! - `instance`: Aggregate, event log, outbox, replication and manager
//! - `runtime`: Workload runtime interface and mock implementation
//! - `state`: Local SQLite state persistence
//! - `client`: HTTP client for the control plane

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod instance;
pub mod runtime;
pub mod state;

// Fakes and fixtures for unit and integration tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use agent::Agent;
pub use client::ControlPlaneClient;
pub use config::{Config, LifecycleConfig};
pub use error::LifecycleError;
pub use instance::{CreateInstanceRequest, Instance, LifecycleContext, Manager};
pub use runtime::{MockRuntime, Runtime, StopSignal};
