//! Per-instance lifecycle management.
//!
//! An instance is owned by exactly one [`EventLog`], which is the only thing
//! allowed to mutate it. Every mutation is an [`InstanceEvent`] that is
//! persisted together with the aggregate columns it changes, then folded into
//! the in-memory copy with [`Instance::apply`].
//!
//! ```text
//! Manager ──push──> EventLog ──tx──> StateStore
//!    │                 │ ├──report──> Eventer ──request──> EventBus
//!    │                 │ └──watch───> Replication ──upsert──> ClusterReplicator
//!    └──calls──> Runtime
//! ```

mod event_log;
mod eventer;
mod manager;
mod replication;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_events::{InstanceEvent, InstanceEventPayload, InstanceStatus};
use fleet_id::{FleetId, InstanceId, MachineId, NodeId, ReservationId};
use serde::{Deserialize, Serialize};

pub use event_log::{EventLog, InstanceView, StateError};
pub use eventer::{event_subject, EventBus, Eventer};
pub use manager::Manager;
pub use replication::{ClusterReplicator, Replication};

use crate::config::LifecycleConfig;
use crate::runtime::Runtime;
use crate::state::StateStore;

/// Collaborators shared by every instance on the node.
#[derive(Clone)]
pub struct LifecycleContext {
    pub store: Arc<StateStore>,
    pub runtime: Arc<dyn Runtime>,
    pub bus: Arc<dyn EventBus>,
    pub replicator: Arc<dyn ClusterReplicator>,
    pub config: LifecycleConfig,
}

/// Resources granted to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub cpus: u32,
    pub cpu_mhz: u32,
    pub memory_mb: u32,
}

/// What happens when a workload exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Leave the instance stopped.
    #[default]
    No,
    /// Restart after an unsuccessful exit, at most `max_retries` times in a row.
    OnFailure { max_retries: u32 },
    /// Restart after every unrequested exit.
    Always,
}

impl RestartPolicy {
    /// Whether an unrequested exit should be followed by a restart.
    pub fn should_restart(&self, success: bool, restarts: u32) -> bool {
        match self {
            Self::No => false,
            Self::OnFailure { max_retries } => !success && restarts < *max_retries,
            Self::Always => true,
        }
    }
}

/// Workload configuration. Immutable once the instance exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub guest: GuestConfig,
    #[serde(default)]
    pub restart: RestartPolicy,
}

/// Mutable part of the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Target requested by the latest intent-changing operation.
    pub desired_status: InstanceStatus,
    /// Last achieved status; always the status of the latest event.
    pub status: InstanceStatus,
    /// Consecutive restarts since the last user start or stop.
    pub restarts: u32,
}

impl InstanceState {
    pub fn new(desired_status: InstanceStatus) -> Self {
        Self {
            desired_status,
            status: InstanceStatus::Created,
            restarts: 0,
        }
    }
}

/// Request to place a new instance on this node.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub namespace: String,
    pub machine_id: MachineId,
    pub fleet_id: FleetId,
    pub reservation_id: ReservationId,
    pub config: InstanceConfig,
    pub local_ipv4: Option<Ipv4Addr>,
    /// Start the workload as soon as preparation succeeds.
    pub start: bool,
}

/// The instance aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub namespace: String,
    pub machine_id: MachineId,
    pub fleet_id: FleetId,
    pub node_id: NodeId,
    pub reservation_id: ReservationId,
    pub config: InstanceConfig,
    pub local_ipv4: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
    pub state: InstanceState,
    pub prepared: bool,
    pub destroyed: bool,
}

impl Instance {
    /// Builds a fresh aggregate in status `created`.
    pub fn create(request: CreateInstanceRequest, node_id: NodeId) -> Self {
        let desired = if request.start {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        };

        Self {
            id: InstanceId::new(),
            namespace: request.namespace,
            machine_id: request.machine_id,
            fleet_id: request.fleet_id,
            node_id,
            reservation_id: request.reservation_id,
            config: request.config,
            local_ipv4: request.local_ipv4,
            created_at: Utc::now(),
            state: InstanceState::new(desired),
            prepared: false,
            destroyed: false,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.status
    }

    /// Folds one event into the aggregate.
    ///
    /// This is the only place that decides how an event changes the
    /// aggregate; pushing and replaying both go through it.
    pub fn apply(&mut self, event: &InstanceEvent) {
        use InstanceEventPayload as P;

        match &event.payload {
            P::Prepare { .. } | P::Started | P::StartFailed { .. } | P::Exited(_) => {}
            P::Prepared => self.prepared = true,
            P::PreparationFailed { give_up, .. } => {
                if *give_up {
                    self.state.desired_status = InstanceStatus::Destroying;
                }
            }
            P::Start { is_restart } => {
                self.state.desired_status = InstanceStatus::Running;
                self.state.restarts = if *is_restart {
                    self.state.restarts.saturating_add(1)
                } else {
                    0
                };
            }
            P::Stop => {
                self.state.desired_status = InstanceStatus::Stopped;
                self.state.restarts = 0;
            }
            P::Destroy { .. } => self.state.desired_status = InstanceStatus::Destroyed,
            P::Destroyed => self.destroyed = true,
        }

        self.state.status = event.status;
    }

    /// Rebuilds the aggregate from its event history.
    ///
    /// `initial_desired` is the desired status the instance was created with.
    pub fn replay<'a>(
        &self,
        initial_desired: InstanceStatus,
        events: impl IntoIterator<Item = &'a InstanceEvent>,
    ) -> Instance {
        let mut replayed = Instance {
            state: InstanceState::new(initial_desired),
            prepared: false,
            destroyed: false,
            ..self.clone()
        };
        for event in events {
            replayed.apply(event);
        }
        replayed
    }
}
