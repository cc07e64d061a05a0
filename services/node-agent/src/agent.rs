//! Node-wide registry of instance managers.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_id::{InstanceId, NodeId};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::LifecycleError;
use crate::instance::{CreateInstanceRequest, Instance, LifecycleContext, Manager, StateError};
use crate::state::StoredInstance;

/// Owns one [`Manager`] per instance placed on this node.
pub struct Agent {
    node_id: NodeId,
    ctx: LifecycleContext,
    managers: RwLock<HashMap<InstanceId, Arc<Manager>>>,
}

impl Agent {
    pub fn new(node_id: NodeId, ctx: LifecycleContext) -> Self {
        Self {
            node_id,
            ctx,
            managers: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Persists a new instance and prepares it in the background.
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<Arc<Manager>, LifecycleError> {
        let instance = Instance::create(request, self.node_id);
        self.ctx
            .store
            .create_instance(&instance)
            .map_err(StateError::from)?;

        info!(
            instance_id = %instance.id,
            machine_id = %instance.machine_id,
            image = %instance.config.image,
            "Instance created"
        );

        let manager = Manager::load(
            &self.ctx,
            StoredInstance {
                initial_desired_status: instance.state.desired_status,
                instance,
                events: Vec::new(),
                last_reported_event_id: None,
            },
        );
        self.managers
            .write()
            .await
            .insert(manager.instance().id, Arc::clone(&manager));

        let preparing = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = preparing.prepare().await {
                warn!(instance_id = %preparing.instance().id, error = %e, "Preparation failed");
            }
        });

        Ok(manager)
    }

    /// Loads every persisted instance and reconciles it with the runtime.
    ///
    /// Returns how many instances were recovered. A failure on one instance
    /// is logged and does not stop the others.
    pub async fn recover(&self) -> Result<usize, LifecycleError> {
        let stored = self
            .ctx
            .store
            .load_instances()
            .map_err(StateError::from)?;
        let count = stored.len();

        for stored in stored {
            let id = stored.instance.id;
            let manager = Manager::load(&self.ctx, stored);
            self.managers.write().await.insert(id, Arc::clone(&manager));

            if let Err(e) = manager.recover().await {
                error!(instance_id = %id, error = %e, "Failed to recover instance");
            }
        }

        info!(count, "Recovered instances");
        Ok(count)
    }

    pub async fn get(&self, id: InstanceId) -> Result<Arc<Manager>, LifecycleError> {
        self.managers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LifecycleError::NotFound(id))
    }

    /// Snapshots of every registered instance.
    pub async fn instances(&self) -> Vec<Instance> {
        self.managers
            .read()
            .await
            .values()
            .map(|manager| manager.instance())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use crate::testing::{instance_request, test_context, wait_until, RecordingBus};
    use fleet_events::InstanceStatus;

    #[tokio::test]
    async fn test_create_instance_registers_and_prepares() {
        let ctx = test_context(Arc::new(MockRuntime::new()), Arc::new(RecordingBus::default()));
        let agent = Agent::new(NodeId::new(), ctx);

        let manager = agent.create_instance(instance_request(false)).await.unwrap();
        let id = manager.instance().id;
        assert_eq!(manager.instance().node_id, agent.node_id());

        wait_until(|| manager.status() == InstanceStatus::Stopped).await;
        let found = agent.get(id).await.unwrap();
        assert!(Arc::ptr_eq(&found, &manager));
        assert_eq!(agent.instances().await.len(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_instance() {
        let ctx = test_context(Arc::new(MockRuntime::new()), Arc::new(RecordingBus::default()));
        let agent = Agent::new(NodeId::new(), ctx);
        let id = InstanceId::new();

        let err = agent.get(id).await.err().unwrap();
        assert!(matches!(err, LifecycleError::NotFound(missing) if missing == id));
    }
}
