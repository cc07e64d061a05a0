//! Best-effort replication of instance snapshots to cluster state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::event_log::InstanceView;
use super::Instance;

/// Eventually consistent cluster-wide store of instance snapshots.
#[async_trait]
pub trait ClusterReplicator: Send + Sync {
    async fn upsert_instance(&self, instance: &Instance) -> anyhow::Result<()>;
}

/// Replication worker for one instance.
///
/// Signals coalesce in the watch channel: while an upsert is in flight, any
/// number of pushes collapse into one follow-up carrying the newest snapshot.
/// The snapshot present at spawn is upserted once, since an upsert lost to a
/// crash would otherwise wait for the next event.
pub struct Replication {
    task: JoinHandle<()>,
}

impl Replication {
    pub fn spawn(
        mut rx: watch::Receiver<InstanceView>,
        replicator: Arc<dyn ClusterReplicator>,
        retry_delay: Duration,
    ) -> Self {
        rx.mark_changed();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                loop {
                    let instance = rx.borrow_and_update().instance.clone();
                    match replicator.upsert_instance(&instance).await {
                        Ok(()) => {
                            debug!(instance_id = %instance.id, status = %instance.status(), "Instance replicated");
                            break;
                        }
                        Err(e) => {
                            warn!(
                                instance_id = %instance.id,
                                error = %e,
                                "Failed to replicate instance, retrying"
                            );
                            tokio::time::sleep(retry_delay).await;
                        }
                    }
                }
            }
        });

        Self { task }
    }
}

impl Drop for Replication {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use crate::testing::{create_stored, test_context, wait_until, RecordingBus, RecordingReplicator};
    use fleet_events::InstanceStatus;

    #[tokio::test]
    async fn test_replicates_latest_snapshot_after_failures() {
        let ctx = test_context(Arc::new(MockRuntime::new()), Arc::new(RecordingBus::default()));
        let stored = create_stored(&ctx, false);
        let instance = stored.instance.clone();

        let (tx, rx) = watch::channel(InstanceView {
            instance: instance.clone(),
            last_event: None,
        });
        let replicator = Arc::new(RecordingReplicator::failing(2));
        let _replication = Replication::spawn(rx, replicator.clone(), Duration::from_millis(5));

        let mut preparing = instance.clone();
        preparing.state.status = InstanceStatus::Preparing;
        tx.send_replace(InstanceView {
            instance: preparing,
            last_event: None,
        });

        let mut stopped = instance.clone();
        stopped.state.status = InstanceStatus::Stopped;
        tx.send_replace(InstanceView {
            instance: stopped,
            last_event: None,
        });

        wait_until(|| !replicator.upserts().is_empty()).await;
        let upserts = replicator.upserts();
        assert_eq!(upserts.last().map(Instance::status), Some(InstanceStatus::Stopped));
        assert!(replicator.attempts() >= 3);
    }

    #[tokio::test]
    async fn test_loaded_snapshot_replicated_once() {
        let ctx = test_context(Arc::new(MockRuntime::new()), Arc::new(RecordingBus::default()));
        let stored = create_stored(&ctx, false);
        let id = stored.instance.id;
        let (_tx, rx) = watch::channel(InstanceView {
            instance: stored.instance,
            last_event: None,
        });
        let replicator = Arc::new(RecordingReplicator::default());
        let _replication = Replication::spawn(rx, replicator.clone(), Duration::from_millis(5));

        wait_until(|| replicator.upserts().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(replicator.attempts(), 1);
        assert_eq!(replicator.upserts()[0].id, id);
    }
}
