//! Durable outbox delivering instance events to the cluster bus.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_events::InstanceEvent;
use fleet_id::{InstanceId, MachineId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Instance;
use crate::state::StateStore;

/// Request/reply publisher for instance events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes one event. `Ok` means the bus acknowledged it.
    async fn request(&self, subject: &str, event: &InstanceEvent) -> anyhow::Result<()>;
}

/// Bus subject for one instance's events.
pub fn event_subject(machine_id: MachineId, instance_id: InstanceId) -> String {
    format!("machines.{machine_id}.instances.{instance_id}.events")
}

struct Outbox {
    queue: Mutex<VecDeque<InstanceEvent>>,
    wake: Notify,
}

impl Outbox {
    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<InstanceEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn head(&self) -> Option<InstanceEvent> {
        self.queue().front().cloned()
    }
}

/// Per-instance outbox.
///
/// Events are delivered in order, one at a time. A failing head event is
/// retried until the bus takes it; nothing behind it is sent meanwhile. The
/// persisted cursor only moves after an acknowledgement, so a restart
/// re-sends at most the head.
pub struct Eventer {
    outbox: Arc<Outbox>,
    task: JoinHandle<()>,
}

impl Eventer {
    /// Starts the delivery worker, seeded with events the bus has not
    /// acknowledged yet.
    pub fn spawn(
        instance: &Instance,
        pending: Vec<InstanceEvent>,
        store: Arc<StateStore>,
        bus: Arc<dyn EventBus>,
        retry_delay: Duration,
    ) -> Self {
        let outbox = Arc::new(Outbox {
            queue: Mutex::new(pending.into()),
            wake: Notify::new(),
        });
        if outbox.head().is_some() {
            outbox.wake.notify_one();
        }

        let worker = Worker {
            outbox: Arc::clone(&outbox),
            instance_id: instance.id,
            subject: event_subject(instance.machine_id, instance.id),
            store,
            bus,
            retry_delay,
        };
        let task = tokio::spawn(worker.run());

        Self { outbox, task }
    }

    /// Queues an event and wakes the worker.
    pub fn report(&self, event: InstanceEvent) {
        self.outbox.queue().push_back(event);
        self.outbox.wake.notify_one();
    }

    /// Number of events not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.outbox.queue().len()
    }
}

impl Drop for Eventer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Worker {
    outbox: Arc<Outbox>,
    instance_id: InstanceId,
    subject: String,
    store: Arc<StateStore>,
    bus: Arc<dyn EventBus>,
    retry_delay: Duration,
}

impl Worker {
    async fn run(self) {
        loop {
            self.outbox.wake.notified().await;
            self.drain().await;
        }
    }

    async fn drain(&self) {
        while let Some(event) = self.outbox.head() {
            match self.bus.request(&self.subject, &event).await {
                Ok(()) => {
                    if let Err(e) = self.store.set_last_reported_event_id(self.instance_id, event.id) {
                        // The event stays delivered; a restart re-sends it.
                        warn!(
                            instance_id = %self.instance_id,
                            event_id = %event.id,
                            error = %e,
                            "Failed to persist outbox cursor"
                        );
                    }
                    self.outbox.queue().pop_front();
                    debug!(instance_id = %self.instance_id, event_id = %event.id, "Event reported");
                }
                Err(e) => {
                    warn!(
                        instance_id = %self.instance_id,
                        event_id = %event.id,
                        error = %e,
                        "Failed to report event, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}
