//! Event-sourced instance state.
//!
//! Every push validates the transition against the current status, writes
//! the event and the aggregate columns it touches in one transaction, and only
//! then swaps the in-memory snapshot. A failed write leaves the snapshot as it
//! was.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use fleet_events::{
    EventOrigin, ExitInfo, InstanceEvent, InstanceEventPayload, InstanceEventType, InstanceStatus,
};
use fleet_id::EventIdGenerator;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use super::eventer::Eventer;
use super::replication::Replication;
use super::{Instance, LifecycleContext};
use crate::state::{StateStore, StateStoreError, StoredInstance};

/// Errors from pushing events.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

/// Snapshot published after every successful push.
#[derive(Debug, Clone)]
pub struct InstanceView {
    pub instance: Instance,
    pub last_event: Option<InstanceEvent>,
}

/// Sole owner of one instance aggregate.
pub struct EventLog {
    store: Arc<StateStore>,
    ids: &'static EventIdGenerator,
    eventer: Eventer,
    current: watch::Sender<InstanceView>,
    push_lock: Mutex<()>,
    _replication: Replication,
}

impl EventLog {
    /// Builds the log from persisted state and starts its outbox and
    /// replication workers. Must be called inside a tokio runtime.
    pub fn load(ctx: &LifecycleContext, stored: StoredInstance) -> Self {
        let pending = stored.unreported_events();
        let view = InstanceView {
            last_event: stored.last_event().cloned(),
            instance: stored.instance,
        };

        let eventer = Eventer::spawn(
            &view.instance,
            pending,
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.bus),
            ctx.config.outbox_retry_delay,
        );

        let (current, rx) = watch::channel(view);
        let replication = Replication::spawn(
            rx,
            Arc::clone(&ctx.replicator),
            ctx.config.replication_retry_delay,
        );

        Self {
            store: Arc::clone(&ctx.store),
            ids: EventIdGenerator::global(),
            eventer,
            current,
            push_lock: Mutex::new(()),
            _replication: replication,
        }
    }

    pub fn instance(&self) -> Instance {
        self.current.borrow().instance.clone()
    }

    pub fn status(&self) -> InstanceStatus {
        self.current.borrow().instance.status()
    }

    pub fn last_event(&self) -> Option<InstanceEvent> {
        self.current.borrow().last_event.clone()
    }

    /// Receives a new snapshot after each push.
    pub fn subscribe(&self) -> watch::Receiver<InstanceView> {
        self.current.subscribe()
    }

    /// Events still waiting for the cluster bus.
    pub fn pending_reports(&self) -> usize {
        self.eventer.pending()
    }

    /// Retry counter of the newest `prepare` event, if any.
    pub fn last_prepare_retries(&self) -> Result<Option<u32>, StateError> {
        let id = self.current.borrow().instance.id;
        let event = self
            .store
            .latest_instance_event(id, InstanceEventType::Prepare)?;
        Ok(event.and_then(|event| match event.payload {
            InstanceEventPayload::Prepare { retries } => Some(retries),
            _ => None,
        }))
    }

    /// `created -> preparing`, or a further attempt while preparing.
    ///
    /// Pushing the same attempt twice is a no-op.
    pub fn push_prepare_event(&self, retries: u32) -> Result<(), StateError> {
        let _guard = self.lock();
        let view = self.current.borrow().clone();
        let status = view.instance.status();

        if status == InstanceStatus::Preparing {
            let same_attempt = view.last_event.as_ref().is_some_and(|event| {
                matches!(event.payload, InstanceEventPayload::Prepare { retries: r } if r == retries)
            });
            if same_attempt {
                debug!(instance_id = %view.instance.id, retries, "Prepare attempt already recorded");
                return Ok(());
            }
        } else {
            check(status, InstanceStatus::Preparing)?;
        }

        self.commit(
            view,
            EventOrigin::System,
            InstanceStatus::Preparing,
            InstanceEventPayload::Prepare { retries },
        )
    }

    pub fn push_prepared_event(&self) -> Result<(), StateError> {
        self.transition(
            EventOrigin::System,
            InstanceStatus::Stopped,
            InstanceEventPayload::Prepared,
            |status| status == InstanceStatus::Preparing,
        )
    }

    /// Records a failed attempt. Status stays `preparing`; `give_up` turns the
    /// desired status to `destroying`.
    pub fn push_preparation_failed_event(
        &self,
        error: String,
        fatal: bool,
        give_up: bool,
    ) -> Result<(), StateError> {
        let _guard = self.lock();
        let view = self.current.borrow().clone();
        let status = view.instance.status();
        if status != InstanceStatus::Preparing {
            return Err(StateError::InvalidTransition {
                from: status,
                to: InstanceStatus::Preparing,
            });
        }

        self.commit(
            view,
            EventOrigin::System,
            InstanceStatus::Preparing,
            InstanceEventPayload::PreparationFailed {
                error,
                fatal,
                give_up,
            },
        )
    }

    /// No-op when already starting or running.
    pub fn push_start_event(&self, origin: EventOrigin, is_restart: bool) -> Result<(), StateError> {
        let _guard = self.lock();
        let view = self.current.borrow().clone();
        let status = view.instance.status();
        if matches!(status, InstanceStatus::Starting | InstanceStatus::Running) {
            return Ok(());
        }
        check(status, InstanceStatus::Starting)?;

        self.commit(
            view,
            origin,
            InstanceStatus::Starting,
            InstanceEventPayload::Start { is_restart },
        )
    }

    pub fn push_start_failed_event(&self, error: String) -> Result<(), StateError> {
        self.transition(
            EventOrigin::System,
            InstanceStatus::Stopped,
            InstanceEventPayload::StartFailed { error },
            |status| status == InstanceStatus::Starting,
        )
    }

    pub fn push_started_event(&self) -> Result<(), StateError> {
        self.transition(
            EventOrigin::System,
            InstanceStatus::Running,
            InstanceEventPayload::Started,
            |_| true,
        )
    }

    pub fn push_stop_event(&self, origin: EventOrigin) -> Result<(), StateError> {
        self.transition(
            origin,
            InstanceStatus::Stopping,
            InstanceEventPayload::Stop,
            |_| true,
        )
    }

    pub fn push_exited_event(&self, exit: ExitInfo) -> Result<(), StateError> {
        self.transition(
            EventOrigin::System,
            InstanceStatus::Stopped,
            InstanceEventPayload::Exited(exit),
            |status| status.has_workload(),
        )
    }

    /// No-op when already destroying or destroyed.
    pub fn push_destroy_event(&self, origin: EventOrigin, reason: &str) -> Result<(), StateError> {
        let _guard = self.lock();
        let view = self.current.borrow().clone();
        let status = view.instance.status();
        if matches!(
            status,
            InstanceStatus::Destroying | InstanceStatus::Destroyed
        ) {
            return Ok(());
        }
        check(status, InstanceStatus::Destroying)?;

        self.commit(
            view,
            origin,
            InstanceStatus::Destroying,
            InstanceEventPayload::Destroy {
                reason: reason.to_string(),
            },
        )
    }

    pub fn push_destroyed_event(&self) -> Result<(), StateError> {
        self.transition(
            EventOrigin::System,
            InstanceStatus::Destroyed,
            InstanceEventPayload::Destroyed,
            |_| true,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.push_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plain table-checked push. `allowed_from` narrows the legal sources
    /// further where the table alone is too loose.
    fn transition(
        &self,
        origin: EventOrigin,
        to: InstanceStatus,
        payload: InstanceEventPayload,
        allowed_from: impl FnOnce(InstanceStatus) -> bool,
    ) -> Result<(), StateError> {
        let _guard = self.lock();
        let view = self.current.borrow().clone();
        let from = view.instance.status();
        if !allowed_from(from) {
            return Err(StateError::InvalidTransition { from, to });
        }
        check(from, to)?;
        self.commit(view, origin, to, payload)
    }

    /// Persists the event with its aggregate changes, then publishes.
    /// Caller holds the push lock.
    fn commit(
        &self,
        view: InstanceView,
        origin: EventOrigin,
        status: InstanceStatus,
        payload: InstanceEventPayload,
    ) -> Result<(), StateError> {
        let floor = view.last_event.as_ref().map(|event| event.id);
        let event = InstanceEvent {
            id: self.ids.next_after(floor),
            origin,
            status,
            payload,
            timestamp: Utc::now(),
        };

        let prev = &view.instance;
        let mut next = prev.clone();
        next.apply(&event);

        let tx = self.store.begin_tx()?;
        tx.store_instance_event(next.id, &event)?;
        if next.state.desired_status != prev.state.desired_status {
            tx.update_instance_desired_status(next.id, next.state.desired_status)?;
        }
        if next.state.restarts != prev.state.restarts {
            if next.state.restarts == 0 {
                tx.reset_restarts(next.id)?;
            } else {
                tx.increment_instance_restarts(next.id)?;
            }
        }
        if next.prepared && !prev.prepared {
            tx.mark_instance_as_prepared(next.id)?;
        }
        if next.destroyed && !prev.destroyed {
            tx.mark_instance_destroyed(next.id)?;
        }
        tx.commit()?;

        info!(
            instance_id = %next.id,
            event_type = %event.event_type(),
            from = %prev.status(),
            status = %next.status(),
            "Instance event recorded"
        );

        self.current.send_replace(InstanceView {
            instance: next,
            last_event: Some(event.clone()),
        });
        self.eventer.report(event);

        Ok(())
    }
}

fn check(from: InstanceStatus, to: InstanceStatus) -> Result<(), StateError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StateError::InvalidTransition { from, to })
    }
}
