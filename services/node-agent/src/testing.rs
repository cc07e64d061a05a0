//! Fakes and fixtures shared by unit and integration tests.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use fleet_events::{EventOrigin, InstanceEvent, InstanceEventPayload, InstanceStatus};
use fleet_id::{EventIdGenerator, FleetId, InstanceEventId, MachineId, NodeId, ReservationId};

use crate::config::LifecycleConfig;
use crate::instance::{
    ClusterReplicator, CreateInstanceRequest, EventBus, GuestConfig, Instance, InstanceConfig,
    LifecycleContext, RestartPolicy,
};
use crate::runtime::Runtime;
use crate::state::{StateStore, StoredInstance};

/// Bus that acknowledges everything and keeps what it saw.
#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<(String, InstanceEvent)>>,
}

impl RecordingBus {
    pub fn events(&self) -> Vec<(String, InstanceEvent)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn request(&self, subject: &str, event: &InstanceEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((subject.to_string(), event.clone()));
        Ok(())
    }
}

/// Bus that rejects one event a fixed number of times.
pub struct FlakyBus {
    fail_id: InstanceEventId,
    failures_left: AtomicU32,
    attempts: AtomicU32,
    delivered: Mutex<Vec<InstanceEventId>>,
}

impl FlakyBus {
    pub fn new(fail_id: InstanceEventId, failures: u32) -> Self {
        Self {
            fail_id,
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<InstanceEventId> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventBus for FlakyBus {
    async fn request(&self, _subject: &str, event: &InstanceEvent) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if event.id == self.fail_id
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            anyhow::bail!("bus unavailable");
        }
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.id);
        Ok(())
    }
}

/// Replicator that can fail its first calls and records the rest.
#[derive(Default)]
pub struct RecordingReplicator {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    upserts: Mutex<Vec<Instance>>,
}

impl RecordingReplicator {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn upserts(&self) -> Vec<Instance> {
        self.upserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ClusterReplicator for RecordingReplicator {
    async fn upsert_instance(&self, instance: &Instance) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("cluster store unavailable");
        }
        self.upserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance.clone());
        Ok(())
    }
}

/// Lifecycle timings short enough for tests.
pub fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        max_prepare_retries: 3,
        prepare_retry_delay: Duration::from_millis(5),
        replication_retry_delay: Duration::from_millis(5),
        outbox_retry_delay: Duration::from_millis(5),
        stop_timeout: Duration::from_millis(50),
    }
}

/// Context over a fresh in-memory store.
pub fn test_context(runtime: Arc<dyn Runtime>, bus: Arc<dyn EventBus>) -> LifecycleContext {
    let store = StateStore::open_in_memory().expect("in-memory store");
    test_context_with_store(Arc::new(store), runtime, bus)
}

pub fn test_context_with_store(
    store: Arc<StateStore>,
    runtime: Arc<dyn Runtime>,
    bus: Arc<dyn EventBus>,
) -> LifecycleContext {
    LifecycleContext {
        store,
        runtime,
        bus,
        replicator: Arc::new(RecordingReplicator::default()),
        config: test_config(),
    }
}

pub fn instance_request(start: bool) -> CreateInstanceRequest {
    CreateInstanceRequest {
        namespace: "default".to_string(),
        machine_id: MachineId::new(),
        fleet_id: FleetId::new(),
        reservation_id: ReservationId::new(),
        config: InstanceConfig {
            image: "registry.local/app:v1".to_string(),
            cmd: vec!["/bin/app".to_string()],
            env: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
            guest: GuestConfig {
                cpus: 1,
                cpu_mhz: 1000,
                memory_mb: 256,
            },
            restart: RestartPolicy::No,
        },
        local_ipv4: Some(Ipv4Addr::new(172, 19, 0, 2)),
        start,
    }
}

/// Persists a new instance and returns it as the store would load it.
pub fn create_stored(ctx: &LifecycleContext, start: bool) -> StoredInstance {
    create_stored_from(ctx, instance_request(start))
}

pub fn create_stored_from(ctx: &LifecycleContext, request: CreateInstanceRequest) -> StoredInstance {
    let instance = Instance::create(request, NodeId::new());
    ctx.store
        .create_instance(&instance)
        .expect("persist instance");
    StoredInstance {
        initial_desired_status: instance.state.desired_status,
        instance,
        events: Vec::new(),
        last_reported_event_id: None,
    }
}

/// Builds an event with a fresh monotonic ID.
pub fn event(payload: InstanceEventPayload, status: InstanceStatus) -> InstanceEvent {
    InstanceEvent {
        id: EventIdGenerator::global().next_id(),
        origin: EventOrigin::System,
        status,
        payload,
        timestamp: Utc::now(),
    }
}

/// Polls `cond` until it holds. Panics after five seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
