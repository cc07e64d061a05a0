//! SQLite-based state store for the node agent.
//!
//! This provides durable storage for instances and their event logs,
//! enabling recovery after agent restarts.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use fleet_events::{
    EventError, InstanceEvent, InstanceEventPayload, InstanceEventType, InstanceStatus,
};
use fleet_id::{IdError, InstanceEventId, InstanceId};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::instance::{Instance, InstanceState};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("State not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for StateStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Invalid(err.to_string())
    }
}

impl From<EventError> for StateStoreError {
    fn from(err: EventError) -> Self {
        Self::Invalid(err.to_string())
    }
}

impl From<IdError> for StateStoreError {
    fn from(err: IdError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// An instance as loaded at startup.
#[derive(Debug, Clone)]
pub struct StoredInstance {
    /// Aggregate with desired status, restarts and flags from their columns
    /// and status from the latest event.
    pub instance: Instance,

    /// Desired status the instance was created with (replay seed).
    pub initial_desired_status: InstanceStatus,

    /// Full event history in ID order.
    pub events: Vec<InstanceEvent>,

    /// Outbox cursor: newest event the cluster bus acknowledged.
    pub last_reported_event_id: Option<InstanceEventId>,
}

impl StoredInstance {
    pub fn last_event(&self) -> Option<&InstanceEvent> {
        self.events.last()
    }

    /// Events the bus has not acknowledged yet.
    pub fn unreported_events(&self) -> Vec<InstanceEvent> {
        self.events
            .iter()
            .filter(|event| Some(event.id) > self.last_reported_event_id)
            .cloned()
            .collect()
    }
}

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn().execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                machine_id TEXT NOT NULL,
                fleet_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                reservation_id TEXT NOT NULL,
                config TEXT NOT NULL,
                local_ipv4 TEXT,
                created_at TEXT NOT NULL,
                initial_desired_status TEXT NOT NULL,
                desired_status TEXT NOT NULL,
                restarts INTEGER NOT NULL DEFAULT 0,
                prepared INTEGER NOT NULL DEFAULT 0,
                destroyed INTEGER NOT NULL DEFAULT 0,
                last_reported_event_id TEXT
            );

            CREATE TABLE IF NOT EXISTS instance_events (
                event_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instances(instance_id),
                event_type TEXT NOT NULL,
                origin TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instance_events_instance
                ON instance_events(instance_id, event_id);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Persist a newly created instance. Fails if the ID already exists.
    pub fn create_instance(&self, instance: &Instance) -> Result<(), StateStoreError> {
        self.conn().execute(
            r#"
            INSERT INTO instances (
                instance_id, namespace, machine_id, fleet_id, node_id, reservation_id,
                config, local_ipv4, created_at, initial_desired_status, desired_status,
                restarts, prepared, destroyed
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11, ?12, ?13)
            "#,
            params![
                instance.id.to_string(),
                instance.namespace,
                instance.machine_id.to_string(),
                instance.fleet_id.to_string(),
                instance.node_id.to_string(),
                instance.reservation_id.to_string(),
                serde_json::to_string(&instance.config)?,
                instance.local_ipv4.map(|ip| ip.to_string()),
                instance.created_at.to_rfc3339(),
                instance.state.desired_status.as_str(),
                instance.state.restarts,
                instance.prepared,
                instance.destroyed,
            ],
        )?;
        Ok(())
    }

    /// Begin a write transaction. Dropping it without commit rolls back.
    pub fn begin_tx(&self) -> Result<StoreTx<'_>, StateStoreError> {
        let conn = self.conn();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(StoreTx {
            conn,
            finished: false,
        })
    }

    /// Advance the outbox cursor for an instance.
    pub fn set_last_reported_event_id(
        &self,
        instance_id: InstanceId,
        event_id: InstanceEventId,
    ) -> Result<(), StateStoreError> {
        let changed = self.conn().execute(
            "UPDATE instances SET last_reported_event_id = ?1 WHERE instance_id = ?2",
            params![event_id.to_string(), instance_id.to_string()],
        )?;
        ensure_changed(changed, instance_id)
    }

    pub fn last_reported_event_id(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<InstanceEventId>, StateStoreError> {
        let raw: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT last_reported_event_id FROM instances WHERE instance_id = ?1",
                params![instance_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            None => Err(StateStoreError::NotFound(instance_id.to_string())),
            Some(cursor) => Ok(cursor.as_deref().map(str::parse).transpose()?),
        }
    }

    /// All events of an instance in ID order.
    pub fn list_instance_events(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<InstanceEvent>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT event_id, event_type, origin, status, payload, occurred_at
             FROM instance_events WHERE instance_id = ?1 ORDER BY event_id",
        )?;

        let rows = stmt
            .query_map(params![instance_id.to_string()], EventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Newest event of the given type, if any.
    pub fn latest_instance_event(
        &self,
        instance_id: InstanceId,
        event_type: InstanceEventType,
    ) -> Result<Option<InstanceEvent>, StateStoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT event_id, event_type, origin, status, payload, occurred_at
                 FROM instance_events WHERE instance_id = ?1 AND event_type = ?2
                 ORDER BY event_id DESC LIMIT 1",
                params![instance_id.to_string(), event_type.as_str()],
                EventRow::from_row,
            )
            .optional()?;

        row.map(EventRow::into_event).transpose()
    }

    /// Load every instance with its history (startup recovery feed).
    pub fn load_instances(&self) -> Result<Vec<StoredInstance>, StateStoreError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT instance_id, namespace, machine_id, fleet_id, node_id, reservation_id,
                        config, local_ipv4, created_at, initial_desired_status, desired_status,
                        restarts, prepared, destroyed, last_reported_event_id
                 FROM instances ORDER BY instance_id",
            )?;
            let rows = stmt
                .query_map([], InstanceRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        rows.into_iter()
            .map(|row| {
                let mut stored = row.into_stored()?;
                stored.events = self.list_instance_events(stored.instance.id)?;
                if let Some(last) = stored.events.last() {
                    stored.instance.state.status = last.status;
                }
                Ok(stored)
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), StateStoreError> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }
}

/// An open write transaction.
///
/// Holds the connection for its whole lifetime. Never hold one across an
/// `.await`.
pub struct StoreTx<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl StoreTx<'_> {
    pub fn store_instance_event(
        &self,
        instance_id: InstanceId,
        event: &InstanceEvent,
    ) -> Result<(), StateStoreError> {
        self.conn.execute(
            r#"
            INSERT INTO instance_events (event_id, instance_id, event_type, origin, status, payload, occurred_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                event.id.to_string(),
                instance_id.to_string(),
                event.event_type().as_str(),
                event.origin.as_str(),
                event.status.as_str(),
                event.payload.to_json()?,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_instance_desired_status(
        &self,
        instance_id: InstanceId,
        desired: InstanceStatus,
    ) -> Result<(), StateStoreError> {
        let changed = self.conn.execute(
            "UPDATE instances SET desired_status = ?1 WHERE instance_id = ?2",
            params![desired.as_str(), instance_id.to_string()],
        )?;
        ensure_changed(changed, instance_id)
    }

    pub fn increment_instance_restarts(
        &self,
        instance_id: InstanceId,
    ) -> Result<(), StateStoreError> {
        let changed = self.conn.execute(
            "UPDATE instances SET restarts = restarts + 1 WHERE instance_id = ?1",
            params![instance_id.to_string()],
        )?;
        ensure_changed(changed, instance_id)
    }

    pub fn reset_restarts(&self, instance_id: InstanceId) -> Result<(), StateStoreError> {
        let changed = self.conn.execute(
            "UPDATE instances SET restarts = 0 WHERE instance_id = ?1",
            params![instance_id.to_string()],
        )?;
        ensure_changed(changed, instance_id)
    }

    pub fn mark_instance_as_prepared(
        &self,
        instance_id: InstanceId,
    ) -> Result<(), StateStoreError> {
        let changed = self.conn.execute(
            "UPDATE instances SET prepared = 1 WHERE instance_id = ?1",
            params![instance_id.to_string()],
        )?;
        ensure_changed(changed, instance_id)
    }

    pub fn mark_instance_destroyed(&self, instance_id: InstanceId) -> Result<(), StateStoreError> {
        let changed = self.conn.execute(
            "UPDATE instances SET destroyed = 1 WHERE instance_id = ?1",
            params![instance_id.to_string()],
        )?;
        ensure_changed(changed, instance_id)
    }

    pub fn commit(mut self) -> Result<(), StateStoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StateStoreError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for StoreTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                debug!(error = %e, "Rollback of abandoned transaction failed");
            }
        }
    }
}

fn ensure_changed(changed: usize, instance_id: InstanceId) -> Result<(), StateStoreError> {
    if changed == 0 {
        return Err(StateStoreError::NotFound(instance_id.to_string()));
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StateStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StateStoreError::Invalid(format!("bad timestamp {raw}: {e}")))
}

struct EventRow {
    event_id: String,
    event_type: String,
    origin: String,
    status: String,
    payload: String,
    occurred_at: String,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            event_type: row.get(1)?,
            origin: row.get(2)?,
            status: row.get(3)?,
            payload: row.get(4)?,
            occurred_at: row.get(5)?,
        })
    }

    fn into_event(self) -> Result<InstanceEvent, StateStoreError> {
        let event_type: InstanceEventType = self.event_type.parse()?;
        Ok(InstanceEvent {
            id: self.event_id.parse()?,
            origin: self.origin.parse()?,
            status: self.status.parse()?,
            payload: InstanceEventPayload::from_json(event_type, &self.payload)?,
            timestamp: parse_timestamp(&self.occurred_at)?,
        })
    }
}

struct InstanceRow {
    instance_id: String,
    namespace: String,
    machine_id: String,
    fleet_id: String,
    node_id: String,
    reservation_id: String,
    config: String,
    local_ipv4: Option<String>,
    created_at: String,
    initial_desired_status: String,
    desired_status: String,
    restarts: u32,
    prepared: bool,
    destroyed: bool,
    last_reported_event_id: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            instance_id: row.get(0)?,
            namespace: row.get(1)?,
            machine_id: row.get(2)?,
            fleet_id: row.get(3)?,
            node_id: row.get(4)?,
            reservation_id: row.get(5)?,
            config: row.get(6)?,
            local_ipv4: row.get(7)?,
            created_at: row.get(8)?,
            initial_desired_status: row.get(9)?,
            desired_status: row.get(10)?,
            restarts: row.get(11)?,
            prepared: row.get(12)?,
            destroyed: row.get(13)?,
            last_reported_event_id: row.get(14)?,
        })
    }

    fn into_stored(self) -> Result<StoredInstance, StateStoreError> {
        let local_ipv4 = self
            .local_ipv4
            .as_deref()
            .map(str::parse::<Ipv4Addr>)
            .transpose()
            .map_err(|e| StateStoreError::Invalid(format!("bad local_ipv4: {e}")))?;

        let instance = Instance {
            id: self.instance_id.parse()?,
            namespace: self.namespace,
            machine_id: self.machine_id.parse()?,
            fleet_id: self.fleet_id.parse()?,
            node_id: self.node_id.parse()?,
            reservation_id: self.reservation_id.parse()?,
            config: serde_json::from_str(&self.config)?,
            local_ipv4,
            created_at: parse_timestamp(&self.created_at)?,
            state: InstanceState {
                desired_status: self.desired_status.parse()?,
                status: InstanceStatus::Created,
                restarts: self.restarts,
            },
            prepared: self.prepared,
            destroyed: self.destroyed,
        };

        Ok(StoredInstance {
            instance,
            initial_desired_status: self.initial_desired_status.parse()?,
            events: Vec::new(),
            last_reported_event_id: self
                .last_reported_event_id
                .as_deref()
                .map(str::parse)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{event, instance_request};
    use fleet_events::InstanceEventPayload as P;
    use fleet_id::NodeId;

    fn new_instance() -> Instance {
        Instance::create(instance_request(true), NodeId::new())
    }

    #[test]
    fn test_create_and_load_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = new_instance();
        store.create_instance(&instance).unwrap();

        let loaded = store.load_instances().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].instance, instance);
        assert_eq!(loaded[0].initial_desired_status, InstanceStatus::Running);
        assert!(loaded[0].events.is_empty());
        assert!(loaded[0].last_reported_event_id.is_none());
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = new_instance();
        store.create_instance(&instance).unwrap();
        assert!(store.create_instance(&instance).is_err());
    }

    #[test]
    fn test_committed_tx_is_visible() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = new_instance();
        store.create_instance(&instance).unwrap();

        let ev = event(P::Start { is_restart: true }, InstanceStatus::Starting);
        let tx = store.begin_tx().unwrap();
        tx.store_instance_event(instance.id, &ev).unwrap();
        tx.update_instance_desired_status(instance.id, InstanceStatus::Running)
            .unwrap();
        tx.increment_instance_restarts(instance.id).unwrap();
        tx.commit().unwrap();

        let loaded = store.load_instances().unwrap().remove(0);
        assert_eq!(loaded.events, vec![ev]);
        assert_eq!(loaded.instance.state.restarts, 1);
        assert_eq!(loaded.instance.status(), InstanceStatus::Starting);
    }

    #[test]
    fn test_dropped_tx_rolls_back() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = new_instance();
        store.create_instance(&instance).unwrap();

        {
            let tx = store.begin_tx().unwrap();
            tx.store_instance_event(instance.id, &event(P::Prepared, InstanceStatus::Stopped))
                .unwrap();
            tx.mark_instance_as_prepared(instance.id).unwrap();
        }

        let loaded = store.load_instances().unwrap().remove(0);
        assert!(loaded.events.is_empty());
        assert!(!loaded.instance.prepared);

        // The connection is usable again after the implicit rollback.
        let tx = store.begin_tx().unwrap();
        tx.reset_restarts(instance.id).unwrap();
        tx.rollback().unwrap();
    }

    #[test]
    fn test_update_unknown_instance_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let tx = store.begin_tx().unwrap();
        let err = tx.mark_instance_destroyed(InstanceId::new()).unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
    }

    #[test]
    fn test_outbox_cursor() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = new_instance();
        store.create_instance(&instance).unwrap();

        let first = event(P::Prepare { retries: 0 }, InstanceStatus::Preparing);
        let second = event(P::Prepared, InstanceStatus::Stopped);
        let tx = store.begin_tx().unwrap();
        tx.store_instance_event(instance.id, &first).unwrap();
        tx.store_instance_event(instance.id, &second).unwrap();
        tx.commit().unwrap();

        store
            .set_last_reported_event_id(instance.id, first.id)
            .unwrap();
        assert_eq!(
            store.last_reported_event_id(instance.id).unwrap(),
            Some(first.id)
        );

        let loaded = store.load_instances().unwrap().remove(0);
        assert_eq!(loaded.unreported_events(), vec![second]);

        assert!(matches!(
            store.last_reported_event_id(InstanceId::new()),
            Err(StateStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_latest_instance_event_by_type() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = new_instance();
        store.create_instance(&instance).unwrap();

        let tx = store.begin_tx().unwrap();
        for retries in 0..3 {
            tx.store_instance_event(
                instance.id,
                &event(P::Prepare { retries }, InstanceStatus::Preparing),
            )
            .unwrap();
        }
        tx.commit().unwrap();

        let latest = store
            .latest_instance_event(instance.id, InstanceEventType::Prepare)
            .unwrap()
            .unwrap();
        assert_eq!(latest.payload, P::Prepare { retries: 2 });
        assert!(store
            .latest_instance_event(instance.id, InstanceEventType::Destroy)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let instance = new_instance();
        let ev = event(P::Prepare { retries: 0 }, InstanceStatus::Preparing);

        {
            let store = StateStore::open(&path).unwrap();
            store.create_instance(&instance).unwrap();
            let tx = store.begin_tx().unwrap();
            tx.store_instance_event(instance.id, &ev).unwrap();
            tx.commit().unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let loaded = store.load_instances().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].events, vec![ev]);
        assert_eq!(loaded[0].instance.status(), InstanceStatus::Preparing);
    }
}
