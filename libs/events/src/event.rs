//! Instance events.

use chrono::{DateTime, Utc};
use fleet_id::InstanceEventId;
use serde::{Deserialize, Serialize};

use crate::{EventError, InstanceStatus};

/// Who asked for the change an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// A user-facing API call.
    User,
    /// The agent itself (reconciliation, restart policy, recovery).
    #[default]
    System,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventOrigin {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            other => Err(EventError::UnknownOrigin(other.to_string())),
        }
    }
}

/// Discriminant of [`InstanceEventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceEventType {
    Prepare,
    Prepared,
    PreparationFailed,
    Start,
    StartFailed,
    Started,
    Stop,
    Exited,
    Destroy,
    Destroyed,
}

impl InstanceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Prepared => "prepared",
            Self::PreparationFailed => "preparation_failed",
            Self::Start => "start",
            Self::StartFailed => "start_failed",
            Self::Started => "started",
            Self::Stop => "stop",
            Self::Exited => "exited",
            Self::Destroy => "destroy",
            Self::Destroyed => "destroyed",
        }
    }

    pub const ALL: [InstanceEventType; 10] = [
        Self::Prepare,
        Self::Prepared,
        Self::PreparationFailed,
        Self::Start,
        Self::StartFailed,
        Self::Started,
        Self::Stop,
        Self::Exited,
        Self::Destroy,
        Self::Destroyed,
    ];
}

impl std::str::FromStr for InstanceEventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

impl std::fmt::Display for InstanceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a workload run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exited with code 0 and no signal.
    pub success: bool,
    pub exit_code: i32,
    /// The exit followed a stop request.
    pub requested: bool,
    pub exited_at: DateTime<Utc>,
}

/// Type-specific event data. The variant is the event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InstanceEventPayload {
    /// A preparation attempt began. `retries` counts earlier attempts.
    Prepare { retries: u32 },

    Prepared,

    /// A preparation attempt failed.
    ///
    /// `give_up` is set on the attempt that ends preparation, either because
    /// the error was fatal or because no retries remain.
    PreparationFailed {
        error: String,
        fatal: bool,
        give_up: bool,
    },

    Start { is_restart: bool },

    StartFailed { error: String },

    Started,

    Stop,

    Exited(ExitInfo),

    Destroy { reason: String },

    Destroyed,
}

impl InstanceEventPayload {
    pub fn event_type(&self) -> InstanceEventType {
        match self {
            Self::Prepare { .. } => InstanceEventType::Prepare,
            Self::Prepared => InstanceEventType::Prepared,
            Self::PreparationFailed { .. } => InstanceEventType::PreparationFailed,
            Self::Start { .. } => InstanceEventType::Start,
            Self::StartFailed { .. } => InstanceEventType::StartFailed,
            Self::Started => InstanceEventType::Started,
            Self::Stop => InstanceEventType::Stop,
            Self::Exited(_) => InstanceEventType::Exited,
            Self::Destroy { .. } => InstanceEventType::Destroy,
            Self::Destroyed => InstanceEventType::Destroyed,
        }
    }

    /// Serializes to the `{"type": .., "payload": ..}` wire form.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the wire form, checking the tag against `expected`.
    pub fn from_json(expected: InstanceEventType, json: &str) -> Result<Self, EventError> {
        let payload: Self = serde_json::from_str(json)?;
        if payload.event_type() != expected {
            return Err(EventError::InvalidPayload(format!(
                "payload is {} but row says {}",
                payload.event_type(),
                expected
            )));
        }
        Ok(payload)
    }
}

/// One entry in an instance's append-only event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEvent {
    /// Strictly increasing within an instance; sorts by creation time.
    pub id: InstanceEventId,

    pub origin: EventOrigin,

    /// Status the instance has after this event.
    pub status: InstanceStatus,

    #[serde(flatten)]
    pub payload: InstanceEventPayload,

    pub timestamp: DateTime<Utc>,
}

impl InstanceEvent {
    pub fn event_type(&self) -> InstanceEventType {
        self.payload.event_type()
    }
}
