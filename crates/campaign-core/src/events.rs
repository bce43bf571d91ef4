//! Safety events and the bounded audit log that holds them.
//!
//! Each component owns its own `EventLog`. The log keeps at most
//! `MAX_EVENTS` entries; on overflow it trims to the newest `TRIM_TO`.

use crate::types::{EventSeverity, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Hard cap on retained events.
pub const MAX_EVENTS: usize = 1000;

/// Length the log is cut back to when the cap is exceeded.
pub const TRIM_TO: usize = 500;

/// Safety event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyEventType {
    CheckpointCreated,
    RollbackTriggered,
    CorruptionDetected,
    BuildFailure,
    EmergencyRecovery,
    PhaseStart,
    PhaseComplete,
}

impl SafetyEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckpointCreated => "CHECKPOINT_CREATED",
            Self::RollbackTriggered => "ROLLBACK_TRIGGERED",
            Self::CorruptionDetected => "CORRUPTION_DETECTED",
            Self::BuildFailure => "BUILD_FAILURE",
            Self::EmergencyRecovery => "EMERGENCY_RECOVERY",
            Self::PhaseStart => "PHASE_START",
            Self::PhaseComplete => "PHASE_COMPLETE",
        }
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyEvent {
    pub id: Id,
    #[serde(rename = "type")]
    pub event_type: SafetyEventType,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub severity: EventSeverity,
    /// Short machine-readable tag, e.g. `stash-create` or `nuclear-reset:failed`.
    pub action: String,
}

impl SafetyEvent {
    pub fn new(
        event_type: SafetyEventType,
        severity: EventSeverity,
        description: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Id::new(),
            event_type,
            timestamp: Utc::now(),
            description: description.into(),
            severity,
            action: action.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Bounded ring buffer of safety events.
///
/// Never drops the newest entry: trimming always removes from the front.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: VecDeque<SafetyEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, trimming to the newest `TRIM_TO` entries on overflow.
    pub fn push(&mut self, event: SafetyEvent) {
        self.events.push_back(event);
        if self.events.len() > MAX_EVENTS {
            let excess = self.events.len() - TRIM_TO;
            self.events.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn latest(&self) -> Option<&SafetyEvent> {
        self.events.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SafetyEvent> {
        self.events.iter()
    }

    pub fn snapshot(&self) -> Vec<SafetyEvent> {
        self.events.iter().cloned().collect()
    }
}
