use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::lead::LeadId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A human must take over the conversation.
    EscalationRequired,
    /// A qualified lead is ready for human follow-up.
    HandoffReady,
    /// A scheduled message exhausted its retries.
    SendFailed,
    /// A handed-off lead has seen no human follow-up.
    StaleHandoff,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EscalationRequired => "escalation_required",
            Self::HandoffReady => "handoff_ready",
            Self::SendFailed => "send_failed",
            Self::StaleHandoff => "stale_handoff",
        }
    }
}

/// Human-attention event. Escalations, terminal send failures, and stale
/// handoffs all surface here — no failure is dropped silently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: String,
    pub lead_id: LeadId,
    pub kind: NotificationKind,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        lead_id: LeadId,
        kind: NotificationKind,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            lead_id,
            kind,
            message: message.into(),
            metadata: BTreeMap::new(),
            occurred_at,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl InMemoryNotificationSink {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn notify(&self, event: NotificationEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}
