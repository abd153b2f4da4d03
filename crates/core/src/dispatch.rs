//! Deterministic dispatch engine.
//!
//! Pure state-transition logic for scheduled messages. Every method takes
//! the current instant as an argument and returns the updated message plus
//! an audit transition; persistence and the actual channel send happen in
//! the orchestrator, strictly between the `pending -> sending` and
//! `sending -> {sent,failed,pending}` writes.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::lead::LeadId;
use crate::domain::message::{
    Channel, DeliveryStatus, IdempotencyKey, MessageId, MessageTransition, ScheduledMessage,
    TransitionId,
};

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// How long a `sending` claim is honored before the message is
    /// considered stuck and retried.
    pub lease_seconds: i64,
    /// Send attempts before a message fails terminally.
    pub max_attempts: u32,
    /// Base delay between retries.
    pub retry_base_delay_seconds: i64,
    /// Backoff multiplier per attempt.
    pub retry_backoff_multiplier: u32,
    /// Ceiling on the retry delay.
    pub retry_max_delay_seconds: i64,
    /// Minimum spacing after a successful send to the same lead.
    pub cooldown_seconds: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 120,
            max_attempts: 3,
            retry_base_delay_seconds: 60,
            retry_backoff_multiplier: 2,
            retry_max_delay_seconds: 480,
            cooldown_seconds: 90 * 60,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid status transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: DeliveryStatus, to: DeliveryStatus, reason: String },
    #[error("message {0} is not yet due")]
    NotDue(MessageId),
    #[error("message {message_id} is leased by {held_by}")]
    LeaseActive { message_id: MessageId, held_by: String },
}

/// An updated message and the audit record of how it got there.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOutcome {
    pub message: ScheduledMessage,
    pub transition: MessageTransition,
}

/// How a send failure should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry with exponential backoff until attempts run out.
    Transient,
    /// No retry; fail terminally right away.
    Permanent,
}

#[derive(Clone, Debug)]
pub struct DispatchEngine {
    config: DispatchConfig,
}

impl DispatchEngine {
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Build a fresh `pending` message. The caller supplies the idempotency
    /// key; duplicate keys are resolved at insert time by the repository.
    pub fn create_message(
        &self,
        lead_id: LeadId,
        channel: Channel,
        body: impl Into<String>,
        idempotency_key: IdempotencyKey,
        earliest_send_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ScheduledMessage {
        ScheduledMessage {
            id: MessageId(Uuid::new_v4().to_string()),
            lead_id,
            channel,
            body: body.into(),
            idempotency_key,
            status: DeliveryStatus::Pending,
            earliest_send_at,
            lease_expires_at: None,
            claimed_by: None,
            retry_count: 0,
            last_error: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Spacing rule: a new send may not land sooner than the cool-down
    /// after the lead's last successful outbound.
    pub fn clamp_not_before(
        &self,
        not_before: DateTime<Utc>,
        last_outbound_at: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        match last_outbound_at {
            Some(last) => not_before.max(last + Duration::seconds(self.config.cooldown_seconds)),
            None => not_before,
        }
    }

    /// Claim a due message for sending: `pending -> sending` with a lease.
    /// A `sending` message whose lease has lapsed may be stolen.
    pub fn claim(
        &self,
        mut message: ScheduledMessage,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let worker_id = worker_id.into();

        match message.status {
            DeliveryStatus::Pending => {
                if now < message.earliest_send_at {
                    return Err(DispatchError::NotDue(message.id.clone()));
                }
            }
            DeliveryStatus::Sending => {
                let lease_live =
                    message.lease_expires_at.is_some_and(|expires| now < expires);
                if lease_live {
                    return Err(DispatchError::LeaseActive {
                        message_id: message.id.clone(),
                        held_by: message.claimed_by.clone().unwrap_or_default(),
                    });
                }
            }
            _ => {
                return Err(DispatchError::InvalidTransition {
                    from: message.status,
                    to: DeliveryStatus::Sending,
                    reason: "message already resolved".to_string(),
                });
            }
        }

        let from = message.status;
        message.status = DeliveryStatus::Sending;
        message.lease_expires_at = Some(now + Duration::seconds(self.config.lease_seconds));
        message.claimed_by = Some(worker_id.clone());
        message.version += 1;
        message.updated_at = now;

        let transition = self.transition(&message, Some(from), "claimed", None, worker_id, now);
        Ok(DispatchOutcome { message, transition })
    }

    /// `sending -> sent` after the channel sender confirmed delivery.
    pub fn complete(
        &self,
        mut message: ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.validate(&message, DeliveryStatus::Sent)?;

        let from = message.status;
        let actor = message.claimed_by.clone().unwrap_or_else(|| "dispatcher".to_string());
        message.status = DeliveryStatus::Sent;
        message.lease_expires_at = None;
        message.claimed_by = None;
        message.version += 1;
        message.updated_at = now;

        let transition = self.transition(&message, Some(from), "sent", None, actor, now);
        Ok(DispatchOutcome { message, transition })
    }

    /// Record a send failure. Transient failures retry with exponential
    /// backoff (`sending -> pending`) until attempts run out, then the
    /// message fails terminally so a human is notified — never silently.
    pub fn fail(
        &self,
        mut message: ScheduledMessage,
        error: impl Into<String>,
        error_class: impl Into<String>,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.validate(&message, DeliveryStatus::Failed)?;

        let error = error.into();
        let error_class = error_class.into();
        let from = message.status;
        let actor = message.claimed_by.clone().unwrap_or_else(|| "dispatcher".to_string());

        message.retry_count += 1;
        message.last_error = Some(error);
        message.lease_expires_at = None;
        message.claimed_by = None;
        message.version += 1;
        message.updated_at = now;

        let retry = matches!(kind, FailureKind::Transient)
            && message.retry_count < self.config.max_attempts;

        let (reason, to) = if retry {
            message.status = DeliveryStatus::Pending;
            message.earliest_send_at = now + self.backoff_delay(message.retry_count);
            ("failed_retryable", DeliveryStatus::Pending)
        } else {
            message.status = DeliveryStatus::Failed;
            ("failed_terminal", DeliveryStatus::Failed)
        };
        debug_assert_eq!(message.status, to);

        let transition =
            self.transition(&message, Some(from), reason, Some(error_class), actor, now);
        Ok(DispatchOutcome { message, transition })
    }

    /// Compliance deferral: push the send forward without touching the
    /// retry count. Not a failure — the message stays `pending`.
    pub fn defer(
        &self,
        mut message: ScheduledMessage,
        next_permitted_at: DateTime<Utc>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if message.status != DeliveryStatus::Pending {
            return Err(DispatchError::InvalidTransition {
                from: message.status,
                to: DeliveryStatus::Pending,
                reason: "only pending messages can be deferred".to_string(),
            });
        }

        message.earliest_send_at = next_permitted_at;
        message.version += 1;
        message.updated_at = now;

        let transition = self.transition(
            &message,
            Some(DeliveryStatus::Pending),
            "compliance_deferred",
            Some(reason.into()),
            "dispatcher".to_string(),
            now,
        );
        Ok(DispatchOutcome { message, transition })
    }

    /// Cancel an open message. A `sending` message may finish its in-flight
    /// call, but the cancelled status wins the version race and its result
    /// is discarded.
    pub fn cancel(
        &self,
        mut message: ScheduledMessage,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.validate(&message, DeliveryStatus::Cancelled)?;

        let from = message.status;
        message.status = DeliveryStatus::Cancelled;
        message.lease_expires_at = None;
        message.claimed_by = None;
        message.version += 1;
        message.updated_at = now;

        let transition = self.transition(
            &message,
            Some(from),
            "cancelled",
            Some(reason.into()),
            "dispatcher".to_string(),
            now,
        );
        Ok(DispatchOutcome { message, transition })
    }

    /// Recover a `sending` message whose lease lapsed without resolution.
    /// Treated as a retryable failure so a crash-looping send cannot spin
    /// forever.
    pub fn release_expired(
        &self,
        message: ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if message.status != DeliveryStatus::Sending {
            return Err(DispatchError::InvalidTransition {
                from: message.status,
                to: DeliveryStatus::Pending,
                reason: "only sending messages hold a lease".to_string(),
            });
        }
        if message.lease_expires_at.is_some_and(|expires| now < expires) {
            return Err(DispatchError::LeaseActive {
                message_id: message.id.clone(),
                held_by: message.claimed_by.clone().unwrap_or_default(),
            });
        }

        self.fail(
            message,
            "send lease expired without resolution",
            "lease_expired",
            FailureKind::Transient,
            now,
        )
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = i64::from(self.config.retry_backoff_multiplier.max(1).pow(exponent));
        let delay = self
            .config
            .retry_base_delay_seconds
            .saturating_mul(factor)
            .min(self.config.retry_max_delay_seconds);
        Duration::seconds(delay)
    }

    fn validate(
        &self,
        message: &ScheduledMessage,
        to: DeliveryStatus,
    ) -> Result<(), DispatchError> {
        let valid = matches!(
            (message.status, to),
            (DeliveryStatus::Pending, DeliveryStatus::Sending)
                | (DeliveryStatus::Sending, DeliveryStatus::Sent)
                | (DeliveryStatus::Sending, DeliveryStatus::Pending)
                | (DeliveryStatus::Sending, DeliveryStatus::Failed)
                | (DeliveryStatus::Pending, DeliveryStatus::Cancelled)
                | (DeliveryStatus::Sending, DeliveryStatus::Cancelled)
        ) || message.status == to;

        if valid {
            Ok(())
        } else {
            Err(DispatchError::InvalidTransition {
                from: message.status,
                to,
                reason: format!("cannot transition from {:?} to {:?}", message.status, to),
            })
        }
    }

    fn transition(
        &self,
        message: &ScheduledMessage,
        from: Option<DeliveryStatus>,
        reason: &str,
        error_class: Option<String>,
        actor: String,
        now: DateTime<Utc>,
    ) -> MessageTransition {
        MessageTransition {
            id: TransitionId(Uuid::new_v4().to_string()),
            message_id: message.id.clone(),
            lead_id: message.lead_id.clone(),
            from_status: from,
            to_status: message.status,
            reason: reason.to_string(),
            error_class,
            actor,
            version: message.version,
            occurred_at: now,
        }
    }
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::new()
    }
}
