//! Message scheduler / dispatcher service.
//!
//! `schedule` is the only write path for new scheduled messages; `tick`
//! drains due work. Multiple workers may run `tick` concurrently against
//! the same store: every transition is a conditional update and the
//! `pending -> sending` claim carries the per-lead mutual-exclusion guard,
//! so races have exactly one winner and losers skip.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use leadflow_core::clock::Clock;
use leadflow_core::compliance::{ComplianceDecision, ComplianceGate};
use leadflow_core::dispatch::{DispatchEngine, FailureKind};
use leadflow_core::domain::lead::{LeadConversation, LeadId};
use leadflow_core::domain::message::{
    Channel, DeliveryStatus, IdempotencyKey, MessageId, MessageTransition, ScheduledMessage,
    TransitionId,
};
use leadflow_core::notify::{NotificationEvent, NotificationKind, NotificationSink};
use leadflow_db::repositories::{
    ConversationRepository, MessageRepository, RepositoryError,
};

use crate::collaborators::ChannelSender;

#[derive(Clone, Debug)]
pub struct DispatcherOptions {
    pub worker_id: String,
    pub batch_size: u32,
    pub cas_retry_limit: u32,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self { worker_id: "dispatcher-1".to_string(), batch_size: 32, cas_retry_limit: 5 }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unknown lead {0}")]
    UnknownLead(LeadId),
    #[error("conversation for {0} is paused")]
    Paused(LeadId),
    #[error("conversation for {0} no longer accepts automated sends")]
    Closed(LeadId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Debug)]
pub struct ScheduleRequest {
    pub lead_id: LeadId,
    pub channel: Channel,
    pub body: String,
    pub not_before: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub released: u32,
    pub sent: u32,
    pub retried: u32,
    pub failed: u32,
    pub deferred: u32,
    pub cancelled: u32,
    pub skipped: u32,
}

enum Processed {
    Sent,
    Retried,
    Failed,
    Deferred,
    Cancelled,
    Skipped,
}

pub struct MessageDispatcher {
    engine: DispatchEngine,
    gate: ComplianceGate,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    sender: Arc<dyn ChannelSender>,
    notifications: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    options: DispatcherOptions,
}

impl MessageDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: DispatchEngine,
        gate: ComplianceGate,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        sender: Arc<dyn ChannelSender>,
        notifications: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        options: DispatcherOptions,
    ) -> Self {
        Self { engine, gate, conversations, messages, sender, notifications, clock, options }
    }

    /// Create a scheduled message unless the idempotency key already owns
    /// one; either way the owning id comes back. `not_before` is clamped to
    /// the lead's cool-down window.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<MessageId, ScheduleError> {
        let conversation = self
            .conversations
            .find(&request.lead_id)
            .await?
            .ok_or_else(|| ScheduleError::UnknownLead(request.lead_id.clone()))?;

        if conversation.paused {
            return Err(ScheduleError::Paused(request.lead_id));
        }
        if !conversation.state.automation_active() {
            return Err(ScheduleError::Closed(request.lead_id));
        }

        let now = self.clock.now();
        let earliest_send_at =
            self.engine.clamp_not_before(request.not_before, conversation.last_outbound_at);
        let message = self.engine.create_message(
            request.lead_id,
            request.channel,
            request.body,
            request.idempotency_key,
            earliest_send_at,
            now,
        );

        let id = self.messages.insert_if_absent(message.clone()).await?;
        if id == message.id {
            self.messages
                .append_transition(MessageTransition {
                    id: TransitionId(Uuid::new_v4().to_string()),
                    message_id: message.id.clone(),
                    lead_id: message.lead_id.clone(),
                    from_status: None,
                    to_status: DeliveryStatus::Pending,
                    reason: "scheduled".to_string(),
                    error_class: None,
                    actor: "scheduler".to_string(),
                    version: message.version,
                    occurred_at: now,
                })
                .await?;
            tracing::info!(
                event_name = "dispatch.scheduled",
                lead_id = %message.lead_id,
                message_id = %message.id,
                earliest_send_at = %message.earliest_send_at,
                "scheduled outbound message"
            );
        } else {
            tracing::debug!(
                event_name = "dispatch.schedule_deduplicated",
                lead_id = %message.lead_id,
                message_id = %id,
                "idempotency key already owns a message"
            );
        }

        Ok(id)
    }

    /// One dispatch pass: recover lapsed leases, then work through due
    /// messages. Per-message errors are logged and skipped; the tick
    /// itself only fails on a repository error while listing.
    pub async fn tick(&self) -> Result<TickSummary, RepositoryError> {
        let now = self.clock.now();
        let mut summary = TickSummary::default();

        for message in self.messages.list_expired_leases(now).await? {
            match self.recover_lease(message, now).await {
                Ok(true) => summary.released += 1,
                Ok(false) => summary.skipped += 1,
                Err(error) => {
                    tracing::warn!(
                        event_name = "dispatch.lease_recovery_failed",
                        error = %error,
                        "could not recover expired lease"
                    );
                    summary.skipped += 1;
                }
            }
        }

        let due = self.messages.list_due(now, self.options.batch_size).await?;
        for message in due {
            let message_id = message.id.clone();
            match self.process_due(message, now).await {
                Ok(Processed::Sent) => summary.sent += 1,
                Ok(Processed::Retried) => summary.retried += 1,
                Ok(Processed::Failed) => summary.failed += 1,
                Ok(Processed::Deferred) => summary.deferred += 1,
                Ok(Processed::Cancelled) => summary.cancelled += 1,
                Ok(Processed::Skipped) => summary.skipped += 1,
                Err(error) => {
                    tracing::warn!(
                        event_name = "dispatch.message_failed",
                        message_id = %message_id,
                        error = %error,
                        "dispatch pass failed for message"
                    );
                    summary.skipped += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn recover_lease(
        &self,
        message: ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let expected_version = message.version;
        let outcome = match self.engine.release_expired(message, now) {
            Ok(outcome) => outcome,
            // Someone else resolved it between listing and here.
            Err(_) => return Ok(false),
        };

        if !self.messages.update(outcome.message.clone(), expected_version).await? {
            return Ok(false);
        }
        self.messages.append_transition(outcome.transition).await?;

        tracing::warn!(
            event_name = "dispatch.lease_recovered",
            message_id = %outcome.message.id,
            lead_id = %outcome.message.lead_id,
            retry_count = outcome.message.retry_count,
            "expired send lease released"
        );

        if outcome.message.status == DeliveryStatus::Failed {
            self.notify_send_failed(&outcome.message, now);
        }
        Ok(true)
    }

    async fn process_due(
        &self,
        message: ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<Processed, RepositoryError> {
        let Some(conversation) = self.conversations.find(&message.lead_id).await? else {
            tracing::warn!(
                event_name = "dispatch.orphan_message",
                message_id = %message.id,
                lead_id = %message.lead_id,
                "scheduled message has no conversation"
            );
            return Ok(Processed::Skipped);
        };

        if conversation.paused {
            return Ok(Processed::Skipped);
        }

        // Compliance is evaluated immediately before the send, never
        // carried over from scheduling time.
        match self.gate.evaluate(&conversation, now) {
            ComplianceDecision::Denied { reason, next_permitted_at } if !reason.is_permanent() => {
                let next = next_permitted_at.unwrap_or(now + Duration::minutes(15));
                let expected_version = message.version;
                let Ok(outcome) = self.engine.defer(message, next, reason.as_str(), now) else {
                    return Ok(Processed::Skipped);
                };
                if self.messages.update(outcome.message.clone(), expected_version).await? {
                    self.messages.append_transition(outcome.transition).await?;
                    return Ok(Processed::Deferred);
                }
                Ok(Processed::Skipped)
            }
            ComplianceDecision::Denied { reason, .. } => {
                let expected_version = message.version;
                let Ok(outcome) = self.engine.cancel(message, reason.as_str(), now) else {
                    return Ok(Processed::Skipped);
                };
                if self.messages.update(outcome.message.clone(), expected_version).await? {
                    self.messages.append_transition(outcome.transition).await?;
                    return Ok(Processed::Cancelled);
                }
                Ok(Processed::Skipped)
            }
            ComplianceDecision::Allowed => self.dispatch_one(message, now).await,
        }
    }

    async fn dispatch_one(
        &self,
        message: ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<Processed, RepositoryError> {
        let expected_version = message.version;
        let Ok(claim) = self.engine.claim(message, self.options.worker_id.as_str(), now) else {
            return Ok(Processed::Skipped);
        };

        if !self.messages.claim_sending(claim.message.clone(), expected_version).await? {
            // Another worker won the claim, or a sibling send is in flight.
            return Ok(Processed::Skipped);
        }
        self.messages.append_transition(claim.transition).await?;
        let claimed = claim.message;

        // The external call happens strictly between the claim write above
        // and the resolution write below; no lock spans it.
        let send_result =
            self.sender.send(&claimed.lead_id, claimed.channel, &claimed.body).await;

        let expected_version = claimed.version;
        match send_result {
            Ok(()) => {
                let Ok(outcome) = self.engine.complete(claimed, now) else {
                    return Ok(Processed::Skipped);
                };
                if !self.messages.update(outcome.message.clone(), expected_version).await? {
                    // Cancelled while in flight; the cancelled status won
                    // the version race and the send result is discarded.
                    tracing::info!(
                        event_name = "dispatch.result_discarded",
                        message_id = %outcome.message.id,
                        lead_id = %outcome.message.lead_id,
                        "send resolved after cancellation; result discarded"
                    );
                    return Ok(Processed::Cancelled);
                }
                self.messages.append_transition(outcome.transition).await?;
                self.stamp_last_outbound(&outcome.message.lead_id, now).await?;
                tracing::info!(
                    event_name = "dispatch.sent",
                    message_id = %outcome.message.id,
                    lead_id = %outcome.message.lead_id,
                    "outbound message delivered"
                );
                Ok(Processed::Sent)
            }
            Err(error) => {
                let kind = if error.is_transient() {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                };
                let Ok(outcome) =
                    self.engine.fail(claimed, error.to_string(), error.class(), kind, now)
                else {
                    return Ok(Processed::Skipped);
                };
                if !self.messages.update(outcome.message.clone(), expected_version).await? {
                    return Ok(Processed::Cancelled);
                }
                self.messages.append_transition(outcome.transition).await?;

                if outcome.message.status == DeliveryStatus::Failed {
                    self.notify_send_failed(&outcome.message, now);
                    Ok(Processed::Failed)
                } else {
                    tracing::warn!(
                        event_name = "dispatch.retry_scheduled",
                        message_id = %outcome.message.id,
                        lead_id = %outcome.message.lead_id,
                        retry_count = outcome.message.retry_count,
                        next_attempt_at = %outcome.message.earliest_send_at,
                        "send failed; retry scheduled"
                    );
                    Ok(Processed::Retried)
                }
            }
        }
    }

    async fn stamp_last_outbound(
        &self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        for _ in 0..self.options.cas_retry_limit {
            let Some(conversation) = self.conversations.find(lead_id).await? else {
                return Ok(());
            };
            let expected_version = conversation.version;
            let mut updated: LeadConversation = conversation;
            updated.last_outbound_at = Some(now);
            updated.updated_at = now;
            updated.version += 1;

            if self.conversations.update(updated, expected_version).await? {
                return Ok(());
            }
        }

        tracing::warn!(
            event_name = "dispatch.outbound_stamp_conflict",
            lead_id = %lead_id,
            "could not stamp last_outbound_at after repeated conflicts"
        );
        Ok(())
    }

    fn notify_send_failed(&self, message: &ScheduledMessage, now: DateTime<Utc>) {
        self.notifications.notify(
            NotificationEvent::new(
                message.lead_id.clone(),
                NotificationKind::SendFailed,
                format!("automated send failed after {} attempts", message.retry_count),
                now,
            )
            .with_metadata("message_id", message.id.0.clone())
            .with_metadata(
                "last_error",
                message.last_error.clone().unwrap_or_else(|| "unknown".to_string()),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use leadflow_core::clock::{Clock, FixedClock};
    use leadflow_core::compliance::{ComplianceGate, SendWindow};
    use leadflow_core::dispatch::DispatchEngine;
    use leadflow_core::domain::lead::{LeadConversation, LeadId, LeadState, LeadType};
    use leadflow_core::domain::message::{Channel, DeliveryStatus, IdempotencyKey};
    use leadflow_core::notify::{InMemoryNotificationSink, NotificationKind};
    use leadflow_db::repositories::{
        ConversationRepository, InMemoryConversationRepository, InMemoryMessageRepository,
        MessageRepository,
    };

    use crate::collaborators::{CollaboratorError, RecordingChannelSender};

    use super::{DispatcherOptions, MessageDispatcher, ScheduleError, ScheduleRequest};

    struct Harness {
        dispatcher: MessageDispatcher,
        conversations: Arc<InMemoryConversationRepository>,
        messages: Arc<InMemoryMessageRepository>,
        sender: Arc<RecordingChannelSender>,
        notifications: InMemoryNotificationSink,
        clock: FixedClock,
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn harness(start: DateTime<Utc>) -> Harness {
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let messages = Arc::new(InMemoryMessageRepository::default());
        let sender = Arc::new(RecordingChannelSender::default());
        let notifications = InMemoryNotificationSink::default();
        let clock = FixedClock::at(start);

        let dispatcher = MessageDispatcher::new(
            DispatchEngine::new(),
            ComplianceGate::new(SendWindow::default()),
            conversations.clone(),
            messages.clone(),
            sender.clone(),
            Arc::new(notifications.clone()),
            Arc::new(clock.clone()),
            DispatcherOptions::default(),
        );

        Harness { dispatcher, conversations, messages, sender, notifications, clock }
    }

    async fn insert_lead(harness: &Harness, lead_id: &str) -> LeadId {
        let id = LeadId(lead_id.to_string());
        let mut conversation =
            LeadConversation::new(id.clone(), LeadType::Buyer, 0, harness.clock.now());
        conversation.state = LeadState::Qualifying;
        harness.conversations.insert(conversation).await.expect("insert lead");
        id
    }

    fn request(lead_id: &LeadId, key: &str, not_before: DateTime<Utc>) -> ScheduleRequest {
        ScheduleRequest {
            lead_id: lead_id.clone(),
            channel: Channel::Sms,
            body: "hello from leadflow".to_string(),
            not_before,
            idempotency_key: IdempotencyKey(key.to_string()),
        }
    }

    #[tokio::test]
    async fn schedule_is_idempotent_per_key() {
        let harness = harness(parse_ts("2026-03-02T15:00:00Z"));
        let lead = insert_lead(&harness, "L-1").await;

        let first = harness
            .dispatcher
            .schedule(request(&lead, "L-1:welcome", harness.clock.now()))
            .await
            .expect("first schedule");
        let second = harness
            .dispatcher
            .schedule(request(&lead, "L-1:welcome", harness.clock.now()))
            .await
            .expect("second schedule");

        assert_eq!(first, second);
        let open = harness.messages.list_open_for_lead(&lead).await.expect("open");
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn schedule_clamps_to_cooldown() {
        let harness = harness(parse_ts("2026-03-02T15:00:00Z"));
        let lead = LeadId("L-2".to_string());
        let mut conversation =
            LeadConversation::new(lead.clone(), LeadType::Buyer, 0, harness.clock.now());
        conversation.state = LeadState::Qualifying;
        conversation.last_outbound_at = Some(harness.clock.now() - Duration::minutes(10));
        harness.conversations.insert(conversation).await.expect("insert lead");

        let id = harness
            .dispatcher
            .schedule(request(&lead, "L-2:qualifying:v2", harness.clock.now()))
            .await
            .expect("schedule");

        let message = harness.messages.find(&id).await.expect("find").expect("row");
        // 90 minute cool-down from last outbound, 10 minutes already spent.
        assert_eq!(
            message.earliest_send_at,
            harness.clock.now() + Duration::minutes(80),
        );
    }

    #[tokio::test]
    async fn schedule_rejects_paused_and_closed_conversations() {
        let harness = harness(parse_ts("2026-03-02T15:00:00Z"));

        let paused_lead = LeadId("L-3".to_string());
        let mut paused =
            LeadConversation::new(paused_lead.clone(), LeadType::Buyer, 0, harness.clock.now());
        paused.state = LeadState::Qualifying;
        paused.paused = true;
        harness.conversations.insert(paused).await.expect("insert paused");

        let closed_lead = LeadId("L-4".to_string());
        let mut closed =
            LeadConversation::new(closed_lead.clone(), LeadType::Buyer, 0, harness.clock.now());
        closed.state = LeadState::Completed;
        harness.conversations.insert(closed).await.expect("insert closed");

        let paused_result = harness
            .dispatcher
            .schedule(request(&paused_lead, "L-3:welcome", harness.clock.now()))
            .await;
        assert!(matches!(paused_result, Err(ScheduleError::Paused(_))));

        let closed_result = harness
            .dispatcher
            .schedule(request(&closed_lead, "L-4:welcome", harness.clock.now()))
            .await;
        assert!(matches!(closed_result, Err(ScheduleError::Closed(_))));
    }

    #[tokio::test]
    async fn tick_sends_due_message_and_stamps_conversation() {
        let harness = harness(parse_ts("2026-03-02T15:00:00Z"));
        let lead = insert_lead(&harness, "L-5").await;

        harness
            .dispatcher
            .schedule(request(&lead, "L-5:welcome", harness.clock.now()))
            .await
            .expect("schedule");

        let summary = harness.dispatcher.tick().await.expect("tick");
        assert_eq!(summary.sent, 1);
        assert_eq!(harness.sender.sent().len(), 1);

        let conversation =
            harness.conversations.find(&lead).await.expect("find").expect("row");
        assert_eq!(conversation.last_outbound_at, Some(harness.clock.now()));

        let open = harness.messages.list_open_for_lead(&lead).await.expect("open");
        assert!(open.is_empty(), "sent message is no longer open");
    }

    #[tokio::test]
    async fn quiet_hours_defer_without_retry_increment() {
        // 03:00 UTC with a UTC-lead: outside the 09:00-20:00 window.
        let harness = harness(parse_ts("2026-03-02T03:00:00Z"));
        let lead = insert_lead(&harness, "L-6").await;

        let id = harness
            .dispatcher
            .schedule(request(&lead, "L-6:welcome", harness.clock.now()))
            .await
            .expect("schedule");

        let summary = harness.dispatcher.tick().await.expect("tick");
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.sent, 0);
        assert!(harness.sender.sent().is_empty());

        let message = harness.messages.find(&id).await.expect("find").expect("row");
        assert_eq!(message.status, DeliveryStatus::Pending);
        assert_eq!(message.retry_count, 0, "compliance deferral is not a retry");
        assert_eq!(message.earliest_send_at, parse_ts("2026-03-02T09:00:00Z"));
    }

    #[tokio::test]
    async fn opted_out_lead_has_due_message_cancelled() {
        let harness = harness(parse_ts("2026-03-02T15:00:00Z"));
        let lead = insert_lead(&harness, "L-7").await;

        let id = harness
            .dispatcher
            .schedule(request(&lead, "L-7:welcome", harness.clock.now()))
            .await
            .expect("schedule");

        // Opt-out lands between scheduling and dispatch.
        let mut conversation =
            harness.conversations.find(&lead).await.expect("find").expect("row");
        let expected = conversation.version;
        conversation.opted_out = true;
        conversation.version += 1;
        assert!(harness.conversations.update(conversation, expected).await.expect("update"));

        let summary = harness.dispatcher.tick().await.expect("tick");
        assert_eq!(summary.cancelled, 1);
        assert!(harness.sender.sent().is_empty());

        let message = harness.messages.find(&id).await.expect("find").expect("row");
        assert_eq!(message.status, DeliveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn three_transient_failures_escalate_with_non_decreasing_delays() {
        let harness = harness(parse_ts("2026-03-02T15:00:00Z"));
        let lead = insert_lead(&harness, "L-8").await;
        harness.sender.script_failures(
            3,
            CollaboratorError::Unavailable("sms gateway timeout".to_string()),
        );

        let id = harness
            .dispatcher
            .schedule(request(&lead, "L-8:welcome", harness.clock.now()))
            .await
            .expect("schedule");

        let mut delays = Vec::new();
        for attempt in 1..=3u32 {
            let summary = harness.dispatcher.tick().await.expect("tick");
            let message = harness.messages.find(&id).await.expect("find").expect("row");
            assert_eq!(message.retry_count, attempt);

            if attempt < 3 {
                assert_eq!(summary.retried, 1);
                assert_eq!(message.status, DeliveryStatus::Pending);
                delays.push(message.earliest_send_at - harness.clock.now());
                harness.clock.set(message.earliest_send_at);
            } else {
                assert_eq!(summary.failed, 1);
                assert_eq!(message.status, DeliveryStatus::Failed);
            }
        }

        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "delays must not shrink");

        let events = harness.notifications.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NotificationKind::SendFailed);
        assert_eq!(events[0].lead_id, lead);

        // Nothing ever reached the transport.
        assert!(harness.sender.sent().is_empty());

        // The failed message never comes due again.
        let summary = harness.dispatcher.tick().await.expect("tick");
        assert_eq!(summary.sent + summary.retried + summary.failed, 0);
    }

    #[tokio::test]
    async fn expired_lease_is_recovered_for_retry() {
        let harness = harness(parse_ts("2026-03-02T15:00:00Z"));
        let lead = insert_lead(&harness, "L-9").await;

        let id = harness
            .dispatcher
            .schedule(request(&lead, "L-9:welcome", harness.clock.now()))
            .await
            .expect("schedule");

        // Simulate a worker that claimed the message and died: claim it
        // directly, then advance past the lease.
        let message = harness.messages.find(&id).await.expect("find").expect("row");
        let engine = DispatchEngine::new();
        let claim = engine.claim(message, "dead-worker", harness.clock.now()).expect("claim");
        assert!(harness
            .messages
            .claim_sending(claim.message.clone(), 1)
            .await
            .expect("claim write"));

        harness.clock.advance(Duration::seconds(180));

        let summary = harness.dispatcher.tick().await.expect("tick");
        assert_eq!(summary.released, 1);

        let message = harness.messages.find(&id).await.expect("find").expect("row");
        assert_eq!(message.status, DeliveryStatus::Pending);
        assert_eq!(message.retry_count, 1);
        assert!(message.earliest_send_at > harness.clock.now());
    }

    #[tokio::test]
    async fn second_message_for_same_lead_waits_for_inflight_send() {
        let harness = harness(parse_ts("2026-03-02T15:00:00Z"));
        let lead = insert_lead(&harness, "L-10").await;

        let first = harness
            .dispatcher
            .schedule(request(&lead, "L-10:a", harness.clock.now()))
            .await
            .expect("schedule first");
        let second = harness
            .dispatcher
            .schedule(request(&lead, "L-10:b", harness.clock.now()))
            .await
            .expect("schedule second");

        // Claim the first directly so it sits in `sending`.
        let message = harness.messages.find(&first).await.expect("find").expect("row");
        let engine = DispatchEngine::new();
        let claim = engine.claim(message, "worker-x", harness.clock.now()).expect("claim");
        assert!(harness
            .messages
            .claim_sending(claim.message, 1)
            .await
            .expect("claim write"));

        let summary = harness.dispatcher.tick().await.expect("tick");
        assert_eq!(summary.sent, 0, "sibling send must wait");

        let blocked = harness.messages.find(&second).await.expect("find").expect("row");
        assert_eq!(blocked.status, DeliveryStatus::Pending);
    }
}
