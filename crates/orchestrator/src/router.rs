//! Event router.
//!
//! Single entry point for everything that moves a conversation: CRM
//! webhook events, scanner timers, and explicit human actions. Processing
//! for one lead is serialized through version-checked conditional updates
//! — a loser re-reads and re-applies its whole step, never a partial write
//! — and inbound events are deduplicated by their upstream external id
//! before anything else happens.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use leadflow_core::clock::Clock;
use leadflow_core::config::OrchestratorConfig;
use leadflow_core::domain::event::ConversationEvent;
use leadflow_core::domain::lead::{
    tz_offset_valid, FactsValidationError, LeadConversation, LeadId, LeadState, LeadType,
    QualificationFacts,
};
use leadflow_core::domain::message::{
    Channel, DeliveryStatus, IdempotencyKey, MessageTransition, TransitionId,
};
use leadflow_core::lifecycle::engine::{
    LifecycleAction, LifecycleContext, LifecycleEngine, LifecycleError, SendTrigger,
    StandardFlow, TransitionOutcome,
};
use leadflow_core::lifecycle::routing::{classify_inbound, InboundSignal};
use leadflow_core::notify::{NotificationEvent, NotificationKind, NotificationSink};
use leadflow_core::scoring::{EngagementSignals, LeadScorer};
use leadflow_db::repositories::{
    ConversationRepository, EventDedupRepository, MessageRepository, RepositoryError,
};

use crate::collaborators::{ContentContext, ContentGenerator, LeadDataProvider};
use crate::dispatcher::{MessageDispatcher, ScheduleError, ScheduleRequest};

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub handoff_threshold: u8,
    pub max_unanswered_sends: u32,
    pub nurture_interval_days: u32,
    pub cas_retry_limit: u32,
    pub default_channel: Channel,
}

impl RouterConfig {
    pub fn from_orchestrator(config: &OrchestratorConfig) -> Self {
        Self {
            handoff_threshold: config.handoff_threshold,
            max_unanswered_sends: config.max_unanswered_sends,
            nurture_interval_days: config.nurture_interval_days,
            cas_retry_limit: config.cas_retry_limit,
            default_channel: Channel::parse(&config.default_channel).unwrap_or(Channel::Sms),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handoff_threshold: 70,
            max_unanswered_sends: 3,
            nurture_interval_days: 14,
            cas_retry_limit: 5,
            default_channel: Channel::Sms,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("unknown lead {0}")]
    UnknownLead(LeadId),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Facts(#[from] FactsValidationError),
    #[error("invalid timezone offset: {0} minutes")]
    InvalidTimezone(i32),
    #[error("conditional update retries exhausted for {0}")]
    ConflictExhausted(LeadId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouterOutcome {
    Applied { from: LeadState, to: LeadState },
    Deduplicated,
}

pub struct EventRouter {
    scorer: LeadScorer,
    engine: LifecycleEngine<StandardFlow>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    dedup: Arc<dyn EventDedupRepository>,
    dispatcher: Arc<MessageDispatcher>,
    content: Arc<dyn ContentGenerator>,
    provider: Arc<dyn LeadDataProvider>,
    notifications: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: RouterConfig,
}

impl EventRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        dedup: Arc<dyn EventDedupRepository>,
        dispatcher: Arc<MessageDispatcher>,
        content: Arc<dyn ContentGenerator>,
        provider: Arc<dyn LeadDataProvider>,
        notifications: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: RouterConfig,
    ) -> Self {
        Self {
            scorer: LeadScorer::new(),
            engine: LifecycleEngine::default(),
            conversations,
            messages,
            dedup,
            dispatcher,
            content,
            provider,
            notifications,
            clock,
            config,
        }
    }

    /// Register a lead and drive it through its creation transition. Safe
    /// to call repeatedly for the same lead: the insert tolerates
    /// duplicates and the welcome send is keyed idempotently.
    pub async fn create_lead(
        &self,
        lead_id: LeadId,
        lead_type: LeadType,
        tz_offset_mins: i32,
        facts: QualificationFacts,
    ) -> Result<RouterOutcome, RouterError> {
        if !tz_offset_valid(tz_offset_mins) {
            return Err(RouterError::InvalidTimezone(tz_offset_mins));
        }
        facts.validate_for(lead_type)?;

        let now = self.clock.now();
        let mut conversation = LeadConversation::new(lead_id.clone(), lead_type, tz_offset_mins, now);
        conversation.facts = facts;
        conversation.score = self
            .scorer
            .score(lead_type, &conversation.facts, &EngagementSignals::default())
            .score;

        let inserted = self.conversations.insert(conversation).await?;
        if !inserted {
            tracing::debug!(
                event_name = "lead.create_replayed",
                lead_id = %lead_id,
                "lead already exists; replaying creation event"
            );
        }

        self.handle_event(&lead_id, ConversationEvent::LeadCreated).await
    }

    /// Merge a facts patch from the CRM, re-score, and route the score
    /// change through the state machine.
    pub async fn update_facts(
        &self,
        lead_id: &LeadId,
        patch: QualificationFacts,
    ) -> Result<RouterOutcome, RouterError> {
        self.apply_event(lead_id, &ConversationEvent::ScoreUpdated, Some(&patch)).await
    }

    /// Route one conversation event. Inbound messages pass the replay
    /// guard first; everything else goes straight to the state machine.
    pub async fn handle_event(
        &self,
        lead_id: &LeadId,
        event: ConversationEvent,
    ) -> Result<RouterOutcome, RouterError> {
        if let ConversationEvent::InboundMessage { external_id, .. } = &event {
            let now = self.clock.now();
            if !self.dedup.record(lead_id, external_id, now).await? {
                tracing::info!(
                    event_name = "lead.event_deduplicated",
                    lead_id = %lead_id,
                    external_id = %external_id,
                    "duplicate inbound event dropped"
                );
                return Ok(RouterOutcome::Deduplicated);
            }
        }

        self.apply_event(lead_id, &event, None).await
    }

    async fn apply_event(
        &self,
        lead_id: &LeadId,
        event: &ConversationEvent,
        facts_patch: Option<&QualificationFacts>,
    ) -> Result<RouterOutcome, RouterError> {
        for _ in 0..self.config.cas_retry_limit {
            let now = self.clock.now();
            let Some(conversation) = self.conversations.find(lead_id).await? else {
                return Err(RouterError::UnknownLead(lead_id.clone()));
            };

            let mut updated = conversation.clone();

            let inbound_signal = match event {
                ConversationEvent::InboundMessage { body, .. } => {
                    updated.last_inbound_at = Some(now);
                    updated.inbound_count += 1;
                    classify_inbound(body)
                }
                _ => InboundSignal::None,
            };

            if let Some(patch) = facts_patch {
                patch.validate_for(updated.lead_type)?;
                updated.facts.merge(patch.clone());
            }

            // On inbound, refresh attributes from the CRM before scoring;
            // the provider is read-only and best-effort.
            if matches!(event, ConversationEvent::InboundMessage { .. }) {
                match self.provider.fetch(lead_id).await {
                    Ok(Some(profile)) => {
                        if profile.facts.validate_for(updated.lead_type).is_ok() {
                            updated.facts.merge(profile.facts);
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::debug!(
                            event_name = "lead.provider_unavailable",
                            lead_id = %lead_id,
                            error = %error,
                            "lead data provider lookup failed; scoring from stored facts"
                        );
                    }
                }
            }

            if matches!(
                event,
                ConversationEvent::InboundMessage { .. } | ConversationEvent::ScoreUpdated
            ) {
                let breakdown = self.scorer.score(
                    updated.lead_type,
                    &updated.facts,
                    &EngagementSignals {
                        inbound_messages: updated.inbound_count,
                        unanswered_sends: updated.unanswered_sends,
                    },
                );
                updated.score = breakdown.score;
            }

            let ctx = LifecycleContext {
                score: updated.score,
                handoff_threshold: self.config.handoff_threshold,
                inbound_signal,
                unanswered_sends: conversation.unanswered_sends,
                max_unanswered_sends: self.config.max_unanswered_sends,
                followup_due: conversation.followup_at.is_some_and(|at| at <= now),
            };

            let outcome = self.engine.apply(&conversation.state, event, &ctx)?;

            updated.state = outcome.to;
            if outcome.to == LeadState::Escalated {
                updated.escalated = true;
            }
            self.apply_state_actions(&mut updated, &outcome.actions, now);
            updated.updated_at = now;
            let expected_version = updated.version;
            updated.version += 1;

            if self.conversations.update(updated.clone(), expected_version).await? {
                tracing::info!(
                    event_name = "lead.transition",
                    lead_id = %lead_id,
                    event = outcome.event_kind,
                    from = outcome.from.as_str(),
                    to = outcome.to.as_str(),
                    score = updated.score,
                    "conversation transition applied"
                );
                self.perform_side_effects(&updated, &outcome, now).await?;
                return Ok(RouterOutcome::Applied { from: outcome.from, to: outcome.to });
            }
            // Lost the conditional update; re-read and retry the whole step.
        }

        Err(RouterError::ConflictExhausted(lead_id.clone()))
    }

    fn apply_state_actions(
        &self,
        conversation: &mut LeadConversation,
        actions: &[LifecycleAction],
        now: DateTime<Utc>,
    ) {
        for action in actions {
            match action {
                LifecycleAction::SetNurtureFollowup => {
                    conversation.followup_at =
                        Some(now + Duration::days(i64::from(self.config.nurture_interval_days)));
                }
                LifecycleAction::ClearNurtureFollowup => conversation.followup_at = None,
                LifecycleAction::MarkOptedOut => conversation.opted_out = true,
                LifecycleAction::SetPaused(paused) => conversation.paused = *paused,
                LifecycleAction::ResetUnansweredSends => conversation.unanswered_sends = 0,
                LifecycleAction::IncrementUnansweredSends => conversation.unanswered_sends += 1,
                // Alert exactly once per handoff: recorded inside the same
                // conditional write that wins the race.
                LifecycleAction::NotifyStaleHandoff => {
                    conversation.stale_alerted_at = Some(now);
                }
                LifecycleAction::ScheduleSend(_)
                | LifecycleAction::CancelPendingSends
                | LifecycleAction::NotifyHandoff
                | LifecycleAction::NotifyEscalation => {}
            }
        }
    }

    async fn perform_side_effects(
        &self,
        conversation: &LeadConversation,
        outcome: &TransitionOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        for action in &outcome.actions {
            match action {
                LifecycleAction::CancelPendingSends => {
                    self.cancel_open_sends(conversation, outcome.event_kind, now).await?;
                }
                LifecycleAction::ScheduleSend(trigger) => {
                    self.schedule_send(conversation, *trigger, now).await?;
                }
                LifecycleAction::NotifyHandoff => {
                    self.notifications.notify(
                        NotificationEvent::new(
                            conversation.lead_id.clone(),
                            NotificationKind::HandoffReady,
                            "lead is ready for human follow-up",
                            now,
                        )
                        .with_metadata("score", conversation.score.to_string())
                        .with_metadata("state", conversation.state.as_str()),
                    );
                }
                LifecycleAction::NotifyEscalation => {
                    self.notifications.notify(NotificationEvent::new(
                        conversation.lead_id.clone(),
                        NotificationKind::EscalationRequired,
                        "conversation escalated; automation paused for this lead",
                        now,
                    ));
                }
                LifecycleAction::NotifyStaleHandoff => {
                    self.notifications.notify(NotificationEvent::new(
                        conversation.lead_id.clone(),
                        NotificationKind::StaleHandoff,
                        "handed-off lead has seen no human follow-up",
                        now,
                    ));
                }
                LifecycleAction::SetNurtureFollowup
                | LifecycleAction::ClearNurtureFollowup
                | LifecycleAction::MarkOptedOut
                | LifecycleAction::SetPaused(_)
                | LifecycleAction::ResetUnansweredSends
                | LifecycleAction::IncrementUnansweredSends => {}
            }
        }
        Ok(())
    }

    async fn cancel_open_sends(
        &self,
        conversation: &LeadConversation,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        let open = self.messages.list_open_for_lead(&conversation.lead_id).await?;
        let cancelled = self.messages.cancel_open_for_lead(&conversation.lead_id, now).await?;

        for message in open {
            self.messages
                .append_transition(MessageTransition {
                    id: TransitionId(Uuid::new_v4().to_string()),
                    message_id: message.id.clone(),
                    lead_id: message.lead_id.clone(),
                    from_status: Some(message.status),
                    to_status: DeliveryStatus::Cancelled,
                    reason: reason.to_string(),
                    error_class: None,
                    actor: "router".to_string(),
                    version: message.version + 1,
                    occurred_at: now,
                })
                .await?;
        }

        tracing::info!(
            event_name = "lead.sends_cancelled",
            lead_id = %conversation.lead_id,
            cancelled,
            reason,
            "open scheduled messages cancelled"
        );
        Ok(())
    }

    async fn schedule_send(
        &self,
        conversation: &LeadConversation,
        trigger: SendTrigger,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        let ctx = ContentContext {
            lead_id: conversation.lead_id.clone(),
            lead_type: conversation.lead_type,
            state: conversation.state,
            facts: conversation.facts.clone(),
            trigger,
        };

        let body = match self.content.generate(&ctx).await {
            Ok(body) => body,
            Err(error) => {
                // A failed generation abandons this one intent; the next
                // natural trigger regenerates from scratch.
                tracing::error!(
                    event_name = "lead.content_generation_failed",
                    lead_id = %conversation.lead_id,
                    trigger = trigger.as_str(),
                    error = %error,
                    "content generation failed; send intent abandoned"
                );
                return Ok(());
            }
        };

        // The welcome key is stable so crash-recovery replays of the
        // creation event can never double-send; later triggers key on the
        // conversation version their transition produced.
        let key = match trigger {
            SendTrigger::Welcome => format!("{}:welcome", conversation.lead_id.0),
            _ => format!(
                "{}:{}:v{}",
                conversation.lead_id.0,
                trigger.as_str(),
                conversation.version
            ),
        };

        let request = ScheduleRequest {
            lead_id: conversation.lead_id.clone(),
            channel: self.config.default_channel,
            body,
            not_before: now,
            idempotency_key: IdempotencyKey(key),
        };

        match self.dispatcher.schedule(request).await {
            Ok(message_id) => {
                tracing::debug!(
                    event_name = "lead.send_scheduled",
                    lead_id = %conversation.lead_id,
                    message_id = %message_id,
                    trigger = trigger.as_str(),
                    "send intent scheduled"
                );
            }
            Err(ScheduleError::Paused(_)) | Err(ScheduleError::Closed(_)) => {
                tracing::debug!(
                    event_name = "lead.send_suppressed",
                    lead_id = %conversation.lead_id,
                    trigger = trigger.as_str(),
                    "conversation stopped accepting sends before scheduling"
                );
            }
            Err(ScheduleError::UnknownLead(_)) => {
                tracing::warn!(
                    event_name = "lead.send_orphaned",
                    lead_id = %conversation.lead_id,
                    "conversation disappeared before scheduling"
                );
            }
            Err(ScheduleError::Repository(error)) => return Err(error.into()),
        }

        Ok(())
    }
}
