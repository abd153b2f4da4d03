//! Boundary contracts consumed by the orchestrator, plus the reference and
//! test implementations. Real content generation and message transport live
//! outside this system.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use leadflow_core::domain::lead::{LeadId, LeadState, LeadType, QualificationFacts};
use leadflow_core::domain::message::Channel;
use leadflow_core::lifecycle::SendTrigger;
use leadflow_core::notify::{NotificationEvent, NotificationSink};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator could not be reached or timed out; retryable.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    /// The collaborator refused the request; retrying will not help.
    #[error("collaborator rejected the request: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "channel_unavailable",
            Self::Rejected(_) => "channel_rejected",
        }
    }
}

/// Everything the external content generator gets to work with.
#[derive(Clone, Debug)]
pub struct ContentContext {
    pub lead_id: LeadId,
    pub lead_type: LeadType,
    pub state: LeadState,
    pub facts: QualificationFacts,
    pub trigger: SendTrigger,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, ctx: &ContentContext) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Must tolerate at-least-once invocation: lease-expiry retries can
    /// resend a message the transport already delivered.
    async fn send(
        &self,
        lead_id: &LeadId,
        channel: Channel,
        body: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Read-only view of a lead as the CRM currently knows it.
#[derive(Clone, Debug)]
pub struct LeadProfile {
    pub lead_id: LeadId,
    pub lead_type: LeadType,
    pub tz_offset_mins: i32,
    pub facts: QualificationFacts,
}

#[async_trait]
pub trait LeadDataProvider: Send + Sync {
    async fn fetch(&self, lead_id: &LeadId) -> Result<Option<LeadProfile>, CollaboratorError>;
}

/// Deterministic fallback content, keyed off the trigger. Useful as a demo
/// generator and as the test double.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateContentGenerator;

#[async_trait]
impl ContentGenerator for TemplateContentGenerator {
    async fn generate(&self, ctx: &ContentContext) -> Result<String, CollaboratorError> {
        let body = match ctx.trigger {
            SendTrigger::Welcome => {
                "Hi! Thanks for reaching out about your home search. \
                 What area are you focused on?"
            }
            SendTrigger::Qualifying => {
                "Quick question so I can point you at the right listings: \
                 what's your ideal move-in timeline?"
            }
            SendTrigger::SchedulingNudge => {
                "Happy to set that up. Does a weekday evening or a weekend \
                 work better for you?"
            }
            SendTrigger::Reengagement => {
                "It's been a little while since we talked. Still thinking \
                 about making a move this year?"
            }
        };
        Ok(body.to_string())
    }
}

/// Content generator that always fails; exercises the abandon-on-failure
/// path.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingContentGenerator;

#[async_trait]
impl ContentGenerator for FailingContentGenerator {
    async fn generate(&self, _ctx: &ContentContext) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable("content generator offline".to_string()))
    }
}

/// Records every send and replays scripted outcomes, defaulting to success.
#[derive(Debug, Default)]
pub struct RecordingChannelSender {
    sent: Mutex<Vec<(LeadId, Channel, String)>>,
    scripted: Mutex<VecDeque<Result<(), CollaboratorError>>>,
}

impl RecordingChannelSender {
    pub fn script(&self, outcome: Result<(), CollaboratorError>) {
        self.scripted.lock().unwrap_or_else(PoisonError::into_inner).push_back(outcome);
    }

    pub fn script_failures(&self, count: usize, error: CollaboratorError) {
        for _ in 0..count {
            self.script(Err(error.clone()));
        }
    }

    pub fn sent(&self) -> Vec<(LeadId, Channel, String)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ChannelSender for RecordingChannelSender {
    async fn send(
        &self,
        lead_id: &LeadId,
        channel: Channel,
        body: &str,
    ) -> Result<(), CollaboratorError> {
        let outcome = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((lead_id.clone(), channel, body.to_string()));
        }
        outcome
    }
}

/// Logs the send instead of delivering it. Stands in for a real transport
/// in demos and `doctor` runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingChannelSender;

#[async_trait]
impl ChannelSender for LoggingChannelSender {
    async fn send(
        &self,
        lead_id: &LeadId,
        channel: Channel,
        body: &str,
    ) -> Result<(), CollaboratorError> {
        tracing::info!(
            event_name = "channel.send",
            lead_id = %lead_id,
            channel = channel.as_str(),
            body_len = body.len(),
            "outbound message (logging transport)"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLeadDataProvider;

#[async_trait]
impl LeadDataProvider for NoopLeadDataProvider {
    async fn fetch(&self, _lead_id: &LeadId) -> Result<Option<LeadProfile>, CollaboratorError> {
        Ok(None)
    }
}

/// Fixed profile map for tests.
#[derive(Debug, Default)]
pub struct StaticLeadDataProvider {
    profiles: Mutex<HashMap<String, LeadProfile>>,
}

impl StaticLeadDataProvider {
    pub fn insert(&self, profile: LeadProfile) {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.lead_id.0.clone(), profile);
    }
}

#[async_trait]
impl LeadDataProvider for StaticLeadDataProvider {
    async fn fetch(&self, lead_id: &LeadId) -> Result<Option<LeadProfile>, CollaboratorError> {
        Ok(self.profiles.lock().unwrap_or_else(PoisonError::into_inner).get(&lead_id.0).cloned())
    }
}

/// Notification sink that surfaces events in the service log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, event: NotificationEvent) {
        tracing::warn!(
            event_name = "notification.emitted",
            lead_id = %event.lead_id,
            kind = event.kind.as_str(),
            message = %event.message,
            "human attention required"
        );
    }
}

/// Posts notification events to a configured webhook. Delivery is
/// fire-and-forget; failures are logged, not retried — the event is also
/// always in the service log via tracing.
pub struct WebhookNotificationSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(url: String) -> Self {
        Self { client: reqwest::Client::new(), url }
    }
}

impl NotificationSink for WebhookNotificationSink {
    fn notify(&self, event: NotificationEvent) {
        tracing::warn!(
            event_name = "notification.emitted",
            lead_id = %event.lead_id,
            kind = event.kind.as_str(),
            message = %event.message,
            "human attention required"
        );

        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let result = client.post(&url).json(&event).send().await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    tracing::error!(
                        event_name = "notification.webhook_rejected",
                        status = %response.status(),
                        "notification webhook returned an error status"
                    );
                }
                Err(error) => {
                    tracing::error!(
                        event_name = "notification.webhook_failed",
                        error = %error,
                        "notification webhook delivery failed"
                    );
                }
                _ => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use leadflow_core::domain::lead::{LeadId, LeadState, LeadType, QualificationFacts};
    use leadflow_core::domain::message::Channel;
    use leadflow_core::lifecycle::SendTrigger;

    use super::{
        ChannelSender, CollaboratorError, ContentContext, ContentGenerator,
        RecordingChannelSender, TemplateContentGenerator,
    };

    fn ctx(trigger: SendTrigger) -> ContentContext {
        ContentContext {
            lead_id: LeadId("L-1".to_string()),
            lead_type: LeadType::Buyer,
            state: LeadState::Qualifying,
            facts: QualificationFacts::default(),
            trigger,
        }
    }

    #[tokio::test]
    async fn template_generator_is_deterministic_per_trigger() {
        let generator = TemplateContentGenerator;

        let first = generator.generate(&ctx(SendTrigger::Welcome)).await.expect("generate");
        let second = generator.generate(&ctx(SendTrigger::Welcome)).await.expect("generate");
        let other = generator.generate(&ctx(SendTrigger::Reengagement)).await.expect("generate");

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn recording_sender_replays_scripted_failures_then_succeeds() {
        let sender = RecordingChannelSender::default();
        sender.script(Err(CollaboratorError::Unavailable("gateway down".to_string())));

        let lead = LeadId("L-1".to_string());
        let first = sender.send(&lead, Channel::Sms, "hello").await;
        assert!(first.is_err());
        assert!(sender.sent().is_empty());

        let second = sender.send(&lead, Channel::Sms, "hello").await;
        assert!(second.is_ok());
        assert_eq!(sender.sent().len(), 1);
    }

    #[test]
    fn error_classification() {
        assert!(CollaboratorError::Unavailable("x".to_string()).is_transient());
        assert!(!CollaboratorError::Rejected("x".to_string()).is_transient());
    }
}
