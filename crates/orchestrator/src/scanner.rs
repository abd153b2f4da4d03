//! Periodic scanner.
//!
//! The only component that turns the passage of time into events: it
//! drives the dispatcher tick, wakes dormant nurture leads, re-drives
//! initial leads that never got their welcome (crash recovery), raises
//! no-response timeouts, and flags stale handoffs. It never touches
//! scheduled-message rows itself — everything routes through the state
//! machine or the dispatcher, so overlapping scans resolve through the
//! same conditional-update discipline as everything else.

use std::sync::Arc;

use chrono::Duration;

use leadflow_core::clock::Clock;
use leadflow_core::config::OrchestratorConfig;
use leadflow_core::domain::event::ConversationEvent;
use leadflow_core::domain::lead::LeadConversation;
use leadflow_db::repositories::{ConversationRepository, MessageRepository};

use crate::dispatcher::{MessageDispatcher, TickSummary};
use crate::router::{EventRouter, RouterError, RouterOutcome};

#[derive(Clone, Debug)]
pub struct ScannerConfig {
    pub interval_secs: u64,
    pub initial_grace_minutes: u32,
    pub stale_handoff_hours: u32,
    pub response_timeout_hours: u32,
}

impl ScannerConfig {
    pub fn from_orchestrator(config: &OrchestratorConfig) -> Self {
        Self {
            interval_secs: config.scanner_interval_secs,
            initial_grace_minutes: config.initial_grace_minutes,
            stale_handoff_hours: config.stale_handoff_hours,
            response_timeout_hours: config.response_timeout_hours,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            initial_grace_minutes: 10,
            stale_handoff_hours: 24,
            response_timeout_hours: 72,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub tick: TickSummary,
    pub rescans: u32,
    pub recovered_initials: u32,
    pub timeouts: u32,
    pub stale_alerts: u32,
}

pub struct PeriodicScanner {
    router: Arc<EventRouter>,
    dispatcher: Arc<MessageDispatcher>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    clock: Arc<dyn Clock>,
    config: ScannerConfig,
}

impl PeriodicScanner {
    pub fn new(
        router: Arc<EventRouter>,
        dispatcher: Arc<MessageDispatcher>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        clock: Arc<dyn Clock>,
        config: ScannerConfig,
    ) -> Self {
        Self { router, dispatcher, conversations, messages, clock, config }
    }

    /// Run scans on a fixed cadence until the task is aborted.
    pub async fn run_forever(&self) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs.max(5)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let summary = self.run_once().await;
            tracing::debug!(
                event_name = "scanner.pass_complete",
                sent = summary.tick.sent,
                rescans = summary.rescans,
                recovered_initials = summary.recovered_initials,
                timeouts = summary.timeouts,
                stale_alerts = summary.stale_alerts,
                "scanner pass complete"
            );
        }
    }

    /// One scan pass. Per-lead failures are logged and skipped so one bad
    /// row cannot stall the rest of the scan.
    pub async fn run_once(&self) -> ScanSummary {
        let mut summary = ScanSummary::default();

        match self.dispatcher.tick().await {
            Ok(tick) => summary.tick = tick,
            Err(error) => {
                tracing::error!(
                    event_name = "scanner.dispatch_tick_failed",
                    error = %error,
                    "dispatcher tick failed"
                );
            }
        }

        let now = self.clock.now();

        match self.conversations.list_nurture_due(now).await {
            Ok(due) => {
                for conversation in due {
                    if self
                        .route(&conversation, ConversationEvent::DormantRescan, "dormant_rescan")
                        .await
                    {
                        summary.rescans += 1;
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    event_name = "scanner.nurture_listing_failed",
                    error = %error,
                    "could not list nurture follow-ups"
                );
            }
        }

        let grace_cutoff = now - Duration::minutes(i64::from(self.config.initial_grace_minutes));
        match self.conversations.list_initial_older_than(grace_cutoff).await {
            Ok(stuck) => {
                for conversation in stuck {
                    match self.messages.has_any_for_lead(&conversation.lead_id).await {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(error) => {
                            tracing::warn!(
                                event_name = "scanner.recovery_check_failed",
                                lead_id = %conversation.lead_id,
                                error = %error,
                                "could not check for scheduled messages"
                            );
                            continue;
                        }
                    }
                    if self
                        .route(&conversation, ConversationEvent::LeadCreated, "initial_recovery")
                        .await
                    {
                        summary.recovered_initials += 1;
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    event_name = "scanner.initial_listing_failed",
                    error = %error,
                    "could not list stuck initial leads"
                );
            }
        }

        let timeout_cutoff =
            now - Duration::hours(i64::from(self.config.response_timeout_hours));
        match self.conversations.list_awaiting_reply(timeout_cutoff).await {
            Ok(waiting) => {
                for conversation in waiting {
                    // Only raise the timeout once the previous touch fully
                    // resolved; an open message means a send is still due
                    // or in flight.
                    match self.messages.list_open_for_lead(&conversation.lead_id).await {
                        Ok(open) if open.is_empty() => {}
                        Ok(_) => continue,
                        Err(error) => {
                            tracing::warn!(
                                event_name = "scanner.timeout_check_failed",
                                lead_id = %conversation.lead_id,
                                error = %error,
                                "could not check open messages"
                            );
                            continue;
                        }
                    }
                    if self
                        .route(
                            &conversation,
                            ConversationEvent::NoResponseTimeout,
                            "no_response_timeout",
                        )
                        .await
                    {
                        summary.timeouts += 1;
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    event_name = "scanner.awaiting_reply_listing_failed",
                    error = %error,
                    "could not list conversations awaiting reply"
                );
            }
        }

        let stale_cutoff = now - Duration::hours(i64::from(self.config.stale_handoff_hours));
        match self.conversations.list_stale_handoffs(stale_cutoff).await {
            Ok(stale) => {
                for conversation in stale {
                    if self
                        .route(
                            &conversation,
                            ConversationEvent::StaleHandoffDetected,
                            "stale_handoff",
                        )
                        .await
                    {
                        summary.stale_alerts += 1;
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    event_name = "scanner.stale_listing_failed",
                    error = %error,
                    "could not list stale handoffs"
                );
            }
        }

        summary
    }

    async fn route(
        &self,
        conversation: &LeadConversation,
        event: ConversationEvent,
        context: &'static str,
    ) -> bool {
        match self.router.handle_event(&conversation.lead_id, event).await {
            Ok(RouterOutcome::Applied { .. }) => true,
            Ok(RouterOutcome::Deduplicated) => false,
            // Another scan or worker won the race; this pass moves on.
            Err(RouterError::ConflictExhausted(_)) | Err(RouterError::Lifecycle(_)) => {
                tracing::debug!(
                    event_name = "scanner.event_superseded",
                    lead_id = %conversation.lead_id,
                    context,
                    "lead changed under the scanner; event dropped"
                );
                false
            }
            Err(error) => {
                tracing::warn!(
                    event_name = "scanner.event_failed",
                    lead_id = %conversation.lead_id,
                    context,
                    error = %error,
                    "scanner event failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use leadflow_core::clock::{Clock, FixedClock};
    use leadflow_core::compliance::{ComplianceGate, SendWindow};
    use leadflow_core::dispatch::DispatchEngine;
    use leadflow_core::domain::lead::{LeadId, LeadState, LeadType, QualificationFacts};
    use leadflow_core::notify::{InMemoryNotificationSink, NotificationKind};
    use leadflow_db::repositories::{
        ConversationRepository, InMemoryConversationRepository, InMemoryEventDedupRepository,
        InMemoryMessageRepository, MessageRepository,
    };

    use crate::collaborators::{
        NoopLeadDataProvider, RecordingChannelSender, TemplateContentGenerator,
    };
    use crate::dispatcher::{DispatcherOptions, MessageDispatcher};
    use crate::router::{EventRouter, RouterConfig};

    use super::{PeriodicScanner, ScannerConfig};

    struct Harness {
        scanner: PeriodicScanner,
        router: Arc<EventRouter>,
        conversations: Arc<InMemoryConversationRepository>,
        messages: Arc<InMemoryMessageRepository>,
        notifications: InMemoryNotificationSink,
        clock: FixedClock,
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn harness() -> Harness {
        let start = parse_ts("2026-03-02T15:00:00Z");
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let messages = Arc::new(InMemoryMessageRepository::default());
        let notifications = InMemoryNotificationSink::default();
        let clock = FixedClock::at(start);

        let dispatcher = Arc::new(MessageDispatcher::new(
            DispatchEngine::new(),
            ComplianceGate::new(SendWindow::default()),
            conversations.clone(),
            messages.clone(),
            Arc::new(RecordingChannelSender::default()),
            Arc::new(notifications.clone()),
            Arc::new(clock.clone()),
            DispatcherOptions::default(),
        ));

        let router = Arc::new(EventRouter::new(
            conversations.clone(),
            messages.clone(),
            Arc::new(InMemoryEventDedupRepository::default()),
            dispatcher.clone(),
            Arc::new(TemplateContentGenerator),
            Arc::new(NoopLeadDataProvider),
            Arc::new(notifications.clone()),
            Arc::new(clock.clone()),
            RouterConfig::default(),
        ));

        let scanner = PeriodicScanner::new(
            router.clone(),
            dispatcher,
            conversations.clone(),
            messages.clone(),
            Arc::new(clock.clone()),
            ScannerConfig::default(),
        );

        Harness { scanner, router, conversations, messages, notifications, clock }
    }

    #[tokio::test]
    async fn dormant_nurture_lead_reenters_qualifying_exactly_once() {
        let harness = harness();
        let lead = LeadId("L-N".to_string());

        let mut conversation = leadflow_core::domain::lead::LeadConversation::new(
            lead.clone(),
            LeadType::Buyer,
            0,
            harness.clock.now() - Duration::days(20),
        );
        conversation.state = LeadState::Nurture;
        conversation.followup_at = Some(harness.clock.now() - Duration::hours(1));
        harness.conversations.insert(conversation).await.expect("insert");

        let first = harness.scanner.run_once().await;
        assert_eq!(first.rescans, 1);

        let refreshed = harness.conversations.find(&lead).await.expect("find").expect("row");
        assert_eq!(refreshed.state, LeadState::Qualifying);
        assert!(refreshed.followup_at.is_none());

        let open = harness.messages.list_open_for_lead(&lead).await.expect("open");
        assert_eq!(open.len(), 1, "re-engagement send scheduled");

        // An overlapping second pass delivers the queued send but finds no
        // follow-up left to rescan.
        let second = harness.scanner.run_once().await;
        assert_eq!(second.rescans, 0);
        assert_eq!(second.tick.sent, 1);

        let third = harness.scanner.run_once().await;
        assert_eq!(third.rescans, 0);
        assert_eq!(third.tick.sent, 0, "exactly one re-engagement send in total");
    }

    #[tokio::test]
    async fn stuck_initial_lead_is_recovered_through_creation() {
        let harness = harness();
        let lead = LeadId("L-O".to_string());

        // A conversation that was inserted but crashed before its creation
        // transition ran: still initial, no scheduled message.
        let conversation = leadflow_core::domain::lead::LeadConversation::new(
            lead.clone(),
            LeadType::Buyer,
            0,
            harness.clock.now() - Duration::minutes(30),
        );
        harness.conversations.insert(conversation).await.expect("insert");

        let summary = harness.scanner.run_once().await;
        assert_eq!(summary.recovered_initials, 1);

        let refreshed = harness.conversations.find(&lead).await.expect("find").expect("row");
        assert_eq!(refreshed.state, LeadState::Qualifying);
        assert!(harness.messages.has_any_for_lead(&lead).await.expect("messages"));

        // Recovery is idempotent: the welcome key already exists.
        let again = harness.scanner.run_once().await;
        assert_eq!(again.recovered_initials, 0);
    }

    #[tokio::test]
    async fn fresh_initial_lead_is_left_alone_during_grace() {
        let harness = harness();
        let lead = LeadId("L-P".to_string());

        let conversation = leadflow_core::domain::lead::LeadConversation::new(
            lead.clone(),
            LeadType::Buyer,
            0,
            harness.clock.now() - Duration::minutes(2),
        );
        harness.conversations.insert(conversation).await.expect("insert");

        let summary = harness.scanner.run_once().await;
        assert_eq!(summary.recovered_initials, 0);
    }

    #[tokio::test]
    async fn unanswered_sends_time_out_into_nurture_after_the_limit() {
        let harness = harness();
        let lead = LeadId("L-Q".to_string());

        harness
            .router
            .create_lead(lead.clone(), LeadType::Buyer, 0, QualificationFacts::default())
            .await
            .expect("create");

        // Deliver the welcome so the lead is waiting on a reply.
        let tick_summary = harness.scanner.run_once().await;
        assert_eq!(tick_summary.tick.sent, 1);

        // Three unanswered touches: each timeout schedules another send,
        // which must be delivered before the next timeout can fire.
        for round in 1..=3u32 {
            harness.clock.advance(Duration::hours(73));
            let summary = harness.scanner.run_once().await;
            assert_eq!(summary.timeouts, 1, "round {round} should raise one timeout");

            let refreshed =
                harness.conversations.find(&lead).await.expect("find").expect("row");
            if round < 3 {
                assert_eq!(refreshed.state, LeadState::Qualifying);
                assert_eq!(refreshed.unanswered_sends, round);
                // Deliver the follow-up touch so the next round times out.
                harness.clock.advance(Duration::hours(2));
                harness.scanner.run_once().await;
            } else {
                assert_eq!(refreshed.state, LeadState::Nurture);
                assert!(refreshed.followup_at.is_some());
            }
        }
    }

    #[tokio::test]
    async fn stale_handoff_alerts_once() {
        let harness = harness();
        let lead = LeadId("L-R".to_string());

        let mut conversation = leadflow_core::domain::lead::LeadConversation::new(
            lead.clone(),
            LeadType::Buyer,
            0,
            harness.clock.now() - Duration::days(3),
        );
        conversation.state = LeadState::HandedOff;
        conversation.updated_at = harness.clock.now() - Duration::hours(30);
        harness.conversations.insert(conversation).await.expect("insert");

        let first = harness.scanner.run_once().await;
        assert_eq!(first.stale_alerts, 1);

        let refreshed = harness.conversations.find(&lead).await.expect("find").expect("row");
        assert_eq!(refreshed.state, LeadState::HandedOff, "alert does not change state");
        assert!(refreshed.stale_alerted_at.is_some());

        let events = harness.notifications.events();
        assert_eq!(
            events.iter().filter(|event| event.kind == NotificationKind::StaleHandoff).count(),
            1
        );

        // The alert marker suppresses repeats on the next pass.
        let second = harness.scanner.run_once().await;
        assert_eq!(second.stale_alerts, 0);
        let events = harness.notifications.events();
        assert_eq!(
            events.iter().filter(|event| event.kind == NotificationKind::StaleHandoff).count(),
            1
        );
    }
}
