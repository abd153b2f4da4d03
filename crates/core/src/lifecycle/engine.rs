use thiserror::Error;

use crate::domain::event::ConversationEvent;
use crate::domain::lead::LeadState;
use crate::lifecycle::routing::InboundSignal;

/// What kind of outbound touch a transition asked for. Becomes part of the
/// scheduling idempotency key and the content-generation context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendTrigger {
    Welcome,
    Qualifying,
    SchedulingNudge,
    Reengagement,
}

impl SendTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Qualifying => "qualifying",
            Self::SchedulingNudge => "scheduling_nudge",
            Self::Reengagement => "reengagement",
        }
    }
}

/// Side-effect intents emitted by a transition. The state machine never
/// performs I/O itself; the event router executes these after the
/// conversation update wins its conditional write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleAction {
    ScheduleSend(SendTrigger),
    SetNurtureFollowup,
    ClearNurtureFollowup,
    CancelPendingSends,
    MarkOptedOut,
    SetPaused(bool),
    ResetUnansweredSends,
    IncrementUnansweredSends,
    NotifyHandoff,
    NotifyEscalation,
    NotifyStaleHandoff,
}

/// Inputs a transition may consult. Built by the router from the freshly
/// re-scored conversation; the engine itself stays pure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleContext {
    pub score: u8,
    pub handoff_threshold: u8,
    pub inbound_signal: InboundSignal,
    pub unanswered_sends: u32,
    pub max_unanswered_sends: u32,
    pub followup_due: bool,
}

impl Default for LifecycleContext {
    fn default() -> Self {
        Self {
            score: 0,
            handoff_threshold: 70,
            inbound_signal: InboundSignal::None,
            unanswered_sends: 0,
            max_unanswered_sends: 3,
            followup_due: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: LeadState,
    pub to: LeadState,
    pub event_kind: &'static str,
    pub actions: Vec<LifecycleAction>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition from {state:?} on event `{event}`")]
    InvalidTransition { state: LeadState, event: &'static str },
}

pub trait ConversationFlow {
    fn initial_state(&self) -> LeadState;
    fn transition(
        &self,
        current: &LeadState,
        event: &ConversationEvent,
        ctx: &LifecycleContext,
    ) -> Result<TransitionOutcome, LifecycleError>;
}

/// The production engagement flow.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardFlow;

impl ConversationFlow for StandardFlow {
    fn initial_state(&self) -> LeadState {
        LeadState::Initial
    }

    fn transition(
        &self,
        current: &LeadState,
        event: &ConversationEvent,
        ctx: &LifecycleContext,
    ) -> Result<TransitionOutcome, LifecycleError> {
        transition_standard(current, event, ctx)
    }
}

pub struct LifecycleEngine<F> {
    flow: F,
}

impl<F> LifecycleEngine<F>
where
    F: ConversationFlow,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> LeadState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &LeadState,
        event: &ConversationEvent,
        ctx: &LifecycleContext,
    ) -> Result<TransitionOutcome, LifecycleError> {
        self.flow.transition(current, event, ctx)
    }
}

impl Default for LifecycleEngine<StandardFlow> {
    fn default() -> Self {
        Self::new(StandardFlow)
    }
}

fn transition_standard(
    current: &LeadState,
    event: &ConversationEvent,
    ctx: &LifecycleContext,
) -> Result<TransitionOutcome, LifecycleError> {
    use ConversationEvent as Event;
    use LeadState::{Completed, Escalated, HandedOff, Initial, Nurture, Qualifying, Scheduling};
    use LifecycleAction as Action;

    let (to, actions) = match (current, event) {
        // Pause/resume toggle the automation flag without moving the
        // lifecycle: "no automation" is distinct from "done".
        (_, Event::ManualPause) => (*current, vec![Action::SetPaused(true)]),
        (_, Event::ManualResume) => (*current, vec![Action::SetPaused(false)]),

        // Replays against an already-closed lead are no-ops, not errors.
        (Completed, Event::OptOutDetected | Event::ManualComplete | Event::LeadCreated) => {
            (Completed, Vec::new())
        }
        (Completed, _) => {
            return Err(invalid(current, event));
        }

        (_, Event::OptOutDetected) => {
            (Completed, vec![Action::MarkOptedOut, Action::CancelPendingSends])
        }
        (_, Event::ManualComplete) => (Completed, vec![Action::CancelPendingSends]),
        (_, Event::ManualHandoff) => (HandedOff, Vec::new()),
        (_, Event::ManualEscalate) => (Escalated, vec![Action::NotifyEscalation]),

        (Initial, Event::LeadCreated) => {
            (Qualifying, vec![Action::ScheduleSend(SendTrigger::Welcome)])
        }
        // A replayed create event for a lead that already moved on.
        (_, Event::LeadCreated) => (*current, Vec::new()),

        (
            Initial | Qualifying | Scheduling | Nurture,
            Event::InboundMessage { .. },
        ) => match ctx.inbound_signal {
            InboundSignal::OptOut => {
                (Completed, vec![Action::MarkOptedOut, Action::CancelPendingSends])
            }
            InboundSignal::AppointmentConfirmed
            | InboundSignal::HumanRequested
            | InboundSignal::Frustration => {
                (HandedOff, vec![Action::ResetUnansweredSends, Action::NotifyHandoff])
            }
            InboundSignal::AppointmentIntent => (
                Scheduling,
                vec![
                    Action::ResetUnansweredSends,
                    Action::ClearNurtureFollowup,
                    Action::ScheduleSend(SendTrigger::SchedulingNudge),
                ],
            ),
            InboundSignal::None => {
                if ctx.score >= ctx.handoff_threshold {
                    (HandedOff, vec![Action::ResetUnansweredSends, Action::NotifyHandoff])
                } else {
                    (
                        Qualifying,
                        vec![
                            Action::ResetUnansweredSends,
                            Action::ClearNurtureFollowup,
                            Action::ScheduleSend(SendTrigger::Qualifying),
                        ],
                    )
                }
            }
        },
        // A human owns the thread; record the inbound but do nothing.
        (Escalated | HandedOff, Event::InboundMessage { .. }) => (*current, Vec::new()),

        (Initial | Qualifying | Scheduling | Nurture, Event::ScoreUpdated) => {
            if ctx.score >= ctx.handoff_threshold {
                (HandedOff, vec![Action::NotifyHandoff])
            } else {
                (*current, Vec::new())
            }
        }
        (Escalated | HandedOff, Event::ScoreUpdated) => (*current, Vec::new()),

        (Qualifying | Scheduling, Event::NoResponseTimeout) => {
            // The timeout itself marks one more unanswered send.
            if ctx.unanswered_sends + 1 >= ctx.max_unanswered_sends {
                (Nurture, vec![Action::IncrementUnansweredSends, Action::SetNurtureFollowup])
            } else {
                (
                    *current,
                    vec![
                        Action::IncrementUnansweredSends,
                        Action::ScheduleSend(SendTrigger::Qualifying),
                    ],
                )
            }
        }

        // A concurrent scan already pulled this lead out of nurture.
        (Initial | Qualifying | Scheduling, Event::DormantRescan) => (*current, Vec::new()),
        (Nurture, Event::DormantRescan) => {
            if ctx.followup_due {
                (
                    Qualifying,
                    vec![
                        Action::ClearNurtureFollowup,
                        Action::ScheduleSend(SendTrigger::Reengagement),
                    ],
                )
            } else {
                (Nurture, Vec::new())
            }
        }

        // Alert only; automation never re-engages a handed-off lead.
        (HandedOff, Event::StaleHandoffDetected) => {
            (HandedOff, vec![Action::NotifyStaleHandoff])
        }

        _ => {
            return Err(invalid(current, event));
        }
    };

    Ok(TransitionOutcome { from: *current, to, event_kind: event.kind(), actions })
}

fn invalid(current: &LeadState, event: &ConversationEvent) -> LifecycleError {
    LifecycleError::InvalidTransition { state: *current, event: event.kind() }
}
