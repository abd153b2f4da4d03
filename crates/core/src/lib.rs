pub mod clock;
pub mod compliance;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod notify;
pub mod scoring;

pub use chrono;

pub use clock::{Clock, FixedClock, SystemClock};
pub use compliance::{ComplianceDecision, ComplianceGate, DenialReason, SendWindow};
pub use dispatch::{
    DispatchConfig, DispatchEngine, DispatchError, DispatchOutcome, FailureKind,
};
pub use domain::event::ConversationEvent;
pub use domain::lead::{
    LeadConversation, LeadId, LeadState, LeadType, Motivation, PriceExpectation,
    QualificationFacts, Timeline,
};
pub use domain::message::{
    Channel, DeliveryStatus, IdempotencyKey, MessageId, MessageTransition, ScheduledMessage,
    TransitionId,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::engine::{
    ConversationFlow, LifecycleContext, LifecycleEngine, LifecycleError, StandardFlow,
    TransitionOutcome,
};
pub use lifecycle::routing::{classify_inbound, InboundSignal};
pub use lifecycle::{LifecycleAction, SendTrigger};
pub use notify::{InMemoryNotificationSink, NotificationEvent, NotificationKind, NotificationSink};
pub use scoring::{EngagementSignals, LeadScorer, ScoreBreakdown};
