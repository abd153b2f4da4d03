pub mod collaborators;
pub mod dispatcher;
pub mod router;
pub mod scanner;

pub use collaborators::{
    ChannelSender, CollaboratorError, ContentContext, ContentGenerator, LeadDataProvider,
    LeadProfile, LoggingChannelSender, NoopLeadDataProvider, RecordingChannelSender,
    StaticLeadDataProvider, TemplateContentGenerator, TracingNotificationSink,
    WebhookNotificationSink,
};
pub use dispatcher::{
    DispatcherOptions, MessageDispatcher, ScheduleError, ScheduleRequest, TickSummary,
};
pub use router::{EventRouter, RouterConfig, RouterError, RouterOutcome};
pub use scanner::{PeriodicScanner, ScanSummary, ScannerConfig};
