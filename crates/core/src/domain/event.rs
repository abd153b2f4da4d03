use serde::{Deserialize, Serialize};

/// Everything that can drive a conversation forward: external input,
/// timers surfaced by the periodic scanner, and explicit human actions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationEvent {
    LeadCreated,
    InboundMessage { external_id: String, body: String },
    ScoreUpdated,
    NoResponseTimeout,
    DormantRescan,
    OptOutDetected,
    ManualPause,
    ManualResume,
    ManualEscalate,
    ManualHandoff,
    ManualComplete,
    StaleHandoffDetected,
}

impl ConversationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LeadCreated => "lead_created",
            Self::InboundMessage { .. } => "inbound_message",
            Self::ScoreUpdated => "score_updated",
            Self::NoResponseTimeout => "no_response_timeout",
            Self::DormantRescan => "dormant_rescan",
            Self::OptOutDetected => "opt_out_detected",
            Self::ManualPause => "manual_pause",
            Self::ManualResume => "manual_resume",
            Self::ManualEscalate => "manual_escalate",
            Self::ManualHandoff => "manual_handoff",
            Self::ManualComplete => "manual_complete",
            Self::StaleHandoffDetected => "stale_handoff_detected",
        }
    }
}
