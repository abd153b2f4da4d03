//! Inbound message pattern routing.
//!
//! Pattern checks run before the score is consulted: an explicit signal in
//! the lead's own words overrides score-based routing.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundSignal {
    /// Regulatory opt-out keyword.
    OptOut,
    /// Lead confirmed a proposed appointment.
    AppointmentConfirmed,
    /// Lead explicitly asked for a human.
    HumanRequested,
    /// Lead is annoyed with the automation.
    Frustration,
    /// Lead wants to arrange a meeting but has not confirmed one.
    AppointmentIntent,
    /// No recognized pattern.
    None,
}

impl InboundSignal {
    /// Signals that route the conversation to a human immediately.
    pub fn is_handoff(&self) -> bool {
        matches!(self, Self::AppointmentConfirmed | Self::HumanRequested | Self::Frustration)
    }
}

const OPT_OUT_KEYWORDS: &[&str] = &["stop", "stopall", "unsubscribe", "end", "quit"];
const OPT_OUT_PHRASES: &[&str] = &["opt out", "opt me out", "remove me from", "do not contact"];

const FRUSTRATION_PHRASES: &[&str] = &[
    "leave me alone",
    "stop texting me",
    "stop calling me",
    "stop messaging me",
    "this is harassment",
    "wrong number",
];

const HUMAN_REQUEST_PHRASES: &[&str] = &[
    "call me",
    "give me a call",
    "talk to a person",
    "talk to a human",
    "speak to someone",
    "speak with an agent",
    "real person",
];

const CONFIRMATION_PHRASES: &[&str] = &[
    "see you then",
    "see you there",
    "confirmed",
    "that works for me",
    "works for me",
    "sounds good",
    "it's a date",
];

const APPOINTMENT_PHRASES: &[&str] = &[
    "can we meet",
    "schedule a",
    "set up a time",
    "book a",
    "tour",
    "showing",
    "available this week",
    "what times",
];

pub fn classify_inbound(body: &str) -> InboundSignal {
    let normalized = body.trim().to_lowercase();

    if is_opt_out(&normalized) {
        return InboundSignal::OptOut;
    }
    if contains_any(&normalized, FRUSTRATION_PHRASES) {
        return InboundSignal::Frustration;
    }
    if contains_any(&normalized, HUMAN_REQUEST_PHRASES) {
        return InboundSignal::HumanRequested;
    }
    if contains_any(&normalized, CONFIRMATION_PHRASES) {
        return InboundSignal::AppointmentConfirmed;
    }
    if contains_any(&normalized, APPOINTMENT_PHRASES) {
        return InboundSignal::AppointmentIntent;
    }

    InboundSignal::None
}

fn is_opt_out(normalized: &str) -> bool {
    // Carrier keywords only count as the first word so "stopped by the
    // open house" does not opt a lead out.
    let first_word = normalized.split_whitespace().next().unwrap_or("");
    let first_word = first_word.trim_matches(|c: char| !c.is_alphanumeric());

    OPT_OUT_KEYWORDS.contains(&first_word) || contains_any(normalized, OPT_OUT_PHRASES)
}

fn contains_any(normalized: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| normalized.contains(phrase))
}
