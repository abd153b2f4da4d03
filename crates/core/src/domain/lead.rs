use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque lead identifier owned by the upstream CRM.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadId(pub String);

impl std::fmt::Display for LeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Largest timezone offset the boundary accepts, in minutes (UTC±14:00).
pub const MAX_TZ_OFFSET_MINS: i32 = 14 * 60;

pub fn tz_offset_valid(mins: i32) -> bool {
    mins.abs() <= MAX_TZ_OFFSET_MINS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadType {
    Buyer,
    Seller,
    Both,
}

impl LeadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buyer => "buyer",
            Self::Seller => "seller",
            Self::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "buyer" => Some(Self::Buyer),
            "seller" => Some(Self::Seller),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadState {
    Initial,
    Qualifying,
    Scheduling,
    Nurture,
    Escalated,
    HandedOff,
    Completed,
}

impl LeadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Qualifying => "qualifying",
            Self::Scheduling => "scheduling",
            Self::Nurture => "nurture",
            Self::Escalated => "escalated",
            Self::HandedOff => "handed_off",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "initial" => Some(Self::Initial),
            "qualifying" => Some(Self::Qualifying),
            "scheduling" => Some(Self::Scheduling),
            "nurture" => Some(Self::Nurture),
            "escalated" => Some(Self::Escalated),
            "handed_off" => Some(Self::HandedOff),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// `Completed` is the only fully terminal state. `HandedOff` is terminal
    /// for automation but a human may still act on the lead.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// States in which automation may still originate sends.
    pub fn automation_active(&self) -> bool {
        matches!(self, Self::Initial | Self::Qualifying | Self::Scheduling | Self::Nurture)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeline {
    Within30Days,
    Within90Days,
    ThisYear,
    Exploring,
}

impl Timeline {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "within_30_days" | "30_days" => Some(Self::Within30Days),
            "within_90_days" | "90_days" => Some(Self::Within90Days),
            "this_year" => Some(Self::ThisYear),
            "exploring" => Some(Self::Exploring),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Motivation {
    Relocation,
    GrowingFamily,
    Investment,
    Downsizing,
    Curious,
}

impl Motivation {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "relocation" => Some(Self::Relocation),
            "growing_family" => Some(Self::GrowingFamily),
            "investment" => Some(Self::Investment),
            "downsizing" => Some(Self::Downsizing),
            "curious" => Some(Self::Curious),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceExpectation {
    Realistic,
    Optimistic,
    Unrealistic,
}

impl PriceExpectation {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "realistic" => Some(Self::Realistic),
            "optimistic" => Some(Self::Optimistic),
            "unrealistic" => Some(Self::Unrealistic),
            _ => None,
        }
    }
}

/// Closed, versioned fact set. The CRM hands us an open-ended attribute bag;
/// this is the typed subset the orchestrator recognizes, validated against
/// the lead type at the ingress boundary. Absent fields feed the scorer's
/// neutral defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualificationFacts {
    pub timeline: Option<Timeline>,
    pub pre_approved: Option<bool>,
    pub budget: Option<Decimal>,
    pub motivation: Option<Motivation>,
    pub price_expectation: Option<PriceExpectation>,
    pub has_agent: Option<bool>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FactsValidationError {
    #[error("fact `{fact}` does not apply to {lead_type:?} leads")]
    NotApplicable { fact: &'static str, lead_type: LeadType },
}

impl QualificationFacts {
    /// Buyer-only facts on a seller lead (and vice versa) are rejected at
    /// the boundary; `Both` accepts the union.
    pub fn validate_for(&self, lead_type: LeadType) -> Result<(), FactsValidationError> {
        match lead_type {
            LeadType::Seller => {
                if self.pre_approved.is_some() {
                    return Err(FactsValidationError::NotApplicable {
                        fact: "pre_approved",
                        lead_type,
                    });
                }
                if self.budget.is_some() {
                    return Err(FactsValidationError::NotApplicable { fact: "budget", lead_type });
                }
            }
            LeadType::Buyer => {
                if self.price_expectation.is_some() {
                    return Err(FactsValidationError::NotApplicable {
                        fact: "price_expectation",
                        lead_type,
                    });
                }
            }
            LeadType::Both => {}
        }
        Ok(())
    }

    /// Merge a partial update: present fields override, absent fields keep
    /// their current value.
    pub fn merge(&mut self, patch: QualificationFacts) {
        if let Some(timeline) = patch.timeline {
            self.timeline = Some(timeline);
        }
        if let Some(pre_approved) = patch.pre_approved {
            self.pre_approved = Some(pre_approved);
        }
        if let Some(budget) = patch.budget {
            self.budget = Some(budget);
        }
        if let Some(motivation) = patch.motivation {
            self.motivation = Some(motivation);
        }
        if let Some(price_expectation) = patch.price_expectation {
            self.price_expectation = Some(price_expectation);
        }
        if let Some(has_agent) = patch.has_agent {
            self.has_agent = Some(has_agent);
        }
    }
}

/// One row per lead. Mutated only through version-checked conditional
/// updates; losers of a concurrent update re-read and retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeadConversation {
    pub lead_id: LeadId,
    pub lead_type: LeadType,
    pub state: LeadState,
    pub score: u8,
    pub facts: QualificationFacts,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub inbound_count: u32,
    pub unanswered_sends: u32,
    pub escalated: bool,
    pub paused: bool,
    pub opted_out: bool,
    pub legal_hold: bool,
    pub tz_offset_mins: i32,
    pub followup_at: Option<DateTime<Utc>>,
    pub stale_alerted_at: Option<DateTime<Utc>>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeadConversation {
    pub fn new(
        lead_id: LeadId,
        lead_type: LeadType,
        tz_offset_mins: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            lead_id,
            lead_type,
            state: LeadState::Initial,
            score: 0,
            facts: QualificationFacts::default(),
            last_inbound_at: None,
            last_outbound_at: None,
            inbound_count: 0,
            unanswered_sends: 0,
            escalated: false,
            paused: false,
            opted_out: false,
            legal_hold: false,
            tz_offset_mins,
            followup_at: None,
            stale_alerted_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{
        tz_offset_valid, FactsValidationError, LeadState, LeadType, PriceExpectation,
        QualificationFacts, Timeline,
    };

    #[test]
    fn lead_state_round_trips_from_storage_encoding() {
        let cases = [
            LeadState::Initial,
            LeadState::Qualifying,
            LeadState::Scheduling,
            LeadState::Nurture,
            LeadState::Escalated,
            LeadState::HandedOff,
            LeadState::Completed,
        ];

        for state in cases {
            assert_eq!(LeadState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn lead_type_round_trips_from_storage_encoding() {
        for lead_type in [LeadType::Buyer, LeadType::Seller, LeadType::Both] {
            assert_eq!(LeadType::parse(lead_type.as_str()), Some(lead_type));
        }
    }

    #[test]
    fn only_completed_is_terminal() {
        assert!(LeadState::Completed.is_terminal());
        assert!(!LeadState::HandedOff.is_terminal());
        assert!(!LeadState::Escalated.is_terminal());
    }

    #[test]
    fn automation_stops_at_escalation_and_handoff() {
        assert!(LeadState::Qualifying.automation_active());
        assert!(LeadState::Nurture.automation_active());
        assert!(!LeadState::Escalated.automation_active());
        assert!(!LeadState::HandedOff.automation_active());
        assert!(!LeadState::Completed.automation_active());
    }

    #[test]
    fn buyer_facts_rejected_on_seller_lead() {
        let facts = QualificationFacts {
            pre_approved: Some(true),
            ..QualificationFacts::default()
        };

        let error = facts.validate_for(LeadType::Seller).expect_err("must reject");
        assert_eq!(
            error,
            FactsValidationError::NotApplicable { fact: "pre_approved", lead_type: LeadType::Seller }
        );
    }

    #[test]
    fn seller_facts_rejected_on_buyer_lead() {
        let facts = QualificationFacts {
            price_expectation: Some(PriceExpectation::Optimistic),
            ..QualificationFacts::default()
        };

        assert!(facts.validate_for(LeadType::Buyer).is_err());
    }

    #[test]
    fn both_lead_accepts_union_of_facts() {
        let facts = QualificationFacts {
            timeline: Some(Timeline::Within30Days),
            pre_approved: Some(true),
            budget: Some(Decimal::new(450_000, 0)),
            price_expectation: Some(PriceExpectation::Realistic),
            ..QualificationFacts::default()
        };

        assert!(facts.validate_for(LeadType::Both).is_ok());
    }

    #[test]
    fn merge_overrides_present_fields_only() {
        let mut facts = QualificationFacts {
            timeline: Some(Timeline::Exploring),
            pre_approved: Some(false),
            ..QualificationFacts::default()
        };

        facts.merge(QualificationFacts {
            timeline: Some(Timeline::Within30Days),
            budget: Some(Decimal::new(300_000, 0)),
            ..QualificationFacts::default()
        });

        assert_eq!(facts.timeline, Some(Timeline::Within30Days));
        assert_eq!(facts.pre_approved, Some(false));
        assert_eq!(facts.budget, Some(Decimal::new(300_000, 0)));
    }

    #[test]
    fn timezone_offset_bounds() {
        assert!(tz_offset_valid(0));
        assert!(tz_offset_valid(-8 * 60));
        assert!(tz_offset_valid(14 * 60));
        assert!(!tz_offset_valid(15 * 60));
        assert!(!tz_offset_valid(-15 * 60));
    }
}
