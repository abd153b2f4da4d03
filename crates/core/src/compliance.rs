//! Send-permission predicate.
//!
//! Consulted by the dispatcher immediately before every send, never cached
//! across ticks: opt-out status and the wall clock both change between
//! scheduling and execution.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};

use crate::domain::lead::LeadConversation;

/// Allowed lead-local hours for automated sends; `end_hour` is exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self { start_hour: 9, end_hour: 20 }
    }
}

impl SendWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        let hour = time.hour() as u8;
        hour >= self.start_hour && hour < self.end_hour
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenialReason {
    OptedOut,
    OutsideSendWindow,
    LegalHold,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptedOut => "opted_out",
            Self::OutsideSendWindow => "outside_send_window",
            Self::LegalHold => "legal_hold",
        }
    }

    /// Permanent denials cancel the message; temporary ones reschedule it.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::OutsideSendWindow)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComplianceDecision {
    Allowed,
    Denied { reason: DenialReason, next_permitted_at: Option<DateTime<Utc>> },
}

#[derive(Clone, Copy, Debug)]
pub struct ComplianceGate {
    window: SendWindow,
}

impl ComplianceGate {
    pub fn new(window: SendWindow) -> Self {
        Self { window }
    }

    /// Checks run in order and short-circuit on the first failure:
    /// opt-out/suppression, lead-local send window, legal hold.
    pub fn evaluate(&self, lead: &LeadConversation, now: DateTime<Utc>) -> ComplianceDecision {
        if lead.opted_out {
            return ComplianceDecision::Denied {
                reason: DenialReason::OptedOut,
                next_permitted_at: None,
            };
        }

        let local = now + Duration::minutes(i64::from(lead.tz_offset_mins));
        if !self.window.contains(local.time()) {
            return ComplianceDecision::Denied {
                reason: DenialReason::OutsideSendWindow,
                next_permitted_at: Some(self.next_window_open(lead.tz_offset_mins, now)),
            };
        }

        if lead.legal_hold {
            return ComplianceDecision::Denied {
                reason: DenialReason::LegalHold,
                next_permitted_at: None,
            };
        }

        ComplianceDecision::Allowed
    }

    pub fn is_allowed(&self, lead: &LeadConversation, now: DateTime<Utc>) -> bool {
        matches!(self.evaluate(lead, now), ComplianceDecision::Allowed)
    }

    /// Next UTC instant at which the lead-local send window opens.
    fn next_window_open(&self, tz_offset_mins: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = Duration::minutes(i64::from(tz_offset_mins));
        let local = now + offset;
        let window_start = NaiveTime::from_hms_opt(u32::from(self.window.start_hour), 0, 0)
            .unwrap_or(NaiveTime::MIN);

        let today_open = local.date_naive().and_time(window_start);
        let next_local_open = if local.time() < window_start {
            today_open
        } else {
            today_open + Duration::days(1)
        };

        Utc.from_utc_datetime(&next_local_open) - offset
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use crate::domain::lead::{LeadConversation, LeadId, LeadType};

    use super::{ComplianceDecision, ComplianceGate, DenialReason, SendWindow};

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn lead_with_offset(tz_offset_mins: i32) -> LeadConversation {
        LeadConversation::new(
            LeadId("L-1".to_string()),
            LeadType::Buyer,
            tz_offset_mins,
            parse_ts("2026-03-01T00:00:00Z"),
        )
    }

    fn gate() -> ComplianceGate {
        ComplianceGate::new(SendWindow::default())
    }

    #[test]
    fn allows_send_inside_local_window() {
        // UTC 17:00, lead at UTC-5 => local 12:00.
        let lead = lead_with_offset(-300);
        assert!(gate().is_allowed(&lead, parse_ts("2026-03-01T17:00:00Z")));
    }

    #[test]
    fn denies_outside_window_with_next_permitted_instant() {
        // UTC 03:00, lead at UTC-5 => local 22:00 the previous day.
        let lead = lead_with_offset(-300);
        let decision = gate().evaluate(&lead, parse_ts("2026-03-01T03:00:00Z"));

        match decision {
            ComplianceDecision::Denied { reason, next_permitted_at } => {
                assert_eq!(reason, DenialReason::OutsideSendWindow);
                // Local window opens 09:00 local = 14:00 UTC.
                assert_eq!(next_permitted_at, Some(parse_ts("2026-03-01T14:00:00Z")));
            }
            other => panic!("expected window denial, got {other:?}"),
        }
    }

    #[test]
    fn early_morning_defers_to_same_local_day() {
        // UTC 11:00, lead at UTC-5 => local 06:00, before the window opens.
        let lead = lead_with_offset(-300);
        let decision = gate().evaluate(&lead, parse_ts("2026-03-01T11:00:00Z"));

        match decision {
            ComplianceDecision::Denied { next_permitted_at, .. } => {
                assert_eq!(next_permitted_at, Some(parse_ts("2026-03-01T14:00:00Z")));
            }
            other => panic!("expected window denial, got {other:?}"),
        }
    }

    #[test]
    fn opt_out_short_circuits_before_window_check() {
        let mut lead = lead_with_offset(-300);
        lead.opted_out = true;

        // Outside the window too, but opt-out must win the ordering.
        let decision = gate().evaluate(&lead, parse_ts("2026-03-01T03:00:00Z"));
        assert_eq!(
            decision,
            ComplianceDecision::Denied { reason: DenialReason::OptedOut, next_permitted_at: None }
        );
    }

    #[test]
    fn legal_hold_denies_inside_window() {
        let mut lead = lead_with_offset(0);
        lead.legal_hold = true;

        let decision = gate().evaluate(&lead, parse_ts("2026-03-01T12:00:00Z"));
        assert_eq!(
            decision,
            ComplianceDecision::Denied { reason: DenialReason::LegalHold, next_permitted_at: None }
        );
    }

    #[test]
    fn window_end_hour_is_exclusive() {
        let lead = lead_with_offset(0);
        assert!(gate().is_allowed(&lead, parse_ts("2026-03-01T19:59:00Z")));
        assert!(!gate().is_allowed(&lead, parse_ts("2026-03-01T20:00:00Z")));
    }

    #[test]
    fn permanence_classification() {
        assert!(DenialReason::OptedOut.is_permanent());
        assert!(DenialReason::LegalHold.is_permanent());
        assert!(!DenialReason::OutsideSendWindow.is_permanent());
    }
}
