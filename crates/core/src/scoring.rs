//! Lead scoring rubric.
//!
//! Pure and deterministic: identical inputs always produce the identical
//! score and reason list. Each rubric category contributes at most its cap
//! and the caps sum to 100, so no input combination can exceed the range.
//! Unknown facts contribute a category-specific neutral default — never
//! zero, never the cap — so absence of information is neither punished as
//! a dead lead nor rewarded as a hot one.

use crate::domain::lead::{
    LeadType, Motivation, PriceExpectation, QualificationFacts, Timeline,
};

/// Conversation-level signals that feed the engagement category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngagementSignals {
    pub inbound_messages: u32,
    pub unanswered_sends: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub score: u8,
    pub reasons: Vec<String>,
}

mod caps {
    pub const TIMELINE: u8 = 30;
    pub const FINANCING: u8 = 25;
    pub const BUDGET: u8 = 20;
    pub const BUYER_MOTIVATION: u8 = 15;
    pub const PRICE_REALISM: u8 = 25;
    pub const SELLER_MOTIVATION: u8 = 20;
    pub const READINESS: u8 = 15;
    pub const ENGAGEMENT: u8 = 10;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LeadScorer;

impl LeadScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score a lead out of 100. Combined leads take the better of the two
    /// sub-rubrics, reasons included.
    pub fn score(
        &self,
        lead_type: LeadType,
        facts: &QualificationFacts,
        signals: &EngagementSignals,
    ) -> ScoreBreakdown {
        match lead_type {
            LeadType::Buyer => score_buyer(facts, signals),
            LeadType::Seller => score_seller(facts, signals),
            LeadType::Both => {
                let buyer = score_buyer(facts, signals);
                let seller = score_seller(facts, signals);
                if seller.score > buyer.score {
                    seller
                } else {
                    buyer
                }
            }
        }
    }
}

fn score_buyer(facts: &QualificationFacts, signals: &EngagementSignals) -> ScoreBreakdown {
    let mut score = 0u8;
    let mut reasons = Vec::new();

    let (points, reason) = timeline_points(facts.timeline);
    score += points.min(caps::TIMELINE);
    reasons.push(reason);

    let (points, reason) = match facts.pre_approved {
        Some(true) => (caps::FINANCING, "pre-approved for financing"),
        Some(false) => (6, "financing not yet arranged"),
        None => (9, "financing status unknown"),
    };
    score += points.min(caps::FINANCING);
    reasons.push(reason.to_string());

    let (points, reason) = match facts.budget {
        Some(budget) if budget.is_sign_positive() && !budget.is_zero() => {
            (caps::BUDGET, "budget provided")
        }
        Some(_) => (5, "budget unclear"),
        None => (7, "budget not discussed"),
    };
    score += points.min(caps::BUDGET);
    reasons.push(reason.to_string());

    let (points, reason) = match facts.motivation {
        Some(Motivation::Relocation) => (caps::BUYER_MOTIVATION, "motivated by relocation"),
        Some(Motivation::GrowingFamily) => (13, "motivated by a growing family"),
        Some(Motivation::Investment) => (11, "buying as an investment"),
        Some(Motivation::Downsizing) => (10, "motivated by downsizing"),
        Some(Motivation::Curious) => (3, "browsing out of curiosity"),
        None => (6, "motivation unknown"),
    };
    score += points.min(caps::BUYER_MOTIVATION);
    reasons.push(reason.to_string());

    let (points, reason) = engagement_points(signals);
    score += points.min(caps::ENGAGEMENT);
    reasons.push(reason);

    ScoreBreakdown { score: score.min(100), reasons }
}

fn score_seller(facts: &QualificationFacts, signals: &EngagementSignals) -> ScoreBreakdown {
    let mut score = 0u8;
    let mut reasons = Vec::new();

    let (points, reason) = timeline_points(facts.timeline);
    score += points.min(caps::TIMELINE);
    reasons.push(reason);

    let (points, reason) = match facts.price_expectation {
        Some(PriceExpectation::Realistic) => (caps::PRICE_REALISM, "realistic on price"),
        Some(PriceExpectation::Optimistic) => (12, "optimistic on price"),
        Some(PriceExpectation::Unrealistic) => (4, "price expectation far above market"),
        None => (8, "price expectation unknown"),
    };
    score += points.min(caps::PRICE_REALISM);
    reasons.push(reason.to_string());

    let (points, reason) = match facts.motivation {
        Some(Motivation::Relocation) => (caps::SELLER_MOTIVATION, "motivated by relocation"),
        Some(Motivation::Downsizing) => (18, "motivated by downsizing"),
        Some(Motivation::GrowingFamily) => (14, "needs more space"),
        Some(Motivation::Investment) => (12, "selling an investment property"),
        Some(Motivation::Curious) => (4, "testing the market"),
        None => (8, "motivation unknown"),
    };
    score += points.min(caps::SELLER_MOTIVATION);
    reasons.push(reason.to_string());

    let (points, reason) = match facts.has_agent {
        Some(false) => (caps::READINESS, "not yet represented by an agent"),
        Some(true) => (3, "already working with an agent"),
        None => (6, "representation unknown"),
    };
    score += points.min(caps::READINESS);
    reasons.push(reason.to_string());

    let (points, reason) = engagement_points(signals);
    score += points.min(caps::ENGAGEMENT);
    reasons.push(reason);

    ScoreBreakdown { score: score.min(100), reasons }
}

fn timeline_points(timeline: Option<Timeline>) -> (u8, String) {
    let (points, reason) = match timeline {
        Some(Timeline::Within30Days) => (caps::TIMELINE, "ready within 30 days"),
        Some(Timeline::Within90Days) => (22, "ready within 90 days"),
        Some(Timeline::ThisYear) => (14, "planning to move this year"),
        Some(Timeline::Exploring) => (5, "still exploring"),
        None => (10, "timeline unknown"),
    };
    (points, reason.to_string())
}

fn engagement_points(signals: &EngagementSignals) -> (u8, String) {
    // Neutral baseline of 4, nudged up for replies and down for ignored
    // touches, clamped so the category never hits zero or its cap from
    // signals alone.
    let replies = signals.inbound_messages.min(3) as i32;
    let ignored = signals.unanswered_sends.min(3) as i32;
    let points = (4 + 2 * replies - ignored).clamp(1, caps::ENGAGEMENT as i32) as u8;

    let reason = if signals.inbound_messages > 0 && signals.unanswered_sends == 0 {
        "responsive lead"
    } else if signals.unanswered_sends >= 3 {
        "repeated touches unanswered"
    } else {
        "limited engagement history"
    };
    (points, reason.to_string())
}
