use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use leadflow_core::domain::lead::{LeadConversation, LeadId};
use leadflow_core::domain::message::{
    IdempotencyKey, MessageId, MessageTransition, ScheduledMessage,
};

pub mod conversation;
pub mod dedup;
pub mod memory;
pub mod message;

pub use conversation::SqlConversationRepository;
pub use dedup::SqlEventDedupRepository;
pub use memory::{
    InMemoryConversationRepository, InMemoryEventDedupRepository, InMemoryMessageRepository,
};
pub use message::SqlMessageRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Store for per-lead conversation rows. Every mutation after the initial
/// insert is a conditional update keyed on the row version; a `false`
/// return means another worker won the race and the caller must re-read
/// and retry its whole step.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find(&self, id: &LeadId) -> Result<Option<LeadConversation>, RepositoryError>;

    /// Insert a new conversation; returns `false` if the lead already
    /// exists (duplicate create events are expected).
    async fn insert(&self, conversation: LeadConversation) -> Result<bool, RepositoryError>;

    /// Conditional update: applies only when the stored version still
    /// equals `expected_version`.
    async fn update(
        &self,
        conversation: LeadConversation,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    /// Nurtured conversations whose follow-up instant has passed.
    async fn list_nurture_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError>;

    /// Conversations still in `initial` created before the cutoff.
    async fn list_initial_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError>;

    /// Handed-off conversations with no human follow-up since the cutoff
    /// and no stale alert recorded yet.
    async fn list_stale_handoffs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError>;

    /// Actively qualifying conversations whose last outbound predates the
    /// cutoff with no inbound reply since. Candidates for
    /// `no_response_timeout`; the scanner additionally requires that no
    /// open message exists for the lead.
    async fn list_awaiting_reply(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError>;
}

/// Store for scheduled messages and their transition audit. The
/// `pending -> sending` claim is the one write that needs more than a
/// version check: it also asserts no sibling send is in flight for the
/// same lead, in a single conditional statement only one worker can win.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find(&self, id: &MessageId) -> Result<Option<ScheduledMessage>, RepositoryError>;

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ScheduledMessage>, RepositoryError>;

    /// Insert unless the idempotency key is already present; returns the id
    /// of the row that owns the key either way.
    async fn insert_if_absent(
        &self,
        message: ScheduledMessage,
    ) -> Result<MessageId, RepositoryError>;

    /// Due `pending` messages, oldest first, excluding leads that already
    /// hold a `sending` row.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError>;

    /// `sending` messages whose lease has lapsed.
    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError>;

    /// Open (`pending` or `sending`) messages for one lead.
    async fn list_open_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError>;

    /// Version-checked save for non-claim transitions.
    async fn update(
        &self,
        message: ScheduledMessage,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    /// Version-checked claim into `sending` that additionally fails when
    /// any other message for the lead is already `sending`.
    async fn claim_sending(
        &self,
        message: ScheduledMessage,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    /// Atomically flip every open message for the lead to `cancelled`.
    /// Returns the number of rows cancelled.
    async fn cancel_open_for_lead(
        &self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError>;

    /// Whether any scheduled message exists for the lead, in any status.
    async fn has_any_for_lead(&self, lead_id: &LeadId) -> Result<bool, RepositoryError>;

    async fn append_transition(
        &self,
        transition: MessageTransition,
    ) -> Result<(), RepositoryError>;

    async fn list_transitions(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<MessageTransition>, RepositoryError>;
}

/// Replay guard for inbound events keyed by the upstream external id.
#[async_trait]
pub trait EventDedupRepository: Send + Sync {
    /// Record the pair; returns `false` when it was already recorded,
    /// which means the event is a replay and must be dropped.
    async fn record(
        &self,
        lead_id: &LeadId,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
