use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadflow_core::domain::lead::{
    LeadConversation, LeadId, LeadState, LeadType, QualificationFacts,
};

use super::{parse_optional_timestamp, parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

use super::ConversationRepository;

const CONVERSATION_COLUMNS: &str = "lead_id,
                lead_type,
                state,
                score,
                facts_json,
                last_inbound_at,
                last_outbound_at,
                inbound_count,
                unanswered_sends,
                escalated,
                paused,
                opted_out,
                legal_hold,
                tz_offset_mins,
                followup_at,
                stale_alerted_at,
                version,
                created_at,
                updated_at";

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn find(&self, id: &LeadId) -> Result<Option<LeadConversation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM lead_conversation WHERE lead_id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn insert(&self, conversation: LeadConversation) -> Result<bool, RepositoryError> {
        let facts_json = encode_facts(&conversation.facts)?;
        let result = sqlx::query(
            "INSERT INTO lead_conversation (
                lead_id,
                lead_type,
                state,
                score,
                facts_json,
                last_inbound_at,
                last_outbound_at,
                inbound_count,
                unanswered_sends,
                escalated,
                paused,
                opted_out,
                legal_hold,
                tz_offset_mins,
                followup_at,
                stale_alerted_at,
                version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(lead_id) DO NOTHING",
        )
        .bind(&conversation.lead_id.0)
        .bind(conversation.lead_type.as_str())
        .bind(conversation.state.as_str())
        .bind(i64::from(conversation.score))
        .bind(facts_json)
        .bind(conversation.last_inbound_at.map(|value| value.to_rfc3339()))
        .bind(conversation.last_outbound_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(conversation.inbound_count))
        .bind(i64::from(conversation.unanswered_sends))
        .bind(i64::from(conversation.escalated))
        .bind(i64::from(conversation.paused))
        .bind(i64::from(conversation.opted_out))
        .bind(i64::from(conversation.legal_hold))
        .bind(i64::from(conversation.tz_offset_mins))
        .bind(conversation.followup_at.map(|value| value.to_rfc3339()))
        .bind(conversation.stale_alerted_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(conversation.version))
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update(
        &self,
        conversation: LeadConversation,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let facts_json = encode_facts(&conversation.facts)?;
        let result = sqlx::query(
            "UPDATE lead_conversation SET
                lead_type = ?,
                state = ?,
                score = ?,
                facts_json = ?,
                last_inbound_at = ?,
                last_outbound_at = ?,
                inbound_count = ?,
                unanswered_sends = ?,
                escalated = ?,
                paused = ?,
                opted_out = ?,
                legal_hold = ?,
                tz_offset_mins = ?,
                followup_at = ?,
                stale_alerted_at = ?,
                version = ?,
                updated_at = ?
             WHERE lead_id = ? AND version = ?",
        )
        .bind(conversation.lead_type.as_str())
        .bind(conversation.state.as_str())
        .bind(i64::from(conversation.score))
        .bind(facts_json)
        .bind(conversation.last_inbound_at.map(|value| value.to_rfc3339()))
        .bind(conversation.last_outbound_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(conversation.inbound_count))
        .bind(i64::from(conversation.unanswered_sends))
        .bind(i64::from(conversation.escalated))
        .bind(i64::from(conversation.paused))
        .bind(i64::from(conversation.opted_out))
        .bind(i64::from(conversation.legal_hold))
        .bind(i64::from(conversation.tz_offset_mins))
        .bind(conversation.followup_at.map(|value| value.to_rfc3339()))
        .bind(conversation.stale_alerted_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(conversation.version))
        .bind(conversation.updated_at.to_rfc3339())
        .bind(&conversation.lead_id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_nurture_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM lead_conversation
             WHERE state = 'nurture' AND followup_at IS NOT NULL AND followup_at <= ?
             ORDER BY followup_at ASC"
        ))
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(conversation_from_row).collect()
    }

    async fn list_initial_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM lead_conversation
             WHERE state = 'initial' AND created_at <= ?
             ORDER BY created_at ASC"
        ))
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(conversation_from_row).collect()
    }

    async fn list_stale_handoffs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM lead_conversation
             WHERE state = 'handed_off' AND stale_alerted_at IS NULL AND updated_at <= ?
             ORDER BY updated_at ASC"
        ))
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(conversation_from_row).collect()
    }

    async fn list_awaiting_reply(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadConversation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM lead_conversation
             WHERE state IN ('qualifying', 'scheduling')
               AND last_outbound_at IS NOT NULL
               AND last_outbound_at <= ?
               AND (last_inbound_at IS NULL OR last_inbound_at < last_outbound_at)
             ORDER BY last_outbound_at ASC"
        ))
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(conversation_from_row).collect()
    }
}

fn encode_facts(facts: &QualificationFacts) -> Result<String, RepositoryError> {
    serde_json::to_string(facts)
        .map_err(|error| RepositoryError::Decode(format!("could not encode facts: {error}")))
}

fn conversation_from_row(row: SqliteRow) -> Result<LeadConversation, RepositoryError> {
    let lead_type_raw = row.try_get::<String, _>("lead_type")?;
    let lead_type = LeadType::parse(&lead_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown lead type `{lead_type_raw}`")))?;

    let state_raw = row.try_get::<String, _>("state")?;
    let state = LeadState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown lead state `{state_raw}`")))?;

    let score_raw = row.try_get::<i64, _>("score")?;
    let score = u8::try_from(score_raw)
        .map_err(|_| RepositoryError::Decode(format!("score out of range: {score_raw}")))?;

    let facts_raw = row.try_get::<String, _>("facts_json")?;
    let facts = serde_json::from_str(&facts_raw)
        .map_err(|error| RepositoryError::Decode(format!("could not decode facts: {error}")))?;

    let tz_raw = row.try_get::<i64, _>("tz_offset_mins")?;
    let tz_offset_mins = i32::try_from(tz_raw)
        .map_err(|_| RepositoryError::Decode(format!("tz offset out of range: {tz_raw}")))?;

    Ok(LeadConversation {
        lead_id: LeadId(row.try_get("lead_id")?),
        lead_type,
        state,
        score,
        facts,
        last_inbound_at: parse_optional_timestamp("last_inbound_at", row.try_get("last_inbound_at")?)?,
        last_outbound_at: parse_optional_timestamp(
            "last_outbound_at",
            row.try_get("last_outbound_at")?,
        )?,
        inbound_count: parse_u32("inbound_count", row.try_get("inbound_count")?)?,
        unanswered_sends: parse_u32("unanswered_sends", row.try_get("unanswered_sends")?)?,
        escalated: row.try_get::<i64, _>("escalated")? != 0,
        paused: row.try_get::<i64, _>("paused")? != 0,
        opted_out: row.try_get::<i64, _>("opted_out")? != 0,
        legal_hold: row.try_get::<i64, _>("legal_hold")? != 0,
        tz_offset_mins,
        followup_at: parse_optional_timestamp("followup_at", row.try_get("followup_at")?)?,
        stale_alerted_at: parse_optional_timestamp(
            "stale_alerted_at",
            row.try_get("stale_alerted_at")?,
        )?,
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
