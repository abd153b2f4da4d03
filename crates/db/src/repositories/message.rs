use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadflow_core::domain::lead::LeadId;
use leadflow_core::domain::message::{
    Channel, DeliveryStatus, IdempotencyKey, MessageId, MessageTransition, ScheduledMessage,
    TransitionId,
};

use super::{parse_optional_timestamp, parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

use super::MessageRepository;

const MESSAGE_COLUMNS: &str = "id,
                lead_id,
                channel,
                body,
                idempotency_key,
                status,
                earliest_send_at,
                lease_expires_at,
                claimed_by,
                retry_count,
                last_error,
                version,
                created_at,
                updated_at";

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn find(&self, id: &MessageId) -> Result<Option<ScheduledMessage>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM scheduled_message WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(message_from_row).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ScheduledMessage>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM scheduled_message WHERE idempotency_key = ?"
        ))
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(message_from_row).transpose()
    }

    async fn insert_if_absent(
        &self,
        message: ScheduledMessage,
    ) -> Result<MessageId, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO scheduled_message (
                id,
                lead_id,
                channel,
                body,
                idempotency_key,
                status,
                earliest_send_at,
                lease_expires_at,
                claimed_by,
                retry_count,
                last_error,
                version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(&message.id.0)
        .bind(&message.lead_id.0)
        .bind(message.channel.as_str())
        .bind(&message.body)
        .bind(&message.idempotency_key.0)
        .bind(message.status.as_str())
        .bind(message.earliest_send_at.to_rfc3339())
        .bind(message.lease_expires_at.map(|value| value.to_rfc3339()))
        .bind(message.claimed_by.as_deref())
        .bind(i64::from(message.retry_count))
        .bind(message.last_error.as_deref())
        .bind(i64::from(message.version))
        .bind(message.created_at.to_rfc3339())
        .bind(message.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(message.id);
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM scheduled_message WHERE idempotency_key = ?")
                .bind(&message.idempotency_key.0)
                .fetch_optional(&self.pool)
                .await?;

        existing.map(MessageId).ok_or_else(|| {
            RepositoryError::Decode(format!(
                "idempotency key `{}` conflicted but owner row was not found",
                message.idempotency_key.0
            ))
        })
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM scheduled_message
             WHERE status = 'pending'
               AND earliest_send_at <= ?
               AND NOT EXISTS (
                   SELECT 1 FROM scheduled_message other
                   WHERE other.lead_id = scheduled_message.lead_id
                     AND other.status = 'sending'
               )
             ORDER BY earliest_send_at ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(now.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM scheduled_message
             WHERE status = 'sending'
               AND lease_expires_at IS NOT NULL
               AND lease_expires_at <= ?
             ORDER BY lease_expires_at ASC"
        ))
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn list_open_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM scheduled_message
             WHERE lead_id = ? AND status IN ('pending', 'sending')
             ORDER BY created_at ASC"
        ))
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn update(
        &self,
        message: ScheduledMessage,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE scheduled_message SET
                status = ?,
                earliest_send_at = ?,
                lease_expires_at = ?,
                claimed_by = ?,
                retry_count = ?,
                last_error = ?,
                version = ?,
                updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(message.status.as_str())
        .bind(message.earliest_send_at.to_rfc3339())
        .bind(message.lease_expires_at.map(|value| value.to_rfc3339()))
        .bind(message.claimed_by.as_deref())
        .bind(i64::from(message.retry_count))
        .bind(message.last_error.as_deref())
        .bind(i64::from(message.version))
        .bind(message.updated_at.to_rfc3339())
        .bind(&message.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_sending(
        &self,
        message: ScheduledMessage,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        // Single conditional statement: version check plus the per-lead
        // mutual-exclusion guard. Concurrent workers racing on the same
        // lead can only have one winner.
        let result = sqlx::query(
            "UPDATE scheduled_message SET
                status = 'sending',
                lease_expires_at = ?,
                claimed_by = ?,
                retry_count = ?,
                last_error = ?,
                version = ?,
                updated_at = ?
             WHERE id = ? AND version = ? AND status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM scheduled_message other
                   WHERE other.lead_id = scheduled_message.lead_id
                     AND other.status = 'sending'
                     AND other.id <> scheduled_message.id
               )",
        )
        .bind(message.lease_expires_at.map(|value| value.to_rfc3339()))
        .bind(message.claimed_by.as_deref())
        .bind(i64::from(message.retry_count))
        .bind(message.last_error.as_deref())
        .bind(i64::from(message.version))
        .bind(message.updated_at.to_rfc3339())
        .bind(&message.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_open_for_lead(
        &self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE scheduled_message SET
                status = 'cancelled',
                lease_expires_at = NULL,
                claimed_by = NULL,
                version = version + 1,
                updated_at = ?
             WHERE lead_id = ? AND status IN ('pending', 'sending')",
        )
        .bind(now.to_rfc3339())
        .bind(&lead_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn has_any_for_lead(&self, lead_id: &LeadId) -> Result<bool, RepositoryError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_message WHERE lead_id = ?")
                .bind(&lead_id.0)
                .fetch_one(&self.pool)
                .await?;

        Ok(count > 0)
    }

    async fn append_transition(
        &self,
        transition: MessageTransition,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO message_transition (
                id,
                message_id,
                lead_id,
                from_status,
                to_status,
                reason,
                error_class,
                actor,
                version,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition.id.0)
        .bind(&transition.message_id.0)
        .bind(&transition.lead_id.0)
        .bind(transition.from_status.as_ref().map(DeliveryStatus::as_str))
        .bind(transition.to_status.as_str())
        .bind(&transition.reason)
        .bind(transition.error_class.as_deref())
        .bind(&transition.actor)
        .bind(i64::from(transition.version))
        .bind(transition.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_transitions(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<MessageTransition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                message_id,
                lead_id,
                from_status,
                to_status,
                reason,
                error_class,
                actor,
                version,
                occurred_at
             FROM message_transition
             WHERE message_id = ?
             ORDER BY version ASC, occurred_at ASC",
        )
        .bind(&message_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }
}

fn message_from_row(row: SqliteRow) -> Result<ScheduledMessage, RepositoryError> {
    let channel_raw = row.try_get::<String, _>("channel")?;
    let channel = Channel::parse(&channel_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown channel `{channel_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = DeliveryStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status_raw}`")))?;

    Ok(ScheduledMessage {
        id: MessageId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        channel,
        body: row.try_get("body")?,
        idempotency_key: IdempotencyKey(row.try_get("idempotency_key")?),
        status,
        earliest_send_at: parse_timestamp("earliest_send_at", row.try_get("earliest_send_at")?)?,
        lease_expires_at: parse_optional_timestamp(
            "lease_expires_at",
            row.try_get("lease_expires_at")?,
        )?,
        claimed_by: row.try_get("claimed_by")?,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        last_error: row.try_get("last_error")?,
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn transition_from_row(row: SqliteRow) -> Result<MessageTransition, RepositoryError> {
    let from_status = row
        .try_get::<Option<String>, _>("from_status")?
        .map(|value| {
            DeliveryStatus::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown from_status `{value}`")))
        })
        .transpose()?;

    let to_status_raw = row.try_get::<String, _>("to_status")?;
    let to_status = DeliveryStatus::parse(&to_status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown to_status `{to_status_raw}`")))?;

    Ok(MessageTransition {
        id: TransitionId(row.try_get("id")?),
        message_id: MessageId(row.try_get("message_id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        from_status,
        to_status,
        reason: row.try_get("reason")?,
        error_class: row.try_get("error_class")?,
        actor: row.try_get("actor")?,
        version: parse_u32("version", row.try_get("version")?)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
