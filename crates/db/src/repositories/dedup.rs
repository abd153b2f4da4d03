use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leadflow_core::domain::lead::LeadId;

use super::{EventDedupRepository, RepositoryError};
use crate::DbPool;

pub struct SqlEventDedupRepository {
    pool: DbPool,
}

impl SqlEventDedupRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventDedupRepository for SqlEventDedupRepository {
    async fn record(
        &self,
        lead_id: &LeadId,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO event_dedup (lead_id, external_id, recorded_at)
             VALUES (?, ?, ?)
             ON CONFLICT(lead_id, external_id) DO NOTHING",
        )
        .bind(&lead_id.0)
        .bind(external_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use leadflow_core::domain::lead::LeadId;

    use super::SqlEventDedupRepository;
    use crate::migrations;
    use crate::repositories::EventDedupRepository;
    use crate::connect_with_settings;

    #[tokio::test]
    async fn replayed_external_id_is_detected() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");

        let repo = SqlEventDedupRepository::new(pool.clone());
        let lead = LeadId("L-1".to_string());
        let now = Utc::now();

        assert!(repo.record(&lead, "msg-1", now).await.expect("first record"));
        assert!(!repo.record(&lead, "msg-1", now).await.expect("replay detected"));

        // Same external id on another lead is a different event.
        let other = LeadId("L-2".to_string());
        assert!(repo.record(&other, "msg-1", now).await.expect("other lead records"));

        pool.close().await;
    }
}
