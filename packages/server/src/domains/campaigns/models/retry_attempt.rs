use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::{CallLogId, CampaignId, ContactId, RetryAttemptId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Scheduled,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl std::fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStatus::Scheduled => write!(f, "scheduled"),
            RetryStatus::Processing => write!(f, "processing"),
            RetryStatus::Completed => write!(f, "completed"),
            RetryStatus::Cancelled => write!(f, "cancelled"),
            RetryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RetryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(RetryStatus::Scheduled),
            "processing" => Ok(RetryStatus::Processing),
            "completed" => Ok(RetryStatus::Completed),
            "cancelled" => Ok(RetryStatus::Cancelled),
            "failed" => Ok(RetryStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid retry status: {}", s)),
        }
    }
}

/// A scheduled future re-dial, linked back to the call that caused it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetryAttempt {
    pub id: RetryAttemptId,
    pub call_log_id: CallLogId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub scheduled_for: DateTime<Utc>,
    pub reason: String,
    pub attempt_number: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryAttempt {
    pub fn status(&self) -> RetryStatus {
        self.status.parse().unwrap_or(RetryStatus::Scheduled)
    }

    pub async fn create(
        call_log_id: CallLogId,
        campaign_id: CampaignId,
        contact_id: ContactId,
        scheduled_for: DateTime<Utc>,
        reason: &str,
        attempt_number: i32,
        pool: &PgPool,
    ) -> Result<Self> {
        let attempt = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO retry_attempts (
                call_log_id, campaign_id, contact_id, scheduled_for,
                reason, attempt_number
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(call_log_id)
        .bind(campaign_id)
        .bind(contact_id)
        .bind(scheduled_for)
        .bind(reason)
        .bind(attempt_number)
        .fetch_one(pool)
        .await?;
        Ok(attempt)
    }

    pub async fn find_by_id(id: RetryAttemptId, pool: &PgPool) -> Result<Option<Self>> {
        let attempt = sqlx::query_as::<_, Self>("SELECT * FROM retry_attempts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(attempt)
    }

    /// Claim the attempt for execution; returns `None` when it already
    /// finished or was cancelled. Re-claiming a `processing` attempt is
    /// allowed so a redelivered job can resume after a worker crash.
    pub async fn begin_processing(id: RetryAttemptId, pool: &PgPool) -> Result<Option<Self>> {
        let attempt = sqlx::query_as::<_, Self>(
            r#"
            UPDATE retry_attempts
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'processing')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(attempt)
    }

    pub async fn mark(id: RetryAttemptId, status: RetryStatus, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE retry_attempts SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Cancel every scheduled retry for a campaign. Returns how many were
    /// cancelled.
    pub async fn cancel_for_campaign(campaign_id: CampaignId, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE retry_attempts
            SET status = 'cancelled', updated_at = NOW()
            WHERE campaign_id = $1 AND status IN ('scheduled', 'processing')
            "#,
        )
        .bind(campaign_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            RetryStatus::Scheduled,
            RetryStatus::Processing,
            RetryStatus::Completed,
            RetryStatus::Cancelled,
            RetryStatus::Failed,
        ] {
            let parsed: RetryStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("pending".parse::<RetryStatus>().is_err());
    }
}
