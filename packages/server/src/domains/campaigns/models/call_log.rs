use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{CallLogId, CampaignId, ContactId, PageParams};

/// Per-attempt call state.
///
/// Transitions are monotonic: each status has a rank and a row only ever
/// moves to a strictly higher rank. Out-of-order vendor webhooks therefore
/// cannot rewind a call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CallLogStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
    Busy,
    Cancelled,
}

impl CallLogStatus {
    pub fn rank(&self) -> u8 {
        match self {
            CallLogStatus::Queued => 0,
            CallLogStatus::Initiated => 1,
            CallLogStatus::Ringing => 2,
            CallLogStatus::InProgress => 3,
            CallLogStatus::Completed
            | CallLogStatus::Failed
            | CallLogStatus::NoAnswer
            | CallLogStatus::Busy
            | CallLogStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Statuses a row may currently hold for a transition into `self`.
    pub fn allowed_sources(&self) -> Vec<CallLogStatus> {
        use CallLogStatus::*;
        [Queued, Initiated, Ringing, InProgress]
            .into_iter()
            .filter(|s| s.rank() < self.rank())
            .collect()
    }
}

impl std::fmt::Display for CallLogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallLogStatus::Queued => write!(f, "queued"),
            CallLogStatus::Initiated => write!(f, "initiated"),
            CallLogStatus::Ringing => write!(f, "ringing"),
            CallLogStatus::InProgress => write!(f, "in-progress"),
            CallLogStatus::Completed => write!(f, "completed"),
            CallLogStatus::Failed => write!(f, "failed"),
            CallLogStatus::NoAnswer => write!(f, "no-answer"),
            CallLogStatus::Busy => write!(f, "busy"),
            CallLogStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CallLogStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(CallLogStatus::Queued),
            "initiated" => Ok(CallLogStatus::Initiated),
            "ringing" => Ok(CallLogStatus::Ringing),
            "in-progress" => Ok(CallLogStatus::InProgress),
            "completed" => Ok(CallLogStatus::Completed),
            "failed" => Ok(CallLogStatus::Failed),
            "no-answer" => Ok(CallLogStatus::NoAnswer),
            "busy" => Ok(CallLogStatus::Busy),
            "cancelled" => Ok(CallLogStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid call log status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallLog {
    pub id: CallLogId,
    pub direction: String,
    pub from_number: String,
    pub to_number: String,
    pub user_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub vendor_call_sid: Option<String>,
    pub status: String,
    pub predial_token: Option<String>,
    pub active_token: Option<String>,
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i32>,
    pub transcript: Option<String>,
    pub recording_url: Option<String>,
    pub voicemail_detected: bool,
    pub retry_of: Option<CallLogId>,
    pub price: Option<f64>,
    pub price_unit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallLog {
    pub fn status(&self) -> CallLogStatus {
        self.status.parse().unwrap_or(CallLogStatus::Queued)
    }

    /// Insert a `queued` row for a fresh dial attempt. The row id doubles as
    /// the call id used for lease keys.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_queued(
        campaign_id: CampaignId,
        contact_id: ContactId,
        user_id: Uuid,
        agent_id: Option<Uuid>,
        from_number: &str,
        to_number: &str,
        retry_of: Option<CallLogId>,
        pool: &PgPool,
    ) -> Result<Self> {
        let log = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO call_logs (
                direction, from_number, to_number, user_id, agent_id,
                campaign_id, contact_id, status, retry_of
            )
            VALUES ('outbound', $1, $2, $3, $4, $5, $6, 'queued', $7)
            RETURNING *
            "#,
        )
        .bind(from_number)
        .bind(to_number)
        .bind(user_id)
        .bind(agent_id)
        .bind(campaign_id)
        .bind(contact_id)
        .bind(retry_of)
        .fetch_one(pool)
        .await?;
        Ok(log)
    }

    pub async fn find_by_id(id: CallLogId, pool: &PgPool) -> Result<Option<Self>> {
        let log = sqlx::query_as::<_, Self>("SELECT * FROM call_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(log)
    }

    pub async fn find_by_vendor_sid(sid: &str, pool: &PgPool) -> Result<Option<Self>> {
        let log = sqlx::query_as::<_, Self>("SELECT * FROM call_logs WHERE vendor_call_sid = $1")
            .bind(sid)
            .fetch_optional(pool)
            .await?;
        Ok(log)
    }

    pub async fn list_for_campaign(
        campaign_id: CampaignId,
        page: &PageParams,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let logs = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM call_logs
            WHERE campaign_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(campaign_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;
        Ok(logs)
    }

    /// Latest non-terminal call for a contact, if any. Used by reconcilers
    /// to pair ledger entries with pre-dial leases.
    pub async fn latest_open_for_contact(
        contact_id: ContactId,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let log = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM call_logs
            WHERE contact_id = $1
              AND status IN ('queued', 'initiated', 'ringing', 'in-progress')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(contact_id)
        .fetch_optional(pool)
        .await?;
        Ok(log)
    }

    /// Most recent call for a contact, regardless of status.
    pub async fn latest_for_contact(
        contact_id: ContactId,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let log = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM call_logs
            WHERE contact_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(contact_id)
        .fetch_optional(pool)
        .await?;
        Ok(log)
    }

    /// Calls that currently hold (or are about to hold) a slot lease.
    pub async fn find_open_for_campaign(
        campaign_id: CampaignId,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let logs = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM call_logs
            WHERE campaign_id = $1
              AND status IN ('queued', 'initiated', 'ringing', 'in-progress')
            "#,
        )
        .bind(campaign_id)
        .fetch_all(pool)
        .await?;
        Ok(logs)
    }

    pub async fn set_predial_token(id: CallLogId, token: &str, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE call_logs SET predial_token = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(token)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_vendor_sid(id: CallLogId, sid: &str, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE call_logs SET vendor_call_sid = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(sid)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_active_token(id: CallLogId, token: &str, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE call_logs SET active_token = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(token)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Monotonic status transition. Returns the updated row, or `None` when
    /// the current status does not rank strictly below the target (stale or
    /// duplicate webhook).
    pub async fn transition(
        id: CallLogId,
        to: CallLogStatus,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let sources: Vec<String> = to
            .allowed_sources()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let set_started = to == CallLogStatus::InProgress;
        let log = sqlx::query_as::<_, Self>(
            r#"
            UPDATE call_logs
            SET status = $2,
                started_at = CASE WHEN $3 AND started_at IS NULL THEN NOW() ELSE started_at END,
                ended_at = CASE WHEN $4 THEN NOW() ELSE ended_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.to_string())
        .bind(set_started)
        .bind(to.is_terminal())
        .bind(&sources)
        .fetch_optional(pool)
        .await?;
        Ok(log)
    }

    /// Record terminal call facts reported by the vendor.
    pub async fn record_outcome(
        id: CallLogId,
        duration_secs: Option<i64>,
        recording_url: Option<&str>,
        voicemail_detected: bool,
        price: Option<f64>,
        price_unit: Option<&str>,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_logs
            SET duration_secs = COALESCE($2, duration_secs),
                recording_url = COALESCE($3, recording_url),
                voicemail_detected = voicemail_detected OR $4,
                price = COALESCE($5, price),
                price_unit = COALESCE($6, price_unit),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(duration_secs.map(|d| d as i32))
        .bind(recording_url)
        .bind(voicemail_detected)
        .bind(price)
        .bind(price_unit)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(id: CallLogId, reason: &str, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_logs
            SET status = 'failed',
                failure_reason = $2,
                ended_at = COALESCE(ended_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'initiated', 'ringing', 'in-progress')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_cancelled(id: CallLogId, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_logs
            SET status = 'cancelled',
                ended_at = COALESCE(ended_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'initiated', 'ringing', 'in-progress')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranks_are_monotonic_along_the_happy_path() {
        let path = [
            CallLogStatus::Queued,
            CallLogStatus::Initiated,
            CallLogStatus::Ringing,
            CallLogStatus::InProgress,
            CallLogStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn test_terminal_statuses_share_top_rank() {
        for status in [
            CallLogStatus::Completed,
            CallLogStatus::Failed,
            CallLogStatus::NoAnswer,
            CallLogStatus::Busy,
            CallLogStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert_eq!(status.rank(), 4);
        }
    }

    #[test]
    fn test_allowed_sources_exclude_equal_and_higher_ranks() {
        let sources = CallLogStatus::Ringing.allowed_sources();
        assert!(sources.contains(&CallLogStatus::Queued));
        assert!(sources.contains(&CallLogStatus::Initiated));
        assert!(!sources.contains(&CallLogStatus::Ringing));
        assert!(!sources.contains(&CallLogStatus::InProgress));

        // A terminal target accepts any live status.
        let sources = CallLogStatus::Completed.allowed_sources();
        assert_eq!(sources.len(), 4);
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            CallLogStatus::Queued,
            CallLogStatus::Initiated,
            CallLogStatus::Ringing,
            CallLogStatus::InProgress,
            CallLogStatus::Completed,
            CallLogStatus::Failed,
            CallLogStatus::NoAnswer,
            CallLogStatus::Busy,
            CallLogStatus::Cancelled,
        ] {
            let parsed: CallLogStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
