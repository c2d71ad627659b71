use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{CampaignId, CoreError, CoreResult, PageParams};

/// Campaign lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }

    /// State machine: draft → active; active ⇄ paused; active → completed
    /// or cancelled; paused → cancelled.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Active => write!(f, "active"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid campaign status: {}", s)),
        }
    }
}

/// How waitlisted work is ordered within a campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    Fifo,
    Lifo,
    Priority,
}

impl std::fmt::Display for PriorityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriorityMode::Fifo => write!(f, "fifo"),
            PriorityMode::Lifo => write!(f, "lifo"),
            PriorityMode::Priority => write!(f, "priority"),
        }
    }
}

impl std::str::FromStr for PriorityMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(PriorityMode::Fifo),
            "lifo" => Ok(PriorityMode::Lifo),
            "priority" => Ok(PriorityMode::Priority),
            _ => Err(anyhow::anyhow!("Invalid priority mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub name: String,
    pub status: String,
    pub concurrent_calls_limit: i32,
    pub priority_mode: String,
    pub exclude_voicemail: bool,
    pub max_retry_attempts: i32,
    pub retry_delay_minutes: i32,
    pub business_hours_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a campaign.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub user_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub name: String,
    pub concurrent_calls_limit: i32,
    pub priority_mode: PriorityMode,
    pub exclude_voicemail: bool,
    pub max_retry_attempts: i32,
    pub retry_delay_minutes: i32,
    pub business_hours_only: bool,
}

/// Contact-status aggregates for the stats/progress endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CampaignStats {
    pub total_contacts: i64,
    pub pending: i64,
    pub queued: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub no_answer: i64,
    pub busy: i64,
    pub voicemail: i64,
    pub skipped: i64,
}

impl CampaignStats {
    pub fn terminal(&self) -> i64 {
        self.completed + self.failed + self.no_answer + self.busy + self.voicemail + self.skipped
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_contacts == 0 {
            return 0.0;
        }
        self.terminal() as f64 * 100.0 / self.total_contacts as f64
    }
}

impl Campaign {
    pub fn status(&self) -> CampaignStatus {
        self.status.parse().unwrap_or(CampaignStatus::Draft)
    }

    pub fn priority_mode(&self) -> PriorityMode {
        self.priority_mode.parse().unwrap_or(PriorityMode::Fifo)
    }

    pub async fn create(input: NewCampaign, pool: &PgPool) -> Result<Self> {
        let campaign = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO campaigns (
                user_id, agent_id, name, status, concurrent_calls_limit,
                priority_mode, exclude_voicemail, max_retry_attempts,
                retry_delay_minutes, business_hours_only
            )
            VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(input.user_id)
        .bind(input.agent_id)
        .bind(&input.name)
        .bind(input.concurrent_calls_limit)
        .bind(input.priority_mode.to_string())
        .bind(input.exclude_voicemail)
        .bind(input.max_retry_attempts)
        .bind(input.retry_delay_minutes)
        .bind(input.business_hours_only)
        .fetch_one(pool)
        .await?;
        Ok(campaign)
    }

    pub async fn find_by_id(id: CampaignId, pool: &PgPool) -> Result<Option<Self>> {
        let campaign = sqlx::query_as::<_, Self>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(campaign)
    }

    /// Fetch a campaign the caller owns: 404 when missing, 403 when owned by
    /// someone else.
    pub async fn find_owned(id: CampaignId, user_id: Uuid, pool: &PgPool) -> CoreResult<Self> {
        let campaign = Self::find_by_id(id, pool)
            .await
            .map_err(CoreError::Internal)?
            .ok_or(CoreError::NotFound("campaign"))?;
        if campaign.user_id != user_id {
            return Err(CoreError::Forbidden);
        }
        Ok(campaign)
    }

    pub async fn list_owned(
        user_id: Uuid,
        status: Option<CampaignStatus>,
        agent_id: Option<Uuid>,
        search: Option<&str>,
        page: &PageParams,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let campaigns = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM campaigns
            WHERE user_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR agent_id = $3)
              AND ($4::text IS NULL OR name ILIKE '%' || $4 || '%')
            ORDER BY created_at DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(user_id)
        .bind(status.map(|s| s.to_string()))
        .bind(agent_id)
        .bind(search)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;
        Ok(campaigns)
    }

    pub async fn find_with_status(status: CampaignStatus, pool: &PgPool) -> Result<Vec<Self>> {
        let campaigns = sqlx::query_as::<_, Self>("SELECT * FROM campaigns WHERE status = $1")
            .bind(status.to_string())
            .fetch_all(pool)
            .await?;
        Ok(campaigns)
    }

    /// Campaigns whose distributed state background services must maintain.
    pub async fn find_running(pool: &PgPool) -> Result<Vec<Self>> {
        let campaigns = sqlx::query_as::<_, Self>(
            "SELECT * FROM campaigns WHERE status IN ('active', 'paused')",
        )
        .fetch_all(pool)
        .await?;
        Ok(campaigns)
    }

    /// Guarded status transition. Returns the updated row, or `None` when
    /// the row was no longer in `from` (another worker won the race).
    pub async fn transition(
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let campaign = sqlx::query_as::<_, Self>(
            r#"
            UPDATE campaigns
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_optional(pool)
        .await?;
        Ok(campaign)
    }

    pub async fn update_settings(
        id: CampaignId,
        name: Option<&str>,
        exclude_voicemail: Option<bool>,
        max_retry_attempts: Option<i32>,
        retry_delay_minutes: Option<i32>,
        priority_mode: Option<PriorityMode>,
        pool: &PgPool,
    ) -> Result<Self> {
        let campaign = sqlx::query_as::<_, Self>(
            r#"
            UPDATE campaigns
            SET name = COALESCE($2, name),
                exclude_voicemail = COALESCE($3, exclude_voicemail),
                max_retry_attempts = COALESCE($4, max_retry_attempts),
                retry_delay_minutes = COALESCE($5, retry_delay_minutes),
                priority_mode = COALESCE($6, priority_mode),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(exclude_voicemail)
        .bind(max_retry_attempts)
        .bind(retry_delay_minutes)
        .bind(priority_mode.map(|m| m.to_string()))
        .fetch_one(pool)
        .await?;
        Ok(campaign)
    }

    pub async fn set_concurrent_limit(id: CampaignId, limit: i32, pool: &PgPool) -> Result<Self> {
        let campaign = sqlx::query_as::<_, Self>(
            r#"
            UPDATE campaigns
            SET concurrent_calls_limit = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(limit)
        .fetch_one(pool)
        .await?;
        Ok(campaign)
    }

    pub async fn delete(id: CampaignId, pool: &PgPool) -> Result<()> {
        sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn stats(id: CampaignId, pool: &PgPool) -> Result<CampaignStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) AS count
            FROM campaign_contacts
            WHERE campaign_id = $1
            GROUP BY status
            "#,
        )
        .bind(id)
        .fetch_all(pool)
        .await?;

        let mut stats = CampaignStats::default();
        for (status, count) in rows {
            stats.total_contacts += count;
            match status.as_str() {
                "pending" => stats.pending = count,
                "queued" => stats.queued = count,
                "in-progress" => stats.in_progress = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "no-answer" => stats.no_answer = count,
                "busy" => stats.busy = count,
                "voicemail" => stats.voicemail = count,
                "skipped" => stats.skipped = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// True while any contact is still pending, queued, or mid-call, or a
    /// retry is still scheduled.
    pub async fn has_unfinished_work(id: CampaignId, pool: &PgPool) -> Result<bool> {
        let (unfinished,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM campaign_contacts
            WHERE campaign_id = $1
              AND status IN ('pending', 'queued', 'in-progress')
            "#,
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        if unfinished > 0 {
            return Ok(true);
        }

        let (scheduled,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM retry_attempts
            WHERE campaign_id = $1 AND status IN ('scheduled', 'processing')
            "#,
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(scheduled > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            CampaignStatus::Draft,
            CampaignStatus::Active,
            CampaignStatus::Paused,
            CampaignStatus::Completed,
            CampaignStatus::Cancelled,
        ] {
            let parsed: CampaignStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_state_machine_allows_documented_edges() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Paused.can_transition_to(Cancelled));
    }

    #[test]
    fn test_state_machine_rejects_everything_else() {
        use CampaignStatus::*;
        assert!(!Draft.can_transition_to(Paused));
        assert!(!Draft.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Draft));
    }

    #[test]
    fn test_terminal_states() {
        assert!(CampaignStatus::Completed.is_terminal());
        assert!(CampaignStatus::Cancelled.is_terminal());
        assert!(!CampaignStatus::Active.is_terminal());
        assert!(!CampaignStatus::Paused.is_terminal());
        assert!(!CampaignStatus::Draft.is_terminal());
    }

    #[test]
    fn test_stats_percentages() {
        let stats = CampaignStats {
            total_contacts: 10,
            completed: 3,
            failed: 1,
            skipped: 1,
            ..Default::default()
        };
        assert_eq!(stats.terminal(), 5);
        assert!((stats.percent_complete() - 50.0).abs() < f64::EPSILON);

        let empty = CampaignStats::default();
        assert_eq!(empty.percent_complete(), 0.0);
    }

    #[test]
    fn test_priority_mode_round_trips() {
        for mode in [PriorityMode::Fifo, PriorityMode::Lifo, PriorityMode::Priority] {
            let parsed: PriorityMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
        assert!("weighted".parse::<PriorityMode>().is_err());
    }
}
