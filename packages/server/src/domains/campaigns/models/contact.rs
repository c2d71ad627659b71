use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::{CampaignId, ContactId, PageParams};

/// Contact dial state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ContactStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
    Busy,
    Voicemail,
    Skipped,
}

impl ContactStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ContactStatus::Pending | ContactStatus::Queued | ContactStatus::InProgress
        )
    }
}

impl std::fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContactStatus::Pending => write!(f, "pending"),
            ContactStatus::Queued => write!(f, "queued"),
            ContactStatus::InProgress => write!(f, "in-progress"),
            ContactStatus::Completed => write!(f, "completed"),
            ContactStatus::Failed => write!(f, "failed"),
            ContactStatus::NoAnswer => write!(f, "no-answer"),
            ContactStatus::Busy => write!(f, "busy"),
            ContactStatus::Voicemail => write!(f, "voicemail"),
            ContactStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ContactStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ContactStatus::Pending),
            "queued" => Ok(ContactStatus::Queued),
            "in-progress" => Ok(ContactStatus::InProgress),
            "completed" => Ok(ContactStatus::Completed),
            "failed" => Ok(ContactStatus::Failed),
            "no-answer" => Ok(ContactStatus::NoAnswer),
            "busy" => Ok(ContactStatus::Busy),
            "voicemail" => Ok(ContactStatus::Voicemail),
            "skipped" => Ok(ContactStatus::Skipped),
            _ => Err(anyhow::anyhow!("Invalid contact status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CampaignContact {
    pub id: ContactId,
    pub campaign_id: CampaignId,
    pub phone_number: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub metadata: serde_json::Value,
    pub priority: i32,
    pub status: String,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for adding one contact to a campaign.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub phone_number: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl CampaignContact {
    pub fn status(&self) -> ContactStatus {
        self.status.parse().unwrap_or(ContactStatus::Pending)
    }

    /// Insert a batch of contacts. Duplicate phone numbers within the
    /// campaign are skipped.
    pub async fn insert_batch(
        campaign_id: CampaignId,
        contacts: &[NewContact],
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let mut inserted = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let row = sqlx::query_as::<_, Self>(
                r#"
                INSERT INTO campaign_contacts (
                    campaign_id, phone_number, name, email, priority, metadata
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (campaign_id, phone_number) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(campaign_id)
            .bind(&contact.phone_number)
            .bind(&contact.name)
            .bind(&contact.email)
            .bind(contact.priority.unwrap_or(0))
            .bind(contact.metadata.clone().unwrap_or_else(|| serde_json::json!({})))
            .fetch_optional(pool)
            .await?;
            if let Some(row) = row {
                inserted.push(row);
            }
        }
        Ok(inserted)
    }

    pub async fn find_by_id(id: ContactId, pool: &PgPool) -> Result<Option<Self>> {
        let contact = sqlx::query_as::<_, Self>("SELECT * FROM campaign_contacts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(contact)
    }

    pub async fn list_for_campaign(
        campaign_id: CampaignId,
        status: Option<ContactStatus>,
        page: &PageParams,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let contacts = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM campaign_contacts
            WHERE campaign_id = $1
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(campaign_id)
        .bind(status.map(|s| s.to_string()))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;
        Ok(contacts)
    }

    /// Contacts that have never been enqueued.
    pub async fn find_pending(campaign_id: CampaignId, pool: &PgPool) -> Result<Vec<Self>> {
        let contacts = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM campaign_contacts
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(pool)
        .await?;
        Ok(contacts)
    }

    /// Contacts in retryable failure states below the attempt cap.
    pub async fn find_retry_eligible(
        campaign_id: CampaignId,
        include_voicemail: bool,
        max_attempts: i32,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let contacts = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM campaign_contacts
            WHERE campaign_id = $1
              AND attempt_count < $2
              AND (
                  status IN ('failed', 'no-answer', 'busy')
                  OR (status = 'voicemail' AND $3)
              )
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .bind(campaign_id)
        .bind(max_attempts)
        .bind(include_voicemail)
        .fetch_all(pool)
        .await?;
        Ok(contacts)
    }

    pub async fn update_status(
        id: ContactId,
        status: ContactStatus,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let contact = sqlx::query_as::<_, Self>(
            r#"
            UPDATE campaign_contacts
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .fetch_optional(pool)
        .await?;
        Ok(contact)
    }

    /// Move a contact into `in-progress` and count the attempt.
    pub async fn mark_attempt(id: ContactId, pool: &PgPool) -> Result<Option<Self>> {
        let contact = sqlx::query_as::<_, Self>(
            r#"
            UPDATE campaign_contacts
            SET status = 'in-progress',
                attempt_count = attempt_count + 1,
                last_attempt_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(contact)
    }

    /// Mark every not-yet-dialed contact as skipped (campaign cancelled).
    pub async fn skip_undialed(campaign_id: CampaignId, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_contacts
            SET status = 'skipped', updated_at = NOW()
            WHERE campaign_id = $1 AND status IN ('pending', 'queued')
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
            ContactStatus::Pending,
            ContactStatus::Queued,
            ContactStatus::InProgress,
            ContactStatus::Completed,
            ContactStatus::Failed,
            ContactStatus::NoAnswer,
            ContactStatus::Busy,
            ContactStatus::Voicemail,
            ContactStatus::Skipped,
        ] {
            let parsed: ContactStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminality() {
        assert!(!ContactStatus::Pending.is_terminal());
        assert!(!ContactStatus::Queued.is_terminal());
        assert!(!ContactStatus::InProgress.is_terminal());
        assert!(ContactStatus::Completed.is_terminal());
        assert!(ContactStatus::NoAnswer.is_terminal());
        assert!(ContactStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_new_contact_accepts_camel_case() {
        let json = serde_json::json!({
            "phoneNumber": "+14155550101",
            "name": "Ada",
            "priority": 7
        });
        let contact: NewContact = serde_json::from_value(json).unwrap();
        assert_eq!(contact.phone_number, "+14155550101");
        assert_eq!(contact.priority, Some(7));
        assert!(contact.metadata.is_none());
    }
}
