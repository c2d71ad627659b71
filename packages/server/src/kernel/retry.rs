//! Auto-retry policy and scheduling.
//!
//! On each terminal call-log the failure category decides whether the
//! contact is re-dialed and after how long:
//!
//! | category        | retryable                  | delay                   |
//! |-----------------|----------------------------|-------------------------|
//! | no-answer       | yes                        | base delay with jitter  |
//! | busy            | yes                        | half base               |
//! | voicemail       | unless excluded            | base delay              |
//! | network error   | yes                        | exponential, capped 4×  |
//! | invalid number  | no                         | -                       |
//! | completed       | no                         | -                       |
//!
//! A retry produces a durable `RetryAttempt` row plus a delayed dispatch
//! job that re-enters the pipeline at its scheduled time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use dialq::{DialJob, Queue};
use rand::Rng;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::common::CoreResult;
use crate::domains::campaigns::models::{
    CallLog, Campaign, CampaignContact, RetryAttempt,
};
use crate::kernel::waitlist::origin_for;

/// Business-hours window for scheduled re-dials (campaign-local time is a
/// future concern; the window is evaluated in UTC).
const BUSINESS_HOURS_START: u32 = 9;
const BUSINESS_HOURS_END: u32 = 20;

/// Why the last dial attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    NoAnswer,
    Busy,
    Voicemail,
    NetworkError,
    InvalidNumber,
    Completed,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::NoAnswer => "no_answer",
            FailureCategory::Busy => "busy",
            FailureCategory::Voicemail => "voicemail",
            FailureCategory::NetworkError => "network_error",
            FailureCategory::InvalidNumber => "invalid_number",
            FailureCategory::Completed => "completed",
        }
    }
}

/// Retry decision policy derived from campaign settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub exclude_voicemail: bool,
    pub max_attempts: i32,
    pub business_hours_only: bool,
}

impl RetryPolicy {
    pub fn from_campaign(campaign: &Campaign) -> Self {
        Self {
            base_delay: Duration::from_secs(campaign.retry_delay_minutes.max(1) as u64 * 60),
            exclude_voicemail: campaign.exclude_voicemail,
            max_attempts: campaign.max_retry_attempts,
            business_hours_only: campaign.business_hours_only,
        }
    }

    /// Raw delay for a category, before jitter. `None` means no retry.
    /// `attempt` is the attempt count already made for the contact.
    pub fn delay_for(&self, category: FailureCategory, attempt: i32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match category {
            FailureCategory::NoAnswer => Some(self.base_delay),
            FailureCategory::Busy => Some(self.base_delay / 2),
            FailureCategory::Voicemail => {
                if self.exclude_voicemail {
                    None
                } else {
                    Some(self.base_delay)
                }
            }
            FailureCategory::NetworkError => {
                let exponent = attempt.saturating_sub(1).clamp(0, 2) as u32;
                Some((self.base_delay * 2u32.pow(exponent)).min(self.base_delay * 4))
            }
            FailureCategory::InvalidNumber | FailureCategory::Completed => None,
        }
    }

    /// Scheduled-for time: delay, ±20% jitter, shifted into business hours
    /// when the campaign asks for it. `jitter` is in [-1, 1].
    pub fn schedule_at(
        &self,
        category: FailureCategory,
        attempt: i32,
        now: DateTime<Utc>,
        jitter: f64,
    ) -> Option<DateTime<Utc>> {
        let delay = self.delay_for(category, attempt)?;
        let jittered_secs = delay.as_secs_f64() * (1.0 + 0.2 * jitter.clamp(-1.0, 1.0));
        let run_at = now + chrono::Duration::seconds(jittered_secs.max(1.0) as i64);
        Some(if self.business_hours_only {
            shift_into_business_hours(run_at)
        } else {
            run_at
        })
    }
}

/// Move a timestamp forward to the next in-window moment; times already in
/// the window pass through.
fn shift_into_business_hours(t: DateTime<Utc>) -> DateTime<Utc> {
    let hour = t.hour();
    if (BUSINESS_HOURS_START..BUSINESS_HOURS_END).contains(&hour) {
        return t;
    }
    let date = if hour >= BUSINESS_HOURS_END {
        t.date_naive() + chrono::Days::new(1)
    } else {
        t.date_naive()
    };
    Utc.with_ymd_and_hms(
        date.year(),
        date.month(),
        date.day(),
        BUSINESS_HOURS_START,
        t.minute(),
        t.second(),
    )
    .single()
    .unwrap_or(t)
}

/// Produces retry attempts and their delayed dispatch jobs.
#[derive(Clone)]
pub struct RetryScheduler {
    pool: PgPool,
    queue: Arc<dyn Queue>,
    high_priority_threshold: i32,
}

impl RetryScheduler {
    pub fn new(pool: PgPool, queue: Arc<dyn Queue>, high_priority_threshold: i32) -> Self {
        Self {
            pool,
            queue,
            high_priority_threshold,
        }
    }

    /// Schedule a re-dial for a contact whose call just ended, when policy
    /// allows one. Returns the created attempt, or `None` when the contact
    /// is done.
    pub async fn schedule_retry(
        &self,
        campaign: &Campaign,
        contact: &CampaignContact,
        call_log: &CallLog,
        category: FailureCategory,
    ) -> CoreResult<Option<RetryAttempt>> {
        let policy = RetryPolicy::from_campaign(campaign);
        let jitter: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let Some(run_at) = policy.schedule_at(category, contact.attempt_count, Utc::now(), jitter)
        else {
            debug!(
                contact_id = %contact.id,
                category = category.as_str(),
                attempt = contact.attempt_count,
                "no retry scheduled"
            );
            return Ok(None);
        };

        let attempt_number = contact.attempt_count + 1;
        let attempt = RetryAttempt::create(
            call_log.id,
            campaign.id,
            contact.id,
            run_at,
            category.as_str(),
            attempt_number,
            &self.pool,
        )
        .await?;

        let origin = origin_for(
            campaign.priority_mode(),
            contact.priority,
            self.high_priority_threshold,
        );
        let job = DialJob {
            campaign_id: campaign.id.into_uuid(),
            contact_id: contact.id.into_uuid(),
            origin,
            attempt: attempt_number,
            reserved: false,
            retry_attempt_id: Some(attempt.id.into_uuid()),
            scheduled_for: Some(run_at),
        };
        self.queue.enqueue_delayed(job, run_at).await?;

        info!(
            campaign_id = %campaign.id,
            contact_id = %contact.id,
            retry_attempt_id = %attempt.id,
            category = category.as_str(),
            %run_at,
            "retry scheduled"
        );
        Ok(Some(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1800),
            exclude_voicemail: false,
            max_attempts: 3,
            business_hours_only: false,
        }
    }

    #[test]
    fn test_no_answer_uses_base_delay() {
        assert_eq!(
            policy().delay_for(FailureCategory::NoAnswer, 1),
            Some(Duration::from_secs(1800))
        );
    }

    #[test]
    fn test_busy_uses_half_base() {
        assert_eq!(
            policy().delay_for(FailureCategory::Busy, 1),
            Some(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_voicemail_respects_exclusion() {
        assert_eq!(
            policy().delay_for(FailureCategory::Voicemail, 1),
            Some(Duration::from_secs(1800))
        );
        let mut excluded = policy();
        excluded.exclude_voicemail = true;
        assert_eq!(excluded.delay_for(FailureCategory::Voicemail, 1), None);
    }

    #[test]
    fn test_network_error_backs_off_exponentially_with_cap() {
        let p = RetryPolicy {
            max_attempts: 10,
            ..policy()
        };
        assert_eq!(
            p.delay_for(FailureCategory::NetworkError, 1),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(
            p.delay_for(FailureCategory::NetworkError, 2),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            p.delay_for(FailureCategory::NetworkError, 3),
            Some(Duration::from_secs(7200))
        );
        // Capped at 4× base.
        assert_eq!(
            p.delay_for(FailureCategory::NetworkError, 9),
            Some(Duration::from_secs(7200))
        );
    }

    #[test]
    fn test_terminal_categories_never_retry() {
        assert_eq!(policy().delay_for(FailureCategory::InvalidNumber, 1), None);
        assert_eq!(policy().delay_for(FailureCategory::Completed, 1), None);
    }

    #[test]
    fn test_attempt_cap_blocks_retry() {
        assert_eq!(policy().delay_for(FailureCategory::NoAnswer, 3), None);
        assert_eq!(policy().delay_for(FailureCategory::NoAnswer, 4), None);
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let p = policy();
        let now = Utc::now();
        let nominal = now + chrono::Duration::seconds(1800);
        for jitter in [-1.0, -0.5, 0.0, 0.5, 1.0] {
            let at = p
                .schedule_at(FailureCategory::NoAnswer, 1, now, jitter)
                .unwrap();
            let skew = (at - nominal).num_seconds().abs();
            assert!(skew <= 361, "skew {} outside jitter bound", skew);
        }
    }

    #[test]
    fn test_business_hours_shift() {
        let p = RetryPolicy {
            business_hours_only: true,
            base_delay: Duration::from_secs(60),
            ..policy()
        };
        // 23:00 UTC + 1min lands after hours; shifted to 09:01 next day.
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap();
        let at = p
            .schedule_at(FailureCategory::NoAnswer, 1, now, 0.0)
            .unwrap();
        assert_eq!(at.hour(), BUSINESS_HOURS_START);
        assert_eq!(at.day(), 2);

        // Early morning shifts to the same day's opening.
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 4, 30, 0).unwrap();
        let at = p
            .schedule_at(FailureCategory::NoAnswer, 1, now, 0.0)
            .unwrap();
        assert_eq!(at.hour(), BUSINESS_HOURS_START);
        assert_eq!(at.day(), 1);

        // In-window times pass through untouched.
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let at = p
            .schedule_at(FailureCategory::NoAnswer, 1, now, 0.0)
            .unwrap();
        assert_eq!(at.hour(), 12);
    }
}
