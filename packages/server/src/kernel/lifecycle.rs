//! Campaign lifecycle operations: start, pause, resume, cancel, retry,
//! limit updates, and purge.
//!
//! Pause never touches in-flight calls - they finish naturally while the
//! pause flag stops new grants. Cancel drains active calls with a bounded
//! wait before force-releasing. Purge removes every KV key belonging to the
//! campaign, static and dynamic, and is safe to run twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dialq::{DialJob, Queue};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::common::{CampaignId, CoreError, CoreResult};
use crate::domains::campaigns::models::{
    CallLog, Campaign, CampaignContact, CampaignStatus, ContactStatus, RetryAttempt,
};
use crate::kernel::concurrency::ConcurrencyTracker;
use crate::kernel::keys::{self, CampaignKeys};
use crate::kernel::kv::Kv;
use crate::kernel::retry::{FailureCategory, RetryScheduler};
use crate::kernel::traits::BaseVendorDialer;
use crate::kernel::waitlist::origin_for;

/// Fraction of the requested limit that active calls may occupy before a
/// reduction is refused.
const SATURATION_GUARD: f64 = 0.9;

/// Seconds purge waits for in-flight dispatchers to observe the pause flag.
const PURGE_GRACE_SECS: u64 = 2;

#[derive(Clone)]
pub struct LifecycleController {
    pool: PgPool,
    kv: Kv,
    tracker: ConcurrencyTracker,
    queue: Arc<dyn Queue>,
    vendor: Arc<dyn BaseVendorDialer>,
    retry: RetryScheduler,
    cold_start_ttl_secs: u64,
    cancel_drain_secs: u64,
    high_priority_threshold: i32,
}

impl LifecycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        kv: Kv,
        tracker: ConcurrencyTracker,
        queue: Arc<dyn Queue>,
        vendor: Arc<dyn BaseVendorDialer>,
        retry: RetryScheduler,
        cold_start_ttl_secs: u64,
        cancel_drain_secs: u64,
        high_priority_threshold: i32,
    ) -> Self {
        Self {
            pool,
            kv,
            tracker,
            queue,
            vendor,
            retry,
            cold_start_ttl_secs,
            cancel_drain_secs,
            high_priority_threshold,
        }
    }

    /// Activate a draft campaign and enqueue all pending contacts.
    pub async fn start(&self, campaign: &Campaign) -> CoreResult<Campaign> {
        let updated = Campaign::transition(
            campaign.id,
            CampaignStatus::Draft,
            CampaignStatus::Active,
            &self.pool,
        )
        .await?
        .ok_or_else(|| {
            CoreError::Conflict(format!(
                "campaign cannot start from status '{}'",
                campaign.status
            ))
        })?;

        self.tracker
            .set_limit(campaign.id, campaign.concurrent_calls_limit as i64)
            .await?;
        self.tracker.clear_paused(campaign.id).await?;
        // Ramp-up marker: dispatch and promotion hold effective concurrency
        // below the configured cap while this lives.
        self.tracker
            .set_cold_start(campaign.id, self.cold_start_ttl_secs)
            .await?;

        let mode = updated.priority_mode();
        let contacts = CampaignContact::find_pending(campaign.id, &self.pool).await?;
        let total = contacts.len();
        for contact in contacts {
            CampaignContact::update_status(contact.id, ContactStatus::Queued, &self.pool).await?;
            let job = DialJob {
                campaign_id: campaign.id.into_uuid(),
                contact_id: contact.id.into_uuid(),
                origin: origin_for(mode, contact.priority, self.high_priority_threshold),
                attempt: contact.attempt_count + 1,
                reserved: false,
                retry_attempt_id: None,
                scheduled_for: None,
            };
            self.queue.enqueue(job).await?;
        }

        info!(campaign_id = %campaign.id, contacts = total, "campaign started");
        Ok(updated)
    }

    /// Pause dialing. In-flight calls finish naturally; dispatch workers
    /// observing the flag return jobs to waitlist heads.
    pub async fn pause(&self, campaign: &Campaign) -> CoreResult<Campaign> {
        let updated = Campaign::transition(
            campaign.id,
            CampaignStatus::Active,
            CampaignStatus::Paused,
            &self.pool,
        )
        .await?
        .ok_or_else(|| CoreError::Conflict("campaign is not active".to_string()))?;

        self.tracker.set_paused(campaign.id).await?;
        info!(campaign_id = %campaign.id, "campaign paused");
        Ok(updated)
    }

    pub async fn resume(&self, campaign: &Campaign) -> CoreResult<Campaign> {
        let updated = Campaign::transition(
            campaign.id,
            CampaignStatus::Paused,
            CampaignStatus::Active,
            &self.pool,
        )
        .await?
        .ok_or_else(|| CoreError::Conflict("campaign is not paused".to_string()))?;

        self.tracker.clear_paused(campaign.id).await?;
        // Kick promotion immediately rather than waiting for a release.
        self.tracker.publish_slot_available(campaign.id).await?;
        info!(campaign_id = %campaign.id, "campaign resumed");
        Ok(updated)
    }

    /// Cancel the campaign: queued work is dropped now, active calls drain
    /// with a bounded wait, then the KV namespace is purged.
    pub async fn cancel(&self, campaign: &Campaign) -> CoreResult<Campaign> {
        let status = campaign.status();
        if status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "campaign is already {}",
                status
            )));
        }
        let updated = Campaign::transition(
            campaign.id,
            status,
            CampaignStatus::Cancelled,
            &self.pool,
        )
        .await?
        .ok_or_else(|| CoreError::Conflict("campaign state changed concurrently".to_string()))?;

        self.queue
            .cancel_campaign_jobs(campaign.id.into_uuid())
            .await?;
        RetryAttempt::cancel_for_campaign(campaign.id, &self.pool).await?;
        CampaignContact::skip_undialed(campaign.id, &self.pool).await?;

        // Ask the vendor to hang up whatever is still connected; calls whose
        // hangup fails are released by the janitor once their lease expires.
        for call in CallLog::find_open_for_campaign(campaign.id, &self.pool).await? {
            if let Some(sid) = call.vendor_call_sid.as_deref() {
                if let Err(err) = self.vendor.hangup_call(sid).await {
                    warn!(call_log_id = %call.id, %err, "cancel hangup failed");
                }
            } else {
                // Never reached the vendor: nothing to hang up.
                CallLog::mark_cancelled(call.id, &self.pool).await?;
                self.tracker
                    .force_release_slot(campaign.id, &call.id.to_string())
                    .await?;
            }
        }

        // Drain-then-purge runs off the request path.
        let controller = self.clone();
        let campaign_id = campaign.id;
        let drain_secs = self.cancel_drain_secs;
        tokio::spawn(async move {
            let deadline = Utc::now() + chrono::Duration::seconds(drain_secs as i64);
            loop {
                match controller.tracker.active_calls(campaign_id).await {
                    Ok(0) => break,
                    Ok(_) if Utc::now() >= deadline => {
                        // Timed out: reclaim whatever is left.
                        if let Ok(members) = controller.tracker.lease_members(campaign_id).await {
                            for member in members {
                                let _ = controller
                                    .tracker
                                    .force_release_slot(
                                        campaign_id,
                                        keys::member_call_id(&member),
                                    )
                                    .await;
                            }
                        }
                        break;
                    }
                    Ok(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                    Err(err) => {
                        warn!(%campaign_id, %err, "cancel drain probe failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            if let Err(err) = controller.purge_keys(campaign_id).await {
                warn!(%campaign_id, %err, "post-cancel purge failed");
            }
        });

        info!(campaign_id = %campaign.id, "campaign cancelled");
        Ok(updated)
    }

    /// Schedule retries for every retry-eligible failed contact. Returns how
    /// many were scheduled.
    pub async fn retry_failed(&self, campaign: &Campaign) -> CoreResult<usize> {
        if campaign.status() != CampaignStatus::Active {
            return Err(CoreError::Conflict(
                "campaign must be active to retry failed contacts".to_string(),
            ));
        }

        let contacts = CampaignContact::find_retry_eligible(
            campaign.id,
            !campaign.exclude_voicemail,
            campaign.max_retry_attempts,
            &self.pool,
        )
        .await?;

        let mut scheduled = 0usize;
        for contact in contacts {
            let Some(call_log) =
                CallLog::latest_for_contact(contact.id, &self.pool).await?
            else {
                continue;
            };
            let category = match contact.status() {
                ContactStatus::NoAnswer => FailureCategory::NoAnswer,
                ContactStatus::Busy => FailureCategory::Busy,
                ContactStatus::Voicemail => FailureCategory::Voicemail,
                _ => FailureCategory::NetworkError,
            };
            if self
                .retry
                .schedule_retry(campaign, &contact, &call_log, category)
                .await?
                .is_some()
            {
                scheduled += 1;
            }
        }

        info!(campaign_id = %campaign.id, scheduled, "manual retry sweep");
        Ok(scheduled)
    }

    /// Change the concurrency limit. Reductions are refused while active
    /// calls sit above 90% of the requested cap.
    pub async fn update_limit(
        &self,
        campaign: &Campaign,
        requested_limit: i32,
    ) -> CoreResult<Campaign> {
        if requested_limit < campaign.concurrent_calls_limit {
            let active = self.tracker.active_calls(campaign.id).await?;
            if active as f64 > SATURATION_GUARD * requested_limit as f64 {
                return Err(CoreError::NearSaturation {
                    active_calls: active,
                    requested_limit: requested_limit as i64,
                });
            }
        }

        let updated =
            Campaign::set_concurrent_limit(campaign.id, requested_limit, &self.pool).await?;
        self.tracker
            .set_limit(campaign.id, requested_limit as i64)
            .await?;
        // A larger limit frees capacity immediately; let promotion see it.
        self.tracker.publish_slot_available(campaign.id).await?;

        info!(
            campaign_id = %campaign.id,
            from = campaign.concurrent_calls_limit,
            to = requested_limit,
            "concurrency limit updated"
        );
        Ok(updated)
    }

    /// Remove every KV key belonging to the campaign. Idempotent: running
    /// twice leaves the same (empty) state.
    pub async fn purge(&self, campaign: &Campaign) -> CoreResult<()> {
        // 1. Stop new grants.
        self.tracker.set_paused(campaign.id).await?;

        // 2. Reflect the stop durably. Only an active campaign needs the
        //    flip; cancelled/completed ones stay as they are.
        let _ = Campaign::transition(
            campaign.id,
            CampaignStatus::Active,
            CampaignStatus::Paused,
            &self.pool,
        )
        .await?;

        // 3. Give in-flight dispatchers time to observe the flag.
        tokio::time::sleep(Duration::from_secs(PURGE_GRACE_SECS)).await;

        // 4. Drop queued work.
        self.queue
            .cancel_campaign_jobs(campaign.id.into_uuid())
            .await?;

        self.purge_keys(campaign.id).await
    }

    /// Steps 5-7: force-release every lease, then UNLINK the whole
    /// namespace.
    async fn purge_keys(&self, campaign_id: CampaignId) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);

        for member in self.tracker.lease_members(campaign_id).await? {
            self.tracker
                .force_release_slot(campaign_id, keys::member_call_id(&member))
                .await?;
        }

        let mut doomed = keys.static_keys();
        doomed.extend(self.kv.scan_match(&keys.lease_pattern()).await?);
        doomed.extend(self.kv.scan_match(&keys.marker_pattern()).await?);
        doomed.sort();
        doomed.dedup();

        let removed = self.kv.unlink(&doomed).await?;
        info!(%campaign_id, keys = doomed.len(), removed, "campaign keys purged");
        Ok(())
    }

    /// Purge distributed state, then delete the durable record.
    pub async fn delete(&self, campaign: &Campaign) -> CoreResult<()> {
        self.purge(campaign).await?;
        Campaign::delete(campaign.id, &self.pool).await?;
        Ok(())
    }
}
