//! Lease janitor: reaps orphaned leases and repairs SET membership.
//!
//! A lease key expires on its own; the membership SET does not. After a
//! worker crash or a vendor that never calls back, the SET can hold members
//! whose lease keys are gone (slot leak) or a lease key can exist without
//! membership (undercount). The janitor walks both directions on a fixed
//! cadence. Both repairs are idempotent: a second run over the same state
//! changes nothing.

use sqlx::PgPool;
use tracing::{debug, warn};

use crate::common::{CampaignId, CoreResult};
use crate::domains::campaigns::models::{CallLog, Campaign};
use crate::kernel::concurrency::ConcurrencyTracker;
use crate::kernel::keys::{self, CampaignKeys};
use crate::kernel::kv::Kv;
use crate::kernel::waitlist::{origin_for, WaitlistEntry, WaitlistService};

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    /// Members removed because their lease key was gone or expiring.
    pub reaped: usize,
    /// Lease keys whose membership had to be restored.
    pub readded: usize,
}

#[derive(Clone)]
pub struct LeaseJanitor {
    kv: Kv,
    tracker: ConcurrencyTracker,
    waitlist: WaitlistService,
    pool: PgPool,
    /// Leases with TTL at or below this are treated as already expired.
    grace_secs: i64,
    high_priority_threshold: i32,
}

impl LeaseJanitor {
    pub fn new(
        kv: Kv,
        tracker: ConcurrencyTracker,
        waitlist: WaitlistService,
        pool: PgPool,
        grace_secs: i64,
        high_priority_threshold: i32,
    ) -> Self {
        Self {
            kv,
            tracker,
            waitlist,
            pool,
            grace_secs,
            high_priority_threshold,
        }
    }

    /// One pass over every running campaign.
    pub async fn run_once(&self) -> CoreResult<()> {
        let campaigns = Campaign::find_running(&self.pool).await?;
        for campaign in campaigns {
            if let Err(err) = self.sweep_campaign(campaign.id).await {
                warn!(campaign_id = %campaign.id, %err, "janitor sweep failed");
            }
        }
        Ok(())
    }

    pub async fn sweep_campaign(&self, campaign_id: CampaignId) -> CoreResult<SweepReport> {
        let keys = CampaignKeys::new(campaign_id);
        let mut report = SweepReport::default();

        let members = self.kv.smembers(&keys.leases()).await?;
        for member in &members {
            let lease_key = keys.lease_for_member(member);
            let ttl = self.kv.ttl(&lease_key).await?;
            let expired = ttl == -2;
            let expiring_predial =
                ttl >= 0 && ttl <= self.grace_secs && keys::is_predial_member(member);

            if expired || expiring_predial {
                self.tracker
                    .force_release_slot(campaign_id, keys::member_call_id(member))
                    .await?;
                report.reaped += 1;
                debug!(%campaign_id, member, ttl, "reaped orphan lease member");

                if keys::is_predial_member(member) {
                    self.requeue_abandoned_predial(campaign_id, member).await?;
                }
            }
        }

        // Inverse: a live lease key must appear in the membership SET.
        let member_prefix = keys.lease_for_member("");
        for lease_key in self.kv.scan_match(&keys.lease_pattern()).await? {
            let Some(member) = lease_key.strip_prefix(member_prefix.as_str()) else {
                continue;
            };
            if !members.iter().any(|m| m == member) {
                self.kv.sadd(&keys.leases(), member).await?;
                report.readded += 1;
                debug!(%campaign_id, member, "restored missing lease membership");
            }
        }

        if report.reaped > 0 || report.readded > 0 {
            warn!(
                %campaign_id,
                reaped = report.reaped,
                readded = report.readded,
                "janitor repaired lease drift"
            );
        }
        Ok(report)
    }

    /// A pre-dial lease died without upgrade: fail its call record and put
    /// the contact back at the waitlist head so it redials promptly.
    async fn requeue_abandoned_predial(
        &self,
        campaign_id: CampaignId,
        member: &str,
    ) -> CoreResult<()> {
        let Ok(call_log_id) = keys::member_call_id(member).parse() else {
            return Ok(());
        };
        let Some(call_log) = CallLog::find_by_id(call_log_id, &self.pool).await? else {
            return Ok(());
        };
        if call_log.status().is_terminal() {
            return Ok(());
        }

        CallLog::mark_failed(call_log.id, "lease_expired", &self.pool).await?;

        let Some(campaign) = Campaign::find_by_id(campaign_id, &self.pool).await? else {
            return Ok(());
        };
        let Some(contact) =
            crate::domains::campaigns::models::CampaignContact::find_by_id(
                call_log.contact_id,
                &self.pool,
            )
            .await?
        else {
            return Ok(());
        };

        let origin = origin_for(
            campaign.priority_mode(),
            contact.priority,
            self.high_priority_threshold,
        );
        self.waitlist
            .return_to_head(
                campaign_id,
                campaign.priority_mode(),
                WaitlistEntry::new(contact.id, contact.attempt_count, origin),
            )
            .await?;
        Ok(())
    }
}
