//! Reconcilers: restore accounting invariants after partial failures.
//!
//! Two independent loops:
//!
//! - [`LedgerReconciler`] re-converges the `:reserved` counter with the
//!   reservation ledger. A ledger entry past its grace window must still be
//!   backed by a queued job or a pre-dial lease; otherwise the worker died
//!   between reservation and lease, and the job is re-waitlisted.
//! - [`QueueReconciler`] recovers jobs whose worker stopped heartbeating,
//!   and drops ghost jobs referencing deleted campaigns.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dialq::{Origin, Queue};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::common::{CampaignId, ContactId, CoreResult};
use crate::domains::campaigns::models::{CallLog, Campaign};
use crate::kernel::concurrency::ConcurrencyTracker;
use crate::kernel::keys::CampaignKeys;
use crate::kernel::waitlist::{WaitlistEntry, WaitlistService};

/// Parse a ledger member of the form `<origin>:<contactId>`.
pub(crate) fn parse_ledger_member(member: &str) -> Option<(Origin, ContactId)> {
    let (tag, contact) = member.split_once(':')?;
    let origin = Origin::from_tag(tag)?;
    let contact_id = contact.parse().ok()?;
    Some((origin, contact_id))
}

// =============================================================================
// Reservation-Ledger Reconciler
// =============================================================================

#[derive(Clone)]
pub struct LedgerReconciler {
    tracker: ConcurrencyTracker,
    queue: Arc<dyn Queue>,
    waitlist: WaitlistService,
    pool: PgPool,
    grace: Duration,
}

impl LedgerReconciler {
    pub fn new(
        tracker: ConcurrencyTracker,
        queue: Arc<dyn Queue>,
        waitlist: WaitlistService,
        pool: PgPool,
        grace: Duration,
    ) -> Self {
        Self {
            tracker,
            queue,
            waitlist,
            pool,
            grace,
        }
    }

    pub async fn run_once(&self) -> CoreResult<()> {
        let campaigns = Campaign::find_running(&self.pool).await?;
        for campaign in campaigns {
            if let Err(err) = self.reconcile_campaign(&campaign).await {
                warn!(campaign_id = %campaign.id, %err, "ledger reconciliation failed");
            }
        }
        Ok(())
    }

    pub async fn reconcile_campaign(&self, campaign: &Campaign) -> CoreResult<usize> {
        let campaign_id = campaign.id;
        let cutoff_ms = Utc::now().timestamp_millis() - self.grace.as_millis() as i64;
        let entries = self
            .tracker
            .ledger_entries_before(campaign_id, cutoff_ms)
            .await?;

        let mut repaired = 0usize;
        if !entries.is_empty() {
            let scheduled: HashSet<_> = self
                .queue
                .scheduled_contacts(campaign_id.into_uuid())
                .await?
                .into_iter()
                .collect();

            for (member, score) in entries {
                let Some((origin, contact_id)) = parse_ledger_member(&member) else {
                    warn!(%campaign_id, member, "unparseable ledger member removed");
                    self.tracker.remove_ledger_entry(campaign_id, &member).await?;
                    continue;
                };

                // (a) The job is still somewhere in the queue pipeline.
                if scheduled.contains(contact_id.as_uuid()) {
                    continue;
                }

                // (b) A pre-dial lease already exists for the contact's open
                // call: the reservation was consumed and the ledger entry
                // just lags.
                if let Some(open) =
                    CallLog::latest_open_for_contact(contact_id, &self.pool).await?
                {
                    let keys = CampaignKeys::new(campaign_id);
                    let predial_key = keys.predial_lease(&open.id.to_string());
                    if self.tracker.kv().exists(&predial_key).await? {
                        self.tracker.remove_ledger_entry(campaign_id, &member).await?;
                        continue;
                    }
                }

                // Orphan: the dispatcher died between reservation and lease.
                warn!(
                    %campaign_id,
                    %contact_id,
                    age_ms = Utc::now().timestamp_millis() - score,
                    "orphan reservation; re-waitlisting"
                );
                if self
                    .tracker
                    .remove_ledger_entry(campaign_id, &member)
                    .await?
                {
                    self.tracker.decr_reserved(campaign_id).await?;
                }
                self.waitlist
                    .return_to_head(
                        campaign_id,
                        campaign.priority_mode(),
                        WaitlistEntry::new(contact_id, 1, origin),
                    )
                    .await?;
                repaired += 1;
            }
        }

        // Inverse drift: more pre-dial leases in flight than the counters
        // admit. Leases are authoritative; restart the counter from zero and
        // let it re-converge.
        let snapshot = self.tracker.snapshot(campaign_id).await?;
        if snapshot.predial > snapshot.reserved + snapshot.active {
            warn!(
                %campaign_id,
                predial = snapshot.predial,
                reserved = snapshot.reserved,
                active = snapshot.active,
                "pre-dial leases exceed accounting; reseeding reserved counter"
            );
            let keys = CampaignKeys::new(campaign_id);
            self.tracker.kv().set(&keys.reserved(), "0").await?;
        }

        Ok(repaired)
    }
}

// =============================================================================
// Queue Reconciler
// =============================================================================

#[derive(Clone)]
pub struct QueueReconciler {
    tracker: ConcurrencyTracker,
    queue: Arc<dyn Queue>,
    waitlist: WaitlistService,
    pool: PgPool,
    stall_threshold: Duration,
}

impl QueueReconciler {
    pub fn new(
        tracker: ConcurrencyTracker,
        queue: Arc<dyn Queue>,
        waitlist: WaitlistService,
        pool: PgPool,
        stall_threshold: Duration,
    ) -> Self {
        Self {
            tracker,
            queue,
            waitlist,
            pool,
            stall_threshold,
        }
    }

    pub async fn run_once(&self) -> CoreResult<usize> {
        let stalled = self.queue.take_stalled(self.stall_threshold).await?;
        let mut recovered = 0usize;

        for envelope in stalled {
            let campaign_id = CampaignId::from_uuid(envelope.job.campaign_id);
            let contact_id = ContactId::from_uuid(envelope.job.contact_id);

            let Some(campaign) = Campaign::find_by_id(campaign_id, &self.pool).await? else {
                warn!(
                    job_id = %envelope.id,
                    %campaign_id,
                    "ghost job for missing campaign dropped"
                );
                continue;
            };

            // If a reservation for this contact is still on the books, give
            // it back before re-waitlisting.
            let member = format!("{}:{}", envelope.job.origin.as_tag(), contact_id);
            if self
                .tracker
                .remove_ledger_entry(campaign_id, &member)
                .await?
            {
                self.tracker.decr_reserved(campaign_id).await?;
            }

            // The worker may have died after creating the lease; in that
            // case the call is in flight and the janitor owns it.
            if let Some(open) = CallLog::latest_open_for_contact(contact_id, &self.pool).await? {
                let keys = CampaignKeys::new(campaign_id);
                let call_id = open.id.to_string();
                let has_lease = self.tracker.kv().exists(&keys.predial_lease(&call_id)).await?
                    || self.tracker.kv().exists(&keys.lease(&call_id)).await?;
                if has_lease {
                    debug!(job_id = %envelope.id, %contact_id, "stalled job already holds a lease; leaving to janitor");
                    continue;
                }
            }

            self.waitlist
                .return_to_head(
                    campaign_id,
                    campaign.priority_mode(),
                    WaitlistEntry::new(contact_id, envelope.job.attempt, envelope.job.origin),
                )
                .await?;
            recovered += 1;
            warn!(
                job_id = %envelope.id,
                %campaign_id,
                %contact_id,
                "stalled job re-waitlisted"
            );
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ledger_member() {
        let contact = ContactId::new();
        let (origin, parsed) = parse_ledger_member(&format!("H:{}", contact)).unwrap();
        assert_eq!(origin, Origin::High);
        assert_eq!(parsed, contact);

        let (origin, _) = parse_ledger_member(&format!("N:{}", contact)).unwrap();
        assert_eq!(origin, Origin::Normal);
    }

    #[test]
    fn test_parse_ledger_member_rejects_garbage() {
        assert!(parse_ledger_member("").is_none());
        assert!(parse_ledger_member("H").is_none());
        assert!(parse_ledger_member("X:not-a-uuid").is_none());
        assert!(parse_ledger_member(&format!("Q:{}", ContactId::new())).is_none());
    }
}
