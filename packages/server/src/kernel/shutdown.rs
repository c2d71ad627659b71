//! Graceful shutdown: stop cleanly without stranding reserved work.
//!
//! Ordered sequence on SIGTERM/SIGINT:
//!
//! 1. pause the queue (no new jobs claimed anywhere in the fleet's name)
//! 2. stop background loops
//! 3. force-release every *pre-dial* lease - active calls are preserved
//! 4. short grace wait
//! 5. drain the reservation ledger back to waitlist heads, then drop the
//!    reserved counter and ledger
//! 6. wait for in-flight queue jobs, bounded
//! 7. close the queue
//!
//! Any step failure propagates; the process exits non-zero.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dialq::Queue;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::domains::campaigns::models::Campaign;
use crate::kernel::concurrency::ConcurrencyTracker;
use crate::kernel::keys::{self, CampaignKeys};
use crate::kernel::kv::Kv;
use crate::kernel::reconciler;
use crate::kernel::services::BackgroundServices;
use crate::kernel::waitlist::{WaitlistEntry, WaitlistService};

pub struct ShutdownCoordinator {
    pub kv: Kv,
    pub pool: PgPool,
    pub queue: Arc<dyn Queue>,
    pub tracker: ConcurrencyTracker,
    pub waitlist: WaitlistService,
    pub services: Arc<BackgroundServices>,
    pub grace: Duration,
    pub drain: Duration,
}

impl ShutdownCoordinator {
    pub async fn run(&self) -> Result<()> {
        info!("graceful shutdown starting");

        // 1. Stop intake.
        self.queue.pause().await.context("pausing queue")?;

        // 2. Background loops down (worker keeps draining until step 6).
        self.services.stop_loops().await;

        // 3. Pre-dial leases are abandoned dials; give the slots back now.
        //    Active leases stay - their calls are still talking.
        let campaigns = Campaign::find_running(&self.pool)
            .await
            .context("listing running campaigns")?;
        for campaign in &campaigns {
            let members = self
                .tracker
                .lease_members(campaign.id)
                .await
                .context("listing lease members")?;
            for member in members {
                if keys::is_predial_member(&member) {
                    self.tracker
                        .force_release_slot(campaign.id, keys::member_call_id(&member))
                        .await
                        .context("releasing pre-dial lease")?;
                }
            }
        }

        // 4. Let anything mid-release settle.
        tokio::time::sleep(self.grace).await;

        // 5. Reserved-but-undispatched work goes back to the waitlists so a
        //    restarted fleet picks it up; the counters die with this
        //    process's authority over them.
        for campaign in &campaigns {
            let campaign_keys = CampaignKeys::new(campaign.id);
            let entries = self
                .kv
                .zrange_all(&campaign_keys.reserved_ledger())
                .await
                .context("reading reservation ledger")?;
            for member in entries {
                let Some((origin, contact_id)) = reconciler::parse_ledger_member(&member) else {
                    warn!(campaign_id = %campaign.id, member, "unparseable ledger entry dropped");
                    continue;
                };
                self.waitlist
                    .return_to_head(
                        campaign.id,
                        campaign.priority_mode(),
                        WaitlistEntry::new(contact_id, 1, origin),
                    )
                    .await
                    .context("draining ledger to waitlist")?;
            }
            self.kv
                .unlink(&[campaign_keys.reserved(), campaign_keys.reserved_ledger()])
                .await
                .context("dropping reservation state")?;
        }

        // 6. In-flight dispatch jobs get a bounded window to finish.
        if !self.services.drain_worker(self.drain).await {
            warn!("worker drain timed out");
        }

        // 7. Done with the queue.
        self.queue.close().await.context("closing queue")?;

        info!("graceful shutdown complete");
        Ok(())
    }
}
