//! Invariant monitor: observes cross-component invariants and alerts.
//!
//! Never mutates state - violations are the reconcilers' job to fix. A
//! budget overshoot is only alerted once it persists for a second
//! consecutive cycle, since a single observation can be a benign in-flight
//! race.

use std::collections::HashMap;
use std::sync::Mutex;

use sqlx::PgPool;
use tracing::warn;

use crate::common::{CampaignId, CoreResult};
use crate::domains::campaigns::models::Campaign;
use crate::kernel::concurrency::ConcurrencyTracker;
use crate::kernel::keys::CampaignKeys;
use crate::kernel::kv::Kv;

pub struct InvariantMonitor {
    kv: Kv,
    tracker: ConcurrencyTracker,
    pool: PgPool,
    /// Consecutive over-budget observations per campaign.
    overshoot_cycles: Mutex<HashMap<CampaignId, u32>>,
}

impl InvariantMonitor {
    pub fn new(kv: Kv, tracker: ConcurrencyTracker, pool: PgPool) -> Self {
        Self {
            kv,
            tracker,
            pool,
            overshoot_cycles: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_once(&self) -> CoreResult<()> {
        let campaigns = Campaign::find_running(&self.pool).await?;
        for campaign in campaigns {
            if let Err(err) = self.check_campaign(campaign.id).await {
                warn!(campaign_id = %campaign.id, %err, "invariant check failed");
            }
        }
        Ok(())
    }

    pub async fn check_campaign(&self, campaign_id: CampaignId) -> CoreResult<()> {
        let snapshot = self.tracker.snapshot(campaign_id).await?;

        // Invariant 1: active + predial + reserved ≤ limit.
        let over_budget = match snapshot.limit {
            Some(limit) => snapshot.holders() + snapshot.reserved > limit,
            None => false,
        };
        {
            let mut cycles = self
                .overshoot_cycles
                .lock()
                .expect("overshoot cycle lock poisoned");
            if over_budget {
                let count = cycles.entry(campaign_id).or_insert(0);
                *count += 1;
                if *count >= 2 {
                    warn!(
                        %campaign_id,
                        active = snapshot.active,
                        predial = snapshot.predial,
                        reserved = snapshot.reserved,
                        limit = snapshot.limit.unwrap_or(-1),
                        cycles = *count,
                        "INVARIANT VIOLATION: slot budget exceeded for consecutive cycles"
                    );
                }
            } else {
                cycles.remove(&campaign_id);
            }
        }

        // Invariant 2: every SET member has a lease key and vice versa.
        let keys = CampaignKeys::new(campaign_id);
        let members = self.kv.smembers(&keys.leases()).await?;
        let lease_keys = self.kv.scan_match(&keys.lease_pattern()).await?;
        if members.len() != lease_keys.len() {
            warn!(
                %campaign_id,
                members = members.len(),
                lease_keys = lease_keys.len(),
                "INVARIANT VIOLATION: lease membership and lease keys disagree"
            );
        }

        Ok(())
    }
}
