//! Per-campaign vendor circuit breaker.
//!
//! Consecutive vendor failures increment `:cb:fail`; crossing the threshold
//! sets the `:circuit` marker for a cool-down window during which dispatch
//! re-enqueues jobs with a short backoff instead of dialing. Any success
//! resets the count.

use tracing::warn;

use crate::common::{CampaignId, CoreResult};
use crate::kernel::keys::CampaignKeys;
use crate::kernel::kv::Kv;

// Failure counts older than this are stale; the window resets itself.
const FAIL_COUNT_TTL_SECS: u64 = 300;

#[derive(Clone)]
pub struct CircuitBreaker {
    kv: Kv,
    threshold: i64,
    cooldown_secs: u64,
}

impl CircuitBreaker {
    pub fn new(kv: Kv, threshold: i64, cooldown_secs: u64) -> Self {
        Self {
            kv,
            threshold,
            cooldown_secs,
        }
    }

    pub async fn is_open(&self, campaign_id: CampaignId) -> CoreResult<bool> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self.kv.exists(&keys.circuit()).await?)
    }

    /// Count a vendor failure; trips the circuit at the threshold.
    pub async fn record_failure(&self, campaign_id: CampaignId) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        let failures = self.kv.incr(&keys.cb_fail()).await?;
        self.kv.expire(&keys.cb_fail(), FAIL_COUNT_TTL_SECS).await?;
        if failures >= self.threshold {
            warn!(
                %campaign_id,
                failures,
                cooldown_secs = self.cooldown_secs,
                "vendor circuit opened"
            );
            self.kv
                .set_ex(&keys.circuit(), "1", self.cooldown_secs)
                .await?;
            self.kv.del(&keys.cb_fail()).await?;
        }
        Ok(())
    }

    /// A successful vendor call closes the failure window.
    pub async fn record_success(&self, campaign_id: CampaignId) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        self.kv.del(&keys.cb_fail()).await?;
        Ok(())
    }
}
