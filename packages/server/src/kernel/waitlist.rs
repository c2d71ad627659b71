//! Two-lane deferred-job store with dedup and promotion.
//!
//! Jobs that cannot get a slot wait in per-campaign `high` / `normal` lists.
//! A seen-set keeps any contact from being listed twice; per-job marker keys
//! and the fairness ZSET carry insertion metadata so promotion can age
//! normal-lane entries ahead of the high lane and the compactor can repair
//! half-written state.
//!
//! Promotion is serialized per campaign through the short-lived
//! `promote-mutex` key: concurrent promoters race SET NX and losers walk
//! away. A passing promoter moves at most `min(free slots, batch)` jobs back
//! onto the dispatch queue, already holding their reservations.

use std::sync::Arc;

use chrono::Utc;
use dialq::{DialJob, Origin, Queue};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::common::{CampaignId, ContactId, CoreResult};
use crate::domains::campaigns::models::{Campaign, CampaignContact, CampaignStatus, PriorityMode};
use crate::kernel::concurrency::{ConcurrencyTracker, ReserveOutcome};
use crate::kernel::keys::CampaignKeys;
use crate::kernel::kv::Kv;

/// One deferred dispatch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub contact_id: ContactId,
    pub attempt: i32,
    pub origin: Origin,
    pub enqueued_ms: i64,
}

impl WaitlistEntry {
    pub fn new(contact_id: ContactId, attempt: i32, origin: Origin) -> Self {
        Self {
            contact_id,
            attempt,
            origin,
            enqueued_ms: Utc::now().timestamp_millis(),
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Lane assignment policy.
///
/// In `priority` mode the contact's priority decides the lane; `fifo` and
/// `lifo` use the normal lane only (lifo differs in push position, not
/// lane).
pub fn origin_for(mode: PriorityMode, priority: i32, high_threshold: i32) -> Origin {
    match mode {
        PriorityMode::Priority if priority >= high_threshold => Origin::High,
        _ => Origin::Normal,
    }
}

#[derive(Debug, Clone)]
pub struct WaitlistSettings {
    pub aging_threshold_ms: i64,
    pub promotion_batch: usize,
    pub promote_mutex_ttl_secs: u64,
    pub high_priority_threshold: i32,
    /// Entries older than this with a terminal contact are purged by the
    /// compactor.
    pub stale_entry_ms: i64,
}

impl Default for WaitlistSettings {
    fn default() -> Self {
        Self {
            aging_threshold_ms: 30_000,
            promotion_batch: 10,
            promote_mutex_ttl_secs: 5,
            high_priority_threshold: 5,
            stale_entry_ms: 600_000,
        }
    }
}

#[derive(Clone)]
pub struct WaitlistService {
    kv: Kv,
    tracker: ConcurrencyTracker,
    queue: Arc<dyn Queue>,
    pool: PgPool,
    settings: WaitlistSettings,
}

impl WaitlistService {
    pub fn new(
        kv: Kv,
        tracker: ConcurrencyTracker,
        queue: Arc<dyn Queue>,
        pool: PgPool,
        settings: WaitlistSettings,
    ) -> Self {
        Self {
            kv,
            tracker,
            queue,
            pool,
            settings,
        }
    }

    fn lane_key(keys: &CampaignKeys, origin: Origin) -> String {
        match origin {
            Origin::High => keys.waitlist_high(),
            Origin::Normal => keys.waitlist_normal(),
        }
    }

    /// Append an entry to its lane. Returns false when the contact was
    /// already waitlisted (duplicate dropped).
    pub async fn push(
        &self,
        campaign_id: CampaignId,
        mode: PriorityMode,
        entry: WaitlistEntry,
    ) -> CoreResult<bool> {
        self.insert(campaign_id, mode, entry, false).await
    }

    /// Insert an entry at the head of its lane - the next position to be
    /// promoted. Used when a job must go back after a failed dispatch.
    pub async fn return_to_head(
        &self,
        campaign_id: CampaignId,
        mode: PriorityMode,
        entry: WaitlistEntry,
    ) -> CoreResult<bool> {
        self.insert(campaign_id, mode, entry, true).await
    }

    async fn insert(
        &self,
        campaign_id: CampaignId,
        mode: PriorityMode,
        entry: WaitlistEntry,
        at_head: bool,
    ) -> CoreResult<bool> {
        let keys = CampaignKeys::new(campaign_id);
        let contact_key = entry.contact_id.to_string();

        let added = self.kv.sadd(&keys.waitlist_seen(), &contact_key).await?;
        if added == 0 {
            let (high, normal) = self.lengths(campaign_id).await?;
            debug!(
                %campaign_id,
                contact_id = %entry.contact_id,
                waitlist_high = high,
                waitlist_normal = normal,
                "duplicate waitlist push dropped"
            );
            return Ok(false);
        }

        let lane = Self::lane_key(&keys, entry.origin);
        let raw = entry.encode();
        // Promotion pops fifo/priority lanes from the right, lifo from the
        // left; "head" means the next pop position for the mode.
        match (mode, at_head) {
            (PriorityMode::Lifo, _) => self.kv.lpush(&lane, &raw).await?,
            (_, true) => self.kv.rpush(&lane, &raw).await?,
            (_, false) => self.kv.lpush(&lane, &raw).await?,
        };

        let marker = serde_json::json!({
            "origin": entry.origin.as_tag(),
            "enqueuedMs": entry.enqueued_ms,
        });
        self.kv
            .set(&keys.waitlist_marker(&contact_key), &marker.to_string())
            .await?;
        // First-seen timestamp survives re-pushes so aging is never reset.
        if self.kv.zscore(&keys.fairness(), &contact_key).await?.is_none() {
            self.kv
                .zadd(&keys.fairness(), entry.enqueued_ms, &contact_key)
                .await?;
        }
        Ok(true)
    }

    async fn peek(
        &self,
        keys: &CampaignKeys,
        mode: PriorityMode,
        origin: Origin,
    ) -> CoreResult<Option<WaitlistEntry>> {
        let lane = Self::lane_key(keys, origin);
        let index = match mode {
            PriorityMode::Lifo => 0,
            _ => -1,
        };
        let raw = self.kv.lindex(&lane, index).await?;
        Ok(raw.as_deref().and_then(WaitlistEntry::decode))
    }

    async fn pop(
        &self,
        keys: &CampaignKeys,
        mode: PriorityMode,
        origin: Origin,
    ) -> CoreResult<Option<WaitlistEntry>> {
        let lane = Self::lane_key(keys, origin);
        let raw = match mode {
            PriorityMode::Lifo => self.kv.lpop(&lane).await?,
            _ => self.kv.rpop(&lane).await?,
        };
        let Some(raw) = raw else { return Ok(None) };
        let Some(entry) = WaitlistEntry::decode(&raw) else {
            warn!(campaign_id = %keys.campaign_id(), "dropping undecodable waitlist entry");
            return Ok(None);
        };
        let contact_key = entry.contact_id.to_string();
        self.kv.srem(&keys.waitlist_seen(), &contact_key).await?;
        self.kv.del(&keys.waitlist_marker(&contact_key)).await?;
        Ok(Some(entry))
    }

    /// Age of a waiting contact, from its first-seen time when the fairness
    /// set has one.
    async fn entry_age_ms(
        &self,
        keys: &CampaignKeys,
        entry: &WaitlistEntry,
        now_ms: i64,
    ) -> CoreResult<i64> {
        let first_seen = self
            .kv
            .zscore(&keys.fairness(), &entry.contact_id.to_string())
            .await?
            .unwrap_or(entry.enqueued_ms);
        Ok(now_ms - first_seen)
    }

    /// Promote up to `min(free slots, batch)` entries onto the dispatch
    /// queue. Returns how many were promoted.
    ///
    /// The high lane drains first, except that a normal-lane entry older
    /// than the aging threshold jumps ahead so sustained high-priority
    /// traffic cannot starve the normal lane.
    pub async fn promote(&self, campaign_id: CampaignId) -> CoreResult<usize> {
        let keys = CampaignKeys::new(campaign_id);

        // Recent full pass left a gate marker; let it cool off.
        if self.kv.exists(&keys.promote_gate()).await? {
            return Ok(0);
        }

        let Some(campaign) = Campaign::find_by_id(campaign_id, &self.pool).await? else {
            return Ok(0);
        };
        if campaign.status() != CampaignStatus::Active {
            return Ok(0);
        }
        let mode = campaign.priority_mode();

        let Some(token) = self
            .tracker
            .acquire_promote_mutex(campaign_id, self.settings.promote_mutex_ttl_secs)
            .await?
        else {
            return Ok(0);
        };

        let result = self.promote_locked(&keys, &campaign, mode).await;
        if let Err(err) = self
            .tracker
            .release_promote_mutex(campaign_id, &token)
            .await
        {
            warn!(%campaign_id, %err, "promote mutex release failed");
        }
        result
    }

    async fn promote_locked(
        &self,
        keys: &CampaignKeys,
        campaign: &Campaign,
        mode: PriorityMode,
    ) -> CoreResult<usize> {
        let campaign_id = keys.campaign_id();
        self.tracker
            .seed_limit_if_missing(campaign_id, campaign.concurrent_calls_limit as i64)
            .await?;

        let snapshot = self.tracker.snapshot(campaign_id).await?;
        let free = snapshot.free_slots().min(self.settings.promotion_batch as i64);
        if free <= 0 {
            // Nothing promotable right now; damp repeat attempts briefly.
            self.kv.set_ex(&keys.promote_gate(), "1", 2).await?;
            return Ok(0);
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut promoted = 0usize;

        for _ in 0..free {
            let aged_normal = match self.peek(keys, mode, Origin::Normal).await? {
                Some(entry) => {
                    self.entry_age_ms(keys, &entry, now_ms).await?
                        > self.settings.aging_threshold_ms
                }
                None => false,
            };

            let entry = if aged_normal {
                self.pop(keys, mode, Origin::Normal).await?
            } else if self.peek(keys, mode, Origin::High).await?.is_some() {
                self.pop(keys, mode, Origin::High).await?
            } else {
                self.pop(keys, mode, Origin::Normal).await?
            };
            let Some(entry) = entry else { break };

            let ledger_member = format!("{}:{}", entry.origin.as_tag(), entry.contact_id);
            let outcome = self
                .tracker
                .reserve_slot(campaign_id, &ledger_member, now_ms)
                .await?;
            match outcome {
                ReserveOutcome::Granted => {
                    let job = DialJob {
                        campaign_id: campaign_id.into_uuid(),
                        contact_id: entry.contact_id.into_uuid(),
                        origin: entry.origin,
                        attempt: entry.attempt,
                        reserved: true,
                        retry_attempt_id: None,
                        scheduled_for: None,
                    };
                    match self.queue.enqueue(job).await {
                        Ok(_) => {
                            self.kv
                                .zrem(&keys.fairness(), &entry.contact_id.to_string())
                                .await?;
                            promoted += 1;
                        }
                        Err(err) => {
                            warn!(%campaign_id, %err, "enqueue after promotion failed; rolling back");
                            self.tracker.decr_reserved(campaign_id).await?;
                            self.tracker
                                .remove_ledger_entry(campaign_id, &ledger_member)
                                .await?;
                            self.return_to_head(campaign_id, mode, entry).await?;
                            break;
                        }
                    }
                }
                ReserveOutcome::Waitlisted
                | ReserveOutcome::Paused
                | ReserveOutcome::MissingLimit => {
                    // Capacity vanished under us; put the job back where it
                    // was and signal back-off.
                    self.return_to_head(campaign_id, mode, entry).await?;
                    self.kv.set_ex(&keys.promote_gate(), "1", 2).await?;
                    break;
                }
            }
        }

        if promoted > 0 {
            info!(%campaign_id, promoted, "waitlist promotion");
        }
        Ok(promoted)
    }

    /// Repair half-written waitlist state.
    ///
    /// Three passes: markers with no list entry are pruned, list entries
    /// with no marker get one synthesized, and stale entries whose contact
    /// already reached a terminal status are purged outright.
    pub async fn compact(&self, campaign_id: CampaignId) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);

        let mut listed: Vec<(String, WaitlistEntry)> = Vec::new();
        for lane in [keys.waitlist_high(), keys.waitlist_normal()] {
            for raw in self.kv.lrange(&lane, 0, -1).await? {
                if let Some(entry) = WaitlistEntry::decode(&raw) {
                    listed.push((lane.clone(), entry));
                }
            }
        }

        let marker_keys = self.kv.scan_match(&keys.marker_pattern()).await?;
        let marker_prefix = keys.waitlist_marker("");
        let marked: Vec<String> = marker_keys
            .iter()
            .filter_map(|k| k.strip_prefix(marker_prefix.as_str()))
            .map(|s| s.to_string())
            .collect();

        // Markers pointing at nothing.
        for contact in &marked {
            if !listed.iter().any(|(_, e)| e.contact_id.to_string() == *contact) {
                debug!(%campaign_id, contact, "pruning orphan waitlist marker");
                self.kv.del(&keys.waitlist_marker(contact)).await?;
                self.kv.srem(&keys.waitlist_seen(), contact).await?;
                self.kv.zrem(&keys.fairness(), contact).await?;
            }
        }

        let now_ms = Utc::now().timestamp_millis();
        for (lane, entry) in &listed {
            let contact_key = entry.contact_id.to_string();

            if !marked.contains(&contact_key) {
                let marker = serde_json::json!({
                    "origin": entry.origin.as_tag(),
                    "enqueuedMs": entry.enqueued_ms,
                });
                self.kv
                    .set(&keys.waitlist_marker(&contact_key), &marker.to_string())
                    .await?;
            }

            if now_ms - entry.enqueued_ms > self.settings.stale_entry_ms {
                let terminal = CampaignContact::find_by_id(entry.contact_id, &self.pool)
                    .await?
                    .map(|c| c.status().is_terminal())
                    .unwrap_or(true);
                if terminal {
                    debug!(%campaign_id, contact = %contact_key, "purging stale waitlist entry");
                    self.kv.lrem(lane, 1, &entry.encode()).await?;
                    self.kv.srem(&keys.waitlist_seen(), &contact_key).await?;
                    self.kv.del(&keys.waitlist_marker(&contact_key)).await?;
                    self.kv.zrem(&keys.fairness(), &contact_key).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn lengths(&self, campaign_id: CampaignId) -> CoreResult<(i64, i64)> {
        let keys = CampaignKeys::new(campaign_id);
        let high = self.kv.llen(&keys.waitlist_high()).await?;
        let normal = self.kv.llen(&keys.waitlist_normal()).await?;
        Ok((high, normal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_policy_by_mode() {
        assert_eq!(
            origin_for(PriorityMode::Priority, 7, 5),
            Origin::High
        );
        assert_eq!(
            origin_for(PriorityMode::Priority, 5, 5),
            Origin::High
        );
        assert_eq!(
            origin_for(PriorityMode::Priority, 4, 5),
            Origin::Normal
        );
        // fifo/lifo always use the normal lane regardless of priority.
        assert_eq!(origin_for(PriorityMode::Fifo, 100, 5), Origin::Normal);
        assert_eq!(origin_for(PriorityMode::Lifo, 100, 5), Origin::Normal);
    }

    #[test]
    fn test_entry_codec_round_trip() {
        let entry = WaitlistEntry::new(ContactId::new(), 2, Origin::High);
        let raw = entry.encode();
        let back = WaitlistEntry::decode(&raw).unwrap();
        assert_eq!(back.contact_id, entry.contact_id);
        assert_eq!(back.attempt, 2);
        assert_eq!(back.origin, Origin::High);
        assert_eq!(back.enqueued_ms, entry.enqueued_ms);
    }

    #[test]
    fn test_undecodable_entries_are_none() {
        assert!(WaitlistEntry::decode("not json").is_none());
        assert!(WaitlistEntry::decode("{}").is_none());
    }
}
