//! Per-campaign slot accounting.
//!
//! A slot is held in one of three forms, always counted together against the
//! campaign's concurrency limit:
//!
//! - a **reservation** (`:reserved` counter + ledger entry) from the moment
//!   a dispatch decision grants capacity,
//! - a **pre-dial lease** (short TTL) once a call id exists and the vendor
//!   is being invoked,
//! - an **active lease** (long TTL) after the vendor confirms the call.
//!
//! Every state change that affects a grant decision runs as a single Lua
//! script, because between any two commands another worker may act on the
//! same campaign. The pre-dial → active upgrade is a compare-and-swap keyed
//! on an opaque token: only the worker holding the token can upgrade, and a
//! mismatch means the janitor already reclaimed the slot.

use lazy_static::lazy_static;
use redis::Script;
use uuid::Uuid;

use crate::common::{CampaignId, CoreResult};
use crate::kernel::keys::{self, CampaignKeys};
use crate::kernel::kv::Kv;

lazy_static! {
    /// KEYS: paused, limit, leases, reserved, ledger, cold-start
    /// ARGV: ledger member, now ms
    /// Returns "paused" | "nolimit" | "granted" | "waitlisted".
    static ref RESERVE_SLOT: Script = Script::new(
        r#"
        if redis.call('GET', KEYS[1]) then
            return 'paused'
        end
        local limit = tonumber(redis.call('GET', KEYS[2]) or '-1')
        if limit < 0 then
            return 'nolimit'
        end
        if redis.call('EXISTS', KEYS[6]) == 1 then
            limit = math.max(1, math.ceil(limit / 2))
        end
        local holders = redis.call('SCARD', KEYS[3])
        local reserved = tonumber(redis.call('GET', KEYS[4]) or '0')
        if holders + reserved < limit then
            redis.call('INCR', KEYS[4])
            redis.call('ZADD', KEYS[5], 'NX', ARGV[2], ARGV[1])
            return 'granted'
        end
        return 'waitlisted'
        "#,
    );

    /// KEYS: reserved, leases, predial lease key, ledger
    /// ARGV: predial member, token, ttl secs, ledger member ('' to skip)
    /// Returns 1 when the reserved counter was already at zero (drift).
    static ref CREATE_PREDIAL: Script = Script::new(
        r#"
        local reserved = tonumber(redis.call('GET', KEYS[1]) or '0')
        local drift = 0
        if reserved > 0 then
            redis.call('DECR', KEYS[1])
        else
            redis.call('SET', KEYS[1], '0')
            drift = 1
        end
        if ARGV[4] ~= '' then
            redis.call('ZREM', KEYS[4], ARGV[4])
        end
        redis.call('SADD', KEYS[2], ARGV[1])
        redis.call('SET', KEYS[3], ARGV[2], 'EX', tonumber(ARGV[3]))
        return drift
        "#,
    );

    /// KEYS: predial lease key, active lease key, leases
    /// ARGV: expected predial token, new active token, ttl secs,
    ///       predial member, active member
    /// Returns the new token, or '' on token mismatch.
    static ref UPGRADE_TO_ACTIVE: Script = Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if current ~= ARGV[1] then
            return ''
        end
        redis.call('SREM', KEYS[3], ARGV[4])
        redis.call('SADD', KEYS[3], ARGV[5])
        redis.call('DEL', KEYS[1])
        redis.call('SET', KEYS[2], ARGV[2], 'EX', tonumber(ARGV[3]))
        return ARGV[2]
        "#,
    );

    /// KEYS: leases, active lease key
    /// ARGV: active member
    static ref RELEASE_ACTIVE: Script = Script::new(
        r#"
        redis.call('SREM', KEYS[1], ARGV[1])
        redis.call('DEL', KEYS[2])
        return 1
        "#,
    );

    /// KEYS: leases, predial lease key, active lease key
    /// ARGV: predial member, active member
    static ref FORCE_RELEASE: Script = Script::new(
        r#"
        redis.call('SREM', KEYS[1], ARGV[1])
        redis.call('SREM', KEYS[1], ARGV[2])
        redis.call('DEL', KEYS[2])
        redis.call('DEL', KEYS[3])
        return 1
        "#,
    );

    /// KEYS: reserved
    /// Clamped decrement: an absent counter is treated as zero and the
    /// counter never goes negative.
    static ref DECR_RESERVED: Script = Script::new(
        r#"
        local reserved = tonumber(redis.call('GET', KEYS[1]) or '0')
        if reserved > 0 then
            return redis.call('DECR', KEYS[1])
        end
        redis.call('SET', KEYS[1], '0')
        return 0
        "#,
    );

    /// KEYS: mutex key
    /// ARGV: expected holder token
    /// Compare-and-delete release so a stale holder cannot free a newer
    /// holder's mutex.
    static ref RELEASE_MUTEX: Script = Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    );
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Capacity granted; the reserved counter and ledger now carry the job.
    Granted,
    /// No capacity; the job belongs on the waitlist.
    Waitlisted,
    /// The campaign's pause flag is set.
    Paused,
    /// The `:limit` key is missing; seed it from the campaign record and
    /// retry.
    MissingLimit,
}

/// Point-in-time view of a campaign's slot accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotSnapshot {
    pub active: i64,
    pub predial: i64,
    pub reserved: i64,
    /// None when the `:limit` key is absent.
    pub limit: Option<i64>,
    pub cold_start: bool,
}

impl SlotSnapshot {
    pub fn holders(&self) -> i64 {
        self.active + self.predial
    }

    /// Limit the campaign is currently allowed to dial at, after cold-start
    /// damping.
    pub fn effective_limit(&self) -> i64 {
        let limit = self.limit.unwrap_or(0);
        if self.cold_start {
            // Hold ramp-up to half the configured cap, never below one.
            ((limit + 1) / 2).max(1)
        } else {
            limit
        }
    }

    /// Slots free for promotion right now.
    pub fn free_slots(&self) -> i64 {
        (self.effective_limit() - self.holders() - self.reserved).max(0)
    }
}

/// Opaque random token guarding lease upgrades (32 hex chars).
fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Clone)]
pub struct ConcurrencyTracker {
    kv: Kv,
    predial_ttl_secs: u64,
    active_ttl_secs: u64,
    paused_ttl_secs: u64,
}

impl ConcurrencyTracker {
    pub fn new(kv: Kv, predial_ttl_secs: u64, active_ttl_secs: u64, paused_ttl_secs: u64) -> Self {
        Self {
            kv,
            predial_ttl_secs,
            active_ttl_secs,
            paused_ttl_secs,
        }
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    /// Atomically reserve capacity for one job. The ledger member records
    /// `(origin, jobId)` so reconcilers can see in-flight work; its score is
    /// the enqueue time, preserved across reissues (ZADD NX) so aging is not
    /// reset.
    pub async fn reserve_slot(
        &self,
        campaign_id: CampaignId,
        ledger_member: &str,
        now_ms: i64,
    ) -> CoreResult<ReserveOutcome> {
        let keys = CampaignKeys::new(campaign_id);
        let outcome: String = self
            .kv
            .eval(
                &RESERVE_SLOT,
                &[
                    keys.paused(),
                    keys.limit(),
                    keys.leases(),
                    keys.reserved(),
                    keys.reserved_ledger(),
                    keys.cold_start(),
                ],
                &[ledger_member.to_string(), now_ms.to_string()],
            )
            .await?;
        Ok(match outcome.as_str() {
            "granted" => ReserveOutcome::Granted,
            "paused" => ReserveOutcome::Paused,
            "nolimit" => ReserveOutcome::MissingLimit,
            _ => ReserveOutcome::Waitlisted,
        })
    }

    /// Consume a reservation into a pre-dial lease for `call_id` and return
    /// the lease token. The matching ledger entry is cleared in the same
    /// script. A reserved counter already at zero is logged as drift; the
    /// lease is still created and the reconciler re-converges the counter.
    pub async fn create_predial_lease(
        &self,
        campaign_id: CampaignId,
        call_id: &str,
        ledger_member: Option<&str>,
    ) -> CoreResult<String> {
        let keys = CampaignKeys::new(campaign_id);
        let token = mint_token();
        let drift: i64 = self
            .kv
            .eval(
                &CREATE_PREDIAL,
                &[
                    keys.reserved(),
                    keys.leases(),
                    keys.predial_lease(call_id),
                    keys.reserved_ledger(),
                ],
                &[
                    keys::predial_member(call_id),
                    token.clone(),
                    self.predial_ttl_secs.to_string(),
                    ledger_member.unwrap_or_default().to_string(),
                ],
            )
            .await?;
        if drift == 1 {
            tracing::warn!(
                %campaign_id,
                call_id,
                "reserved counter was zero at pre-dial; accounting drift"
            );
        }
        Ok(token)
    }

    /// Compare-and-swap the pre-dial lease into an active lease. Returns the
    /// new active token, or `None` when the stored token did not match -
    /// the caller lost the race and must treat the slot as gone.
    pub async fn upgrade_to_active(
        &self,
        campaign_id: CampaignId,
        call_id: &str,
        predial_token: &str,
    ) -> CoreResult<Option<String>> {
        let keys = CampaignKeys::new(campaign_id);
        let new_token = mint_token();
        let result: String = self
            .kv
            .eval(
                &UPGRADE_TO_ACTIVE,
                &[
                    keys.predial_lease(call_id),
                    keys.lease(call_id),
                    keys.leases(),
                ],
                &[
                    predial_token.to_string(),
                    new_token,
                    self.active_ttl_secs.to_string(),
                    keys::predial_member(call_id),
                    call_id.to_string(),
                ],
            )
            .await?;
        Ok(if result.is_empty() { None } else { Some(result) })
    }

    /// Release an active lease and announce the freed slot.
    pub async fn release_active(&self, campaign_id: CampaignId, call_id: &str) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        let _: i64 = self
            .kv
            .eval(
                &RELEASE_ACTIVE,
                &[keys.leases(), keys.lease(call_id)],
                &[call_id.to_string()],
            )
            .await?;
        self.publish_slot_available(campaign_id).await
    }

    /// Unconditionally drop both lease shapes for a call. Idempotent; used
    /// by the janitor, cancellation, and shutdown.
    pub async fn force_release_slot(
        &self,
        campaign_id: CampaignId,
        call_id: &str,
    ) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        let _: i64 = self
            .kv
            .eval(
                &FORCE_RELEASE,
                &[
                    keys.leases(),
                    keys.predial_lease(call_id),
                    keys.lease(call_id),
                ],
                &[keys::predial_member(call_id), call_id.to_string()],
            )
            .await?;
        self.publish_slot_available(campaign_id).await
    }

    /// Best-effort TTL extension for a long call.
    pub async fn refresh_active_lease(
        &self,
        campaign_id: CampaignId,
        call_id: &str,
    ) -> CoreResult<bool> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self
            .kv
            .expire(&keys.lease(call_id), self.active_ttl_secs)
            .await?)
    }

    /// Clamped decrement of the reserved counter.
    pub async fn decr_reserved(&self, campaign_id: CampaignId) -> CoreResult<i64> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self.kv.eval(&DECR_RESERVED, &[keys.reserved()], &[]).await?)
    }

    pub async fn remove_ledger_entry(
        &self,
        campaign_id: CampaignId,
        member: &str,
    ) -> CoreResult<bool> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self.kv.zrem(&keys.reserved_ledger(), member).await? == 1)
    }

    /// Ledger entries with enqueue time at or before `max_score_ms`.
    pub async fn ledger_entries_before(
        &self,
        campaign_id: CampaignId,
        max_score_ms: i64,
    ) -> CoreResult<Vec<(String, i64)>> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self
            .kv
            .zrangebyscore_withscores(&keys.reserved_ledger(), max_score_ms)
            .await?)
    }

    /// Number of lease holders of either shape.
    pub async fn active_calls(&self, campaign_id: CampaignId) -> CoreResult<i64> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self.kv.scard(&keys.leases()).await?)
    }

    pub async fn lease_members(&self, campaign_id: CampaignId) -> CoreResult<Vec<String>> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self.kv.smembers(&keys.leases()).await?)
    }

    pub async fn snapshot(&self, campaign_id: CampaignId) -> CoreResult<SlotSnapshot> {
        let keys = CampaignKeys::new(campaign_id);
        let members = self.kv.smembers(&keys.leases()).await?;
        let predial = members
            .iter()
            .filter(|m| keys::is_predial_member(m))
            .count() as i64;
        let active = members.len() as i64 - predial;
        let reserved = self
            .kv
            .get(&keys.reserved())
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let limit = self
            .kv
            .get(&keys.limit())
            .await?
            .and_then(|v| v.parse().ok());
        let cold_start = self.kv.exists(&keys.cold_start()).await?;
        Ok(SlotSnapshot {
            active,
            predial,
            reserved,
            limit,
            cold_start,
        })
    }

    pub async fn set_limit(&self, campaign_id: CampaignId, limit: i64) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self.kv.set(&keys.limit(), &limit.to_string()).await?)
    }

    /// Seed `:limit` from the durable record without clobbering a live
    /// value.
    pub async fn seed_limit_if_missing(
        &self,
        campaign_id: CampaignId,
        limit: i64,
    ) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        self.kv.set_nx(&keys.limit(), &limit.to_string()).await?;
        Ok(())
    }

    pub async fn set_paused(&self, campaign_id: CampaignId) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self
            .kv
            .set_ex(&keys.paused(), "1", self.paused_ttl_secs)
            .await?)
    }

    pub async fn clear_paused(&self, campaign_id: CampaignId) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        self.kv.del(&keys.paused()).await?;
        Ok(())
    }

    pub async fn is_paused(&self, campaign_id: CampaignId) -> CoreResult<bool> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self.kv.exists(&keys.paused()).await?)
    }

    pub async fn set_cold_start(&self, campaign_id: CampaignId, ttl_secs: u64) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        Ok(self.kv.set_ex(&keys.cold_start(), "1", ttl_secs).await?)
    }

    /// Take the promotion mutex. Returns the holder token, or `None` when
    /// another promoter holds it.
    pub async fn acquire_promote_mutex(
        &self,
        campaign_id: CampaignId,
        ttl_secs: u64,
    ) -> CoreResult<Option<String>> {
        let keys = CampaignKeys::new(campaign_id);
        let token = mint_token();
        let acquired = self
            .kv
            .set_nx_ex(&keys.promote_mutex(), &token, ttl_secs)
            .await?;
        Ok(acquired.then_some(token))
    }

    /// Release the promotion mutex if we still hold it.
    pub async fn release_promote_mutex(
        &self,
        campaign_id: CampaignId,
        token: &str,
    ) -> CoreResult<bool> {
        let keys = CampaignKeys::new(campaign_id);
        let released: i64 = self
            .kv
            .eval(&RELEASE_MUTEX, &[keys.promote_mutex()], &[token.to_string()])
            .await?;
        Ok(released == 1)
    }

    pub async fn publish_slot_available(&self, campaign_id: CampaignId) -> CoreResult<()> {
        let keys = CampaignKeys::new(campaign_id);
        self.kv
            .publish(&keys.slot_available_channel(), "1")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_opaque_hex() {
        let token = mint_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, mint_token());
    }

    #[test]
    fn test_snapshot_free_slots() {
        let snapshot = SlotSnapshot {
            active: 2,
            predial: 1,
            reserved: 1,
            limit: Some(10),
            cold_start: false,
        };
        assert_eq!(snapshot.holders(), 3);
        assert_eq!(snapshot.effective_limit(), 10);
        assert_eq!(snapshot.free_slots(), 6);
    }

    #[test]
    fn test_snapshot_cold_start_damps_limit() {
        let snapshot = SlotSnapshot {
            active: 0,
            predial: 0,
            reserved: 0,
            limit: Some(10),
            cold_start: true,
        };
        assert_eq!(snapshot.effective_limit(), 5);

        let tiny = SlotSnapshot {
            limit: Some(1),
            cold_start: true,
            ..Default::default()
        };
        // Damping never pushes a campaign below one slot.
        assert_eq!(tiny.effective_limit(), 1);
    }

    #[test]
    fn test_snapshot_free_slots_never_negative() {
        let snapshot = SlotSnapshot {
            active: 8,
            predial: 2,
            reserved: 3,
            limit: Some(10),
            cold_start: false,
        };
        assert_eq!(snapshot.free_slots(), 0);
    }

    #[test]
    fn test_snapshot_missing_limit_grants_nothing() {
        let snapshot = SlotSnapshot {
            active: 0,
            predial: 0,
            reserved: 0,
            limit: None,
            cold_start: false,
        };
        assert_eq!(snapshot.free_slots(), 0);
    }
}
