//! Campaign key schema.
//!
//! Every key belonging to a campaign shares the literal prefix
//! `campaign:{<id>}:`. The braces are the cluster hash-tag syntax: they pin
//! all of a campaign's keys to one slot so multi-key atomic scripts work
//! against a clustered store. This is part of the key format, not a
//! convention.

use crate::common::CampaignId;

/// Prefix on lease-set members that denote a pre-dial (not yet
/// vendor-confirmed) slot hold.
pub const PREDIAL_MEMBER_PREFIX: &str = "pre-";

#[derive(Debug, Clone)]
pub struct CampaignKeys {
    prefix: String,
    campaign_id: CampaignId,
}

impl CampaignKeys {
    pub fn new(campaign_id: CampaignId) -> Self {
        Self {
            prefix: format!("campaign:{{{}}}", campaign_id),
            campaign_id,
        }
    }

    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    fn suffixed(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// SET of lease members: `pre-<callId>` or bare `<callId>`.
    pub fn leases(&self) -> String {
        self.suffixed("leases")
    }

    /// Token string for an active lease.
    pub fn lease(&self, call_id: &str) -> String {
        self.suffixed(&format!("lease:{}", call_id))
    }

    /// Token string for a pre-dial lease.
    pub fn predial_lease(&self, call_id: &str) -> String {
        self.suffixed(&format!("lease:{}{}", PREDIAL_MEMBER_PREFIX, call_id))
    }

    /// Lease key for a set member of either shape.
    pub fn lease_for_member(&self, member: &str) -> String {
        self.suffixed(&format!("lease:{}", member))
    }

    pub fn limit(&self) -> String {
        self.suffixed("limit")
    }

    pub fn reserved(&self) -> String {
        self.suffixed("reserved")
    }

    pub fn reserved_ledger(&self) -> String {
        self.suffixed("reserved:ledger")
    }

    pub fn paused(&self) -> String {
        self.suffixed("paused")
    }

    pub fn promote_gate(&self) -> String {
        self.suffixed("promote-gate")
    }

    pub fn promote_mutex(&self) -> String {
        self.suffixed("promote-mutex")
    }

    pub fn cb_fail(&self) -> String {
        self.suffixed("cb:fail")
    }

    pub fn circuit(&self) -> String {
        self.suffixed("circuit")
    }

    pub fn fairness(&self) -> String {
        self.suffixed("fairness")
    }

    pub fn cold_start(&self) -> String {
        self.suffixed("cold-start")
    }

    pub fn waitlist_high(&self) -> String {
        self.suffixed("waitlist:high")
    }

    pub fn waitlist_normal(&self) -> String {
        self.suffixed("waitlist:normal")
    }

    pub fn waitlist_seen(&self) -> String {
        self.suffixed("waitlist:seen")
    }

    pub fn waitlist_marker(&self, job_id: &str) -> String {
        self.suffixed(&format!("waitlist:marker:{}", job_id))
    }

    /// SCAN pattern covering every per-call lease key.
    pub fn lease_pattern(&self) -> String {
        self.suffixed("lease:*")
    }

    /// SCAN pattern covering every waitlist marker key.
    pub fn marker_pattern(&self) -> String {
        self.suffixed("waitlist:marker:*")
    }

    /// SCAN pattern covering the whole campaign namespace.
    pub fn all_pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    /// Keys with fixed names, enumerated for purge. Dynamic keys (leases,
    /// markers) are discovered by SCAN.
    pub fn static_keys(&self) -> Vec<String> {
        vec![
            self.leases(),
            self.limit(),
            self.reserved(),
            self.reserved_ledger(),
            self.paused(),
            self.promote_gate(),
            self.promote_mutex(),
            self.cb_fail(),
            self.circuit(),
            self.fairness(),
            self.cold_start(),
            self.waitlist_high(),
            self.waitlist_normal(),
            self.waitlist_seen(),
        ]
    }

    /// Pub/sub channel announcing a freed slot. Channels are not hash-tagged;
    /// they are not keys.
    pub fn slot_available_channel(&self) -> String {
        format!("campaign:{}:slot-available", self.campaign_id)
    }

    /// Pattern matching every campaign's slot-available channel.
    pub fn slot_available_pattern() -> &'static str {
        "campaign:*:slot-available"
    }

    /// Campaign id embedded in a slot-available channel name.
    pub fn campaign_from_channel(channel: &str) -> Option<CampaignId> {
        let rest = channel.strip_prefix("campaign:")?;
        let id = rest.strip_suffix(":slot-available")?;
        id.parse().ok()
    }
}

/// Lease-set member for a pre-dial hold.
pub fn predial_member(call_id: &str) -> String {
    format!("{}{}", PREDIAL_MEMBER_PREFIX, call_id)
}

/// True when a lease-set member denotes a pre-dial hold.
pub fn is_predial_member(member: &str) -> bool {
    member.starts_with(PREDIAL_MEMBER_PREFIX)
}

/// Strip the pre-dial prefix, returning the bare call id.
pub fn member_call_id(member: &str) -> &str {
    member.strip_prefix(PREDIAL_MEMBER_PREFIX).unwrap_or(member)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_carry_the_hash_tag() {
        let id = CampaignId::new();
        let keys = CampaignKeys::new(id);
        let expected_prefix = format!("campaign:{{{}}}:", id);
        for key in keys.static_keys() {
            assert!(
                key.starts_with(&expected_prefix),
                "{} lacks hash-tagged prefix",
                key
            );
        }
        assert!(keys.lease("abc").starts_with(&expected_prefix));
        assert!(keys.waitlist_marker("j1").starts_with(&expected_prefix));
    }

    #[test]
    fn test_lease_keys_by_member_shape() {
        let keys = CampaignKeys::new(CampaignId::new());
        assert_eq!(keys.lease_for_member("abc"), keys.lease("abc"));
        assert_eq!(keys.lease_for_member("pre-abc"), keys.predial_lease("abc"));
    }

    #[test]
    fn test_member_helpers() {
        assert_eq!(predial_member("x"), "pre-x");
        assert!(is_predial_member("pre-x"));
        assert!(!is_predial_member("x"));
        assert_eq!(member_call_id("pre-x"), "x");
        assert_eq!(member_call_id("x"), "x");
    }

    #[test]
    fn test_channel_round_trip() {
        let id = CampaignId::new();
        let keys = CampaignKeys::new(id);
        let channel = keys.slot_available_channel();
        assert_eq!(CampaignKeys::campaign_from_channel(&channel), Some(id));
        assert_eq!(CampaignKeys::campaign_from_channel("campaign:junk"), None);
        // Channel names are deliberately not hash-tagged.
        assert!(!channel.contains('{'));
    }

    #[test]
    fn test_static_keys_cover_purge_surface() {
        let keys = CampaignKeys::new(CampaignId::new());
        let statics = keys.static_keys();
        for expected in [
            keys.leases(),
            keys.limit(),
            keys.reserved(),
            keys.reserved_ledger(),
            keys.paused(),
            keys.promote_gate(),
            keys.promote_mutex(),
            keys.cb_fail(),
            keys.circuit(),
            keys.fairness(),
            keys.cold_start(),
            keys.waitlist_high(),
            keys.waitlist_normal(),
            keys.waitlist_seen(),
        ] {
            assert!(statics.contains(&expected), "missing {}", expected);
        }
    }
}
