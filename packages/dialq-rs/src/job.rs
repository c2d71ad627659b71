//! Job payloads and envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::QueueError;

/// Which waitlist lane a job came from (or would fall back to).
///
/// `H` jobs were promoted from the high-priority lane, `N` from the normal
/// lane. The tag survives the whole dispatch round-trip so that a job which
/// has to be returned to a waitlist goes back to the lane it left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    #[serde(rename = "H")]
    High,
    #[serde(rename = "N")]
    Normal,
}

impl Origin {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Origin::High => "H",
            Origin::Normal => "N",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "H" => Some(Origin::High),
            "N" => Some(Origin::Normal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// One dispatch request: dial this contact on behalf of this campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialJob {
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub origin: Origin,
    /// Dial attempt number for the contact (1-based).
    pub attempt: i32,
    /// True when a waitlist promoter already reserved capacity for this
    /// job; the dispatcher must not reserve again.
    #[serde(default)]
    pub reserved: bool,
    /// Present when this job was produced by the retry scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt_id: Option<Uuid>,
    /// The time a delayed job was scheduled to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// A job plus the queue's own bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    /// Delivery attempt at the queue level (1-based). Distinct from
    /// `DialJob::attempt`, which counts dials of the contact.
    pub delivery: u32,
    pub enqueued_at_ms: i64,
    pub job: DialJob,
}

impl JobEnvelope {
    pub fn new(job: DialJob) -> Self {
        Self {
            id: Uuid::new_v4(),
            delivery: 1,
            enqueued_at_ms: Utc::now().timestamp_millis(),
            job,
        }
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> DialJob {
        DialJob {
            campaign_id: Uuid::new_v4(),
            contact_id: Uuid::new_v4(),
            origin: Origin::Normal,
            attempt: 1,
            reserved: false,
            retry_attempt_id: None,
            scheduled_for: None,
        }
    }

    #[test]
    fn test_envelope_round_trips_through_json() {
        let envelope = JobEnvelope::new(sample_job());
        let raw = envelope.encode().unwrap();
        let back = JobEnvelope::decode(&raw).unwrap();
        assert_eq!(back.id, envelope.id);
        assert_eq!(back.job.campaign_id, envelope.job.campaign_id);
        assert_eq!(back.job.origin, Origin::Normal);
    }

    #[test]
    fn test_origin_serializes_as_single_letter_tag() {
        let raw = serde_json::to_string(&Origin::High).unwrap();
        assert_eq!(raw, "\"H\"");
        let raw = serde_json::to_string(&Origin::Normal).unwrap();
        assert_eq!(raw, "\"N\"");
    }

    #[test]
    fn test_origin_tag_round_trip() {
        assert_eq!(Origin::from_tag("H"), Some(Origin::High));
        assert_eq!(Origin::from_tag("N"), Some(Origin::Normal));
        assert_eq!(Origin::from_tag("X"), None);
    }

    #[test]
    fn test_optional_fields_are_omitted_when_absent() {
        let envelope = JobEnvelope::new(sample_job());
        let raw = envelope.encode().unwrap();
        assert!(!raw.contains("retry_attempt_id"));
        assert!(!raw.contains("scheduled_for"));
    }
}
