// Wire types for the Programmable Voice REST API and its status webhooks.

use serde::{Deserialize, Serialize};

/// A call resource as returned by `POST /Calls.json` and `GET /Calls/<sid>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResource {
    pub sid: String,
    pub status: String,
    pub to: String,
    pub from: String,
    /// Seconds, present once the call has ended. Twilio serializes this as a
    /// string.
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub answered_by: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub price_unit: Option<String>,
}

impl CallResource {
    pub fn duration_secs(&self) -> Option<i64> {
        self.duration.as_deref().and_then(|d| d.parse().ok())
    }
}

/// Error body Twilio returns alongside non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct TwilioErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<u16>,
}

/// Form-encoded payload of a status callback POST.
///
/// Field names follow Twilio's PascalCase convention; everything beyond the
/// sid and status is optional because Twilio only sends what applies to the
/// transition at hand.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusCallbackPayload {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
    #[serde(rename = "CallDuration", default)]
    pub call_duration: Option<String>,
    #[serde(rename = "RecordingUrl", default)]
    pub recording_url: Option<String>,
    #[serde(rename = "AnsweredBy", default)]
    pub answered_by: Option<String>,
    #[serde(rename = "SipResponseCode", default)]
    pub sip_response_code: Option<String>,
}

impl StatusCallbackPayload {
    pub fn duration_secs(&self) -> Option<i64> {
        self.call_duration.as_deref().and_then(|d| d.parse().ok())
    }

    /// True when answering machine detection flagged a machine pickup.
    pub fn is_machine(&self) -> bool {
        self.answered_by
            .as_deref()
            .map(|a| a.starts_with("machine"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_resource_duration_parses() {
        let resource = CallResource {
            sid: "CA1".to_string(),
            status: "completed".to_string(),
            to: "+14155550101".to_string(),
            from: "+15005550006".to_string(),
            duration: Some("42".to_string()),
            direction: None,
            answered_by: None,
            price: None,
            price_unit: None,
        };
        assert_eq!(resource.duration_secs(), Some(42));
    }

    #[test]
    fn test_status_callback_machine_detection() {
        let json = serde_json::json!({
            "CallSid": "CA1",
            "CallStatus": "in-progress",
            "AnsweredBy": "machine_start"
        });
        let payload: StatusCallbackPayload = serde_json::from_value(json).unwrap();
        assert!(payload.is_machine());

        let json = serde_json::json!({
            "CallSid": "CA1",
            "CallStatus": "in-progress",
            "AnsweredBy": "human"
        });
        let payload: StatusCallbackPayload = serde_json::from_value(json).unwrap();
        assert!(!payload.is_machine());
    }
}
