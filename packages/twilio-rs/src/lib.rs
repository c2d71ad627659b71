// Thin client for the Twilio Programmable Voice REST API.
// Only the surface the dialer needs: create a call, hang one up, fetch status.

use std::collections::HashMap;

pub mod models;

use reqwest::Client;

use crate::models::{CallResource, TwilioErrorBody};

/// Classified failure from the Twilio REST API.
///
/// The dispatch pipeline needs to tell transient vendor trouble (worth a
/// retry, counted against the circuit breaker) from permanent rejection
/// (bad number, auth problem) so the two are separated here rather than at
/// every call site.
#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    /// Network-level failure reaching Twilio (DNS, TLS, timeout).
    #[error("twilio request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Twilio answered with a non-success status.
    #[error("twilio returned {status}: {message}")]
    Api {
        status: u16,
        /// Twilio's own numeric error code when the body carried one.
        code: Option<i64>,
        message: String,
    },
}

impl TwilioError {
    /// True when the failure is plausibly transient and the call may be
    /// retried against the same number.
    pub fn is_temporary(&self) -> bool {
        match self {
            TwilioError::Transport(_) => true,
            TwilioError::Api { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TwilioOptions {
    pub account_sid: String,
    pub auth_token: String,
    /// E.164 caller id used as the `From` of every outbound call.
    pub from_number: String,
}

/// Parameters for one outbound call.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    /// E.164 destination.
    pub to: String,
    /// URL Twilio fetches for call instructions (TwiML or media stream).
    pub voice_url: String,
    /// URL Twilio posts status transitions to. Callers append their own
    /// correlation token as a query parameter before passing it in.
    pub status_callback_url: String,
    /// Enable answering machine detection.
    pub machine_detection: bool,
    /// Seconds to let the destination ring before giving up.
    pub timeout_secs: u32,
}

#[derive(Debug, Clone)]
pub struct TwilioService {
    options: TwilioOptions,
    client: Client,
}

impl TwilioService {
    pub fn new(options: TwilioOptions) -> Self {
        Self {
            options,
            client: Client::new(),
        }
    }

    fn calls_url(&self) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls.json",
            self.options.account_sid
        )
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls/{}.json",
            self.options.account_sid,
            urlencoding::encode(call_sid)
        )
    }

    /// Start an outbound call and return the created call resource.
    pub async fn initiate_call(&self, call: &OutboundCall) -> Result<CallResource, TwilioError> {
        let timeout = call.timeout_secs.to_string();
        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("To", &call.to);
        form.insert("From", &self.options.from_number);
        form.insert("Url", &call.voice_url);
        form.insert("StatusCallback", &call.status_callback_url);
        form.insert("StatusCallbackMethod", "POST");
        form.insert("Timeout", &timeout);
        if call.machine_detection {
            form.insert("MachineDetection", "Enable");
        }

        let response = self
            .client
            .post(self.calls_url())
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .form(&form)
            .send()
            .await?;

        Self::parse_call_response(response).await
    }

    /// Terminate an in-progress or ringing call.
    ///
    /// Twilio treats completing an already-completed call as a no-op, so this
    /// is safe to invoke more than once for the same sid.
    pub async fn hangup_call(&self, call_sid: &str) -> Result<CallResource, TwilioError> {
        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("Status", "completed");

        let response = self
            .client
            .post(self.call_url(call_sid))
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .form(&form)
            .send()
            .await?;

        Self::parse_call_response(response).await
    }

    /// Fetch the current state of a call.
    pub async fn get_call(&self, call_sid: &str) -> Result<CallResource, TwilioError> {
        let response = self
            .client
            .get(self.call_url(call_sid))
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .send()
            .await?;

        Self::parse_call_response(response).await
    }

    async fn parse_call_response(response: reqwest::Response) -> Result<CallResource, TwilioError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: Option<TwilioErrorBody> = serde_json::from_str(&body).ok();
            let (code, message) = match parsed {
                Some(e) => (e.code, e.message),
                None => (None, body),
            };
            tracing::warn!(status = status.as_u16(), ?code, %message, "twilio api error");
            return Err(TwilioError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }

        response.json::<CallResource>().await.map_err(TwilioError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16) -> TwilioError {
        TwilioError::Api {
            status,
            code: None,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_server_errors_are_temporary() {
        assert!(api_error(500).is_temporary());
        assert!(api_error(503).is_temporary());
        assert!(api_error(429).is_temporary());
    }

    #[test]
    fn test_client_errors_are_permanent() {
        assert!(!api_error(400).is_temporary());
        assert!(!api_error(401).is_temporary());
        assert!(!api_error(404).is_temporary());
    }

    #[test]
    fn test_call_url_encodes_sid() {
        let service = TwilioService::new(TwilioOptions {
            account_sid: "AC123".to_string(),
            auth_token: "token".to_string(),
            from_number: "+15005550006".to_string(),
        });
        let url = service.call_url("CA abc");
        assert!(url.contains("CA%20abc"));
        assert!(url.starts_with("https://api.twilio.com/2010-04-01/Accounts/AC123/Calls/"));
    }
}
