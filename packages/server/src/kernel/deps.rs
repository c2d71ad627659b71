//! Server dependencies for request handlers (using traits for testability)
//!
//! This module provides the central dependency container shared by HTTP
//! handlers and background services, plus the production adapter binding
//! the vendor-dialer trait to the Twilio client.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use twilio::{OutboundCall, TwilioService};

use crate::common::CoreError;
use crate::kernel::concurrency::ConcurrencyTracker;
use crate::kernel::dispatch::DispatchPipeline;
use crate::kernel::kv::Kv;
use crate::kernel::lifecycle::LifecycleController;
use crate::kernel::traits::{BaseVendorDialer, DialParams, VendorCall};
use crate::kernel::waitlist::WaitlistService;

// =============================================================================
// TwilioService Adapter (implements BaseVendorDialer trait)
// =============================================================================

/// Binds [`BaseVendorDialer`] to the Twilio voice client.
pub struct TwilioDialer {
    service: Arc<TwilioService>,
    from_number: String,
    /// Externally reachable base URL for webhook callbacks.
    public_base_url: String,
    dial_timeout_secs: u32,
}

impl TwilioDialer {
    pub fn new(
        service: Arc<TwilioService>,
        from_number: String,
        public_base_url: String,
        dial_timeout_secs: u32,
    ) -> Self {
        Self {
            service,
            from_number,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            dial_timeout_secs,
        }
    }
}

#[async_trait]
impl BaseVendorDialer for TwilioDialer {
    async fn initiate_call(&self, params: DialParams) -> Result<VendorCall, CoreError> {
        // The pre-dial token rides the callback URL; the webhook handler
        // presents it for the lease upgrade.
        let status_callback_url = format!(
            "{}/webhooks/twilio/status?call={}&token={}",
            self.public_base_url, params.call_log_id, params.predial_token
        );
        let voice_url = format!(
            "{}/voice/answer?call={}",
            self.public_base_url, params.call_log_id
        );

        let call = OutboundCall {
            to: params.to,
            voice_url,
            status_callback_url,
            machine_detection: params.machine_detection,
            timeout_secs: self.dial_timeout_secs,
        };
        let resource = self.service.initiate_call(&call).await?;
        Ok(VendorCall {
            sid: resource.sid,
            status: resource.status,
        })
    }

    async fn hangup_call(&self, vendor_call_sid: &str) -> Result<(), CoreError> {
        self.service.hangup_call(vendor_call_sid).await?;
        Ok(())
    }

    fn from_number(&self) -> &str {
        &self.from_number
    }
}

// =============================================================================
// ServerDeps
// =============================================================================

/// Server dependencies accessible to request handlers.
#[derive(Clone)]
pub struct ServerDeps {
    pub db_pool: PgPool,
    pub kv: Kv,
    pub queue: Arc<dyn dialq::Queue>,
    pub tracker: ConcurrencyTracker,
    pub waitlist: WaitlistService,
    pub dispatch: Arc<DispatchPipeline>,
    pub lifecycle: LifecycleController,
    pub vendor: Arc<dyn BaseVendorDialer>,
    /// Static token expected in the Authorization header.
    pub api_bearer_token: String,
}

impl ServerDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_pool: PgPool,
        kv: Kv,
        queue: Arc<dyn dialq::Queue>,
        tracker: ConcurrencyTracker,
        waitlist: WaitlistService,
        dispatch: Arc<DispatchPipeline>,
        lifecycle: LifecycleController,
        vendor: Arc<dyn BaseVendorDialer>,
        api_bearer_token: String,
    ) -> Self {
        Self {
            db_pool,
            kv,
            queue,
            tracker,
            waitlist,
            dispatch,
            lifecycle,
            vendor,
            api_bearer_token,
        }
    }
}
