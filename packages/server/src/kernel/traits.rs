// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic. Naming
// convention: Base* for trait names.

use async_trait::async_trait;

use crate::common::{CallLogId, CoreError};

/// Parameters for one outbound dial.
#[derive(Debug, Clone)]
pub struct DialParams {
    /// E.164 destination.
    pub to: String,
    /// Call-log id; doubles as the lease call id and rides the callback URL.
    pub call_log_id: CallLogId,
    /// Pre-dial lease token, carried back by the vendor's status callbacks.
    pub predial_token: String,
    /// Ask the vendor to run answering-machine detection.
    pub machine_detection: bool,
}

/// The vendor's view of a freshly created call.
#[derive(Debug, Clone)]
pub struct VendorCall {
    pub sid: String,
    pub status: String,
}

// =============================================================================
// Vendor Dialer Trait (Infrastructure - telephony)
// =============================================================================

#[async_trait]
pub trait BaseVendorDialer: Send + Sync {
    /// Start an outbound call. Failures come back pre-classified as
    /// `VendorTemporary` or `VendorPermanent`.
    async fn initiate_call(&self, params: DialParams) -> Result<VendorCall, CoreError>;

    /// Hang up an in-flight call. Idempotent at the vendor.
    async fn hangup_call(&self, vendor_call_sid: &str) -> Result<(), CoreError>;

    /// Caller id used as the `From` of every outbound call.
    fn from_number(&self) -> &str;
}
