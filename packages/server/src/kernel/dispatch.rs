//! Dispatch pipeline: from queued job to vendor call to released slot.
//!
//! Dispatch is at-most-once per call log. The ordering that makes that
//! hold:
//!
//! 1. pre-flight (pause flag, circuit breaker, campaign liveness)
//! 2. `reserve_slot` - the only capacity decision, made atomically in the KV
//! 3. call-log row insert (its id is the call id everywhere downstream)
//! 4. pre-dial lease, consuming the reservation in the same script
//! 5. vendor initiate; a synchronous failure force-releases immediately
//! 6. webhook upgrade to an active lease, gated on the pre-dial token
//! 7. webhook terminal status releases the slot and may schedule a retry
//!
//! A reservation that never reaches step 4 is repaired by the ledger
//! reconciler; a pre-dial lease that never reaches step 6 expires and is
//! reaped by the janitor.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dialq::{JobEnvelope, Origin, Queue};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use twilio::models::StatusCallbackPayload;

use crate::common::{CallLogId, CampaignId, ContactId, CoreError, CoreResult, RetryAttemptId};
use crate::domains::campaigns::models::{
    CallLog, CallLogStatus, Campaign, CampaignContact, CampaignStatus, ContactStatus,
    RetryAttempt, RetryStatus,
};
use crate::kernel::circuit::CircuitBreaker;
use crate::kernel::concurrency::{ConcurrencyTracker, ReserveOutcome};
use crate::kernel::retry::{FailureCategory, RetryScheduler};
use crate::kernel::traits::{BaseVendorDialer, DialParams};
use crate::kernel::waitlist::{origin_for, WaitlistEntry, WaitlistService};

/// Seconds a job waits before re-entering dispatch while the circuit is
/// open.
const CIRCUIT_BACKOFF_SECS: i64 = 5;

/// Flat outbound rate used for the per-call cost estimate; the vendor's
/// billed price lands later through reporting, not this pipeline.
const CALL_RATE_PER_MINUTE_USD: f64 = 0.014;

/// Estimated call cost from billed-minute duration.
pub fn estimate_call_price(duration_secs: i64) -> f64 {
    let billed_minutes = (duration_secs as f64 / 60.0).ceil().max(1.0);
    billed_minutes * CALL_RATE_PER_MINUTE_USD
}

/// Map a vendor callback status onto the call-log state machine.
pub fn map_vendor_status(status: &str) -> Option<CallLogStatus> {
    match status {
        "queued" => Some(CallLogStatus::Queued),
        "initiated" => Some(CallLogStatus::Initiated),
        "ringing" => Some(CallLogStatus::Ringing),
        "in-progress" | "answered" => Some(CallLogStatus::InProgress),
        "completed" => Some(CallLogStatus::Completed),
        "busy" => Some(CallLogStatus::Busy),
        "no-answer" => Some(CallLogStatus::NoAnswer),
        "failed" => Some(CallLogStatus::Failed),
        "canceled" | "cancelled" => Some(CallLogStatus::Cancelled),
        _ => None,
    }
}

/// Contact status resulting from a terminal call, factoring voicemail
/// detection.
pub fn contact_status_for_terminal(
    status: CallLogStatus,
    voicemail_detected: bool,
) -> Option<ContactStatus> {
    match status {
        CallLogStatus::Completed => Some(if voicemail_detected {
            ContactStatus::Voicemail
        } else {
            ContactStatus::Completed
        }),
        CallLogStatus::Failed => Some(ContactStatus::Failed),
        CallLogStatus::NoAnswer => Some(ContactStatus::NoAnswer),
        CallLogStatus::Busy => Some(ContactStatus::Busy),
        CallLogStatus::Cancelled => Some(ContactStatus::Skipped),
        _ => None,
    }
}

/// Failure category feeding the retry policy.
pub fn failure_category_for_terminal(
    status: CallLogStatus,
    voicemail_detected: bool,
) -> FailureCategory {
    match status {
        CallLogStatus::Completed if voicemail_detected => FailureCategory::Voicemail,
        CallLogStatus::Completed => FailureCategory::Completed,
        CallLogStatus::NoAnswer => FailureCategory::NoAnswer,
        CallLogStatus::Busy => FailureCategory::Busy,
        CallLogStatus::Failed => FailureCategory::NetworkError,
        CallLogStatus::Cancelled => FailureCategory::Completed,
        _ => FailureCategory::Completed,
    }
}

pub struct DispatchPipeline {
    pool: PgPool,
    tracker: ConcurrencyTracker,
    waitlist: WaitlistService,
    queue: Arc<dyn Queue>,
    vendor: Arc<dyn BaseVendorDialer>,
    circuit: CircuitBreaker,
    retry: RetryScheduler,
    high_priority_threshold: i32,
}

impl DispatchPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        tracker: ConcurrencyTracker,
        waitlist: WaitlistService,
        queue: Arc<dyn Queue>,
        vendor: Arc<dyn BaseVendorDialer>,
        circuit: CircuitBreaker,
        retry: RetryScheduler,
        high_priority_threshold: i32,
    ) -> Self {
        Self {
            pool,
            tracker,
            waitlist,
            queue,
            vendor,
            circuit,
            retry,
            high_priority_threshold,
        }
    }

    fn ledger_member(origin: Origin, contact_id: ContactId) -> String {
        format!("{}:{}", origin.as_tag(), contact_id)
    }

    /// Give back a reservation this job was carrying.
    async fn abandon_reservation(
        &self,
        campaign_id: CampaignId,
        origin: Origin,
        contact_id: ContactId,
    ) -> CoreResult<()> {
        self.tracker.decr_reserved(campaign_id).await?;
        self.tracker
            .remove_ledger_entry(campaign_id, &Self::ledger_member(origin, contact_id))
            .await?;
        Ok(())
    }

    /// Process one dispatch job. Returning an error redelivers the job per
    /// the queue's backoff policy, so only transient failures propagate.
    pub async fn dispatch(&self, envelope: &JobEnvelope) -> CoreResult<()> {
        let job = &envelope.job;
        let campaign_id = CampaignId::from_uuid(job.campaign_id);
        let contact_id = ContactId::from_uuid(job.contact_id);

        // Retry jobs claim their attempt row first so a cancelled retry is
        // dropped before any capacity work.
        let retry_attempt = match job.retry_attempt_id {
            Some(id) => {
                let id = RetryAttemptId::from_uuid(id);
                match RetryAttempt::begin_processing(id, &self.pool).await? {
                    Some(attempt) => Some(attempt),
                    None => {
                        debug!(retry_attempt_id = %id, "retry attempt no longer runnable; dropping job");
                        return Ok(());
                    }
                }
            }
            None => None,
        };

        let Some(campaign) = Campaign::find_by_id(campaign_id, &self.pool).await? else {
            warn!(%campaign_id, "job references missing campaign; dropping");
            if job.reserved {
                self.abandon_reservation(campaign_id, job.origin, contact_id)
                    .await?;
            }
            return Ok(());
        };

        let status = campaign.status();
        if status.is_terminal() || status == CampaignStatus::Draft {
            debug!(%campaign_id, %status, "campaign not dialable; skipping contact");
            CampaignContact::update_status(contact_id, ContactStatus::Skipped, &self.pool).await?;
            if job.reserved {
                self.abandon_reservation(campaign_id, job.origin, contact_id)
                    .await?;
            }
            if let Some(attempt) = &retry_attempt {
                RetryAttempt::mark(attempt.id, RetryStatus::Cancelled, &self.pool).await?;
            }
            return Ok(());
        }

        let Some(contact) = CampaignContact::find_by_id(contact_id, &self.pool).await? else {
            warn!(%contact_id, "job references missing contact; dropping");
            if job.reserved {
                self.abandon_reservation(campaign_id, job.origin, contact_id)
                    .await?;
            }
            return Ok(());
        };

        // A contact that already finished (e.g. dialed by another path)
        // is only re-dialed through an explicit retry attempt.
        if contact.status().is_terminal() && retry_attempt.is_none() {
            if job.reserved {
                self.abandon_reservation(campaign_id, job.origin, contact_id)
                    .await?;
            }
            return Ok(());
        }

        // Circuit open: park the job briefly. A carried reservation stays
        // held; the job still owns it when it comes back.
        if self.circuit.is_open(campaign_id).await? {
            debug!(%campaign_id, "circuit open; backing off");
            if let Some(attempt) = &retry_attempt {
                // Put the attempt back so the redelivered job can claim it.
                RetryAttempt::mark(attempt.id, RetryStatus::Scheduled, &self.pool).await?;
            }
            self.queue
                .enqueue_delayed(
                    job.clone(),
                    Utc::now() + chrono::Duration::seconds(CIRCUIT_BACKOFF_SECS),
                )
                .await?;
            return Ok(());
        }

        let mode = campaign.priority_mode();

        // Paused: back to the waitlist head with origin preserved.
        if self.tracker.is_paused(campaign_id).await? {
            if job.reserved {
                self.abandon_reservation(campaign_id, job.origin, contact_id)
                    .await?;
            }
            if let Some(attempt) = &retry_attempt {
                RetryAttempt::mark(attempt.id, RetryStatus::Scheduled, &self.pool).await?;
            }
            self.waitlist
                .return_to_head(
                    campaign_id,
                    mode,
                    WaitlistEntry::new(contact_id, job.attempt, job.origin),
                )
                .await?;
            return Ok(());
        }

        // Reserve, unless a promoter already did on our behalf.
        let origin = if job.reserved {
            job.origin
        } else {
            origin_for(mode, contact.priority, self.high_priority_threshold)
        };
        let ledger_member = Self::ledger_member(origin, contact_id);
        if !job.reserved {
            self.tracker
                .seed_limit_if_missing(campaign_id, campaign.concurrent_calls_limit as i64)
                .await?;
            let now_ms = Utc::now().timestamp_millis();
            let mut outcome = self
                .tracker
                .reserve_slot(campaign_id, &ledger_member, now_ms)
                .await?;
            if outcome == ReserveOutcome::MissingLimit {
                self.tracker
                    .set_limit(campaign_id, campaign.concurrent_calls_limit as i64)
                    .await?;
                outcome = self
                    .tracker
                    .reserve_slot(campaign_id, &ledger_member, now_ms)
                    .await?;
            }
            match outcome {
                ReserveOutcome::Granted => {}
                ReserveOutcome::Waitlisted | ReserveOutcome::MissingLimit => {
                    if let Some(attempt) = &retry_attempt {
                        RetryAttempt::mark(attempt.id, RetryStatus::Scheduled, &self.pool)
                            .await?;
                    }
                    self.waitlist
                        .push(
                            campaign_id,
                            mode,
                            WaitlistEntry::new(contact_id, job.attempt, origin),
                        )
                        .await?;
                    return Ok(());
                }
                ReserveOutcome::Paused => {
                    if let Some(attempt) = &retry_attempt {
                        RetryAttempt::mark(attempt.id, RetryStatus::Scheduled, &self.pool)
                            .await?;
                    }
                    self.waitlist
                        .return_to_head(
                            campaign_id,
                            mode,
                            WaitlistEntry::new(contact_id, job.attempt, origin),
                        )
                        .await?;
                    return Ok(());
                }
            }
        }

        // Capacity held from here on: every early exit must release it.
        let retry_of = retry_attempt.as_ref().map(|a| a.call_log_id);
        let call_log = CallLog::create_queued(
            campaign_id,
            contact_id,
            campaign.user_id,
            campaign.agent_id,
            self.vendor.from_number(),
            &contact.phone_number,
            retry_of,
            &self.pool,
        )
        .await?;
        let call_id = call_log.id.to_string();

        let predial_token = self
            .tracker
            .create_predial_lease(campaign_id, &call_id, Some(&ledger_member))
            .await?;
        CallLog::set_predial_token(call_log.id, &predial_token, &self.pool).await?;
        CampaignContact::mark_attempt(contact_id, &self.pool).await?;

        let params = DialParams {
            to: contact.phone_number.clone(),
            call_log_id: call_log.id,
            predial_token,
            machine_detection: true,
        };
        match self.vendor.initiate_call(params).await {
            Ok(vendor_call) => {
                CallLog::set_vendor_sid(call_log.id, &vendor_call.sid, &self.pool).await?;
                CallLog::transition(call_log.id, CallLogStatus::Initiated, &self.pool).await?;
                self.circuit.record_success(campaign_id).await?;
                if let Some(attempt) = &retry_attempt {
                    RetryAttempt::mark(attempt.id, RetryStatus::Completed, &self.pool).await?;
                }
                info!(
                    %campaign_id,
                    call_log_id = %call_log.id,
                    vendor_sid = %vendor_call.sid,
                    "call initiated"
                );
                Ok(())
            }
            Err(CoreError::VendorTemporary(message)) => {
                warn!(%campaign_id, call_log_id = %call_log.id, %message, "vendor temporary failure");
                self.tracker
                    .force_release_slot(campaign_id, &call_id)
                    .await?;
                CallLog::mark_failed(call_log.id, "network_error", &self.pool).await?;
                self.circuit.record_failure(campaign_id).await?;
                CampaignContact::update_status(contact_id, ContactStatus::Queued, &self.pool)
                    .await?;
                if let Some(attempt) = &retry_attempt {
                    RetryAttempt::mark(attempt.id, RetryStatus::Scheduled, &self.pool).await?;
                }
                // Redeliver through the queue's backoff.
                Err(CoreError::VendorTemporary(message))
            }
            Err(CoreError::VendorPermanent(message)) => {
                warn!(%campaign_id, call_log_id = %call_log.id, %message, "vendor permanent failure");
                self.tracker
                    .force_release_slot(campaign_id, &call_id)
                    .await?;
                CallLog::mark_failed(call_log.id, "invalid_number", &self.pool).await?;
                CampaignContact::update_status(contact_id, ContactStatus::Failed, &self.pool)
                    .await?;
                if let Some(attempt) = &retry_attempt {
                    RetryAttempt::mark(attempt.id, RetryStatus::Failed, &self.pool).await?;
                }
                self.check_campaign_completion(campaign_id).await?;
                Ok(())
            }
            Err(other) => {
                // KV/database trouble mid-dial: release and let the queue
                // redeliver.
                self.tracker
                    .force_release_slot(campaign_id, &call_id)
                    .await?;
                CallLog::mark_failed(call_log.id, "dispatch_error", &self.pool).await?;
                Err(other)
            }
        }
    }

    /// Handle a vendor status callback for a call.
    ///
    /// `token` is the pre-dial token the dispatch pipeline handed the
    /// vendor; it authenticates the callback and keys the lease upgrade.
    pub async fn handle_status_callback(
        &self,
        call_log_id: CallLogId,
        token: &str,
        payload: &StatusCallbackPayload,
    ) -> CoreResult<()> {
        let call_log = CallLog::find_by_id(call_log_id, &self.pool)
            .await?
            .ok_or(CoreError::NotFound("call log"))?;

        if call_log.predial_token.as_deref() != Some(token) {
            warn!(%call_log_id, "status callback with unknown token");
            return Err(CoreError::Forbidden);
        }

        let Some(next) = map_vendor_status(&payload.call_status) else {
            debug!(%call_log_id, status = %payload.call_status, "unmapped vendor status ignored");
            return Ok(());
        };

        let campaign_id = call_log.campaign_id;
        let call_id = call_log.id.to_string();

        if call_log.vendor_call_sid.is_none() {
            CallLog::set_vendor_sid(call_log.id, &payload.call_sid, &self.pool).await?;
        }

        if next.is_terminal() {
            return self.handle_terminal(&call_log, next, payload).await;
        }

        // Live transition. Anything past `queued` confirms the call: upgrade
        // the pre-dial lease exactly once.
        CallLog::transition(call_log.id, next, &self.pool).await?;

        if next.rank() >= CallLogStatus::Ringing.rank() && call_log.active_token.is_none() {
            match self
                .tracker
                .upgrade_to_active(campaign_id, &call_id, token)
                .await?
            {
                Some(active_token) => {
                    CallLog::set_active_token(call_log.id, &active_token, &self.pool).await?;
                    CampaignContact::update_status(
                        call_log.contact_id,
                        ContactStatus::InProgress,
                        &self.pool,
                    )
                    .await?;
                }
                None => {
                    // Token mismatch: the janitor reclaimed the slot while
                    // the vendor was connecting. The slot is gone; kill the
                    // call record and let retry policy pick the contact up.
                    warn!(%call_log_id, "pre-dial upgrade lost; releasing");
                    self.tracker
                        .force_release_slot(campaign_id, &call_id)
                        .await?;
                    CallLog::mark_failed(call_log.id, "lease_lost", &self.pool).await?;
                    return Ok(());
                }
            }
        } else if call_log.active_token.is_some() {
            // Long call: keep the active lease alive.
            self.tracker
                .refresh_active_lease(campaign_id, &call_id)
                .await?;
        }

        if payload.is_machine() {
            CallLog::record_outcome(call_log.id, None, None, true, None, None, &self.pool).await?;
            let campaign = Campaign::find_by_id(campaign_id, &self.pool).await?;
            if campaign.map(|c| c.exclude_voicemail).unwrap_or(false) {
                // Machine pickup on a voicemail-excluding campaign: hang up
                // rather than burn the slot on a message.
                if let Some(sid) = call_log.vendor_call_sid.as_deref() {
                    if let Err(err) = self.vendor.hangup_call(sid).await {
                        warn!(%call_log_id, %err, "voicemail hangup failed");
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_terminal(
        &self,
        call_log: &CallLog,
        next: CallLogStatus,
        payload: &StatusCallbackPayload,
    ) -> CoreResult<()> {
        let campaign_id = call_log.campaign_id;
        let call_id = call_log.id.to_string();

        let transitioned = CallLog::transition(call_log.id, next, &self.pool).await?;
        if transitioned.is_none() {
            // Duplicate or out-of-order terminal webhook; the slot was
            // already handled.
            debug!(call_log_id = %call_log.id, "stale terminal webhook ignored");
            return Ok(());
        }

        // Covers both lease shapes: calls that died before upgrade still
        // hold a pre-dial member.
        self.tracker
            .force_release_slot(campaign_id, &call_id)
            .await?;

        let voicemail = payload.is_machine() || call_log.voicemail_detected;
        let duration = payload.duration_secs();
        let price = match next {
            CallLogStatus::Completed => duration.map(estimate_call_price),
            _ => None,
        };
        CallLog::record_outcome(
            call_log.id,
            duration,
            payload.recording_url.as_deref(),
            voicemail,
            price,
            price.map(|_| "USD"),
            &self.pool,
        )
        .await?;

        if let Some(contact_status) = contact_status_for_terminal(next, voicemail) {
            CampaignContact::update_status(call_log.contact_id, contact_status, &self.pool)
                .await?;
        }

        info!(
            %campaign_id,
            call_log_id = %call_log.id,
            status = %next,
            duration = ?payload.duration_secs(),
            voicemail,
            "call terminal"
        );

        // Retry decision.
        let campaign = Campaign::find_by_id(campaign_id, &self.pool).await?;
        let contact = CampaignContact::find_by_id(call_log.contact_id, &self.pool).await?;
        if let (Some(campaign), Some(contact)) = (campaign, contact) {
            if campaign.status() == CampaignStatus::Active {
                let category = failure_category_for_terminal(next, voicemail);
                self.retry
                    .schedule_retry(&campaign, &contact, call_log, category)
                    .await?;
            }
        }

        self.check_campaign_completion(campaign_id).await?;
        Ok(())
    }

    /// Flip an active campaign to `completed` once nothing remains to dial.
    pub async fn check_campaign_completion(&self, campaign_id: CampaignId) -> CoreResult<()> {
        if Campaign::has_unfinished_work(campaign_id, &self.pool).await? {
            return Ok(());
        }
        if Campaign::transition(
            campaign_id,
            CampaignStatus::Active,
            CampaignStatus::Completed,
            &self.pool,
        )
        .await?
        .is_some()
        {
            info!(%campaign_id, "campaign completed");
        }
        Ok(())
    }
}

#[async_trait]
impl dialq::JobHandler for DispatchPipeline {
    async fn handle(&self, envelope: &JobEnvelope) -> anyhow::Result<()> {
        self.dispatch(envelope)
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_status_mapping() {
        assert_eq!(map_vendor_status("queued"), Some(CallLogStatus::Queued));
        assert_eq!(map_vendor_status("ringing"), Some(CallLogStatus::Ringing));
        assert_eq!(
            map_vendor_status("in-progress"),
            Some(CallLogStatus::InProgress)
        );
        assert_eq!(
            map_vendor_status("answered"),
            Some(CallLogStatus::InProgress)
        );
        assert_eq!(
            map_vendor_status("completed"),
            Some(CallLogStatus::Completed)
        );
        assert_eq!(map_vendor_status("busy"), Some(CallLogStatus::Busy));
        assert_eq!(
            map_vendor_status("no-answer"),
            Some(CallLogStatus::NoAnswer)
        );
        assert_eq!(
            map_vendor_status("canceled"),
            Some(CallLogStatus::Cancelled)
        );
        assert_eq!(map_vendor_status("something-new"), None);
    }

    #[test]
    fn test_contact_status_for_terminal() {
        assert_eq!(
            contact_status_for_terminal(CallLogStatus::Completed, false),
            Some(ContactStatus::Completed)
        );
        assert_eq!(
            contact_status_for_terminal(CallLogStatus::Completed, true),
            Some(ContactStatus::Voicemail)
        );
        assert_eq!(
            contact_status_for_terminal(CallLogStatus::NoAnswer, false),
            Some(ContactStatus::NoAnswer)
        );
        assert_eq!(
            contact_status_for_terminal(CallLogStatus::Cancelled, false),
            Some(ContactStatus::Skipped)
        );
        assert_eq!(contact_status_for_terminal(CallLogStatus::Ringing, false), None);
    }

    #[test]
    fn test_failure_category_for_terminal() {
        assert_eq!(
            failure_category_for_terminal(CallLogStatus::NoAnswer, false),
            FailureCategory::NoAnswer
        );
        assert_eq!(
            failure_category_for_terminal(CallLogStatus::Busy, false),
            FailureCategory::Busy
        );
        assert_eq!(
            failure_category_for_terminal(CallLogStatus::Failed, false),
            FailureCategory::NetworkError
        );
        assert_eq!(
            failure_category_for_terminal(CallLogStatus::Completed, true),
            FailureCategory::Voicemail
        );
        assert_eq!(
            failure_category_for_terminal(CallLogStatus::Completed, false),
            FailureCategory::Completed
        );
    }

    #[test]
    fn test_price_estimate_bills_in_minute_increments() {
        assert!((estimate_call_price(60) - 0.014).abs() < 1e-9);
        assert!((estimate_call_price(61) - 0.028).abs() < 1e-9);
        // Even a zero-second connect bills one minute.
        assert!((estimate_call_price(0) - 0.014).abs() < 1e-9);
    }

    #[test]
    fn test_ledger_member_format() {
        let contact = ContactId::new();
        let member = DispatchPipeline::ledger_member(Origin::High, contact);
        assert_eq!(member, format!("H:{}", contact));
        let member = DispatchPipeline::ledger_member(Origin::Normal, contact);
        assert_eq!(member, format!("N:{}", contact));
    }
}
