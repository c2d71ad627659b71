// TestDependencies - mock implementations for testing
//
// Provides mock services that can be injected into the kernel for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dialq::{DialJob, JobEnvelope, Queue, QueueError};
use uuid::Uuid;

use crate::common::CoreError;
use crate::kernel::traits::{BaseVendorDialer, DialParams, VendorCall};

// =============================================================================
// Mock Vendor Dialer
// =============================================================================

/// Failure the mock should produce on the next initiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockDialFailure {
    Temporary,
    Permanent,
}

/// Vendor dialer that records calls and answers from a script.
pub struct MockVendorDialer {
    from_number: String,
    calls: Mutex<Vec<DialParams>>,
    hangups: Mutex<Vec<String>>,
    failures: Mutex<Vec<MockDialFailure>>,
}

impl MockVendorDialer {
    pub fn new() -> Self {
        Self {
            from_number: "+15005550006".to_string(),
            calls: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failure for the next initiate call.
    pub fn fail_next(&self, failure: MockDialFailure) {
        self.failures.lock().unwrap().push(failure);
    }

    pub fn calls(&self) -> Vec<DialParams> {
        self.calls.lock().unwrap().clone()
    }

    pub fn hangups(&self) -> Vec<String> {
        self.hangups.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockVendorDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseVendorDialer for MockVendorDialer {
    async fn initiate_call(&self, params: DialParams) -> Result<VendorCall, CoreError> {
        self.calls.lock().unwrap().push(params);
        if let Some(failure) = self.failures.lock().unwrap().pop() {
            return Err(match failure {
                MockDialFailure::Temporary => {
                    CoreError::VendorTemporary("mock 503".to_string())
                }
                MockDialFailure::Permanent => {
                    CoreError::VendorPermanent("mock invalid number".to_string())
                }
            });
        }
        Ok(VendorCall {
            sid: format!("CA{}", Uuid::new_v4().simple()),
            status: "queued".to_string(),
        })
    }

    async fn hangup_call(&self, vendor_call_sid: &str) -> Result<(), CoreError> {
        self.hangups.lock().unwrap().push(vendor_call_sid.to_string());
        Ok(())
    }

    fn from_number(&self) -> &str {
        &self.from_number
    }
}

// =============================================================================
// Spy Queue (records enqueued jobs)
// =============================================================================

/// Queue spy recording every enqueue for assertion.
pub struct SpyQueue {
    jobs: Mutex<Vec<(DialJob, Option<DateTime<Utc>>)>>,
    cancelled: Mutex<Vec<Uuid>>,
    paused: Mutex<bool>,
}

impl SpyQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            paused: Mutex::new(false),
        }
    }

    pub fn jobs(&self) -> Vec<(DialJob, Option<DateTime<Utc>>)> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn has_job_for_contact(&self, contact_id: Uuid) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .any(|(job, _)| job.contact_id == contact_id)
    }

    pub fn cancelled_campaigns(&self) -> Vec<Uuid> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl Default for SpyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for SpyQueue {
    async fn enqueue(&self, job: DialJob) -> Result<Uuid, QueueError> {
        self.jobs.lock().unwrap().push((job, None));
        Ok(Uuid::new_v4())
    }

    async fn enqueue_front(&self, job: DialJob) -> Result<Uuid, QueueError> {
        self.jobs.lock().unwrap().insert(0, (job, None));
        Ok(Uuid::new_v4())
    }

    async fn enqueue_delayed(
        &self,
        job: DialJob,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid, QueueError> {
        self.jobs.lock().unwrap().push((job, Some(run_at)));
        Ok(Uuid::new_v4())
    }

    async fn pause(&self) -> Result<(), QueueError> {
        *self.paused.lock().unwrap() = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        *self.paused.lock().unwrap() = false;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        Ok(*self.paused.lock().unwrap())
    }

    async fn active_count(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    async fn waiting_count(&self) -> Result<usize, QueueError> {
        Ok(self.jobs.lock().unwrap().len())
    }

    async fn is_scheduled(&self, _job_id: Uuid) -> Result<bool, QueueError> {
        Ok(false)
    }

    async fn campaign_job_ids(&self, _campaign_id: Uuid) -> Result<Vec<Uuid>, QueueError> {
        Ok(Vec::new())
    }

    async fn scheduled_contacts(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, QueueError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(job, _)| job.campaign_id == campaign_id)
            .map(|(job, _)| job.contact_id)
            .collect())
    }

    async fn cancel_campaign_jobs(&self, campaign_id: Uuid) -> Result<u64, QueueError> {
        self.cancelled.lock().unwrap().push(campaign_id);
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|(job, _)| job.campaign_id != campaign_id);
        Ok((before - jobs.len()) as u64)
    }

    async fn take_stalled(&self, _older_than: Duration) -> Result<Vec<JobEnvelope>, QueueError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Convenience constructor used by handler tests.
pub fn spy_queue() -> Arc<SpyQueue> {
    Arc::new(SpyQueue::new())
}
