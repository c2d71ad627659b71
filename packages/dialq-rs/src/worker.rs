//! Worker pool: claims jobs and runs them through an application handler.
//!
//! Policy lives here, not in the queue: how many jobs run at once, how often
//! to poll, how many delivery attempts a failing job gets, and how fast the
//! backoff grows.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{JobEnvelope, RedisQueue};

/// Application-side job execution.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobEnvelope) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum jobs executing at once in this process.
    pub concurrency: usize,
    /// How often the claim loop wakes when the queue is idle.
    pub poll_interval: Duration,
    /// Delivery attempts per job before it is dropped.
    pub max_deliveries: u32,
    /// First redelivery delay; doubles per delivery.
    pub retry_base_delay: Duration,
    /// Heartbeat cadence for claimed jobs.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_millis(250),
            max_deliveries: 3,
            retry_base_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Redelivery delay for the given (1-based) delivery number, doubling per
/// attempt with the exponent capped so the delay cannot overflow.
fn backoff_delay(config: &WorkerConfig, delivery: u32) -> Duration {
    let exponent = delivery.saturating_sub(1).min(6);
    config.retry_base_delay * 2u32.pow(exponent)
}

pub struct Worker {
    queue: Arc<RedisQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(queue: Arc<RedisQueue>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            queue,
            handler,
            config,
            semaphore,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Start the claim loop. Calling start on a running worker is a no-op.
    pub fn start(&self) {
        let mut guard = self.handle.lock().expect("worker handle lock poisoned");
        if guard.is_some() {
            return;
        }
        let queue = self.queue.clone();
        let handler = self.handler.clone();
        let config = self.config.clone();
        let semaphore = self.semaphore.clone();
        let shutdown_rx = self.shutdown.subscribe();
        *guard = Some(tokio::spawn(run_loop(
            queue, handler, config, semaphore, shutdown_rx,
        )));
    }

    /// Signal shutdown and wait up to `timeout` for in-flight jobs to drain.
    /// Returns false if the drain timed out.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("worker handle lock poisoned").take();
        let Some(handle) = handle else { return true };
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("worker drain timed out; in-flight jobs abandoned");
                false
            }
        }
    }
}

async fn run_loop(
    queue: Arc<RedisQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        if let Err(err) = queue.promote_due(100).await {
            warn!(%err, "delayed-job promotion failed");
            continue;
        }

        // Drain the waiting list until it is empty or every slot is taken.
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            match queue.claim().await {
                Ok(Some(envelope)) => {
                    let queue = queue.clone();
                    let handler = handler.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        execute_job(queue, handler, config, envelope).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    break;
                }
                Err(err) => {
                    warn!(%err, "claim failed");
                    drop(permit);
                    break;
                }
            }
        }
    }

    // Wait for in-flight handlers before returning so stop() observes a
    // fully drained pool.
    let _ = semaphore
        .acquire_many(config.concurrency as u32)
        .await;
    debug!("worker loop drained");
}

async fn execute_job(
    queue: Arc<RedisQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    envelope: JobEnvelope,
) {
    let job_id = envelope.id;
    let campaign_id = envelope.job.campaign_id;

    let hb_queue = queue.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        loop {
            ticker.tick().await;
            if hb_queue.heartbeat(job_id).await.is_err() {
                break;
            }
        }
    });

    let result = handler.handle(&envelope).await;
    heartbeat.abort();

    match result {
        Ok(()) => {
            if let Err(err) = queue.complete(job_id, campaign_id).await {
                warn!(%job_id, %err, "failed to mark job complete");
            }
        }
        Err(err) => {
            if envelope.delivery < config.max_deliveries {
                let delay = backoff_delay(&config, envelope.delivery);
                let run_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                warn!(%job_id, %campaign_id, delivery = envelope.delivery, %err, ?delay, "job failed; redelivering");
                if let Err(err) = queue.retry_later(envelope, run_at).await {
                    warn!(%job_id, %err, "failed to schedule redelivery");
                }
            } else {
                error!(%job_id, %campaign_id, delivery = envelope.delivery, %err, "job failed permanently; dropping");
                if let Err(err) = queue.complete(job_id, campaign_id).await {
                    warn!(%job_id, %err, "failed to drop exhausted job");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_delivery() {
        let config = WorkerConfig {
            retry_base_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_exponent_is_capped() {
        let config = WorkerConfig {
            retry_base_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(backoff_delay(&config, 8), Duration::from_secs(64));
        assert_eq!(backoff_delay(&config, 100), Duration::from_secs(64));
    }

    #[test]
    fn test_default_config_is_sane() {
        let config = WorkerConfig::default();
        assert!(config.concurrency > 0);
        assert!(config.max_deliveries >= 1);
        assert!(config.heartbeat_interval > config.poll_interval);
    }
}
