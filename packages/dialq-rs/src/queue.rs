//! Queue trait and the Redis implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{DialJob, JobEnvelope, QueueError};

/// Operations the application sees.
///
/// Claiming, completion, and heartbeats are worker-internal and live on
/// [`RedisQueue`] directly; this trait is the seam handed to dispatchers,
/// reconcilers, and the lifecycle controller (and to spies in tests).
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a job to the back of the queue. Returns the job id.
    async fn enqueue(&self, job: DialJob) -> Result<Uuid, QueueError>;

    /// Insert a job at the front of the queue, ahead of waiting work.
    async fn enqueue_front(&self, job: DialJob) -> Result<Uuid, QueueError>;

    /// Schedule a job for delivery at `run_at`.
    async fn enqueue_delayed(
        &self,
        job: DialJob,
        run_at: chrono::DateTime<Utc>,
    ) -> Result<Uuid, QueueError>;

    /// Stop handing out jobs. Already-claimed jobs keep running.
    async fn pause(&self) -> Result<(), QueueError>;

    /// Resume handing out jobs.
    async fn resume(&self) -> Result<(), QueueError>;

    async fn is_paused(&self) -> Result<bool, QueueError>;

    /// Number of claimed jobs currently being worked.
    async fn active_count(&self) -> Result<usize, QueueError>;

    /// Number of jobs waiting for a worker.
    async fn waiting_count(&self) -> Result<usize, QueueError>;

    /// True while the job is anywhere in the pipeline (waiting, delayed, or
    /// claimed).
    async fn is_scheduled(&self, job_id: Uuid) -> Result<bool, QueueError>;

    /// Ids of every pipeline job belonging to a campaign.
    async fn campaign_job_ids(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, QueueError>;

    /// Contact ids with a job anywhere in the pipeline for a campaign. One
    /// full pass over queue storage; meant for reconciler ticks, not hot
    /// paths.
    async fn scheduled_contacts(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, QueueError>;

    /// Remove every waiting and delayed job for a campaign. Claimed jobs are
    /// left to finish. Returns the number of jobs removed.
    async fn cancel_campaign_jobs(&self, campaign_id: Uuid) -> Result<u64, QueueError>;

    /// Remove and return claimed jobs whose heartbeat is older than
    /// `older_than` - their worker is presumed dead.
    async fn take_stalled(&self, older_than: Duration) -> Result<Vec<JobEnvelope>, QueueError>;

    /// Refuse all further enqueues and claims.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Redis-backed queue.
///
/// All keys share the `dialq:{<name>}:` hash-tagged prefix so multi-key
/// pipelines stay on one slot under cluster mode.
pub struct RedisQueue {
    conn: ConnectionManager,
    name: String,
    closed: AtomicBool,
}

impl RedisQueue {
    pub async fn connect(url: &str, name: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(QueueError::from)?;
        let conn = ConnectionManager::new(client).await.map_err(QueueError::from)?;
        Ok(Self {
            conn,
            name: name.into(),
            closed: AtomicBool::new(false),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("dialq:{{{}}}:{}", self.name, suffix)
    }

    fn campaign_key(&self, campaign_id: Uuid) -> String {
        self.key(&format!("campaign:{}", campaign_id))
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn push(&self, job: DialJob, front: bool) -> Result<Uuid, QueueError> {
        self.ensure_open()?;
        let envelope = JobEnvelope::new(job);
        let raw = envelope.encode()?;
        let mut conn = self.conn.clone();
        // Claims RPOP, so the head of the queue is the tail of the list.
        let push_cmd = if front { "RPUSH" } else { "LPUSH" };
        let _: () = redis::pipe()
            .atomic()
            .cmd(push_cmd)
            .arg(self.key("wait"))
            .arg(&raw)
            .ignore()
            .cmd("SADD")
            .arg(self.key("ids"))
            .arg(envelope.id.to_string())
            .ignore()
            .cmd("SADD")
            .arg(self.campaign_key(envelope.job.campaign_id))
            .arg(envelope.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!(job_id = %envelope.id, campaign_id = %envelope.job.campaign_id, front, "job enqueued");
        Ok(envelope.id)
    }

    /// Claim one waiting job, registering it as active with a fresh
    /// heartbeat. Returns `None` when the queue is empty, paused, or closed.
    pub async fn claim(&self) -> Result<Option<JobEnvelope>, QueueError> {
        if self.closed.load(Ordering::SeqCst) || self.is_paused().await? {
            return Ok(None);
        }
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("RPOP")
            .arg(self.key("wait"))
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else { return Ok(None) };

        let envelope = match JobEnvelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Undecodable payloads cannot be retried; drop with a trace.
                warn!(%err, "dropping undecodable queue payload");
                return Ok(None);
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.key("active"))
            .arg(envelope.id.to_string())
            .arg(&raw)
            .ignore()
            .cmd("HSET")
            .arg(self.key("active:hb"))
            .arg(envelope.id.to_string())
            .arg(now_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(Some(envelope))
    }

    /// Record a heartbeat for a claimed job.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let _: () = redis::cmd("HSET")
            .arg(self.key("active:hb"))
            .arg(job_id.to_string())
            .arg(now_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove a finished job from every index.
    pub async fn complete(&self, job_id: Uuid, campaign_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.key("active"))
            .arg(job_id.to_string())
            .ignore()
            .cmd("HDEL")
            .arg(self.key("active:hb"))
            .arg(job_id.to_string())
            .ignore()
            .cmd("SREM")
            .arg(self.key("ids"))
            .arg(job_id.to_string())
            .ignore()
            .cmd("SREM")
            .arg(self.campaign_key(campaign_id))
            .arg(job_id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Move a claimed job back to the delayed set for a later delivery
    /// attempt. The envelope keeps its id; only the delivery counter moves.
    pub async fn retry_later(
        &self,
        mut envelope: JobEnvelope,
        run_at: chrono::DateTime<Utc>,
    ) -> Result<(), QueueError> {
        envelope.delivery += 1;
        let raw = envelope.encode()?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.key("active"))
            .arg(envelope.id.to_string())
            .ignore()
            .cmd("HDEL")
            .arg(self.key("active:hb"))
            .arg(envelope.id.to_string())
            .ignore()
            .cmd("ZADD")
            .arg(self.key("delayed"))
            .arg(run_at.timestamp_millis())
            .arg(&raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Move due delayed jobs onto the waiting list. Returns how many moved.
    pub async fn promote_due(&self, limit: usize) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key("delayed"))
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(limit as i64)
            .query_async(&mut conn)
            .await?;

        let mut moved = 0;
        for raw in due {
            // ZREM doubles as the claim: whichever mover removes the member
            // owns it, so concurrent movers cannot double-deliver.
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.key("delayed"))
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            if removed == 1 {
                let _: () = redis::cmd("LPUSH")
                    .arg(self.key("wait"))
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, job: DialJob) -> Result<Uuid, QueueError> {
        self.push(job, false).await
    }

    async fn enqueue_front(&self, job: DialJob) -> Result<Uuid, QueueError> {
        self.push(job, true).await
    }

    async fn enqueue_delayed(
        &self,
        job: DialJob,
        run_at: chrono::DateTime<Utc>,
    ) -> Result<Uuid, QueueError> {
        self.ensure_open()?;
        let mut envelope = JobEnvelope::new(job);
        envelope.job.scheduled_for = Some(run_at);
        let raw = envelope.encode()?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(self.key("delayed"))
            .arg(run_at.timestamp_millis())
            .arg(&raw)
            .ignore()
            .cmd("SADD")
            .arg(self.key("ids"))
            .arg(envelope.id.to_string())
            .ignore()
            .cmd("SADD")
            .arg(self.campaign_key(envelope.job.campaign_id))
            .arg(envelope.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!(job_id = %envelope.id, %run_at, "job scheduled");
        Ok(envelope.id)
    }

    async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key("paused"))
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.key("paused"))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.key("paused"))
            .query_async(&mut conn)
            .await?;
        Ok(exists == 1)
    }

    async fn active_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("HLEN")
            .arg(self.key("active"))
            .query_async(&mut conn)
            .await?;
        Ok(count as usize)
    }

    async fn waiting_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("LLEN")
            .arg(self.key("wait"))
            .query_async(&mut conn)
            .await?;
        Ok(count as usize)
    }

    async fn is_scheduled(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let member: i64 = redis::cmd("SISMEMBER")
            .arg(self.key("ids"))
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(member == 1)
    }

    async fn campaign_job_ids(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.campaign_key(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(raw.iter().filter_map(|id| id.parse().ok()).collect())
    }

    async fn scheduled_contacts(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, QueueError> {
        let mut conn = self.conn.clone();
        let mut contacts = Vec::new();

        let waiting: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("wait"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.key("delayed"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let active: Vec<String> = redis::cmd("HVALS")
            .arg(self.key("active"))
            .query_async(&mut conn)
            .await?;

        for raw in waiting.iter().chain(delayed.iter()).chain(active.iter()) {
            if let Ok(envelope) = JobEnvelope::decode(raw) {
                if envelope.job.campaign_id == campaign_id {
                    contacts.push(envelope.job.contact_id);
                }
            }
        }
        Ok(contacts)
    }

    async fn cancel_campaign_jobs(&self, campaign_id: Uuid) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut removed: u64 = 0;

        let waiting: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("wait"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        for raw in waiting {
            let Ok(envelope) = JobEnvelope::decode(&raw) else { continue };
            if envelope.job.campaign_id != campaign_id {
                continue;
            }
            let gone: i64 = redis::cmd("LREM")
                .arg(self.key("wait"))
                .arg(1)
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            if gone > 0 {
                removed += gone as u64;
                let _: () = redis::cmd("SREM")
                    .arg(self.key("ids"))
                    .arg(envelope.id.to_string())
                    .query_async(&mut conn)
                    .await?;
            }
        }

        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.key("delayed"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        for raw in delayed {
            let Ok(envelope) = JobEnvelope::decode(&raw) else { continue };
            if envelope.job.campaign_id != campaign_id {
                continue;
            }
            let gone: i64 = redis::cmd("ZREM")
                .arg(self.key("delayed"))
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            if gone > 0 {
                removed += gone as u64;
                let _: () = redis::cmd("SREM")
                    .arg(self.key("ids"))
                    .arg(envelope.id.to_string())
                    .query_async(&mut conn)
                    .await?;
            }
        }

        let _: () = redis::cmd("DEL")
            .arg(self.campaign_key(campaign_id))
            .query_async(&mut conn)
            .await?;

        debug!(%campaign_id, removed, "cancelled campaign jobs");
        Ok(removed)
    }

    async fn take_stalled(&self, older_than: Duration) -> Result<Vec<JobEnvelope>, QueueError> {
        let mut conn = self.conn.clone();
        let cutoff_ms = Utc::now().timestamp_millis() - older_than.as_millis() as i64;

        let heartbeats: Vec<(String, i64)> = redis::cmd("HGETALL")
            .arg(self.key("active:hb"))
            .query_async(&mut conn)
            .await?;

        let mut stalled = Vec::new();
        for (job_id, beat_ms) in heartbeats {
            if beat_ms > cutoff_ms {
                continue;
            }
            let raw: Option<String> = redis::cmd("HGET")
                .arg(self.key("active"))
                .arg(&job_id)
                .query_async(&mut conn)
                .await?;
            let _: () = redis::pipe()
                .atomic()
                .cmd("HDEL")
                .arg(self.key("active"))
                .arg(&job_id)
                .ignore()
                .cmd("HDEL")
                .arg(self.key("active:hb"))
                .arg(&job_id)
                .ignore()
                .cmd("SREM")
                .arg(self.key("ids"))
                .arg(&job_id)
                .ignore()
                .query_async(&mut conn)
                .await?;
            if let Some(raw) = raw {
                match JobEnvelope::decode(&raw) {
                    Ok(envelope) => {
                        let _: () = redis::cmd("SREM")
                            .arg(self.campaign_key(envelope.job.campaign_id))
                            .arg(&job_id)
                            .query_async(&mut conn)
                            .await?;
                        stalled.push(envelope);
                    }
                    Err(err) => warn!(%job_id, %err, "stalled job payload undecodable"),
                }
            }
        }
        Ok(stalled)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
