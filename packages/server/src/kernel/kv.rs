//! Typed wrapper over the Redis-compatible coordination store.
//!
//! One `Kv` handle serves both standalone and cluster deployments; the two
//! differ only in how the underlying connection is built. Multi-key
//! operations rely on callers hash-tagging their keys so a cluster routes
//! them to a single slot.
//!
//! Every method can fail with [`KvError`]; callers treat failures as
//! retryable unless noted otherwise.

use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{FromRedisValue, Script};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

const CLUSTER_SCHEME: &str = "redis+cluster://";

#[derive(Debug, Error)]
pub enum KvError {
    /// The store could not be reached.
    #[error("kv store unavailable: {0}")]
    Unavailable(redis::RedisError),

    /// The store rejected or failed a command.
    #[error("kv command failed: {0}")]
    Backend(redis::RedisError),

    /// The configured URL could not be parsed.
    #[error("invalid kv url: {0}")]
    InvalidUrl(redis::RedisError),
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
            KvError::Unavailable(err)
        } else {
            KvError::Backend(err)
        }
    }
}

#[derive(Clone)]
enum KvConn {
    Standalone(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Handle to the coordination store.
///
/// Cheap to clone; every clone shares the underlying multiplexed
/// connection.
#[derive(Clone)]
pub struct Kv {
    conn: KvConn,
    /// Dedicated client for pub/sub subscriptions, which need their own
    /// connection. In cluster mode this points at the seed node.
    pubsub_client: redis::Client,
}

impl Kv {
    /// Connect using the configured URL. `redis://` selects standalone mode,
    /// `redis+cluster://` cluster mode.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        if let Some(rest) = url.strip_prefix(CLUSTER_SCHEME) {
            let node_url = format!("redis://{}", rest);
            let client = ClusterClient::new(vec![node_url.clone()]).map_err(KvError::InvalidUrl)?;
            let conn = client.get_async_connection().await?;
            let pubsub_client = redis::Client::open(node_url.as_str()).map_err(KvError::InvalidUrl)?;
            Ok(Self {
                conn: KvConn::Cluster(conn),
                pubsub_client,
            })
        } else {
            let client = redis::Client::open(url).map_err(KvError::InvalidUrl)?;
            let conn = ConnectionManager::new(client.clone()).await?;
            Ok(Self {
                conn: KvConn::Standalone(conn),
                pubsub_client: client,
            })
        }
    }

    async fn run<T: FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, KvError> {
        match self.conn.clone() {
            KvConn::Standalone(mut conn) => Ok(cmd.query_async(&mut conn).await?),
            KvConn::Cluster(mut conn) => Ok(cmd.query_async(&mut conn).await?),
        }
    }

    /// Connectivity probe.
    pub async fn ping(&self) -> Result<(), KvError> {
        let _: String = self.run(redis::cmd("PING").to_owned()).await?;
        Ok(())
    }

    // =========================================================================
    // Strings
    // =========================================================================

    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.run(redis::cmd("GET").arg(key).to_owned()).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.run(redis::cmd("SET").arg(key).arg(value).to_owned()).await
    }

    /// SET only when the key is absent. Returns true when the set happened.
    pub async fn set_nx(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let set: Option<String> = self
            .run(redis::cmd("SET").arg(key).arg(value).arg("NX").to_owned())
            .await?;
        Ok(set.is_some())
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.run(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .to_owned(),
        )
        .await
    }

    /// SET NX with a TTL; the building block for short-lived mutexes.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let set: Option<String> = self
            .run(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .to_owned(),
            )
            .await?;
        Ok(set.is_some())
    }

    pub async fn incr(&self, key: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("INCR").arg(key).to_owned()).await
    }

    pub async fn del(&self, key: &str) -> Result<u64, KvError> {
        self.run(redis::cmd("DEL").arg(key).to_owned()).await
    }

    /// Non-blocking delete of a batch of keys.
    pub async fn unlink(&self, keys: &[String]) -> Result<u64, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("UNLINK");
        for key in keys {
            cmd.arg(key);
        }
        self.run(cmd).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let n: i64 = self.run(redis::cmd("EXISTS").arg(key).to_owned()).await?;
        Ok(n == 1)
    }

    /// Remaining TTL in seconds: -2 when the key is absent, -1 when it has
    /// no expiry.
    pub async fn ttl(&self, key: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("TTL").arg(key).to_owned()).await
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let n: i64 = self
            .run(redis::cmd("EXPIRE").arg(key).arg(ttl_secs).to_owned())
            .await?;
        Ok(n == 1)
    }

    // =========================================================================
    // Sets
    // =========================================================================

    pub async fn sadd(&self, key: &str, member: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("SADD").arg(key).arg(member).to_owned()).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("SREM").arg(key).arg(member).to_owned()).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.run(redis::cmd("SMEMBERS").arg(key).to_owned()).await
    }

    pub async fn scard(&self, key: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("SCARD").arg(key).to_owned()).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let n: i64 = self
            .run(redis::cmd("SISMEMBER").arg(key).arg(member).to_owned())
            .await?;
        Ok(n == 1)
    }

    // =========================================================================
    // Lists
    // =========================================================================

    pub async fn lpush(&self, key: &str, value: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("LPUSH").arg(key).arg(value).to_owned()).await
    }

    pub async fn rpush(&self, key: &str, value: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("RPUSH").arg(key).arg(value).to_owned()).await
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<String>, KvError> {
        self.run(redis::cmd("LPOP").arg(key).to_owned()).await
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>, KvError> {
        self.run(redis::cmd("RPOP").arg(key).to_owned()).await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        self.run(
            redis::cmd("LRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .to_owned(),
        )
        .await
    }

    pub async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, KvError> {
        self.run(redis::cmd("LINDEX").arg(key).arg(index).to_owned()).await
    }

    pub async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<i64, KvError> {
        self.run(
            redis::cmd("LREM")
                .arg(key)
                .arg(count)
                .arg(value)
                .to_owned(),
        )
        .await
    }

    pub async fn llen(&self, key: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("LLEN").arg(key).to_owned()).await
    }

    // =========================================================================
    // Sorted sets
    // =========================================================================

    pub async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<i64, KvError> {
        self.run(
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .to_owned(),
        )
        .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("ZREM").arg(key).arg(member).to_owned()).await
    }

    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, KvError> {
        self.run(redis::cmd("ZSCORE").arg(key).arg(member).to_owned()).await
    }

    pub async fn zcard(&self, key: &str) -> Result<i64, KvError> {
        self.run(redis::cmd("ZCARD").arg(key).to_owned()).await
    }

    pub async fn zrange_all(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.run(redis::cmd("ZRANGE").arg(key).arg(0).arg(-1).to_owned()).await
    }

    /// Members with score at or below `max_score`, oldest first, with their
    /// scores.
    pub async fn zrangebyscore_withscores(
        &self,
        key: &str,
        max_score: i64,
    ) -> Result<Vec<(String, i64)>, KvError> {
        self.run(
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(max_score)
                .arg("WITHSCORES")
                .to_owned(),
        )
        .await
    }

    // =========================================================================
    // Scripts
    // =========================================================================

    /// Execute a Lua script with the given KEYS and ARGV. The script is
    /// loaded on first use and invoked by hash afterwards.
    pub async fn eval<T: FromRedisValue>(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<T, KvError> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        match self.conn.clone() {
            KvConn::Standalone(mut conn) => Ok(invocation.invoke_async(&mut conn).await?),
            KvConn::Cluster(mut conn) => Ok(invocation.invoke_async(&mut conn).await?),
        }
    }

    // =========================================================================
    // Scan / pub-sub
    // =========================================================================

    /// Collect keys matching a pattern via cursor iteration.
    pub async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(200)
                        .to_owned(),
                )
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let _: i64 = self
            .run(redis::cmd("PUBLISH").arg(channel).arg(payload).to_owned())
            .await?;
        Ok(())
    }

    /// Subscribe to a channel pattern. Messages arrive as
    /// `(channel, payload)` on the returned receiver; the background task
    /// ends when the receiver is dropped or the connection dies, so callers
    /// that need a durable subscription should re-subscribe on channel
    /// close.
    pub async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<(String, String)>, KvError> {
        use futures::StreamExt;

        let mut pubsub = self.pubsub_client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = msg.get_payload().unwrap_or_default();
                if tx.send((channel, payload)).await.is_err() {
                    break;
                }
            }
            warn!("pub/sub subscription stream ended");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_scheme_detection() {
        assert!(
            "redis+cluster://10.0.0.1:6379"
                .strip_prefix(CLUSTER_SCHEME)
                .is_some()
        );
        assert!("redis://localhost:6379".strip_prefix(CLUSTER_SCHEME).is_none());
    }
}
