use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Coordination store. `redis://` for standalone, `redis+cluster://` for
    /// cluster mode.
    pub kv_url: String,
    /// Backend for the dispatch queue (standalone Redis).
    pub queue_url: String,
    pub port: u16,
    /// Static bearer token expected on every API request.
    pub api_bearer_token: String,
    /// Externally reachable base URL, used to build vendor callback URLs.
    pub public_base_url: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_from_number: String,
    pub tunables: Tunables,
}

/// Operational knobs with production defaults.
///
/// Every value can be overridden from the environment; none are required.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Max concurrent dispatch jobs executing in this worker process.
    pub worker_concurrency: usize,
    /// Pre-dial lease TTL in seconds.
    pub predial_ttl_secs: u64,
    /// Active lease TTL in seconds.
    pub active_ttl_secs: u64,
    /// Pause flag TTL in seconds. Must exceed `pause_refresh_secs`.
    pub paused_ttl_secs: u64,
    /// Cadence of the pause-flag refresher.
    pub pause_refresh_secs: u64,
    /// Promotion mutex TTL in seconds.
    pub promote_mutex_ttl_secs: u64,
    /// Waitlist age beyond which a normal-lane job outranks the high lane.
    pub aging_threshold_ms: i64,
    /// Max jobs promoted per promotion pass.
    pub promotion_batch: usize,
    /// Waitlist compactor cadence in seconds.
    pub compactor_interval_secs: u64,
    /// Lease janitor cadence in seconds.
    pub janitor_interval_secs: u64,
    /// TTL at or below which the janitor treats a lease as expiring.
    pub janitor_grace_secs: i64,
    /// Ledger reconciler cadence in seconds.
    pub ledger_interval_secs: u64,
    /// Age before a ledger entry is considered orphaned.
    pub ledger_grace_secs: u64,
    /// Queue reconciler cadence in seconds.
    pub queue_reconciler_interval_secs: u64,
    /// Heartbeat age before a claimed queue job counts as stalled.
    pub stall_threshold_secs: u64,
    /// Invariant monitor cadence in seconds.
    pub monitor_interval_secs: u64,
    /// Consecutive vendor failures before the circuit opens.
    pub circuit_threshold: i64,
    /// Seconds the circuit stays open once tripped.
    pub circuit_cooldown_secs: u64,
    /// Ramp-up marker TTL after campaign start.
    pub cold_start_ttl_secs: u64,
    /// Seconds to wait for in-flight dispatchers during shutdown/purge.
    pub shutdown_grace_secs: u64,
    /// Seconds to wait for active queue jobs during shutdown.
    pub shutdown_drain_secs: u64,
    /// Ring timeout passed to the vendor per call.
    pub dial_timeout_secs: u32,
    /// Contact priority at or above which a job enters the high lane.
    pub high_priority_threshold: i32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            worker_concurrency: 25,
            predial_ttl_secs: 45,
            active_ttl_secs: 210,
            paused_ttl_secs: 300,
            pause_refresh_secs: 60,
            promote_mutex_ttl_secs: 5,
            aging_threshold_ms: 30_000,
            promotion_batch: 10,
            compactor_interval_secs: 5,
            janitor_interval_secs: 45,
            janitor_grace_secs: 5,
            ledger_interval_secs: 5,
            ledger_grace_secs: 15,
            queue_reconciler_interval_secs: 30,
            stall_threshold_secs: 60,
            monitor_interval_secs: 120,
            circuit_threshold: 5,
            circuit_cooldown_secs: 30,
            cold_start_ttl_secs: 60,
            shutdown_grace_secs: 3,
            shutdown_drain_secs: 30,
            dial_timeout_secs: 30,
            high_priority_threshold: 5,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Tunables::default();
        let tunables = Tunables {
            worker_concurrency: env_parse("WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            predial_ttl_secs: env_parse("PREDIAL_TTL_SECS", defaults.predial_ttl_secs)?,
            active_ttl_secs: env_parse("ACTIVE_TTL_SECS", defaults.active_ttl_secs)?,
            paused_ttl_secs: env_parse("PAUSED_TTL_SECS", defaults.paused_ttl_secs)?,
            pause_refresh_secs: env_parse("PAUSE_REFRESH_SECS", defaults.pause_refresh_secs)?,
            promote_mutex_ttl_secs: env_parse(
                "PROMOTE_MUTEX_TTL_SECS",
                defaults.promote_mutex_ttl_secs,
            )?,
            aging_threshold_ms: env_parse("AGING_THRESHOLD_MS", defaults.aging_threshold_ms)?,
            promotion_batch: env_parse("PROMOTION_BATCH", defaults.promotion_batch)?,
            compactor_interval_secs: env_parse(
                "COMPACTOR_INTERVAL_SECS",
                defaults.compactor_interval_secs,
            )?,
            janitor_interval_secs: env_parse(
                "JANITOR_INTERVAL_SECS",
                defaults.janitor_interval_secs,
            )?,
            janitor_grace_secs: env_parse("JANITOR_GRACE_SECS", defaults.janitor_grace_secs)?,
            ledger_interval_secs: env_parse("LEDGER_INTERVAL_SECS", defaults.ledger_interval_secs)?,
            ledger_grace_secs: env_parse("LEDGER_GRACE_SECS", defaults.ledger_grace_secs)?,
            queue_reconciler_interval_secs: env_parse(
                "QUEUE_RECONCILER_INTERVAL_SECS",
                defaults.queue_reconciler_interval_secs,
            )?,
            stall_threshold_secs: env_parse("STALL_THRESHOLD_SECS", defaults.stall_threshold_secs)?,
            monitor_interval_secs: env_parse(
                "MONITOR_INTERVAL_SECS",
                defaults.monitor_interval_secs,
            )?,
            circuit_threshold: env_parse("CIRCUIT_THRESHOLD", defaults.circuit_threshold)?,
            circuit_cooldown_secs: env_parse(
                "CIRCUIT_COOLDOWN_SECS",
                defaults.circuit_cooldown_secs,
            )?,
            cold_start_ttl_secs: env_parse("COLD_START_TTL_SECS", defaults.cold_start_ttl_secs)?,
            shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs)?,
            shutdown_drain_secs: env_parse("SHUTDOWN_DRAIN_SECS", defaults.shutdown_drain_secs)?,
            dial_timeout_secs: env_parse("DIAL_TIMEOUT_SECS", defaults.dial_timeout_secs)?,
            high_priority_threshold: env_parse(
                "HIGH_PRIORITY_THRESHOLD",
                defaults.high_priority_threshold,
            )?,
        };

        if tunables.pause_refresh_secs >= tunables.paused_ttl_secs {
            anyhow::bail!("PAUSE_REFRESH_SECS must be less than PAUSED_TTL_SECS");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            kv_url: env::var("KV_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            queue_url: env::var("QUEUE_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            api_bearer_token: env::var("API_BEARER_TOKEN")
                .context("API_BEARER_TOKEN must be set")?,
            public_base_url: env::var("PUBLIC_BASE_URL")
                .context("PUBLIC_BASE_URL must be set")?,
            twilio_account_sid: env::var("TWILIO_ACCOUNT_SID")
                .context("TWILIO_ACCOUNT_SID must be set")?,
            twilio_auth_token: env::var("TWILIO_AUTH_TOKEN")
                .context("TWILIO_AUTH_TOKEN must be set")?,
            twilio_from_number: env::var("TWILIO_FROM_NUMBER")
                .context("TWILIO_FROM_NUMBER must be set")?,
            tunables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunables_keep_refresh_below_ttl() {
        let tunables = Tunables::default();
        assert!(tunables.pause_refresh_secs < tunables.paused_ttl_secs);
    }

    #[test]
    fn test_default_lease_ttls_are_in_range() {
        let tunables = Tunables::default();
        assert!((30..=60).contains(&tunables.predial_ttl_secs));
        assert!((180..=240).contains(&tunables.active_ttl_secs));
        assert!(tunables.promote_mutex_ttl_secs <= 5);
    }

    #[test]
    fn test_env_parse_falls_back_to_default() {
        let value: u64 = env_parse("DEFINITELY_NOT_SET_ANYWHERE_XYZ", 42).unwrap();
        assert_eq!(value, 42);
    }
}
