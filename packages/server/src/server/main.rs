// Main entry point for the dial-dispatch server

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dialer_core::domains::campaigns::models::Campaign;
use dialer_core::kernel::{
    BackgroundServices, CircuitBreaker, ConcurrencyTracker, DispatchPipeline, InvariantMonitor,
    Kv, LeaseJanitor, LedgerReconciler, LifecycleController, QueueReconciler, ServerDeps,
    ShutdownCoordinator, TwilioDialer, WaitlistService, WaitlistSettings,
};
use dialer_core::kernel::retry::RetryScheduler;
use dialer_core::server::build_app;
use dialer_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twilio::{TwilioOptions, TwilioService};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dialer_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting campaign dial-dispatch server");

    // Startup-config errors exit 2, shutdown failures exit 1.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "configuration error");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "server exited with error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let tunables = config.tunables.clone();

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    // Coordination store and dispatch queue
    let kv = Kv::connect(&config.kv_url)
        .await
        .context("Failed to connect to KV store")?;
    let redis_queue = Arc::new(
        dialq::RedisQueue::connect(&config.queue_url, "dial")
            .await
            .context("Failed to connect to queue backend")?,
    );
    let queue: Arc<dyn dialq::Queue> = redis_queue.clone();

    // Kernel components, leaves first
    let tracker = ConcurrencyTracker::new(
        kv.clone(),
        tunables.predial_ttl_secs,
        tunables.active_ttl_secs,
        tunables.paused_ttl_secs,
    );
    let waitlist = WaitlistService::new(
        kv.clone(),
        tracker.clone(),
        queue.clone(),
        pool.clone(),
        WaitlistSettings {
            aging_threshold_ms: tunables.aging_threshold_ms,
            promotion_batch: tunables.promotion_batch,
            promote_mutex_ttl_secs: tunables.promote_mutex_ttl_secs,
            high_priority_threshold: tunables.high_priority_threshold,
            ..WaitlistSettings::default()
        },
    );
    let circuit = CircuitBreaker::new(
        kv.clone(),
        tunables.circuit_threshold,
        tunables.circuit_cooldown_secs,
    );
    let retry = RetryScheduler::new(
        pool.clone(),
        queue.clone(),
        tunables.high_priority_threshold,
    );

    let twilio = Arc::new(TwilioService::new(TwilioOptions {
        account_sid: config.twilio_account_sid.clone(),
        auth_token: config.twilio_auth_token.clone(),
        from_number: config.twilio_from_number.clone(),
    }));
    let vendor = Arc::new(TwilioDialer::new(
        twilio,
        config.twilio_from_number.clone(),
        config.public_base_url.clone(),
        tunables.dial_timeout_secs,
    ));

    let dispatch = Arc::new(DispatchPipeline::new(
        pool.clone(),
        tracker.clone(),
        waitlist.clone(),
        queue.clone(),
        vendor.clone(),
        circuit,
        retry.clone(),
        tunables.high_priority_threshold,
    ));

    let worker = Arc::new(dialq::Worker::new(
        redis_queue.clone(),
        dispatch.clone(),
        dialq::WorkerConfig {
            concurrency: tunables.worker_concurrency,
            ..dialq::WorkerConfig::default()
        },
    ));

    let janitor = LeaseJanitor::new(
        kv.clone(),
        tracker.clone(),
        waitlist.clone(),
        pool.clone(),
        tunables.janitor_grace_secs,
        tunables.high_priority_threshold,
    );
    let ledger_reconciler = LedgerReconciler::new(
        tracker.clone(),
        queue.clone(),
        waitlist.clone(),
        pool.clone(),
        Duration::from_secs(tunables.ledger_grace_secs),
    );
    let queue_reconciler = QueueReconciler::new(
        tracker.clone(),
        queue.clone(),
        waitlist.clone(),
        pool.clone(),
        Duration::from_secs(tunables.stall_threshold_secs),
    );
    let monitor = Arc::new(InvariantMonitor::new(
        kv.clone(),
        tracker.clone(),
        pool.clone(),
    ));

    let services = Arc::new(BackgroundServices::new(
        kv.clone(),
        pool.clone(),
        tracker.clone(),
        waitlist.clone(),
        worker,
        janitor,
        ledger_reconciler,
        queue_reconciler,
        monitor,
        tunables.clone(),
    ));

    let lifecycle = LifecycleController::new(
        pool.clone(),
        kv.clone(),
        tracker.clone(),
        queue.clone(),
        vendor.clone(),
        retry,
        tunables.cold_start_ttl_secs,
        tunables.shutdown_drain_secs,
        tunables.high_priority_threshold,
    );

    let deps = ServerDeps::new(
        pool.clone(),
        kv.clone(),
        queue.clone(),
        tracker.clone(),
        waitlist.clone(),
        dispatch,
        lifecycle,
        vendor,
        config.api_bearer_token.clone(),
    );

    // Re-seed KV limits for campaigns that were running before a restart.
    for campaign in Campaign::find_running(&pool).await? {
        tracker
            .seed_limit_if_missing(campaign.id, campaign.concurrent_calls_limit as i64)
            .await
            .ok();
    }

    services.start();

    let app = build_app(deps);
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // SIGTERM/SIGINT received: run the ordered shutdown sequence.
    let coordinator = ShutdownCoordinator {
        kv,
        pool,
        queue,
        tracker,
        waitlist,
        services,
        grace: Duration::from_secs(tunables.shutdown_grace_secs),
        drain: Duration::from_secs(tunables.shutdown_drain_secs),
    };
    coordinator.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
