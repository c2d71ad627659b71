//! Process-singleton background services.
//!
//! One instance per worker process owns every long-running loop: the
//! dispatch worker, the slot-available promotion listener, the waitlist
//! compactor, the janitor, both reconcilers, the invariant monitor, and the
//! pause-flag refresher. `start` and `stop` are idempotent; lifecycle is
//! init on process start and teardown during graceful shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Tunables;
use crate::domains::campaigns::models::{Campaign, CampaignStatus};
use crate::kernel::invariants::InvariantMonitor;
use crate::kernel::janitor::LeaseJanitor;
use crate::kernel::keys::CampaignKeys;
use crate::kernel::kv::Kv;
use crate::kernel::reconciler::{LedgerReconciler, QueueReconciler};
use crate::kernel::concurrency::ConcurrencyTracker;
use crate::kernel::waitlist::WaitlistService;

use std::sync::Arc;

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        debug!(service = name, "background loop stopped");
    })
}

pub struct BackgroundServices {
    kv: Kv,
    pool: PgPool,
    tracker: ConcurrencyTracker,
    waitlist: WaitlistService,
    worker: Arc<dialq::Worker>,
    janitor: LeaseJanitor,
    ledger_reconciler: LedgerReconciler,
    queue_reconciler: QueueReconciler,
    monitor: Arc<InvariantMonitor>,
    tunables: Tunables,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl BackgroundServices {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Kv,
        pool: PgPool,
        tracker: ConcurrencyTracker,
        waitlist: WaitlistService,
        worker: Arc<dialq::Worker>,
        janitor: LeaseJanitor,
        ledger_reconciler: LedgerReconciler,
        queue_reconciler: QueueReconciler,
        monitor: Arc<InvariantMonitor>,
        tunables: Tunables,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            kv,
            pool,
            tracker,
            waitlist,
            worker,
            janitor,
            ledger_reconciler,
            queue_reconciler,
            monitor,
            tunables,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Start every background loop. Safe to call more than once; only the
    /// first call has an effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.worker.start();

        let mut tasks = self.tasks.lock().expect("services task lock poisoned");

        // Slot-available promotion listener.
        {
            let kv = self.kv.clone();
            let waitlist = self.waitlist.clone();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let mut rx = match kv.psubscribe(CampaignKeys::slot_available_pattern()).await
                    {
                        Ok(rx) => rx,
                        Err(err) => {
                            warn!(%err, "slot-available subscribe failed; retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            message = rx.recv() => match message {
                                Some((channel, _payload)) => {
                                    if let Some(campaign_id) =
                                        CampaignKeys::campaign_from_channel(&channel)
                                    {
                                        if let Err(err) = waitlist.promote(campaign_id).await {
                                            warn!(%campaign_id, %err, "promotion on signal failed");
                                        }
                                    }
                                }
                                // Subscription dropped; rebuild it.
                                None => break,
                            }
                        }
                    }
                }
                debug!(service = "promotion-listener", "background loop stopped");
            }));
        }

        // Periodic compactor + fallback promotion tick.
        {
            let waitlist = self.waitlist.clone();
            let pool = self.pool.clone();
            tasks.push(spawn_periodic(
                "waitlist-compactor",
                Duration::from_secs(self.tunables.compactor_interval_secs),
                self.shutdown.subscribe(),
                move || {
                    let waitlist = waitlist.clone();
                    let pool = pool.clone();
                    async move {
                        let campaigns = match Campaign::find_with_status(
                            CampaignStatus::Active,
                            &pool,
                        )
                        .await
                        {
                            Ok(campaigns) => campaigns,
                            Err(err) => {
                                warn!(%err, "compactor campaign scan failed");
                                return;
                            }
                        };
                        for campaign in campaigns {
                            if let Err(err) = waitlist.promote(campaign.id).await {
                                warn!(campaign_id = %campaign.id, %err, "tick promotion failed");
                            }
                            if let Err(err) = waitlist.compact(campaign.id).await {
                                warn!(campaign_id = %campaign.id, %err, "compaction failed");
                            }
                        }
                    }
                },
            ));
        }

        // Lease janitor.
        {
            let janitor = self.janitor.clone();
            tasks.push(spawn_periodic(
                "lease-janitor",
                Duration::from_secs(self.tunables.janitor_interval_secs),
                self.shutdown.subscribe(),
                move || {
                    let janitor = janitor.clone();
                    async move {
                        if let Err(err) = janitor.run_once().await {
                            warn!(%err, "janitor run failed");
                        }
                    }
                },
            ));
        }

        // Reservation-ledger reconciler.
        {
            let reconciler = self.ledger_reconciler.clone();
            tasks.push(spawn_periodic(
                "ledger-reconciler",
                Duration::from_secs(self.tunables.ledger_interval_secs),
                self.shutdown.subscribe(),
                move || {
                    let reconciler = reconciler.clone();
                    async move {
                        if let Err(err) = reconciler.run_once().await {
                            warn!(%err, "ledger reconciler run failed");
                        }
                    }
                },
            ));
        }

        // Queue reconciler.
        {
            let reconciler = self.queue_reconciler.clone();
            tasks.push(spawn_periodic(
                "queue-reconciler",
                Duration::from_secs(self.tunables.queue_reconciler_interval_secs),
                self.shutdown.subscribe(),
                move || {
                    let reconciler = reconciler.clone();
                    async move {
                        if let Err(err) = reconciler.run_once().await {
                            warn!(%err, "queue reconciler run failed");
                        }
                    }
                },
            ));
        }

        // Invariant monitor.
        {
            let monitor = self.monitor.clone();
            tasks.push(spawn_periodic(
                "invariant-monitor",
                Duration::from_secs(self.tunables.monitor_interval_secs),
                self.shutdown.subscribe(),
                move || {
                    let monitor = monitor.clone();
                    async move {
                        if let Err(err) = monitor.run_once().await {
                            warn!(%err, "invariant monitor run failed");
                        }
                    }
                },
            ));
        }

        // Pause-flag refresher: paused campaigns keep their short-TTL flag
        // alive until resumed.
        {
            let tracker = self.tracker.clone();
            let pool = self.pool.clone();
            tasks.push(spawn_periodic(
                "pause-refresher",
                Duration::from_secs(self.tunables.pause_refresh_secs),
                self.shutdown.subscribe(),
                move || {
                    let tracker = tracker.clone();
                    let pool = pool.clone();
                    async move {
                        let paused = match Campaign::find_with_status(
                            CampaignStatus::Paused,
                            &pool,
                        )
                        .await
                        {
                            Ok(paused) => paused,
                            Err(err) => {
                                warn!(%err, "pause refresher scan failed");
                                return;
                            }
                        };
                        for campaign in paused {
                            if let Err(err) = tracker.set_paused(campaign.id).await {
                                warn!(campaign_id = %campaign.id, %err, "pause refresh failed");
                            }
                        }
                    }
                },
            ));
        }

        info!("background services started");
    }

    /// Stop every loop except the dispatch worker (which drains separately
    /// so in-flight jobs can finish). Idempotent.
    pub async fn stop_loops(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("services task lock poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("background services stopped");
    }

    /// Stop the dispatch worker, waiting up to `timeout` for in-flight jobs.
    /// Returns false when the drain timed out.
    pub async fn drain_worker(&self, timeout: Duration) -> bool {
        self.worker.stop(timeout).await
    }
}
