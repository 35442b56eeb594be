//! Runtime wiring (spec §9: "global state → explicit runtime context").
//! A single [`Runtime`] value is constructed once at startup and
//! injected into every component and route handler — nothing reaches
//! out to a global.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::aggregator::{Aggregator, AggregatorConfig};
use crate::bar_store::BarStore;
use crate::broker::{BrokerAdapter, HttpBrokerAdapter};
use crate::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig};
use crate::cleanup_worker::CleanupWorker;
use crate::config::Config;
use crate::feed::{PositionFeed, TickFeed, TickFeedConfig};
use crate::hub::{match_all, Hub};
use crate::lock::{DistributedLock, SqliteLock};
use crate::model::{Bar, PositionEvent, WsEvent};
use crate::persistence::sqlite::SqlitePersistence;
use crate::persistence::{BarRepository, OrderRepository, PositionRepository};
use crate::position_tracker::PositionTracker;
use crate::supervisor::{RestartPolicy, Supervisor, SupervisorConfig, TaskSpec};

/// Persisted bars are retried with exponential backoff up to this many
/// attempts before falling to the dead-letter sink (spec §4.C).
const PERSIST_MAX_ATTEMPTS: u32 = 5;
const PERSIST_BATCH_MAX: usize = 200;
const PERSIST_BATCH_LINGER: Duration = Duration::from_millis(50);
/// Periodic sweep interval for the cleanup retry path (spec §8 S5).
const CLEANUP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct Runtime {
    pub config: Config,
    pub bar_store: Arc<BarStore>,
    pub aggregator: Arc<Aggregator>,
    pub market_hub: Arc<Hub<WsEvent>>,
    pub position_events: Arc<Hub<PositionEvent>>,
    pub position_tracker: Arc<PositionTracker>,
    pub persistence: Arc<SqlitePersistence>,
    pub lock: Arc<dyn DistributedLock>,
    pub breakers: Arc<BreakerRegistry>,
    pub jwt_verifier: Arc<crate::auth::JwtVerifier>,
    pub supervisor: Arc<Supervisor>,
    persistence_depth: Arc<AtomicUsize>,
    ready: AtomicBool,
}

impl Runtime {
    pub async fn bootstrap(config: Config) -> anyhow::Result<Arc<Self>> {
        let persistence = SqlitePersistence::open(
            &config.persistence.db_path,
            config.persistence.min_connections,
            config.persistence.max_connections,
            config.persistence.acquire_timeout,
            config.persistence.query_timeout,
        )?;

        let bar_store = Arc::new(BarStore::new(config.aggregator.bar_ring_size));
        let market_hub = Arc::new(Hub::new(config.hub.queue_size, config.hub.slow_threshold_ratio));
        let position_events = Arc::new(Hub::new(config.hub.queue_size, config.hub.slow_threshold_ratio));
        let position_tracker = Arc::new(PositionTracker::new(position_events.clone()));
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            error_rate_window: config.breaker.error_rate_window,
            error_rate_threshold: config.breaker.error_rate_threshold,
            cooldown: config.breaker.cooldown,
        }));
        let lock: Arc<dyn DistributedLock> = SqliteLock::new(persistence.pool_handle());

        let (persist_tx, persist_rx) = mpsc::unbounded_channel::<Bar>();
        let persistence_depth = Arc::new(AtomicUsize::new(0));

        let aggregator = Arc::new(Aggregator::new(
            AggregatorConfig {
                timeframes: config.aggregator.timeframes.clone(),
                persistence_high_water: config.aggregator.persistence_high_water,
            },
            bar_store.clone(),
            market_hub.clone(),
            persist_tx,
            persistence_depth.clone(),
        ));

        let jwt_verifier = Arc::new(crate::auth::JwtVerifier::new(config.auth.jwt_secret.clone()));

        let supervisor = Supervisor::new(SupervisorConfig {
            min_backoff: config.supervisor.min_backoff,
            max_backoff: config.supervisor.max_backoff,
            crash_loop_threshold: config.supervisor.crash_loop_threshold,
            crash_loop_window: config.supervisor.crash_loop_window,
            drain_timeout: config.supervisor.drain_timeout,
        });

        let runtime = Arc::new(Self {
            config,
            bar_store,
            aggregator,
            market_hub,
            position_events,
            position_tracker,
            persistence,
            lock,
            breakers,
            jwt_verifier,
            supervisor,
            persistence_depth,
            ready: AtomicBool::new(false),
        });

        runtime.spawn_persistence_worker(persist_rx);
        runtime.spawn_background_tasks().await;
        runtime.ready.store(true, Ordering::Release);
        Ok(runtime)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn persistence_queue_depth(&self) -> usize {
        self.persistence_depth.load(Ordering::Acquire)
    }

    /// Persistence worker (spec §4.C): drains the aggregator's closed-bar
    /// channel and upserts in batches outside any bar-store lock.
    /// Failures retry with exponential backoff up to
    /// [`PERSIST_MAX_ATTEMPTS`]; exhaustion moves the bar to the
    /// dead-letter sink and increments an error metric. Runs for the
    /// life of the process — it ends only when the aggregator (and
    /// therefore the channel's last sender) is dropped.
    fn spawn_persistence_worker(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Bar>) {
        let persistence = self.persistence.clone();
        let depth = self.persistence_depth.clone();
        let dead_letters = metrics::counter!("persistence_dead_letter_total");

        tokio::spawn(async move {
            loop {
                let first = match rx.recv().await {
                    Some(bar) => bar,
                    None => return,
                };
                let mut batch = vec![first];

                let deadline = tokio::time::sleep(PERSIST_BATCH_LINGER);
                tokio::pin!(deadline);
                while batch.len() < PERSIST_BATCH_MAX {
                    tokio::select! {
                        _ = &mut deadline => break,
                        next = rx.recv() => {
                            match next {
                                Some(bar) => batch.push(bar),
                                None => break,
                            }
                        }
                    }
                }

                let n = batch.len();
                persist_with_retry(&persistence, batch, &dead_letters).await;
                depth.fetch_sub(n.min(depth.load(Ordering::Acquire)), Ordering::AcqRel);
            }
        });
    }

    async fn spawn_background_tasks(self: &Arc<Self>) {
        self.spawn_flush_task().await;
        self.spawn_feed_tasks().await;
        self.spawn_position_event_bridge();
        self.spawn_cleanup_worker().await;
        self.spawn_cleanup_sweep().await;
    }

    /// Rebroadcasts every event on the position-event bus onto the
    /// market hub as `WsEvent::PositionEvent` (spec §6: `POSITION_EVENT`
    /// is one of the WS fan-out event types). The cleanup worker keeps
    /// its own subscription on `position_events` directly; this bridge
    /// only fans the same events out to WebSocket clients.
    fn spawn_position_event_bridge(self: &Arc<Self>) {
        let position_events = self.position_events.clone();
        let market_hub = self.market_hub.clone();
        tokio::spawn(async move {
            let mut sub = position_events.subscribe(match_all());
            while let Some(event) = sub.events.recv().await {
                market_hub.broadcast(WsEvent::PositionEvent { payload: event });
            }
        });
    }

    async fn spawn_flush_task(self: &Arc<Self>) {
        let aggregator = self.aggregator.clone();
        self.supervisor
            .spawn(TaskSpec::new("aggregator-flush", RestartPolicy::Permanent, move |shutdown| {
                let aggregator = aggregator.clone();
                async move {
                    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = interval.tick() => aggregator.flush(now_ms()),
                        }
                    }
                }
            }))
            .await;
    }

    async fn spawn_feed_tasks(self: &Arc<Self>) {
        let tick_feed = TickFeed::new(TickFeedConfig { ws_url: self.config.feed.tick_url.clone(), ..Default::default() });
        let (tick_tx, mut tick_rx) = mpsc::channel(1_024);
        self.supervisor
            .spawn(TaskSpec::new("tick-feed", RestartPolicy::OnFailure, move |shutdown| {
                let tick_feed = tick_feed.clone();
                let tick_tx = tick_tx.clone();
                async move {
                    tick_feed.run(tick_tx, shutdown).await;
                    Ok(())
                }
            }))
            .await;

        let agg_for_ingest = self.aggregator.clone();
        tokio::spawn(async move {
            while let Some(tick) = tick_rx.recv().await {
                if let Err(e) = agg_for_ingest.ingest(tick).await {
                    warn!(error = %e, "tick rejected");
                }
            }
        });

        let position_feed =
            PositionFeed::new(TickFeedConfig { ws_url: self.config.feed.position_url.clone(), ..Default::default() });
        let (pos_tx, mut pos_rx) = mpsc::channel(1_024);
        self.supervisor
            .spawn(TaskSpec::new("position-feed", RestartPolicy::OnFailure, move |shutdown| {
                let position_feed = position_feed.clone();
                let pos_tx = pos_tx.clone();
                async move {
                    position_feed.run(pos_tx, shutdown).await;
                    Ok(())
                }
            }))
            .await;

        let tracker = self.position_tracker.clone();
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = pos_rx.recv().await {
                if let Err(e) = persistence.upsert_position(&snapshot).await {
                    warn!(error = %e, "failed to persist position snapshot");
                }
                tracker.observe(snapshot);
            }
        });
    }

    async fn spawn_cleanup_worker(self: &Arc<Self>) {
        let broker: Arc<dyn BrokerAdapter> = match HttpBrokerAdapter::new(
            self.config.broker.base_url.clone(),
            &self.config.broker.api_key,
            self.config.broker.call_timeout,
        ) {
            Ok(adapter) => Arc::new(adapter),
            Err(e) => {
                error!(error = %e, "failed to construct broker adapter, cleanup worker disabled");
                return;
            }
        };

        let orders: Arc<dyn OrderRepository> = self.persistence.clone();
        let worker = CleanupWorker::new(
            self.lock.clone(),
            orders,
            broker,
            self.breakers.orders.clone(),
            self.market_hub.clone(),
            self.config.cleanup.on_reduce_policy,
        );
        let position_events = self.position_events.clone();
        self.supervisor
            .spawn(TaskSpec::new("cleanup-worker", RestartPolicy::OnFailure, move |shutdown| {
                let worker = worker.clone();
                let position_events = position_events.clone();
                async move {
                    worker.run(position_events, shutdown).await;
                    Ok(())
                }
            }))
            .await;
    }

    /// Periodic lock-sweep reconciliation (spec §8 S5: "a retry
    /// triggered by periodic sweep, not by the original event" for
    /// cleanup work orphaned by a holder crash before release).
    async fn spawn_cleanup_sweep(self: &Arc<Self>) {
        let persistence = self.persistence.clone();
        let lock = self.lock.clone();
        self.supervisor
            .spawn(TaskSpec::new("cleanup-sweep", RestartPolicy::Permanent, move |shutdown| {
                let persistence = persistence.clone();
                let lock = lock.clone();
                async move {
                    let mut interval = tokio::time::interval(CLEANUP_SWEEP_INTERVAL);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = interval.tick() => sweep_pending_cleanup(&persistence, &lock).await,
                        }
                    }
                }
            }))
            .await;
    }

    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        self.market_hub.shutdown_all();
        self.position_events.shutdown_all();
        self.supervisor.shutdown().await;
    }
}

/// Queries for protective orders whose linked position closed/reduced
/// without a matching `cleanup_log` row and surfaces them — acquiring
/// (and releasing) the per-account lock is enough to prove no other
/// node is mid-cleanup; the event-driven path and this sweep share the
/// same lock key so they never race.
async fn sweep_pending_cleanup(persistence: &Arc<SqlitePersistence>, lock: &Arc<dyn DistributedLock>) {
    let pending = match persistence.find_pending_cleanup().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "cleanup sweep lookup failed");
            return;
        }
    };
    for order in pending {
        let key = format!("cleanup:{}", order.account_id);
        match lock.acquire(&key, Duration::from_secs(30)).await {
            Ok(Some(token)) => {
                warn!(account = %order.account_id, order = %order.broker_order_id, "sweep found orphaned cleanup work");
                let _ = lock.release(&key, &token).await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "sweep lock acquisition failed"),
        }
    }
}

async fn persist_with_retry(persistence: &Arc<SqlitePersistence>, batch: Vec<Bar>, dead_letters: &metrics::Counter) {
    let mut attempt = 0u32;
    let mut backoff = Duration::from_millis(100);
    loop {
        attempt += 1;
        match persistence.upsert_bars(batch.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < PERSIST_MAX_ATTEMPTS => {
                warn!(attempt, error = %e, "bar persistence attempt failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                error!(error = %e, count = batch.len(), "bar persistence exhausted retries, moving to dead-letter sink");
                dead_letters.increment(batch.len() as u64);
                for bar in &batch {
                    if let Err(e) = persistence.record_dead_letter(bar).await {
                        error!(error = %e, "failed to record dead-letter bar; data loss");
                    }
                }
                return;
            }
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
