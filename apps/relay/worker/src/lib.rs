//! Relay Worker Service
//!
//! A background worker that dispatches tasks from the shared coordination
//! store.
//!
//! ## Architecture
//!
//! ```text
//! Store queues (tasks:pending:primary / tasks:pending:retry)
//!   ↓ (adaptive blocking pop, W concurrent dispatchers)
//! Dispatcher → breaker gate → rate-limit gate → handler
//!   ↓ outcome routing
//! COMPLETED | scheduled retry (tasks:scheduled) | DLQ (dlq:tasks)
//! ```
//!
//! ## Features
//!
//! - Horizontal scaling: any number of worker processes share the queues
//! - Orphan recovery on startup (crash-abandoned PENDING tasks)
//! - Scheduler loop promoting due retries (idempotent across peers)
//! - TTL'd heartbeats and periodic queue snapshot events
//! - Control channel for fleet-wide circuit reset/open
//! - Graceful shutdown with a bounded drain grace
//! - Health, readiness, queue status, and DLQ admin endpoints

mod handlers;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use core_config::{Environment, FromEnv, app_info};
use eyre::{Result, WrapErr};
use store::{StoreClient, StoreConfig};
use task_broker::{
    BrokerConfig, CircuitBreaker, ControlCommand, Dispatcher, DlqManager, EventPublisher,
    HealthState, HeartbeatWriter, Ingress, ProviderProbe, ProviderStateCache, RateLimiter,
    RetryRouter, Scheduler, TaskRepository, full_admin_router, keys, metrics,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub use handlers::{EchoHandler, default_registry};
pub use task_broker::HandlerRegistry;

/// Start the health and admin HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Queue status: `/queue/status`, worker liveness: `/workers`
/// - Prometheus metrics: `/metrics`
/// - DLQ admin: `/admin/dlq`, `/admin/dlq/stats`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app = full_admin_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the worker with the given handler registry.
pub async fn run(registry: HandlerRegistry) -> Result<()> {
    run_with_probe(registry, None).await
}

/// Run the worker, optionally with a provider probe for the periodic
/// state refresher.
///
/// This is the main entry point. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Connects to the coordination store with retry
/// 3. Recovers orphaned tasks from previous runs
/// 4. Spawns dispatchers, scheduler, heartbeat, snapshot publisher, and
///    the control listener
/// 5. Drains gracefully on SIGINT/SIGTERM
pub async fn run_with_probe(
    registry: HandlerRegistry,
    probe: Option<Arc<dyn ProviderProbe>>,
) -> Result<()> {
    // Initialize tracing (env-aware: JSON for prod, pretty for dev)
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    // Initialize Prometheus metrics
    metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting relay worker");
    info!("Environment: {:?}", environment);

    // Health server port (default 8082)
    let health_port: u16 = std::env::var("WORKER_HEALTH_PORT")
        .or_else(|_| std::env::var("HEALTH_PORT"))
        .unwrap_or_else(|_| "8082".to_string())
        .parse()
        .unwrap_or(8082);

    // Load configuration from the environment
    let store_config = StoreConfig::from_env().wrap_err("Failed to load store configuration")?;
    let broker_config =
        Arc::new(BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?);

    // Connect to the store with retry logic
    info!("Connecting to store...");
    let store_client = store::connect_with_retry(store_config, None)
        .await
        .wrap_err("Failed to connect to store")?;
    info!("Connected to store successfully");

    info!(
        worker_id = %broker_config.worker_id,
        concurrency = broker_config.concurrency,
        task_types = ?registry.task_types(),
        "Worker configuration loaded"
    );

    // Wire up the broker components
    let registry = Arc::new(registry);
    let repo = TaskRepository::new(store_client.clone());
    let events = EventPublisher::new(store_client.clone());
    let breaker = Arc::new(CircuitBreaker::new(broker_config.breaker.clone()));
    let limiter = RateLimiter::new(store_client.clone(), 10.0, 1.0);
    let provider = ProviderStateCache::new(
        store_client.clone(),
        std::time::Duration::from_secs(broker_config.provider_fresh_secs),
        broker_config.provider_circuit_threshold,
    );
    let router = RetryRouter::new(
        repo.clone(),
        events.clone(),
        std::time::Duration::from_secs(broker_config.max_task_age_secs),
        broker_config.retry_warn_depth,
        broker_config.retry_crit_depth,
    );
    let dlq = DlqManager::new(store_client.clone(), repo.clone());
    let ingress = Ingress::new(
        repo.clone(),
        dlq.clone(),
        events.clone(),
        Arc::clone(&registry),
        Arc::clone(&broker_config),
    );
    let in_flight = Arc::new(AtomicUsize::new(0));

    // Recover tasks abandoned by a previous run before accepting new work
    match ingress.requeue_orphaned().await {
        Ok(0) => {}
        Ok(count) => info!(count, "Recovered orphaned tasks on startup"),
        Err(e) => warn!(error = %e, "Orphan recovery failed on startup"),
    }

    // Set up the shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    // Health and admin server
    let health_state = HealthState {
        store: store_client.clone(),
        ingress: ingress.clone(),
        dlq: dlq.clone(),
        app_name: app_info.name.to_string(),
        app_version: app_info.version.to_string(),
        heartbeat_period_secs: broker_config.heartbeat_period_secs,
        heartbeat_ttl_factor: broker_config.heartbeat_ttl_factor,
    };
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    // Background loops
    let scheduler = Scheduler::new(repo.clone(), events.clone(), Arc::clone(&broker_config));
    {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await });
    }

    let heartbeat = HeartbeatWriter::new(
        store_client.clone(),
        broker_config.worker_id.clone(),
        broker_config.heartbeat_period_secs,
        broker_config.heartbeat_ttl_factor,
        Arc::clone(&breaker),
        Arc::clone(&in_flight),
    );
    {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { heartbeat.run(shutdown).await });
    }

    {
        let repo = repo.clone();
        let events = events.clone();
        let config = Arc::clone(&broker_config);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { snapshot_loop(repo, events, config, shutdown).await });
    }

    {
        let store_client = store_client.clone();
        let breaker = Arc::clone(&breaker);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { control_listener(store_client, breaker, shutdown).await });
    }

    {
        let store_client = store_client.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { store_health_loop(store_client, shutdown).await });
    }

    if let Some(probe) = probe {
        let provider = provider.clone();
        let fresh_secs = broker_config.provider_fresh_secs;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { provider_refresh_loop(provider, probe, fresh_secs, shutdown).await });
    }

    // Dispatchers, supervised: a panicked loop is restarted
    let dispatcher = Dispatcher::new(
        store_client.clone(),
        repo.clone(),
        Arc::clone(&registry),
        Arc::clone(&breaker),
        limiter.clone(),
        provider.clone(),
        router.clone(),
        events.clone(),
        Arc::clone(&broker_config),
        Arc::clone(&in_flight),
    );

    info!("Starting dispatchers...");
    let mut dispatchers: JoinSet<()> = JoinSet::new();
    for _ in 0..broker_config.concurrency {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown_rx.clone();
        dispatchers.spawn(async move { dispatcher.run(shutdown).await });
    }

    let mut shutdown_watch = shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown_watch.changed() => {
                if *shutdown_watch.borrow() {
                    break;
                }
            }
            joined = dispatchers.join_next() => {
                match joined {
                    None => break,
                    Some(result) => {
                        if *shutdown_rx.borrow() {
                            continue;
                        }
                        match result {
                            Err(e) if e.is_panic() => {
                                error!("Dispatcher panicked, restarting");
                            }
                            _ => warn!("Dispatcher exited unexpectedly, restarting"),
                        }
                        let dispatcher = dispatcher.clone();
                        let shutdown = shutdown_rx.clone();
                        dispatchers.spawn(async move { dispatcher.run(shutdown).await });
                    }
                }
            }
        }
    }

    // Drain in-flight work within the grace period, then cut it loose;
    // anything lost is recovered by the next start's orphan requeue.
    info!(
        grace_secs = broker_config.shutdown_grace_secs,
        "Draining dispatchers"
    );
    let drained = tokio::time::timeout(broker_config.shutdown_grace(), async {
        while dispatchers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Drain grace elapsed, aborting remaining dispatchers");
        dispatchers.abort_all();
        while dispatchers.join_next().await.is_some() {}
    }

    info!("Relay worker stopped");
    Ok(())
}

/// Publish a full queue snapshot on a fixed period so reconnecting event
/// subscribers converge.
async fn snapshot_loop(
    repo: TaskRepository,
    events: EventPublisher,
    config: Arc<BrokerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = std::time::Duration::from_secs(config.snapshot_period_secs);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match repo.queue_snapshot().await {
            Ok(snapshot) => {
                metrics::set_queue_depths(&snapshot.depths);
                let ratio = task_broker::adaptive_retry_ratio(
                    snapshot.depths.retry,
                    config.retry_warn_depth,
                    config.retry_crit_depth,
                );
                events.queue_snapshot(snapshot, ratio).await;
            }
            Err(e) => warn!(error = %e, "Queue snapshot failed"),
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(period) => {}
        }
    }
}

/// Apply fleet-wide circuit control broadcasts to this worker's breaker.
async fn control_listener(
    store_client: StoreClient,
    breaker: Arc<CircuitBreaker>,
    mut shutdown: watch::Receiver<bool>,
) {
    use futures::StreamExt;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut pubsub = match store_client.subscribe(keys::CONTROL_CHANNEL).await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                warn!(error = %e, "Control subscription failed, retrying");
                tokio::select! {
                    _ = shutdown.changed() => continue,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                }
            }
        };

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!("Control subscription closed, resubscribing");
                        break;
                    };
                    let Ok(payload) = message.get_payload::<String>() else {
                        continue;
                    };
                    match serde_json::from_str::<ControlCommand>(&payload) {
                        Ok(ControlCommand::ResetAllCircuits) => {
                            info!("Control: resetting circuit breaker");
                            breaker.reset();
                        }
                        Ok(ControlCommand::OpenAllCircuits) => {
                            info!("Control: forcing circuit breaker open");
                            breaker.force_open();
                        }
                        Err(e) => warn!(error = %e, "Unparseable control message"),
                    }
                }
            }
        }
    }
}

/// Ping the store on the configured interval; reconnection itself is the
/// connection manager's job, this loop just makes outages visible.
async fn store_health_loop(store_client: StoreClient, mut shutdown: watch::Receiver<bool>) {
    let period =
        std::time::Duration::from_secs(store_client.config().health_check_interval_secs.max(1));

    loop {
        if *shutdown.borrow() {
            break;
        }

        match store_client.ping().await {
            Ok(latency) => {
                tracing::debug!(latency_ms = latency.as_millis() as u64, "Store ping ok");
            }
            Err(e) => warn!(error = %e, "Store ping failed"),
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(period) => {}
        }
    }
}

/// Periodically refresh the shared provider state through the probe.
async fn provider_refresh_loop(
    provider: ProviderStateCache,
    probe: Arc<dyn ProviderProbe>,
    fresh_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = std::time::Duration::from_secs(fresh_secs.max(1));

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = provider.get_state(false, probe.as_ref()).await {
            warn!(error = %e, "Provider state refresh failed");
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(period) => {}
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
