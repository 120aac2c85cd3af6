//! Entry point: configuration, wiring, and the ordered shutdown sequence.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use herald::cleaner::Cleaner;
use herald::cluster::watch::KubeCluster;
use herald::config::Config;
use herald::metrics::{self, Metrics};
use herald::notifier::Notifier;
use herald::observer::Observer;
use herald::reconciler::Reconciler;
use herald::storage_monitor::StorageMonitor;
use herald::store::Store;

/// How long shutdown waits for the task loops to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Buffered cluster events between the watch tasks and the observer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "/config/herald.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("failed to load config from {config_path}: {error:#}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);
    tracing::info!(
        name = %config.app.name,
        version = %config.app.version,
        log_level = %config.app.log_level,
        "starting herald"
    );

    if config.metrics.enabled {
        if let Err(error) = metrics::install_exporter(&config.metrics.listen) {
            tracing::error!(%error, "failed to start metrics exporter");
            return ExitCode::FAILURE;
        }
    }
    let metrics = Metrics::new();

    let store = match Store::open(&config.storage.db_path).await {
        Ok(store) => store,
        Err(error) => {
            tracing::error!(%error, path = %config.storage.db_path, "failed to open database");
            return ExitCode::FAILURE;
        }
    };

    let cluster = match KubeCluster::connect(metrics.clone()).await {
        Ok(cluster) => cluster,
        Err(error) => {
            tracing::error!(%error, "failed to create kubernetes client");
            return ExitCode::FAILURE;
        }
    };

    let notifier = match Notifier::new(store.clone(), Arc::clone(&config), metrics.clone()) {
        Ok(notifier) => notifier,
        Err(error) => {
            tracing::error!(%error, "failed to build notifier");
            return ExitCode::FAILURE;
        }
    };

    // The watch tasks get their own stop channel so the event source can be
    // dried up before the rest of the pipeline is cancelled.
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (watch_stop_tx, watch_stop_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watch_handles = cluster.spawn_watchers(&config.resources, event_tx, watch_stop_rx);

    let mut tasks = JoinSet::new();
    let observer = Observer::new(
        store.clone(),
        config.annotation.clone(),
        config.payload.clone(),
        metrics.clone(),
    );
    tasks.spawn(observer.run(event_rx, shutdown_rx.clone()));
    tasks.spawn(notifier.run(shutdown_rx.clone()));

    if config.reconciliation.enabled {
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(cluster.clone()),
            Arc::clone(&config),
            metrics.clone(),
        );
        tasks.spawn(reconciler.run(shutdown_rx.clone()));
    }

    if config.retention.enabled {
        let cleaner = Cleaner::new(store.clone(), Arc::clone(&config), metrics.clone());
        tasks.spawn(cleaner.run(shutdown_rx.clone()));
    }

    let monitor = StorageMonitor::new(store.clone(), Arc::clone(&config), metrics.clone());
    tasks.spawn(monitor.run(shutdown_rx.clone()));
    drop(shutdown_rx);

    tracing::info!("herald is ready");

    wait_for_signal().await;

    tracing::info!("starting graceful shutdown");

    // Stop the watchers first: the event source dries up and the observer
    // drains whatever is still buffered.
    let _ = watch_stop_tx.send(true);
    for handle in watch_handles {
        let _ = handle.await;
    }

    // Then cancel the remaining loops and wait out the grace window.
    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "shutdown grace period elapsed, aborting remaining tasks"
        );
        tasks.shutdown().await;
    }

    store.close().await;
    tracing::info!("herald shutdown complete");
    ExitCode::SUCCESS
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = tracing_subscriber::EnvFilter::new(&config.app.log_level);
    if config.app.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(error) => {
            tracing::error!(%error, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = term.recv() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received interrupt");
}
