//! Core daemon implementation
//! Wires the registry, connection factory and the two background loops

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use shrinkwatch_system::{
    maintenance_pass, Compactor, ConnectionFactory, DbAccess, EntryOutcome, EvictReason,
    PassReport, TrackingOptions, WatchRegistry,
};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigManager, DaemonConfig};
use crate::metrics::{MetricsCollector, MetricsStats, PassKind};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Outcomes published by the background loops
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    Compacted { path: PathBuf, duration: Duration },
    CompactionFailed { path: PathBuf, error: String },
    Evicted { path: PathBuf, reason: EvictReason },
    PassCompleted { kind: PassKind, entries: usize },
}

/// Main daemon orchestrator
pub struct Daemon {
    config_manager: ConfigManager,
    registry: Arc<WatchRegistry>,
    access: Arc<DbAccess>,
    metrics_collector: Arc<MetricsCollector>,
    event_sender: broadcast::Sender<DaemonEvent>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    compacting: bool,
}

impl Daemon {
    /// Create a new daemon instance. The compaction and maintenance loops
    /// start here, once, when compaction is needed.
    pub async fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.get_config().await;
        ConfigManager::validate(&config)?;

        let factory = Arc::new(ConnectionFactory::new(config.connection.clone()));
        let registry = Arc::new(WatchRegistry::new());
        for path in &config.registry.seed_paths {
            if !registry.register(path) {
                debug!(path = %path.display(), "Seed path not tracked");
            }
        }

        let compacting = config.compaction_needed();
        let access = Arc::new(DbAccess::new(
            Arc::clone(&factory),
            Arc::clone(&registry),
            TrackingOptions {
                writes: compacting,
                reads: compacting && config.compaction.track_reads,
            },
        ));

        let (event_sender, _) = broadcast::channel(256);

        let mut daemon = Self {
            config_manager,
            registry,
            access,
            metrics_collector: Arc::new(MetricsCollector::new()),
            event_sender,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            compacting,
        };

        if compacting {
            let compactor = Arc::new(Compactor::new(factory, Arc::clone(&daemon.registry)));
            daemon.start_compaction_loop(compactor);
            daemon.start_maintenance_loop();
        } else {
            info!("Compaction not needed for the configured pragmas, background loops not started");
        }

        Ok(daemon)
    }

    /// Run the daemon until a termination signal or cancellation
    pub async fn run(mut self) -> Result<()> {
        info!("Shrinkwatch daemon starting...");

        if self.config_manager.config_path().is_some() {
            self.config_manager
                .start_hot_reload(self.shutdown.clone())
                .await?;
        }
        self.start_config_monitor();

        info!(
            tracked = self.registry.len(),
            compacting = self.compacting,
            "Shrinkwatch daemon started successfully"
        );

        tokio::select! {
            _ = shutdown_signal() => {
                info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                info!("Received internal shutdown signal");
            }
        }

        self.shutdown().await
    }

    fn start_compaction_loop(&mut self, compactor: Arc<Compactor>) {
        let config = self.config_manager.shared();
        let metrics = Arc::clone(&self.metrics_collector);
        let events = self.event_sender.clone();
        let shutdown = self.shutdown.clone();

        self.tasks.push(tokio::spawn(async move {
            Self::compaction_loop(compactor, config, metrics, events, shutdown).await;
        }));

        info!("Started compaction loop");
    }

    async fn compaction_loop(
        compactor: Arc<Compactor>,
        config: Arc<RwLock<DaemonConfig>>,
        metrics: Arc<MetricsCollector>,
        events: broadcast::Sender<DaemonEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            // Re-read each pass so hot-reloaded timings take effect
            let (policy, pass_interval) = {
                let config = config.read().await;
                (config.compaction.policy(), config.compaction.pass_interval())
            };

            let started = Instant::now();
            let report = compactor
                .run_pass(&policy, SystemTime::now(), &shutdown)
                .await;
            metrics.record_pass(PassKind::Compaction, &report, started.elapsed());
            metrics.update_registry_size(compactor.registry().len());
            Self::publish(&events, PassKind::Compaction, &report);

            if report.cancelled {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pass_interval) => {}
            }
        }

        debug!("Compaction loop stopped");
    }

    fn start_maintenance_loop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let config = self.config_manager.shared();
        let metrics = Arc::clone(&self.metrics_collector);
        let events = self.event_sender.clone();
        let shutdown = self.shutdown.clone();

        self.tasks.push(tokio::spawn(async move {
            loop {
                let (retention, interval) = {
                    let config = config.read().await;
                    (config.maintenance.retention(), config.maintenance.interval())
                };

                let started = Instant::now();
                let report =
                    maintenance_pass(&registry, retention, SystemTime::now(), &shutdown).await;
                metrics.record_pass(PassKind::Maintenance, &report, started.elapsed());
                metrics.update_registry_size(registry.len());
                Self::publish(&events, PassKind::Maintenance, &report);

                if report.cancelled {
                    break;
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            debug!("Maintenance loop stopped");
        }));

        info!("Started registry maintenance loop");
    }

    /// Log configuration changes that only apply after a restart
    fn start_config_monitor(&mut self) {
        let mut config_changes = self.config_manager.subscribe_changes();
        let shutdown = self.shutdown.clone();
        let connection = self.access.factory().config().clone();

        self.tasks.push(tokio::spawn(async move {
            loop {
                let new_config = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = config_changes.recv() => match changed {
                        Ok(config) => config,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                info!("Configuration changed, timings apply from the next pass");
                if new_config.connection.clone().normalized() != connection {
                    warn!("Connection settings changed; restart to apply them");
                }
            }
        }));

        info!("Started configuration monitoring");
    }

    fn publish(events: &broadcast::Sender<DaemonEvent>, kind: PassKind, report: &PassReport) {
        for entry in &report.entries {
            let event = match &entry.outcome {
                EntryOutcome::Compacted(duration) => DaemonEvent::Compacted {
                    path: entry.path.clone(),
                    duration: *duration,
                },
                EntryOutcome::Failed(e) => {
                    warn!(path = %entry.path.display(), "Compaction failed: {}", e);
                    DaemonEvent::CompactionFailed {
                        path: entry.path.clone(),
                        error: e.to_string(),
                    }
                }
                EntryOutcome::Evicted(reason) => DaemonEvent::Evicted {
                    path: entry.path.clone(),
                    reason: *reason,
                },
                _ => continue,
            };

            // No subscribers is fine
            let _ = events.send(event);
        }

        let _ = events.send(DaemonEvent::PassCompleted {
            kind,
            entries: report.entries.len(),
        });
    }

    /// Query/write access wired to this daemon's registry
    pub fn access(&self) -> Arc<DbAccess> {
        Arc::clone(&self.access)
    }

    pub fn registry(&self) -> Arc<WatchRegistry> {
        Arc::clone(&self.registry)
    }

    /// Subscribe to background loop outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_sender.subscribe()
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether the background loops were started
    pub fn is_compacting(&self) -> bool {
        self.compacting
    }

    /// Stop the background loops and wait for them to finish
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Starting graceful shutdown...");

        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Graceful shutdown completed");
        Ok(())
    }

    /// Get daemon statistics
    pub fn get_stats(&self) -> DaemonStats {
        DaemonStats {
            tracked_files: self.registry.len(),
            registrations: self.registry.registrations(),
            evictions: self.registry.evictions(),
            compacting: self.compacting,
            metrics: self.metrics_collector.get_stats(),
        }
    }
}

/// Daemon statistics
#[derive(Debug, Clone)]
pub struct DaemonStats {
    pub tracked_files: usize,
    pub registrations: u64,
    pub evictions: u64,
    pub compacting: bool,
    pub metrics: MetricsStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use tempfile::TempDir;

    fn fast_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.compaction.idle_threshold_secs = 0;
        config.compaction.pass_interval_ms = 20;
        config.compaction.entry_pause_ms = 0;
        config.maintenance.interval_ms = 20;
        config.connection.busy_timeout_ms = 0;
        config
    }

    async fn next_matching<F>(events: &mut broadcast::Receiver<DaemonEvent>, pred: F) -> DaemonEvent
    where
        F: Fn(&DaemonEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for daemon event")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_file_compacted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idle.sqlite");
        Connection::open(&path)
            .unwrap()
            .execute_batch("create table t (x integer); insert into t values (1);")
            .unwrap();

        let daemon = Daemon::new(ConfigManager::with_config(fast_config()))
            .await
            .unwrap();
        assert!(daemon.is_compacting());

        let mut events = daemon.subscribe();
        assert!(daemon.registry().register(&path));

        let event = next_matching(&mut events, |e| matches!(e, DaemonEvent::Compacted { .. })).await;
        match event {
            DaemonEvent::Compacted { path: compacted, .. } => assert_eq!(compacted, path),
            other => panic!("unexpected event: {:?}", other),
        }

        // Compaction keeps the entry tracked
        assert!(daemon.registry().contains(&path));
        daemon.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deleted_file_evicted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.sqlite");

        let daemon = Daemon::new(ConfigManager::with_config(fast_config()))
            .await
            .unwrap();
        let mut events = daemon.subscribe();
        daemon.registry().register(&path);

        let event = next_matching(&mut events, |e| matches!(e, DaemonEvent::Evicted { .. })).await;
        match event {
            DaemonEvent::Evicted { path: evicted, reason } => {
                assert_eq!(evicted, path);
                assert_eq!(reason, EvictReason::Missing);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(!daemon.registry().contains(&path));
        assert!(daemon.get_stats().evictions >= 1);
        daemon.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_auto_vacuum_skips_loops() {
        let mut config = fast_config();
        config.connection.pragmas = vec!["PRAGMA auto_vacuum = FULL".to_string()];

        let daemon = Daemon::new(ConfigManager::with_config(config)).await.unwrap();
        assert!(!daemon.is_compacting());
        assert!(daemon.tasks.is_empty());

        // Writes are not tracked when nothing would compact them
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auto.sqlite");
        daemon
            .access()
            .execute_non_query("create table t (x integer);", &path)
            .unwrap();
        assert!(daemon.registry().is_empty());

        daemon.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_seed_paths_and_shutdown() {
        let mut config = fast_config();
        config.registry.seed_paths = vec![PathBuf::from("seed.db"), PathBuf::from("seed.db-wal")];

        let daemon = Daemon::new(ConfigManager::with_config(config)).await.unwrap();
        // The side-car seed is rejected
        assert_eq!(daemon.get_stats().registrations, 1);
        let token = daemon.shutdown_token();

        tokio::time::timeout(Duration::from_secs(5), daemon.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = DaemonConfig::default();
        config.compaction.pass_interval_ms = 0;

        assert!(Daemon::new(ConfigManager::with_config(config)).await.is_err());
    }
}
