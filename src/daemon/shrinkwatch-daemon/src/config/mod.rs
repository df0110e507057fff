//! Configuration management with hot-reload support
//! Only handles configuration loading and validation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shrinkwatch_core::{ConnectionConfig, DEFAULT_DRIVER};
use shrinkwatch_system::CompactionPolicy;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Main daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub compaction: CompactionConfig,
    pub maintenance: MaintenanceConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Enable Prometheus metrics endpoint
    pub enable_metrics: bool,
    /// Metrics bind address
    pub metrics_bind_address: String,
    /// Metrics port
    pub metrics_port: u16,
}

/// Compaction daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Run the compaction daemon at all
    pub enabled: bool,
    /// Files written within this window are considered active
    pub idle_threshold_secs: u64,
    /// Rest between full passes over the registry
    pub pass_interval_ms: u64,
    /// Pause between registry entries within a pass
    pub entry_pause_ms: u64,
    /// Upper bound for a single VACUUM
    pub statement_timeout_secs: u64,
    /// Register files touched by reads as well as writes
    pub track_reads: bool,
}

/// Registry maintenance configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Rest between maintenance passes
    pub interval_ms: u64,
    /// Entries untouched for this long stop being tracked
    pub retention_secs: u64,
}

/// Registry seeding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Database files tracked from startup
    pub seed_paths: Vec<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (pretty, compact, full)
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_bind_address: "127.0.0.1".to_string(),
            metrics_port: 9187,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_threshold_secs: 15 * 60,
            pass_interval_ms: 15_000,
            entry_pause_ms: 100,
            statement_timeout_secs: 5 * 60,
            track_reads: true,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            retention_secs: 75 * 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl CompactionConfig {
    pub fn policy(&self) -> CompactionPolicy {
        CompactionPolicy {
            idle_threshold: Duration::from_secs(self.idle_threshold_secs),
            entry_pause: Duration::from_millis(self.entry_pause_ms),
            statement_timeout: Duration::from_secs(self.statement_timeout_secs),
        }
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl DaemonConfig {
    /// Compaction runs when enabled and the pragma set does not already
    /// request continuous auto-vacuum.
    pub fn compaction_needed(&self) -> bool {
        self.compaction.enabled && self.connection.clone().normalized().needs_compaction()
    }
}

/// Configuration manager with hot-reload capability
pub struct ConfigManager {
    config: Arc<RwLock<DaemonConfig>>,
    config_path: Option<PathBuf>,
    change_sender: broadcast::Sender<DaemonConfig>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Self {
        Self::with_config(DaemonConfig::default())
    }

    /// Create a manager around an existing configuration
    pub fn with_config(config: DaemonConfig) -> Self {
        let (change_sender, _) = broadcast::channel(10);

        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: None,
            change_sender,
        }
    }

    /// Load configuration from file
    pub async fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config_str = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let new_config: DaemonConfig =
            toml::from_str(&config_str).with_context(|| "Failed to parse config file")?;

        {
            let mut config_guard = self.config.write().await;
            *config_guard = new_config.clone();
        }

        self.config_path = Some(path.to_path_buf());

        // Notify subscribers of config change
        if let Err(e) = self.change_sender.send(new_config) {
            debug!("No config change subscribers: {}", e);
        }

        info!("Loaded configuration from: {}", path.display());
        Ok(())
    }

    /// Save current configuration to file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config = self.config.read().await;
        let config_str = toml::to_string_pretty(&*config)?;

        tokio::fs::write(path.as_ref(), config_str)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        info!("Saved configuration to: {}", path.as_ref().display());
        Ok(())
    }

    /// Get current configuration
    pub async fn get_config(&self) -> DaemonConfig {
        self.config.read().await.clone()
    }

    /// Shared handle the background loops read on every pass
    pub fn shared(&self) -> Arc<RwLock<DaemonConfig>> {
        Arc::clone(&self.config)
    }

    /// Path of the loaded configuration file, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Subscribe to configuration changes
    pub fn subscribe_changes(&self) -> broadcast::Receiver<DaemonConfig> {
        self.change_sender.subscribe()
    }

    /// Poll the loaded file's modification time and reload on change until
    /// `shutdown` fires.
    pub async fn start_hot_reload(&self, shutdown: CancellationToken) -> Result<()> {
        let config_path = self
            .config_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No config file loaded"))?;

        let config_path = config_path.clone();
        let config = Arc::clone(&self.config);
        let change_sender = self.change_sender.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut last_modified = None;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                // Check file modification time
                match tokio::fs::metadata(&config_path).await {
                    Ok(metadata) => {
                        let modified = metadata.modified().ok();

                        if last_modified.is_none() {
                            last_modified = modified;
                            continue;
                        }

                        if modified != last_modified {
                            last_modified = modified;

                            match Self::reload_config(&config_path, &config).await {
                                Ok(new_config) => {
                                    info!("Hot-reloaded configuration");
                                    let _ = change_sender.send(new_config);
                                }
                                Err(e) => {
                                    warn!("Failed to hot-reload config: {}", e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to check config file: {}", e);
                    }
                }
            }
        });

        info!("Started configuration hot-reload monitoring");
        Ok(())
    }

    /// Internal method to reload configuration
    async fn reload_config(
        path: &Path,
        config: &Arc<RwLock<DaemonConfig>>,
    ) -> Result<DaemonConfig> {
        let config_str = tokio::fs::read_to_string(path).await?;
        let new_config: DaemonConfig = toml::from_str(&config_str)?;
        Self::validate(&new_config)?;

        {
            let mut config_guard = config.write().await;
            *config_guard = new_config.clone();
        }

        Ok(new_config)
    }

    /// Validate configuration
    pub fn validate(config: &DaemonConfig) -> Result<()> {
        if config.connection.driver_name != DEFAULT_DRIVER {
            anyhow::bail!(
                "Unsupported driver: {} (only {} is supported)",
                config.connection.driver_name,
                DEFAULT_DRIVER
            );
        }

        if config.connection.max_statement_len == 0 {
            anyhow::bail!("max_statement_len must be > 0");
        }

        if config.compaction.pass_interval_ms == 0 {
            anyhow::bail!("compaction.pass_interval_ms must be > 0");
        }

        if config.compaction.statement_timeout_secs == 0 {
            anyhow::bail!("compaction.statement_timeout_secs must be > 0");
        }

        if config.maintenance.interval_ms == 0 {
            anyhow::bail!("maintenance.interval_ms must be > 0");
        }

        // Entries must stay tracked long enough to become idle
        if config.maintenance.retention_secs <= config.compaction.idle_threshold_secs {
            anyhow::bail!(
                "maintenance.retention_secs ({}) must exceed compaction.idle_threshold_secs ({})",
                config.maintenance.retention_secs,
                config.compaction.idle_threshold_secs
            );
        }

        if config.server.enable_metrics && config.server.metrics_port == 0 {
            anyhow::bail!("Invalid metrics port: {}", config.server.metrics_port);
        }

        if !matches!(config.logging.format.as_str(), "pretty" | "compact" | "full") {
            anyhow::bail!("Unknown log format: {}", config.logging.format);
        }

        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_config_load() {
        let mut temp_file = NamedTempFile::new().unwrap();

        let config_toml = r#"
[connection]
pragmas = ["PRAGMA journal_mode=WAL", "PRAGMA synchronous = NORMAL"]
max_open_conns = 4

[compaction]
idle_threshold_secs = 600
pass_interval_ms = 5000

[registry]
seed_paths = ["/var/lib/app/main.sqlite"]
"#;

        temp_file.write_all(config_toml.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let mut manager = ConfigManager::new();
        let mut changes = manager.subscribe_changes();
        manager.load_from_file(temp_file.path()).await.unwrap();

        let config = manager.get_config().await;
        assert_eq!(config.connection.max_open_conns, 4);
        assert_eq!(config.compaction.idle_threshold_secs, 600);
        assert_eq!(config.compaction.pass_interval(), Duration::from_secs(5));
        // Unset fields keep their defaults
        assert_eq!(config.compaction.statement_timeout_secs, 300);
        assert_eq!(config.maintenance.retention_secs, 75 * 60);
        assert_eq!(
            config.registry.seed_paths,
            vec![PathBuf::from("/var/lib/app/main.sqlite")]
        );
        assert_eq!(manager.config_path(), Some(temp_file.path()));
        assert_eq!(changes.recv().await.unwrap(), config);

        ConfigManager::validate(&config).unwrap();
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrinkwatch.toml");

        let mut config = DaemonConfig::default();
        config.compaction.entry_pause_ms = 0;
        config.registry.seed_paths = vec![PathBuf::from("a.db")];
        ConfigManager::with_config(config.clone())
            .save_to_file(&path)
            .await
            .unwrap();

        let mut manager = ConfigManager::new();
        manager.load_from_file(&path).await.unwrap();
        assert_eq!(manager.get_config().await, config);
    }

    #[test]
    fn test_validation() {
        assert!(ConfigManager::validate(&DaemonConfig::default()).is_ok());

        let mut config = DaemonConfig::default();
        config.maintenance.retention_secs = config.compaction.idle_threshold_secs;
        assert!(ConfigManager::validate(&config).is_err());

        let mut config = DaemonConfig::default();
        config.connection.driver_name = "postgres".to_string();
        assert!(ConfigManager::validate(&config).is_err());

        let mut config = DaemonConfig::default();
        config.compaction.pass_interval_ms = 0;
        assert!(ConfigManager::validate(&config).is_err());

        let mut config = DaemonConfig::default();
        config.logging.format = "xml".to_string();
        assert!(ConfigManager::validate(&config).is_err());
    }

    #[test]
    fn test_compaction_needed() {
        assert!(DaemonConfig::default().compaction_needed());

        let mut config = DaemonConfig::default();
        config.connection.pragmas = vec!["PRAGMA auto_vacuum = FULL".to_string()];
        assert!(!config.compaction_needed());

        let mut config = DaemonConfig::default();
        config.compaction.enabled = false;
        assert!(!config.compaction_needed());
    }

    #[tokio::test]
    async fn test_hot_reload_requires_file() {
        let manager = ConfigManager::new();
        assert!(manager
            .start_hot_reload(CancellationToken::new())
            .await
            .is_err());
    }

    const RELOAD_BASE: &str = "[compaction]\nidle_threshold_secs = 600\npass_interval_ms = 5000\n";

    /// Manager watching a freshly written config file, plus a change receiver
    /// subscribed after the initial load.
    async fn watched_manager(
        path: &Path,
        shutdown: &CancellationToken,
    ) -> (ConfigManager, broadcast::Receiver<DaemonConfig>) {
        tokio::fs::write(path, RELOAD_BASE).await.unwrap();

        let mut manager = ConfigManager::new();
        manager.load_from_file(path).await.unwrap();
        let changes = manager.subscribe_changes();
        manager.start_hot_reload(shutdown.clone()).await.unwrap();

        // Give the poller time to record the current modification time
        tokio::time::sleep(Duration::from_millis(1500)).await;
        (manager, changes)
    }

    #[tokio::test]
    async fn test_hot_reload_applies_new_timings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrinkwatch.toml");
        let shutdown = CancellationToken::new();
        let (manager, mut changes) = watched_manager(&path, &shutdown).await;

        tokio::fs::write(
            &path,
            "[compaction]\nidle_threshold_secs = 600\npass_interval_ms = 250\n",
        )
        .await
        .unwrap();

        let reloaded = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("config was not reloaded")
            .unwrap();
        assert_eq!(reloaded.compaction.pass_interval_ms, 250);
        assert_eq!(
            manager.shared().read().await.compaction.pass_interval(),
            Duration::from_millis(250)
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_hot_reload_keeps_config_on_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrinkwatch.toml");
        let shutdown = CancellationToken::new();
        let (manager, mut changes) = watched_manager(&path, &shutdown).await;

        // Retention not above the idle threshold fails validation
        tokio::fs::write(
            &path,
            "[compaction]\nidle_threshold_secs = 600\npass_interval_ms = 250\n\n[maintenance]\nretention_secs = 60\n",
        )
        .await
        .unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(2500), changes.recv())
                .await
                .is_err()
        );
        let config = manager.get_config().await;
        assert_eq!(config.compaction.pass_interval_ms, 5000);
        assert_eq!(config.maintenance.retention_secs, 75 * 60);

        shutdown.cancel();
    }
}
