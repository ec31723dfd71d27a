use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use foreman_core::{FabricError, Result};

use crate::schema::FabricConfig;

/// Loads and optionally hot-reloads the fabric configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<FabricConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > FOREMAN_CONFIG env > ~/.foreman/fabric.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("FOREMAN_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("fabric.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            FabricConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Wrap an in-memory config (tests, embedding).
    pub fn from_config(config: FabricConfig) -> Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::from("fabric.toml"),
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> FabricConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<FabricConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn parse(raw: &str, path: &Path) -> Result<FabricConfig> {
        toml::from_str::<FabricConfig>(raw).map_err(|e| {
            FabricError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Log warnings, fail on errors.
    fn check(config: &FabricConfig) -> Result<()> {
        let warnings = config.validate().map_err(FabricError::Config)?;
        for w in &warnings {
            warn!("{}", w);
        }
        Ok(())
    }

    /// Apply env var overrides (FOREMAN_LOG_LEVEL, FOREMAN_DB_PATH, etc.)
    fn apply_env_overrides(mut config: FabricConfig) -> FabricConfig {
        if let Ok(v) = std::env::var("FOREMAN_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("FOREMAN_DB_PATH") {
            config.storage.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FOREMAN_SYNC_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(ms) => config.sync.delivery_timeout_ms = ms,
                Err(_) => warn!(value = %v, "ignoring non-numeric FOREMAN_SYNC_TIMEOUT_MS"),
            }
        }
        // Env fills the signing key only when the file leaves it unset.
        if config.arc.signing_key.is_none() {
            if let Ok(v) = std::env::var("FOREMAN_ARC_SIGNING_KEY") {
                config.arc.signing_key = Some(v);
            }
        }
        config
    }

    /// Reload the config from disk. On any error the current config is kept.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(FabricError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = Self::apply_env_overrides(Self::parse(&raw, &self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that swaps in the new config when the file changes.
    /// The returned watcher must be kept alive for watching to continue.
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    let raw = match std::fs::read_to_string(&path_for_event) {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(error = %e, "failed to read config file during hot-reload");
                            return;
                        }
                    };
                    let parsed = ConfigLoader::parse(&raw, &path_for_event)
                        .map(ConfigLoader::apply_env_overrides)
                        .and_then(|c| ConfigLoader::check(&c).map(|_| c));
                    match parsed {
                        Ok(new_config) => {
                            *config.write() = new_config;
                            info!("configuration hot-reloaded successfully");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            },
        )
        .map_err(|e| FabricError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory; some editors write a temp file and rename.
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| FabricError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
