use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use foreman_boundary::{ArcReviewQueue, ArcVerifier, BoundaryEnforcer, HmacArcVerifier};
use foreman_config::{FabricConfig, WarningSeverity};
use foreman_core::{EventBus, FabricError, Result};
use foreman_memory::{AuditLog, Keyring, TierLimits, TierStore};
use foreman_sync::{ConflictResolver, LocalPeer, SyncEngine};

use crate::fabric::{HostedInstance, MemoryFabric};

/// Assembles a [`MemoryFabric`] from config, with optional overrides for the
/// pieces tests and embedders usually want to supply themselves.
pub struct FabricBuilder {
    config: FabricConfig,
    keyring: Option<Arc<Keyring>>,
    verifier: Option<Arc<dyn ArcVerifier>>,
    events: Option<EventBus>,
}

impl FabricBuilder {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            config,
            keyring: None,
            verifier: None,
            events: None,
        }
    }

    /// Use this keyring instead of `[encryption.tenant_keys]`.
    pub fn keyring(mut self, keyring: Arc<Keyring>) -> Self {
        self.keyring = Some(keyring);
        self
    }

    /// Use this ARC verifier instead of the HMAC verifier keyed from `[arc]`.
    pub fn verifier(mut self, verifier: Arc<dyn ArcVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<MemoryFabric> {
        let config = self.config;
        info!("initializing memory fabric");

        let warnings = config.validate().map_err(|reason| FabricError::ConfigValidation {
            field: "fabric.toml".into(),
            reason,
        })?;
        for w in warnings.iter().filter(|w| w.severity == WarningSeverity::Warning) {
            warn!(field = %w.field, "{}", w.message);
        }

        let in_memory = config.storage.is_in_memory();
        let db_path = resolve_db_path(&config.storage.db_path);
        if !in_memory && let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyring = match self.keyring {
            Some(keyring) => keyring,
            None => Arc::new(Keyring::from_base64_map(&config.encryption.tenant_keys)?),
        };
        let verifier: Arc<dyn ArcVerifier> = match self.verifier {
            Some(verifier) => verifier,
            None => Arc::new(HmacArcVerifier::from_config(&config.arc)?),
        };
        let events = self.events.unwrap_or_default();

        let audit = if in_memory {
            AuditLog::open_in_memory()?
        } else {
            AuditLog::open(&db_path)?
        };

        let reviews = Arc::new(ArcReviewQueue::new());
        let enforcer = BoundaryEnforcer::new(audit.clone(), Arc::clone(&keyring), &config.boundary)
            .with_events(events.clone());
        let resolver =
            ConflictResolver::new(audit.clone(), Arc::clone(&reviews)).with_events(events.clone());
        let sync = Arc::new(
            SyncEngine::new(config.sync.clone(), audit.clone(), resolver).with_events(events.clone()),
        );

        let limits = TierLimits::from(&config.tiers);
        let mut seen = HashSet::new();
        let mut instances = Vec::new();
        for instance in config.effective_instances() {
            let id = instance.instance_id();
            if !seen.insert(id.clone()) {
                return Err(FabricError::Config(format!("duplicate instance id '{id}'")));
            }

            if let Some(tenant) = &instance.tenant
                && !keyring.has_key(tenant)
            {
                if in_memory {
                    keyring.generate(tenant)?;
                    info!(tenant = %tenant, "generated ephemeral tenant key");
                } else {
                    warn!(tenant = %tenant, "no encryption key configured; LTM writes for this tenant will be rejected");
                }
            }

            let store = if in_memory {
                TierStore::open_in_memory(Arc::clone(&keyring), limits)?
            } else {
                TierStore::open(&instance_db_path(&db_path, &id), Arc::clone(&keyring), limits)?
            };
            sync.register(Arc::new(LocalPeer::new(
                id.clone(),
                instance.embodiment,
                instance.tenant.clone(),
                store.clone(),
            )));
            instances.push(HostedInstance::new(id, instance, store));
        }

        info!(
            instances = instances.len(),
            in_memory,
            audit_events = audit.len()?,
            "memory fabric ready"
        );

        Ok(MemoryFabric {
            config,
            instances,
            audit,
            keyring,
            enforcer,
            sync,
            events,
            verifier,
            reviews,
            in_flight: Mutex::new(JoinSet::new()),
            collected: Mutex::new(Vec::new()),
        })
    }
}

/// Where `[storage] db_path` lives on disk; relative paths sit under `~/.foreman/`.
pub fn resolve_db_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join(path)
    }
}

/// `fabric.db` + `isms_runtime@tenant_a` -> `fabric-isms_runtime_tenant_a.db`
fn instance_db_path(db_path: &Path, instance_id: &str) -> PathBuf {
    let stem = db_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fabric".into());
    let safe: String = instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    db_path.with_file_name(format!("{stem}-{safe}.db"))
}
