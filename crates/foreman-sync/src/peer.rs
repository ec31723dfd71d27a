use async_trait::async_trait;

use foreman_core::{Embodiment, MemoryEntry, Result, Tier};
use foreman_memory::{EntryRef, TierStore};

/// A replica the sync engine can deliver entries to.
///
/// Implementations must apply `put` with the same compare-and-set semantics
/// as [`TierStore::put`]: a stale `expected` version is a `VersionConflict`.
#[async_trait]
pub trait EmbodimentPeer: Send + Sync {
    fn instance_id(&self) -> &str;

    fn embodiment(&self) -> Embodiment;

    /// Tenant the instance serves, if any.
    fn tenant(&self) -> Option<&str>;

    /// Current copy, without touching read-tracking.
    async fn get(&self, tier: Tier, id: &str, tenant: Option<&str>) -> Result<Option<MemoryEntry>>;

    async fn put(&self, entry: &MemoryEntry, expected: Option<u64>) -> Result<EntryRef>;
}

/// An instance hosted in this process, backed by its own [`TierStore`].
#[derive(Clone)]
pub struct LocalPeer {
    id: String,
    embodiment: Embodiment,
    tenant: Option<String>,
    store: TierStore,
}

impl LocalPeer {
    pub fn new(id: impl Into<String>, embodiment: Embodiment, tenant: Option<String>, store: TierStore) -> Self {
        Self {
            id: id.into(),
            embodiment,
            tenant,
            store,
        }
    }

    pub fn store(&self) -> &TierStore {
        &self.store
    }
}

#[async_trait]
impl EmbodimentPeer for LocalPeer {
    fn instance_id(&self) -> &str {
        &self.id
    }

    fn embodiment(&self) -> Embodiment {
        self.embodiment
    }

    fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    async fn get(&self, tier: Tier, id: &str, tenant: Option<&str>) -> Result<Option<MemoryEntry>> {
        self.store.peek(tier, id, tenant)
    }

    async fn put(&self, entry: &MemoryEntry, expected: Option<u64>) -> Result<EntryRef> {
        Ok(self.store.put(entry, expected)?.entry)
    }
}
