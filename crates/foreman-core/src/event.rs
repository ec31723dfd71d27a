use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{Embodiment, Severity, Tier};

/// Events published as the fabric stores, syncs and rejects entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FabricEvent {
    // ── Entry lifecycle ────────────────────────────────────────
    EntryStored {
        tier: Tier,
        id: String,
        embodiment: Embodiment,
    },
    EntryUpdated {
        tier: Tier,
        id: String,
        version: u64,
    },
    EntryErased {
        tier: Tier,
        id: String,
        tenant_id: Option<String>,
    },
    EntriesPruned {
        tier: Tier,
        count: usize,
    },

    // ── Boundary ───────────────────────────────────────────────
    BoundaryViolation {
        embodiment: Embodiment,
        tier: Tier,
        reason: String,
        severity: Severity,
    },

    // ── Sync / conflicts ───────────────────────────────────────
    SyncCompleted {
        tier: Tier,
        id: String,
        synced: usize,
        skipped: usize,
        failed: usize,
    },
    ConflictDetected {
        tier: Tier,
        id: String,
        conflict_type: String,
    },
    ArcEscalated {
        review_id: Uuid,
        entry_id: String,
    },

    Shutdown,
}

/// A broadcast-based event bus for fabric-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<FabricEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: FabricEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
