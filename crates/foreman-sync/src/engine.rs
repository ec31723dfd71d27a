use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn};

use foreman_boundary::privilege;
use foreman_config::SyncConfig;
use foreman_core::{
    Embodiment, EventBus, FabricError, FabricEvent, MemoryEntry, Result, Severity, Tier,
    now_millis,
};
use foreman_memory::{AuditCategory, AuditLog, AuditRecord};

use crate::conflict::{ConflictRecord, ConflictResolver, Resolution, VersionSnapshot, detect_conflict};
use crate::peer::EmbodimentPeer;

/// Pending deliveries at or above this count mark an embodiment out of sync.
const OUT_OF_SYNC_THRESHOLD: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTarget {
    pub embodiment: Embodiment,
    pub instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SyncTarget {
    fn of(peer: &dyn EmbodimentPeer, reason: Option<String>) -> Self {
        Self {
            embodiment: peer.embodiment(),
            instance: peer.instance_id().to_string(),
            reason,
        }
    }
}

/// Outcome of propagating one committed entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub synced: Vec<SyncTarget>,
    pub skipped: Vec<SyncTarget>,
    pub failed: Vec<SyncTarget>,
    pub conflicts: Vec<ConflictRecord>,
}

impl SyncReport {
    pub fn synced_embodiments(&self) -> Vec<Embodiment> {
        embodiments(&self.synced)
    }

    pub fn skipped_embodiments(&self) -> Vec<Embodiment> {
        embodiments(&self.skipped)
    }

    pub fn failed_embodiments(&self) -> Vec<Embodiment> {
        embodiments(&self.failed)
    }
}

fn embodiments(targets: &[SyncTarget]) -> Vec<Embodiment> {
    let mut list: Vec<Embodiment> = targets.iter().map(|t| t.embodiment).collect();
    list.sort();
    list.dedup();
    list
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    OutOfSync,
}

impl HealthStatus {
    pub fn from_pending(pending: usize) -> Self {
        match pending {
            0 => HealthStatus::Healthy,
            n if n < OUT_OF_SYNC_THRESHOLD => HealthStatus::Degraded,
            _ => HealthStatus::OutOfSync,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::OutOfSync => "out_of_sync",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub embodiment: Embodiment,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_updates: usize,
    pub health_status: HealthStatus,
    pub conflicts: Vec<ConflictRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub status: HealthStatus,
    pub last_sync: Option<DateTime<Utc>>,
    /// Ids of entries not yet delivered to this embodiment.
    pub missing_entries: Vec<String>,
    /// Ids of entries whose copies disagree and could not be settled.
    pub version_mismatches: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    Complete,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub status: ReconcileStatus,
    pub reconciled: usize,
    pub conflicts: Vec<ConflictRecord>,
}

#[derive(Debug, Clone)]
struct PendingDelivery {
    origin: String,
    entry: MemoryEntry,
    reason: String,
}

#[derive(Debug, Clone)]
struct InstanceState {
    embodiment: Embodiment,
    last_sync_at: Option<DateTime<Utc>>,
    pending: BTreeMap<(Tier, String), PendingDelivery>,
    conflicts: Vec<ConflictRecord>,
}

impl InstanceState {
    fn new(embodiment: Embodiment) -> Self {
        Self {
            embodiment,
            last_sync_at: None,
            pending: BTreeMap::new(),
            conflicts: Vec::new(),
        }
    }

    fn delivered(&mut self, entry: &MemoryEntry, at: DateTime<Utc>) {
        self.last_sync_at = Some(at);
        self.pending.remove(&(entry.tier, entry.id.clone()));
        self.conflicts.retain(|c| c.entry_id != entry.id);
    }

    fn undelivered(&mut self, origin: &str, entry: &MemoryEntry, reason: String, conflict: Option<ConflictRecord>) {
        let key = (entry.tier, entry.id.clone());
        let newer_queued = self
            .pending
            .get(&key)
            .is_some_and(|p| p.entry.version() > entry.version());
        if !newer_queued {
            self.pending.insert(
                key,
                PendingDelivery {
                    origin: origin.to_string(),
                    entry: entry.clone(),
                    reason,
                },
            );
        }
        if let Some(conflict) = conflict {
            self.conflicts.retain(|c| c.entry_id != conflict.entry_id);
            self.conflicts.push(conflict);
        }
    }
}

enum Eligibility {
    Deliver,
    Skip(String),
    /// Delivery would cross a tenant boundary.
    Blocked(String),
}

/// Result of one delivery attempt.
struct Delivery {
    result: Result<()>,
    conflict: Option<ConflictRecord>,
    /// The entry was erased while the delivery was queued; nothing was written.
    erased: bool,
}

impl Delivery {
    fn ok(conflict: Option<ConflictRecord>) -> Self {
        Self {
            result: Ok(()),
            conflict,
            erased: false,
        }
    }

    fn failed(error: FabricError, conflict: Option<ConflictRecord>) -> Self {
        Self {
            result: Err(error),
            conflict,
            erased: false,
        }
    }

    fn erased() -> Self {
        Self {
            result: Ok(()),
            conflict: None,
            erased: true,
        }
    }
}

const ERASED: &str = "entry was erased";

/// Entries erased under ARC approval. Sync never writes them again.
#[derive(Clone, Default)]
struct Tombstones(Arc<Mutex<HashSet<(Tier, Option<String>, String)>>>);

impl Tombstones {
    fn insert(&self, tier: Tier, tenant: Option<&str>, id: &str) {
        self.0.lock().insert((tier, tenant.map(str::to_string), id.to_string()));
    }

    fn contains(&self, tier: Tier, tenant: Option<&str>, id: &str) -> bool {
        self.0
            .lock()
            .contains(&(tier, tenant.map(str::to_string), id.to_string()))
    }

    fn covers(&self, entry: &MemoryEntry) -> bool {
        self.contains(entry.tier, entry.tenant_id.as_deref(), &entry.id)
    }
}

/// Propagates committed entries from one embodiment instance to the others
/// allowed to read them.
///
/// Each target gets its own task and its own timeout, so one slow replica
/// never holds up the rest. Failed deliveries stay queued per target until
/// [`SyncEngine::reconcile_embodiment`] succeeds in applying them.
pub struct SyncEngine {
    config: SyncConfig,
    peers: RwLock<Vec<Arc<dyn EmbodimentPeer>>>,
    resolver: ConflictResolver,
    audit: AuditLog,
    state: Mutex<HashMap<String, InstanceState>>,
    tombstones: Tombstones,
    events: Option<EventBus>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, audit: AuditLog, resolver: ConflictResolver) -> Self {
        Self {
            config,
            peers: RwLock::new(Vec::new()),
            resolver,
            audit,
            state: Mutex::new(HashMap::new()),
            tombstones: Tombstones::default(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn register(&self, peer: Arc<dyn EmbodimentPeer>) {
        info!(
            instance = peer.instance_id(),
            embodiment = %peer.embodiment(),
            tenant = ?peer.tenant(),
            "registered sync peer"
        );
        self.state
            .lock()
            .entry(peer.instance_id().to_string())
            .or_insert_with(|| InstanceState::new(peer.embodiment()));
        let mut peers = self.peers.write();
        peers.retain(|p| p.instance_id() != peer.instance_id());
        peers.push(peer);
    }

    pub fn peer(&self, instance_id: &str) -> Option<Arc<dyn EmbodimentPeer>> {
        self.peers.read().iter().find(|p| p.instance_id() == instance_id).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<dyn EmbodimentPeer>> {
        self.peers.read().clone()
    }

    /// Stop propagating an erased entry.
    ///
    /// Queued deliveries of it are dropped, and no later sync or
    /// reconciliation writes it to any instance again.
    pub fn tombstone(&self, tier: Tier, tenant: Option<&str>, id: &str) {
        self.tombstones.insert(tier, tenant, id);
        let mut state = self.state.lock();
        for slot in state.values_mut() {
            slot.pending
                .retain(|(t, pid), p| !(*t == tier && pid == id && p.entry.tenant_id.as_deref() == tenant));
            slot.conflicts.retain(|c| c.entry_id != id);
        }
        info!(%tier, id, "entry tombstoned for sync");
    }

    pub fn is_tombstoned(&self, tier: Tier, tenant: Option<&str>, id: &str) -> bool {
        self.tombstones.contains(tier, tenant, id)
    }

    fn eligibility(&self, origin: &dyn EmbodimentPeer, target: &dyn EmbodimentPeer, entry: &MemoryEntry) -> Eligibility {
        let tier = entry.tier;
        if tier == Tier::Stm {
            return Eligibility::Skip("STM is never synchronized".into());
        }
        if !privilege(target.embodiment(), tier).read {
            return Eligibility::Skip(format!("{} cannot read {tier}", target.embodiment()));
        }
        match tier {
            Tier::Wm => {
                if !self.config.working_set(origin.embodiment()).contains(&target.embodiment()) {
                    return Eligibility::Skip("outside the working set".into());
                }
                let scope = entry.tenant_id.as_deref().or(origin.tenant());
                match (scope, target.tenant()) {
                    (Some(a), Some(b)) if a != b => Eligibility::Skip("WM never crosses tenants".into()),
                    _ => Eligibility::Deliver,
                }
            }
            Tier::Ltm => {
                if entry.tenant_id.is_some() && target.tenant() == entry.tenant_id.as_deref() {
                    Eligibility::Deliver
                } else {
                    Eligibility::Blocked(format!(
                        "LTM for tenant {} cannot reach instance serving {}",
                        entry.tenant_id.as_deref().unwrap_or("<none>"),
                        target.tenant().unwrap_or("<no tenant>")
                    ))
                }
            }
            Tier::Em | Tier::Sm | Tier::Governance => Eligibility::Deliver,
            Tier::Stm => Eligibility::Skip("STM is never synchronized".into()),
        }
    }

    /// Deliver `entry`, just committed on `origin_instance`, to every eligible
    /// instance. Never rolls back the origin write; failures are reported and
    /// queued for reconciliation.
    pub async fn sync(&self, origin_instance: &str, entry: &MemoryEntry) -> Result<SyncReport> {
        let origin = self
            .peer(origin_instance)
            .ok_or_else(|| FabricError::UnknownEmbodiment(format!("no sync peer {origin_instance}")))?;
        let mut report = SyncReport::default();

        if !entry.tier.is_synchronized() {
            debug!(entry_id = %entry.id, "STM entry stays local");
            report.skipped = self
                .peers()
                .iter()
                .filter(|p| p.instance_id() != origin_instance)
                .map(|p| SyncTarget::of(p.as_ref(), Some("STM is never synchronized".into())))
                .collect();
            return Ok(report);
        }
        if self.tombstones.covers(entry) {
            debug!(entry_id = %entry.id, "erased entry is not synchronized");
            report.skipped = self
                .peers()
                .iter()
                .filter(|p| p.instance_id() != origin_instance)
                .map(|p| SyncTarget::of(p.as_ref(), Some(ERASED.into())))
                .collect();
            return Ok(report);
        }

        let timeout = Duration::from_millis(self.config.delivery_timeout_ms);
        let mut tasks = JoinSet::new();
        let mut spawned: HashMap<task::Id, Arc<dyn EmbodimentPeer>> = HashMap::new();
        for target in self.peers() {
            if target.instance_id() == origin_instance {
                continue;
            }
            match self.eligibility(origin.as_ref(), target.as_ref(), entry) {
                Eligibility::Skip(reason) => {
                    report.skipped.push(SyncTarget::of(target.as_ref(), Some(reason)));
                }
                Eligibility::Blocked(reason) => {
                    self.record_blocked(origin.as_ref(), target.as_ref(), entry, &reason)?;
                    report.skipped.push(SyncTarget::of(target.as_ref(), Some(reason)));
                }
                Eligibility::Deliver => {
                    let origin = Arc::clone(&origin);
                    let resolver = self.resolver.clone();
                    let tombstones = self.tombstones.clone();
                    let entry = entry.clone();
                    let peer = Arc::clone(&target);
                    let handle = tasks.spawn(async move {
                        match tokio::time::timeout(
                            timeout,
                            deliver(origin, Arc::clone(&peer), entry, resolver, tombstones),
                        )
                        .await
                        {
                            Ok(delivery) => delivery,
                            Err(_) => Delivery::failed(
                                FabricError::SyncDeliveryFailure {
                                    target: peer.instance_id().to_string(),
                                    reason: format!("timed out after {}ms", timeout.as_millis()),
                                },
                                None,
                            ),
                        }
                    });
                    spawned.insert(handle.id(), target);
                }
            }
        }

        let now = now_millis();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, delivery) = match joined {
                Ok(done) => done,
                Err(e) => {
                    let instance = spawned
                        .get(&e.id())
                        .map(|p| p.instance_id().to_string())
                        .unwrap_or_default();
                    warn!(%instance, error = %e, "sync delivery task aborted");
                    let failure = FabricError::SyncDeliveryFailure {
                        target: instance,
                        reason: "delivery task aborted".into(),
                    };
                    (e.id(), Delivery::failed(failure, None))
                }
            };
            let Some(target) = spawned.remove(&id) else {
                continue;
            };
            self.apply(origin_instance, target.as_ref(), entry, delivery, now, &mut report);
        }

        if let Some(state) = self.state.lock().get_mut(origin_instance) {
            state.last_sync_at = Some(now);
        }
        self.record_sync(origin.as_ref(), entry, &report)?;
        Ok(report)
    }

    fn apply(
        &self,
        origin_instance: &str,
        target: &dyn EmbodimentPeer,
        entry: &MemoryEntry,
        delivery: Delivery,
        now: DateTime<Utc>,
        report: &mut SyncReport,
    ) {
        let mut state = self.state.lock();
        let slot = state
            .entry(target.instance_id().to_string())
            .or_insert_with(|| InstanceState::new(target.embodiment()));
        if delivery.erased {
            slot.pending.remove(&(entry.tier, entry.id.clone()));
            report.skipped.push(SyncTarget::of(target, Some(ERASED.into())));
            return;
        }
        match delivery.result {
            Ok(()) => {
                slot.delivered(entry, now);
                report.synced.push(SyncTarget::of(target, None));
            }
            Err(e) => {
                warn!(
                    target = target.instance_id(),
                    entry_id = %entry.id,
                    error = %e,
                    "sync delivery failed"
                );
                slot.undelivered(origin_instance, entry, e.to_string(), delivery.conflict.clone());
                report.failed.push(SyncTarget::of(target, Some(e.to_string())));
            }
        }
        if let Some(conflict) = delivery.conflict {
            report.conflicts.push(conflict);
        }
    }

    fn record_blocked(
        &self,
        origin: &dyn EmbodimentPeer,
        target: &dyn EmbodimentPeer,
        entry: &MemoryEntry,
        reason: &str,
    ) -> Result<()> {
        warn!(
            entry_id = %entry.id,
            target = target.instance_id(),
            "cross-tenant sync blocked"
        );
        self.audit.append(
            AuditRecord::new(
                AuditCategory::SecurityEvent,
                "cross_tenant_sync_blocked",
                Severity::Critical,
                reason,
            )
            .source(origin.embodiment())
            .entry(entry.id.clone())
            .tenant(entry.tenant_id.as_deref())
            .metadata(json!({
                "tier": entry.tier,
                "origin": origin.instance_id(),
                "target": target.instance_id(),
                "targetTenant": target.tenant(),
            })),
        )?;
        Ok(())
    }

    fn record_sync(&self, origin: &dyn EmbodimentPeer, entry: &MemoryEntry, report: &SyncReport) -> Result<()> {
        let failed = !report.failed.is_empty();
        info!(
            entry_id = %entry.id,
            tier = %entry.tier,
            synced = report.synced.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "sync finished"
        );
        self.audit.append(
            AuditRecord::new(
                AuditCategory::SyncEvent,
                if failed { "sync_partial" } else { "entry_synced" },
                if failed { Severity::Medium } else { Severity::Low },
                format!(
                    "{} v{} synced to {} instance(s), {} failed",
                    entry.id,
                    entry.version(),
                    report.synced.len(),
                    report.failed.len()
                ),
            )
            .source(origin.embodiment())
            .entry(entry.id.clone())
            .tenant(entry.tenant_id.as_deref())
            .metadata(json!({
                "tier": entry.tier,
                "version": entry.version(),
                "synced": report.synced,
                "skipped": report.skipped,
                "failed": report.failed,
                "conflicts": report.conflicts.len(),
            })),
        )?;
        if let Some(events) = &self.events {
            events.publish(FabricEvent::SyncCompleted {
                tier: entry.tier,
                id: entry.id.clone(),
                synced: report.synced.len(),
                skipped: report.skipped.len(),
                failed: report.failed.len(),
            });
        }
        Ok(())
    }

    pub fn status(&self, embodiment: Embodiment) -> SyncStatus {
        let state = self.state.lock();
        let mut status = SyncStatus {
            embodiment,
            last_sync_at: None,
            pending_updates: 0,
            health_status: HealthStatus::Healthy,
            conflicts: Vec::new(),
        };
        for slot in state.values().filter(|s| s.embodiment == embodiment) {
            status.last_sync_at = status.last_sync_at.max(slot.last_sync_at);
            status.pending_updates += slot.pending.len();
            status.conflicts.extend(slot.conflicts.iter().cloned());
        }
        status.health_status = HealthStatus::from_pending(status.pending_updates);
        status
    }

    pub fn check_health(&self, embodiment: Embodiment) -> SyncHealth {
        let state = self.state.lock();
        let mut health = SyncHealth {
            status: HealthStatus::Healthy,
            last_sync: None,
            missing_entries: Vec::new(),
            version_mismatches: Vec::new(),
        };
        for slot in state.values().filter(|s| s.embodiment == embodiment) {
            health.last_sync = health.last_sync.max(slot.last_sync_at);
            health.missing_entries.extend(slot.pending.keys().map(|(_, id)| id.clone()));
            health
                .version_mismatches
                .extend(slot.conflicts.iter().map(|c| c.entry_id.clone()));
        }
        health.missing_entries.sort();
        health.version_mismatches.sort();
        health.version_mismatches.dedup();
        health.status = HealthStatus::from_pending(health.missing_entries.len());
        health
    }

    /// Retry every queued delivery to `embodiment`'s instances.
    ///
    /// Running it again with nothing queued reports `complete` and changes
    /// nothing; other embodiments' state is left alone.
    pub async fn reconcile_embodiment(&self, embodiment: Embodiment) -> Result<ReconcileReport> {
        let queued: Vec<(String, PendingDelivery)> = {
            let state = self.state.lock();
            state
                .iter()
                .filter(|(_, s)| s.embodiment == embodiment)
                .flat_map(|(instance, s)| s.pending.values().map(move |p| (instance.clone(), p.clone())))
                .collect()
        };

        let attempts = queued.into_iter().map(|(instance, pending)| async move {
            let delivery = match (self.peer(&pending.origin), self.peer(&instance)) {
                (Some(origin), Some(target)) => {
                    let timeout = Duration::from_millis(self.config.delivery_timeout_ms);
                    tokio::time::timeout(
                        timeout,
                        deliver(
                            origin,
                            target,
                            pending.entry.clone(),
                            self.resolver.clone(),
                            self.tombstones.clone(),
                        ),
                    )
                    .await
                    .unwrap_or_else(|_| {
                        Delivery::failed(
                            FabricError::SyncDeliveryFailure {
                                target: instance.clone(),
                                reason: format!("timed out after {}ms", timeout.as_millis()),
                            },
                            None,
                        )
                    })
                }
                _ => Delivery::failed(
                    FabricError::SyncDeliveryFailure {
                        target: instance.clone(),
                        reason: "peer no longer registered".into(),
                    },
                    None,
                ),
            };
            (instance, pending, delivery)
        });
        let results = futures::future::join_all(attempts).await;

        let now = now_millis();
        let mut reconciled = 0;
        let mut conflicts = Vec::new();
        {
            let mut state = self.state.lock();
            for (instance, pending, delivery) in results {
                let Some(slot) = state.get_mut(&instance) else {
                    continue;
                };
                if delivery.erased {
                    slot.pending.remove(&(pending.entry.tier, pending.entry.id.clone()));
                    continue;
                }
                match delivery.result {
                    Ok(()) => {
                        slot.delivered(&pending.entry, now);
                        reconciled += 1;
                    }
                    Err(e) => {
                        debug!(instance = %instance, entry_id = %pending.entry.id, error = %e, "still undelivered");
                        slot.undelivered(&pending.origin, &pending.entry, e.to_string(), delivery.conflict.clone());
                    }
                }
                if let Some(conflict) = delivery.conflict {
                    conflicts.push(conflict);
                }
            }
            for slot in state.values_mut().filter(|s| s.embodiment == embodiment) {
                slot.last_sync_at = Some(now);
            }
        }

        let remaining = self.status(embodiment).pending_updates;
        let status = if remaining == 0 {
            ReconcileStatus::Complete
        } else {
            ReconcileStatus::Partial
        };
        info!(%embodiment, reconciled, remaining, "reconciliation finished");
        self.audit.append(
            AuditRecord::new(
                AuditCategory::SyncEvent,
                "embodiment_reconciled",
                if remaining == 0 { Severity::Low } else { Severity::Medium },
                format!("{embodiment}: {reconciled} update(s) applied, {remaining} outstanding"),
            )
            .source("sync")
            .metadata(json!({
                "embodiment": embodiment,
                "reconciled": reconciled,
                "remaining": remaining,
                "conflicts": conflicts.len(),
            })),
        )?;
        Ok(ReconcileReport {
            status,
            reconciled,
            conflicts,
        })
    }

    /// Reason each delivery to `instance` is still queued, keyed by entry id.
    pub fn pending_reasons(&self, instance: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .get(instance)
            .map(|s| {
                s.pending
                    .iter()
                    .map(|((_, id), p)| (id.clone(), p.reason.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Apply `entry` on `target`, settling any conflict with the target's copy.
///
/// The first attempt expects the target to hold the previous version. If it
/// does not, the copies are compared: a stale target is fast-forwarded, and a
/// real conflict goes to the resolver. A resolved winner is written to the
/// target once (the single retry) and copied back to the origin.
async fn deliver(
    origin: Arc<dyn EmbodimentPeer>,
    target: Arc<dyn EmbodimentPeer>,
    entry: MemoryEntry,
    resolver: ConflictResolver,
    tombstones: Tombstones,
) -> Delivery {
    // Checked before every write: an erasure may land while this task waits.
    let erased = || tombstones.covers(&entry);
    if erased() {
        return Delivery::erased();
    }
    let tenant = entry.tenant_id.as_deref();
    let expected = entry.version().checked_sub(1).filter(|v| *v > 0);
    let rejected = match target.put(&entry, expected).await {
        Ok(_) => return Delivery::ok(None),
        Err(e) => e,
    };
    if !matches!(
        rejected,
        FabricError::VersionConflict { .. } | FabricError::GovernanceImmutable
    ) {
        return Delivery::failed(rejected, None);
    }

    let remote = match target.get(entry.tier, &entry.id, tenant).await {
        Ok(remote) => remote,
        Err(e) => return Delivery::failed(e, None),
    };
    let Some(remote) = remote else {
        if erased() {
            return Delivery::erased();
        }
        return match target.put(&entry, None).await {
            Ok(_) => Delivery::ok(None),
            Err(e) => Delivery::failed(e, None),
        };
    };
    if remote == entry {
        return Delivery::ok(None);
    }

    if !entry.tier.is_immutable()
        && entry.version() > remote.version()
        && remote.metadata.updated_at <= entry.metadata.updated_at
    {
        if erased() {
            return Delivery::erased();
        }
        return match target.put(&entry, Some(remote.version())).await {
            Ok(_) => Delivery::ok(None),
            Err(e) => Delivery::failed(e, None),
        };
    }

    // A queued delivery the origin has since moved past.
    if remote.version() > entry.version()
        && let Ok(Some(current)) = origin.get(entry.tier, &entry.id, tenant).await
        && current == remote
    {
        return Delivery::ok(None);
    }

    let incoming = VersionSnapshot::new(origin.embodiment(), entry.clone());
    let existing = VersionSnapshot::new(target.embodiment(), remote.clone());
    let Some(mut conflict) = detect_conflict(&incoming, &existing) else {
        return Delivery::ok(None);
    };

    match resolver.resolve(&conflict) {
        Err(e) => Delivery::failed(e, Some(conflict)),
        Ok(Resolution::PendingArcResolution { review_id }) => Delivery::failed(
            FabricError::SyncDeliveryFailure {
                target: target.instance_id().to_string(),
                reason: format!("awaiting ARC review {review_id}"),
            },
            Some(conflict),
        ),
        Ok(Resolution::Resolved { winner }) => {
            conflict.resolution = Some(format!("{} copy kept", winner.embodiment));
            let top = entry.version().max(remote.version());
            let mut merged = winner.entry;
            if merged.version() < top || entry.version() == remote.version() {
                merged.metadata.version = top + 1;
            }
            if erased() {
                return Delivery::erased();
            }
            if merged != remote
                && let Err(e) = target.put(&merged, Some(remote.version())).await
            {
                return Delivery::failed(e, Some(conflict));
            }
            if merged != entry
                && let Err(e) = origin.put(&merged, Some(entry.version())).await
            {
                debug!(
                    origin = origin.instance_id(),
                    entry_id = %entry.id,
                    error = %e,
                    "origin moved on; leaving the winner for its next sync"
                );
            }
            Delivery::ok(Some(conflict))
        }
    }
}
