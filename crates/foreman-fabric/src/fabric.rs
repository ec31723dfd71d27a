use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use foreman_boundary::{
    ArcAction, ArcApproval, ArcDecision, ArcReviewQueue, ArcVerifier, BoundaryContext,
    BoundaryDecision, BoundaryEnforcer, MemoryOperation, OperationKind, privilege,
};
use foreman_config::{FabricConfig, InstanceConfig};
use foreman_core::{
    Embodiment, EventBus, FabricError, FabricEvent, MemoryEntry, Result, Severity, Tier,
    now_millis,
};
use foreman_memory::{
    AccessLogRecord, AccessResult, AccessType, AuditCategory, AuditEvent, AuditFilter, AuditLog,
    AuditRecord, Keyring, PrunePolicy, QueryFilter, TierStore,
};
use foreman_sync::{
    ReconcileReport, Resolution, SyncEngine, SyncHealth, SyncReport, SyncStatus, VersionSnapshot,
    detect_conflict,
};

use crate::builder::FabricBuilder;
use crate::recall::RecallCursor;
use crate::request::{StoreRequest, UpdateRequest};

/// One embodiment instance hosted by this process.
pub struct HostedInstance {
    id: String,
    config: InstanceConfig,
    store: TierStore,
}

impl HostedInstance {
    pub(crate) fn new(id: String, config: InstanceConfig, store: TierStore) -> Self {
        Self { id, config, store }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn embodiment(&self) -> Embodiment {
        self.config.embodiment
    }

    pub fn tenant(&self) -> Option<&str> {
        self.config.tenant.as_deref()
    }

    pub fn store(&self) -> &TierStore {
        &self.store
    }
}

/// The Memory Fabric entry point.
///
/// Every operation takes the caller's [`BoundaryContext`] and passes the
/// boundary enforcer before storage is touched. Writes return once the local
/// commit succeeds; sync to the other instances happens on background tasks
/// that [`flush_sync`](Self::flush_sync) can await.
pub struct MemoryFabric {
    pub(crate) config: FabricConfig,
    pub(crate) instances: Vec<HostedInstance>,
    pub(crate) audit: AuditLog,
    pub(crate) keyring: Arc<Keyring>,
    pub(crate) enforcer: BoundaryEnforcer,
    pub(crate) sync: Arc<SyncEngine>,
    pub(crate) events: EventBus,
    pub(crate) verifier: Arc<dyn ArcVerifier>,
    pub(crate) reviews: Arc<ArcReviewQueue>,
    pub(crate) in_flight: Mutex<JoinSet<Option<SyncReport>>>,
    /// Reports joined by `delete` before the caller asked for them.
    pub(crate) collected: Mutex<Vec<SyncReport>>,
}

impl MemoryFabric {
    /// Build a fabric with the stores, keys and verifier described by `config`.
    pub fn new(config: FabricConfig) -> Result<Self> {
        FabricBuilder::new(config).build()
    }

    pub fn builder(config: FabricConfig) -> FabricBuilder {
        FabricBuilder::new(config)
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn instances(&self) -> &[HostedInstance] {
        &self.instances
    }

    pub fn instance(&self, id: &str) -> Option<&HostedInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn reviews(&self) -> &Arc<ArcReviewQueue> {
        &self.reviews
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    // ── Entry API ──────────────────────────────────────────────

    /// Store a new entry on the caller's instance and schedule its sync.
    pub async fn store(&self, ctx: &BoundaryContext, request: StoreRequest) -> Result<MemoryEntry> {
        request.content.validate_for(request.tier)?;
        let instance = self.route(ctx)?;
        let tier = request.tier;

        let mut entry = MemoryEntry::new(tier, ctx.embodiment, request.category, request.actor, request.content)
            .with_tags(request.tags);
        if let Some(tenant) = tenant_scope(tier, request.tenant_id.as_deref(), ctx) {
            entry = entry.with_tenant(tenant);
        }
        if let Some(session) = request.session_id {
            entry = entry.with_session(session);
        }
        if tier == Tier::Stm {
            let ttl = i64::try_from(self.config.tiers.stm_ttl_secs)
                .ok()
                .and_then(Duration::try_seconds);
            entry.metadata.expires_at = ttl.and_then(|ttl| entry.metadata.created_at.checked_add_signed(ttl));
        }

        let mut operation = MemoryOperation::for_entry(OperationKind::Write, &entry);
        if let Some(target) = request.target {
            operation = operation.target(target);
        }
        self.authorize(&operation, ctx, Some(&instance.store))?;

        let outcome = instance.store.put(&entry, None)?;
        if !outcome.pruned.is_empty() {
            info!(tier = %tier, count = outcome.pruned.len(), "size limit pruned entries");
            self.events.publish(FabricEvent::EntriesPruned {
                tier,
                count: outcome.pruned.len(),
            });
        }
        if tier.is_tenant_scoped() {
            self.record_access(ctx, &entry.id, entry.tenant_id.as_deref(), AccessType::Write, AccessResult::Granted, None)?;
        }

        info!(tier = %tier, id = %entry.id, embodiment = %ctx.embodiment, "stored entry");
        self.events.publish(FabricEvent::EntryStored {
            tier,
            id: entry.id.clone(),
            embodiment: ctx.embodiment,
        });
        self.spawn_sync(&instance.id, &entry);
        Ok(entry)
    }

    /// Entries of `tier` on the caller's instance matching `filter`.
    ///
    /// LTM is always scoped to one tenant: the filter's if given, else the
    /// caller's. Asking for another tenant than the authenticated one fails.
    pub fn recall(&self, ctx: &BoundaryContext, tier: Tier, mut filter: QueryFilter) -> Result<RecallCursor> {
        let instance = self.route(ctx)?;
        let scope = tenant_scope(tier, filter.tenant_id.as_deref(), ctx);
        let operation = MemoryOperation::read(tier, ctx.embodiment).tenant(scope.as_deref());
        self.authorize(&operation, ctx, None)?;

        if tier.is_tenant_scoped() {
            filter.tenant_id = scope;
        }
        let cursor = RecallCursor::new(instance.store.query(tier, filter));
        Ok(if tier.is_tenant_scoped() {
            cursor.with_access_log(self.audit.clone(), ctx.embodiment, ctx.tenant())
        } else {
            cursor
        })
    }

    /// One entry by id, or `None` when the caller's instance does not hold it.
    pub fn get(&self, ctx: &BoundaryContext, tier: Tier, id: &str, tenant: Option<&str>) -> Result<Option<MemoryEntry>> {
        let instance = self.route(ctx)?;
        let scope = tenant_scope(tier, tenant, ctx);
        let operation = MemoryOperation::read(tier, ctx.embodiment)
            .tenant(scope.as_deref())
            .entry(id);
        self.authorize(&operation, ctx, None)?;

        let entry = instance.store.get(tier, id, scope.as_deref())?;
        if tier.is_tenant_scoped() && entry.is_some() {
            self.record_access(ctx, id, scope.as_deref(), AccessType::Read, AccessResult::Granted, None)?;
        }
        Ok(entry)
    }

    /// Replace an entry's content, producing the next version.
    ///
    /// LTM updates must carry a reason; the replaced version stays readable
    /// through [`get_ltm_version`](Self::get_ltm_version).
    pub async fn update(&self, ctx: &BoundaryContext, request: UpdateRequest) -> Result<MemoryEntry> {
        let UpdateRequest {
            tier,
            id,
            content,
            tenant_id,
            reason,
        } = request;
        content.validate_for(tier)?;
        let reason = reason.filter(|r| !r.trim().is_empty());
        if tier == Tier::Ltm && reason.is_none() {
            return Err(FabricError::InvalidEntry("LTM updates require an update reason".into()));
        }

        let instance = self.route(ctx)?;
        let scope = tenant_scope(tier, tenant_id.as_deref(), ctx);
        let current = instance.store.peek(tier, &id, scope.as_deref())?;

        // Missing entries are authorized against a stand-in so an
        // unprivileged caller learns nothing about what exists.
        let candidate = match &current {
            Some(current) => current.next_version(content),
            None => {
                let mut stand_in = MemoryEntry::new(tier, ctx.embodiment, "", "", content).with_id(id.clone());
                stand_in.tenant_id = scope.clone();
                stand_in
            }
        };
        let mut operation = MemoryOperation::for_entry(OperationKind::Update, &candidate);
        operation.embodiment = ctx.embodiment;
        self.authorize(&operation, ctx, None)?;

        let Some(current) = current else {
            return Err(FabricError::NotFound { tier, id });
        };
        let next = match instance.store.put(&candidate, Some(current.version())) {
            Ok(_) => candidate,
            Err(FabricError::VersionConflict { .. }) => {
                // A sync delivery landed between read and write; rebase once.
                let latest = instance
                    .store
                    .peek(tier, &id, scope.as_deref())?
                    .ok_or_else(|| FabricError::NotFound { tier, id: id.clone() })?;
                debug!(tier = %tier, id = %id, version = latest.version(), "rebasing update");
                let rebased = latest.next_version(candidate.content);
                instance.store.put(&rebased, Some(latest.version()))?;
                rebased
            }
            Err(e) => return Err(e),
        };

        if tier.is_tenant_scoped() {
            self.record_access(ctx, &id, scope.as_deref(), AccessType::Update, AccessResult::Granted, reason)?;
        }
        info!(tier = %tier, id = %id, version = next.version(), "updated entry");
        self.events.publish(FabricEvent::EntryUpdated {
            tier,
            id,
            version: next.version(),
        });
        self.spawn_sync(&instance.id, &next);
        Ok(next)
    }

    /// Erase an LTM entry from every hosted replica. Its version history is
    /// kept for audit.
    ///
    /// Only LTM can be deleted and only with a valid ARC approval naming the
    /// approver. The approval is recorded in the audit log. Sync already in
    /// flight is drained first and the id is tombstoned, so no replica gets
    /// the entry back.
    pub async fn delete(
        &self,
        ctx: &BoundaryContext,
        tier: Tier,
        id: &str,
        tenant: Option<&str>,
        approval: Option<&ArcApproval>,
    ) -> Result<()> {
        let scope = tenant_scope(tier, tenant, ctx);
        let operation = MemoryOperation::new(OperationKind::Delete, tier, ctx.embodiment)
            .tenant(scope.as_deref())
            .entry(id);
        self.authorize(&operation, ctx, None)?;

        let Some(approval) = approval else {
            let err = FabricError::ArcApprovalRequired(format!("deleting {id} needs a named approver and token"));
            self.record_deletion_refused(ctx, id, scope.as_deref(), None, &err)?;
            return Err(err);
        };
        if let Err(err) = self.verifier.verify(approval, ArcAction::LtmDeletion, id) {
            self.record_deletion_refused(ctx, id, scope.as_deref(), Some(&approval.approver), &err)?;
            return Err(err);
        }

        let mut present = false;
        for instance in &self.instances {
            if instance.store.peek(tier, id, scope.as_deref())?.is_some() {
                present = true;
                break;
            }
        }
        if !present {
            return Err(FabricError::NotFound {
                tier,
                id: id.to_string(),
            });
        }

        self.sync.tombstone(tier, scope.as_deref(), id);
        let drained = self.join_in_flight().await;
        self.collected.lock().extend(drained);

        let mut replicas = 0;
        for instance in &self.instances {
            if instance.store.erase(tier, id, scope.as_deref())? {
                replicas += 1;
            }
        }
        if replicas == 0 {
            return Err(FabricError::NotFound {
                tier,
                id: id.to_string(),
            });
        }

        self.audit.append(
            AuditRecord::new(
                AuditCategory::ArcDecision,
                "ltm_deletion_approved",
                Severity::High,
                format!("LTM entry {id} deleted with approval from {}", approval.approver),
            )
            .source(ctx.embodiment)
            .entry(id)
            .tenant(scope.as_deref())
            .metadata(json!({ "approver": approval.approver, "replicas": replicas })),
        )?;
        self.record_access(
            ctx,
            id,
            scope.as_deref(),
            AccessType::Delete,
            AccessResult::Granted,
            Some(format!("approved by {}", approval.approver)),
        )?;

        info!(id, approver = %approval.approver, replicas, "erased LTM entry");
        self.events.publish(FabricEvent::EntryErased {
            tier,
            id: id.to_string(),
            tenant_id: scope,
        });
        Ok(())
    }

    // ── LTM history & access ───────────────────────────────────

    /// A specific historical (or the current) version of an LTM entry.
    pub fn get_ltm_version(
        &self,
        ctx: &BoundaryContext,
        id: &str,
        version: u64,
        tenant: Option<&str>,
    ) -> Result<Option<MemoryEntry>> {
        let (instance, scope) = self.authorize_ltm_read(ctx, id, tenant)?;
        let entry = instance.store.version(Tier::Ltm, id, version, scope.as_deref())?;
        if entry.is_some() {
            self.record_access(
                ctx,
                id,
                scope.as_deref(),
                AccessType::Read,
                AccessResult::Granted,
                Some(format!("version {version}")),
            )?;
        }
        Ok(entry)
    }

    /// Every stored version of an LTM entry, oldest first.
    pub fn ltm_versions(&self, ctx: &BoundaryContext, id: &str, tenant: Option<&str>) -> Result<Vec<MemoryEntry>> {
        let (instance, scope) = self.authorize_ltm_read(ctx, id, tenant)?;
        instance.store.versions(Tier::Ltm, id, scope.as_deref())
    }

    pub fn get_access_log(&self, ctx: &BoundaryContext, id: &str, tenant: Option<&str>) -> Result<Vec<AccessLogRecord>> {
        let (_, scope) = self.authorize_ltm_read(ctx, id, tenant)?;
        self.audit.access_log(id, scope.as_deref())
    }

    fn authorize_ltm_read(
        &self,
        ctx: &BoundaryContext,
        id: &str,
        tenant: Option<&str>,
    ) -> Result<(&HostedInstance, Option<String>)> {
        let instance = self.route(ctx)?;
        let scope = tenant_scope(Tier::Ltm, tenant, ctx);
        let operation = MemoryOperation::read(Tier::Ltm, ctx.embodiment)
            .tenant(scope.as_deref())
            .entry(id);
        self.authorize(&operation, ctx, None)?;
        Ok((instance, scope))
    }

    // ── Sync ───────────────────────────────────────────────────

    pub fn get_sync_status(&self, embodiment: Embodiment) -> SyncStatus {
        self.sync.status(embodiment)
    }

    pub fn check_sync_health(&self, embodiment: Embodiment) -> SyncHealth {
        self.sync.check_health(embodiment)
    }

    pub async fn reconcile_embodiment(&self, embodiment: Embodiment) -> Result<ReconcileReport> {
        self.sync.reconcile_embodiment(embodiment).await
    }

    /// Wait for every background sync started so far.
    ///
    /// Returns the reports of tasks that had not been collected yet.
    pub async fn flush_sync(&self) -> Vec<SyncReport> {
        let mut reports = std::mem::take(&mut *self.collected.lock());
        reports.extend(self.join_in_flight().await);
        reports
    }

    async fn join_in_flight(&self) -> Vec<SyncReport> {
        let mut tasks = std::mem::take(&mut *self.in_flight.lock());
        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "sync task failed to complete"),
            }
        }
        reports
    }

    fn spawn_sync(&self, origin: &str, entry: &MemoryEntry) {
        if !entry.tier.is_synchronized() {
            return;
        }
        let sync = Arc::clone(&self.sync);
        let origin = origin.to_string();
        let entry = entry.clone();

        let mut tasks = self.in_flight.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match sync.sync(&origin, &entry).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(origin = %origin, id = %entry.id, error = %e, "sync failed");
                    None
                }
            }
        });
    }

    // ── Governance & conflicts ─────────────────────────────────

    /// Read-only view of the audit log, open to every embodiment.
    pub fn query_governance_memory(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        self.audit.query(filter)
    }

    /// Settle two copies of one entry with the tier's strategy.
    ///
    /// `None` when the copies do not conflict.
    pub fn resolve_conflict(&self, a: &VersionSnapshot, b: &VersionSnapshot) -> Result<Option<Resolution>> {
        match detect_conflict(a, b) {
            Some(conflict) => self.sync.resolver().resolve(&conflict).map(Some),
            None => Ok(None),
        }
    }

    /// Apply a human decision on an escalated SM conflict.
    ///
    /// An approval writes the chosen copy, at a version above every
    /// candidate, to each hosted instance and returns it.
    pub fn decide_arc_review(&self, review_id: Uuid, decision: ArcDecision) -> Result<Option<MemoryEntry>> {
        let (review, chosen) = self.reviews.decide(review_id, &decision, self.verifier.as_ref())?;
        let approver = match &decision {
            ArcDecision::Approve { approval, .. } => approval.approver.clone(),
            ArcDecision::Reject { approver } => approver.clone(),
        };

        let Some(chosen) = chosen else {
            self.audit.append(
                AuditRecord::new(
                    AuditCategory::ArcDecision,
                    "sm_conflict_rejected",
                    Severity::Medium,
                    format!("ARC review {review_id} on {} rejected by {approver}", review.entry_id),
                )
                .source("arc")
                .entry(review.entry_id.clone())
                .metadata(json!({ "reviewId": review_id, "approver": approver })),
            )?;
            return Ok(None);
        };

        let chosen: VersionSnapshot = serde_json::from_value(chosen)?;
        let top = review
            .candidates
            .iter()
            .filter_map(|c| serde_json::from_value::<VersionSnapshot>(c.clone()).ok())
            .map(|s| s.version())
            .max()
            .unwrap_or(0);
        let mut winner = chosen.entry;
        winner.metadata.version = top.max(winner.version()) + 1;
        winner.metadata.updated_at = now_millis().max(winner.metadata.updated_at);

        let mut applied = 0;
        for instance in &self.instances {
            if !privilege(instance.embodiment(), review.tier).read {
                continue;
            }
            let scope = winner.tenant_id.as_deref().filter(|_| review.tier.is_tenant_scoped());
            let current = instance.store.peek(review.tier, &winner.id, scope)?;
            match instance.store.put(&winner, current.map(|c| c.version())) {
                Ok(_) => applied += 1,
                Err(FabricError::VersionConflict { .. }) => {
                    warn!(instance = %instance.id, id = %winner.id, "newer copy present; ARC decision not applied there");
                }
                Err(e) => return Err(e),
            }
        }

        self.audit.append(
            AuditRecord::new(
                AuditCategory::ArcDecision,
                "sm_conflict_resolved",
                Severity::Medium,
                format!("ARC review {review_id} on {} approved by {approver}", review.entry_id),
            )
            .source("arc")
            .entry(review.entry_id.clone())
            .metadata(json!({
                "reviewId": review_id,
                "approver": approver,
                "winner": chosen.embodiment,
                "version": winner.version(),
                "applied": applied,
            })),
        )?;
        info!(review = %review_id, id = %winner.id, version = winner.version(), applied, "applied ARC decision");
        Ok(Some(winner))
    }

    // ── Maintenance ────────────────────────────────────────────

    /// Drop STM entries whose TTL has passed, on every hosted instance.
    pub fn expire_short_term(&self) -> Result<usize> {
        let now = now_millis();
        let mut removed = 0;
        for instance in &self.instances {
            removed += instance.store.prune(Tier::Stm, PrunePolicy::Expired(now))?.len();
        }
        if removed > 0 {
            info!(count = removed, "expired short-term entries");
            self.events.publish(FabricEvent::EntriesPruned {
                tier: Tier::Stm,
                count: removed,
            });
        }
        Ok(removed)
    }

    // ── Internals ──────────────────────────────────────────────

    /// The instance serving `ctx`: same embodiment and tenant, else the
    /// embodiment's tenant-less instance, else any instance of it.
    fn route(&self, ctx: &BoundaryContext) -> Result<&HostedInstance> {
        let hosted = || self.instances.iter().filter(|i| i.embodiment() == ctx.embodiment);
        let shared = hosted().find(|i| i.tenant().is_none());
        let routed = match ctx.tenant() {
            // Never another tenant's instance.
            Some(tenant) => hosted().find(|i| i.tenant() == Some(tenant)).or(shared),
            // The enforcer rejects tenant-scoped tiers without a tenant context.
            None => shared.or_else(|| hosted().next()),
        };
        match (routed, ctx.tenant()) {
            (Some(instance), _) => Ok(instance),
            (None, Some(tenant)) if hosted().next().is_some() => Err(FabricError::TenantIsolationViolation(
                format!("no {} instance serves tenant {tenant}", ctx.embodiment),
            )),
            (None, _) => Err(FabricError::UnknownEmbodiment(format!("{} is not hosted here", ctx.embodiment))),
        }
    }

    fn authorize(
        &self,
        operation: &MemoryOperation,
        ctx: &BoundaryContext,
        store: Option<&TierStore>,
    ) -> Result<BoundaryDecision> {
        let decision = match store {
            Some(store) => self.enforcer.enforce_in(operation, ctx, store)?,
            None => self.enforcer.enforce(operation, ctx)?,
        };
        if !decision.allowed
            && operation.tier.is_tenant_scoped()
            && let (Some(id), Some(access_type)) = (&operation.entry_id, access_kind(operation.kind))
        {
            self.record_access(
                ctx,
                id,
                operation.tenant_id.as_deref(),
                access_type,
                AccessResult::Denied,
                decision.reason.clone(),
            )?;
        }
        decision.clone().into_result()?;
        Ok(decision)
    }

    fn record_access(
        &self,
        ctx: &BoundaryContext,
        id: &str,
        tenant: Option<&str>,
        access_type: AccessType,
        result: AccessResult,
        reason: Option<String>,
    ) -> Result<()> {
        self.audit.record_access(&AccessLogRecord {
            timestamp: now_millis(),
            entry_id: id.to_string(),
            tier: Tier::Ltm,
            tenant_id: tenant.map(str::to_string),
            accessed_by: ctx.embodiment,
            access_type,
            result,
            tenant_verified: tenant.is_some() && tenant == ctx.tenant(),
            reason,
        })
    }

    fn record_deletion_refused(
        &self,
        ctx: &BoundaryContext,
        id: &str,
        tenant: Option<&str>,
        approver: Option<&str>,
        err: &FabricError,
    ) -> Result<()> {
        warn!(id, embodiment = %ctx.embodiment, "LTM deletion refused: {err}");
        self.audit.append(
            AuditRecord::new(
                AuditCategory::ArcDecision,
                "ltm_deletion_refused",
                Severity::Medium,
                err.to_string(),
            )
            .source(ctx.embodiment)
            .entry(id)
            .tenant(tenant)
            .metadata(json!({ "approver": approver })),
        )?;
        self.record_access(ctx, id, tenant, AccessType::Delete, AccessResult::Denied, Some(err.to_string()))
    }
}

/// Tenant an operation runs under. Tenant-scoped tiers fall back to the
/// caller's authenticated tenant.
fn tenant_scope(tier: Tier, requested: Option<&str>, ctx: &BoundaryContext) -> Option<String> {
    match requested {
        Some(tenant) => Some(tenant.to_string()),
        None if tier.is_tenant_scoped() => ctx.tenant().map(str::to_string),
        None => None,
    }
}

fn access_kind(kind: OperationKind) -> Option<AccessType> {
    match kind {
        OperationKind::Read => Some(AccessType::Read),
        OperationKind::Write => Some(AccessType::Write),
        OperationKind::Update => Some(AccessType::Update),
        OperationKind::Delete => Some(AccessType::Delete),
        OperationKind::ModifyBoundary => None,
    }
}
