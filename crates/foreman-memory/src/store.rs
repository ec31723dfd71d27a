use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use foreman_core::entry::timestamp;
use foreman_core::{Embodiment, FabricError, MemoryEntry, Result, Sensitivity, Tier, now_millis};

use crate::keyring::Keyring;
use crate::limits::{SizeCheck, TierLimits, enforce_size_limits};

const PAGE_SIZE: usize = 256;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        tier TEXT NOT NULL,
        id TEXT NOT NULL,
        tenant_id TEXT,
        embodiment TEXT NOT NULL,
        session_id TEXT,
        category TEXT NOT NULL,
        actor TEXT NOT NULL,
        sensitivity TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        version INTEGER NOT NULL,
        body TEXT NOT NULL,
        sealed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        expires_at TEXT,
        last_read_at TEXT,
        archived INTEGER NOT NULL DEFAULT 0,
        UNIQUE(tier, id)
    );

    CREATE TABLE IF NOT EXISTS entry_versions (
        tier TEXT NOT NULL,
        id TEXT NOT NULL,
        tenant_id TEXT,
        version INTEGER NOT NULL,
        body TEXT NOT NULL,
        sealed INTEGER NOT NULL,
        archived_at TEXT NOT NULL,
        PRIMARY KEY (tier, id, version)
    );

    CREATE INDEX IF NOT EXISTS idx_entries_tier_updated ON entries(tier, archived, updated_at);
    CREATE INDEX IF NOT EXISTS idx_entries_tenant ON entries(tier, tenant_id);

    CREATE TRIGGER IF NOT EXISTS entry_versions_no_update
    BEFORE UPDATE ON entry_versions
    BEGIN SELECT RAISE(ABORT, 'entry version history is immutable'); END;

    CREATE TRIGGER IF NOT EXISTS entry_versions_no_delete
    BEFORE DELETE ON entry_versions
    BEGIN SELECT RAISE(ABORT, 'entry version history is immutable'); END;
";

fn storage(e: rusqlite::Error) -> FabricError {
    FabricError::Storage(e.to_string())
}

fn sensitivity_label(s: Option<Sensitivity>) -> Option<&'static str> {
    s.map(|s| match s {
        Sensitivity::High => "high",
        Sensitivity::Medium => "medium",
        Sensitivity::Low => "low",
    })
}

/// Handle to a stored entry version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRef {
    pub tier: Tier,
    pub id: String,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub entry: EntryRef,
    pub limit: SizeCheck,
    /// Ids evicted (STM/WM) or archived (LTM) by the post-put size check.
    pub pruned: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrunePolicy {
    /// Remove the oldest entries (by `updatedAt`) until at most `n` remain.
    ToLimit(usize),
    /// Remove entries whose `expiresAt` is at or before the given instant.
    Expired(DateTime<Utc>),
    All,
}

/// Filters for [`TierStore::query`]. Empty filter = every active entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryFilter {
    pub tenant_id: Option<String>,
    pub embodiment: Option<Embodiment>,
    pub session_id: Option<String>,
    pub category: Option<String>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Matches entries carrying any of these tags.
    pub tags: Vec<String>,
    pub sensitivity: Option<Sensitivity>,
    pub limit: Option<usize>,
    pub include_archived: bool,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn embodiment(mut self, embodiment: Embodiment) -> Self {
        self.embodiment = Some(embodiment);
        self
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session_id = Some(session.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

struct StoredRow {
    tenant_id: Option<String>,
    body: String,
    sealed: bool,
}

fn decode(keyring: &Keyring, row: &StoredRow) -> Result<MemoryEntry> {
    if row.sealed {
        let tenant = row
            .tenant_id
            .as_deref()
            .ok_or_else(|| FabricError::Storage("sealed row has no tenant".into()))?;
        let plain = keyring.open(tenant, &row.body)?;
        Ok(serde_json::from_slice(&plain)?)
    } else {
        Ok(serde_json::from_str(&row.body)?)
    }
}

/// Durable, tier-partitioned entry storage for one embodiment instance.
///
/// Every write is a compare-and-set on the entry's version. LTM bodies are
/// sealed with the tenant key before they touch disk, and each replaced LTM
/// version is copied into an immutable history table.
#[derive(Clone)]
pub struct TierStore {
    db: Arc<Mutex<Connection>>,
    keyring: Arc<Keyring>,
    limits: TierLimits,
}

impl TierStore {
    /// Open or create the store database at the given path.
    pub fn open(path: &Path, keyring: Arc<Keyring>, limits: TierLimits) -> Result<Self> {
        info!(?path, "opening tier store");

        let conn = Connection::open(path).map_err(storage)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            keyring,
            limits,
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory(keyring: Arc<Keyring>, limits: TierLimits) -> Result<Self> {
        Self::open(Path::new(":memory:"), keyring, limits)
    }

    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    fn encode(&self, entry: &MemoryEntry) -> Result<(String, bool)> {
        if entry.tier.is_tenant_scoped() {
            let tenant = entry
                .tenant_id
                .as_deref()
                .ok_or_else(|| FabricError::InvalidEntry("LTM entries require a tenantId".into()))?;
            let json = serde_json::to_vec(entry)?;
            Ok((self.keyring.seal(tenant, &json)?, true))
        } else {
            Ok((serde_json::to_string(entry)?, false))
        }
    }

    /// Compare-and-set write.
    ///
    /// The stored version must equal `expected` (`None` = entry absent) and the
    /// new version must be greater than the stored one; otherwise the write
    /// fails with `VersionConflict` and nothing changes.
    pub fn put(&self, entry: &MemoryEntry, expected: Option<u64>) -> Result<PutOutcome> {
        entry.check_invariants()?;
        let (body, sealed) = self.encode(entry)?;
        let tier = entry.tier;
        let tier_key = tier.id_prefix();
        let tags = serde_json::to_string(&entry.tags)?;
        let version = entry.version() as i64;

        {
            let mut db = self.db.lock();
            let tx = db.transaction().map_err(storage)?;

            let current: Option<(i64, Option<String>, String, bool)> = tx
                .query_row(
                    "SELECT version, tenant_id, body, sealed FROM entries WHERE tier = ?1 AND id = ?2",
                    params![tier_key, entry.id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(storage)?;
            let found = current.as_ref().map(|c| c.0 as u64);

            if tier.is_immutable() && found.is_some() {
                return Err(FabricError::GovernanceImmutable);
            }
            if let Some((_, stored_tenant, _, _)) = &current {
                if tier.is_tenant_scoped() && stored_tenant.as_deref() != entry.tenant_id.as_deref() {
                    return Err(FabricError::TenantIsolationViolation(format!(
                        "entry {} belongs to another tenant",
                        entry.id
                    )));
                }
            }
            let stale = found.is_some_and(|v| entry.version() <= v);
            if found != expected || stale {
                debug!(tier = %tier, id = %entry.id, ?expected, ?found, "compare-and-set rejected");
                return Err(FabricError::VersionConflict {
                    tier,
                    id: entry.id.clone(),
                    expected,
                    found,
                });
            }

            if tier.is_tenant_scoped() {
                if let Some((old_version, old_tenant, old_body, old_sealed)) = current {
                    tx.execute(
                        "INSERT OR IGNORE INTO entry_versions (tier, id, tenant_id, version, body, sealed, archived_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            tier_key,
                            entry.id,
                            old_tenant,
                            old_version,
                            old_body,
                            old_sealed,
                            timestamp::format(&now_millis()),
                        ],
                    )
                    .map_err(storage)?;
                }
            }

            tx.execute(
                "INSERT INTO entries (tier, id, tenant_id, embodiment, session_id, category, actor,
                                      sensitivity, tags, version, body, sealed, created_at, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(tier, id) DO UPDATE SET
                    tenant_id = excluded.tenant_id,
                    embodiment = excluded.embodiment,
                    session_id = excluded.session_id,
                    category = excluded.category,
                    actor = excluded.actor,
                    sensitivity = excluded.sensitivity,
                    tags = excluded.tags,
                    version = excluded.version,
                    body = excluded.body,
                    sealed = excluded.sealed,
                    updated_at = excluded.updated_at,
                    expires_at = excluded.expires_at,
                    archived = 0",
                params![
                    tier_key,
                    entry.id,
                    entry.tenant_id,
                    entry.embodiment.as_str(),
                    entry.session_id,
                    entry.category,
                    entry.actor,
                    sensitivity_label(entry.content.sensitivity),
                    tags,
                    version,
                    body,
                    sealed,
                    timestamp::format(&entry.metadata.created_at),
                    timestamp::format(&entry.metadata.updated_at),
                    entry.metadata.expires_at.as_ref().map(timestamp::format),
                ],
            )
            .map_err(storage)?;
            tx.commit().map_err(storage)?;
        }

        debug!(tier = %tier, id = %entry.id, version, "stored entry");
        let (limit, pruned) = self.enforce_limits(tier, entry.tenant_id.as_deref())?;

        Ok(PutOutcome {
            entry: EntryRef {
                tier,
                id: entry.id.clone(),
                version: entry.version(),
            },
            limit,
            pruned,
        })
    }

    /// Active entry by id. LTM lookups are scoped to `tenant` (no tenant, no
    /// result) and stamp the entry as read.
    pub fn get(&self, tier: Tier, id: &str, tenant: Option<&str>) -> Result<Option<MemoryEntry>> {
        if tier.is_tenant_scoped() && tenant.is_none() {
            return Ok(None);
        }
        let scope = if tier.is_tenant_scoped() { tenant } else { None };
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT seq, tenant_id, body, sealed FROM entries
                 WHERE tier = ?1 AND id = ?2 AND archived = 0 AND (?3 IS NULL OR tenant_id = ?3)",
                params![tier.id_prefix(), id, scope],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        StoredRow {
                            tenant_id: row.get(1)?,
                            body: row.get(2)?,
                            sealed: row.get(3)?,
                        },
                    ))
                },
            )
            .optional()
            .map_err(storage)?;
        let Some((seq, row)) = row else {
            return Ok(None);
        };
        if tier.is_tenant_scoped() {
            db.execute(
                "UPDATE entries SET last_read_at = ?1 WHERE seq = ?2",
                params![timestamp::format(&now_millis()), seq],
            )
            .map_err(storage)?;
        }
        drop(db);
        decode(&self.keyring, &row).map(Some)
    }

    /// Raw lookup for replication: includes archived rows and does not count as a read.
    pub fn peek(&self, tier: Tier, id: &str, tenant: Option<&str>) -> Result<Option<MemoryEntry>> {
        let scope = if tier.is_tenant_scoped() { tenant } else { None };
        let row = {
            let db = self.db.lock();
            db.query_row(
                "SELECT tenant_id, body, sealed FROM entries
                 WHERE tier = ?1 AND id = ?2 AND (?3 IS NULL OR tenant_id = ?3)",
                params![tier.id_prefix(), id, scope],
                |row| {
                    Ok(StoredRow {
                        tenant_id: row.get(0)?,
                        body: row.get(1)?,
                        sealed: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(storage)?
        };
        match row {
            Some(row) if tier.is_tenant_scoped() && row.tenant_id.as_deref() != tenant => Ok(None),
            Some(row) => decode(&self.keyring, &row).map(Some),
            None => Ok(None),
        }
    }

    /// Lazy, restartable scan of active entries matching `filter`.
    pub fn query(&self, tier: Tier, filter: QueryFilter) -> EntryCursor {
        // Tenant-scoped tiers yield nothing without a tenant.
        let exhausted = tier.is_tenant_scoped() && filter.tenant_id.is_none();
        EntryCursor {
            db: Arc::clone(&self.db),
            keyring: Arc::clone(&self.keyring),
            tier,
            filter,
            after_seq: 0,
            buffer: VecDeque::new(),
            yielded: 0,
            exhausted,
        }
    }

    pub fn count_active(&self, tier: Tier, tenant: Option<&str>) -> Result<usize> {
        let db = self.db.lock();
        let count: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM entries
                 WHERE tier = ?1 AND archived = 0 AND (?2 IS NULL OR tenant_id = ?2)",
                params![tier.id_prefix(), tenant],
                |row| row.get(0),
            )
            .map_err(storage)?;
        Ok(count as usize)
    }

    /// Never-read entries first, then least recently updated.
    fn oldest(&self, tier: Tier, tenant: Option<&str>, n: usize) -> Result<Vec<String>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT id FROM entries
                 WHERE tier = ?1 AND archived = 0 AND (?2 IS NULL OR tenant_id = ?2)
                 ORDER BY (last_read_at IS NOT NULL), updated_at, seq
                 LIMIT ?3",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![tier.id_prefix(), tenant, n as i64], |row| row.get(0))
            .map_err(storage)?;
        rows.collect::<std::result::Result<Vec<String>, _>>()
            .map_err(storage)
    }

    fn tenants_in(&self, tier: Tier) -> Result<Vec<String>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT DISTINCT tenant_id FROM entries
                 WHERE tier = ?1 AND archived = 0 AND tenant_id IS NOT NULL",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![tier.id_prefix()], |row| row.get(0))
            .map_err(storage)?;
        rows.collect::<std::result::Result<Vec<String>, _>>()
            .map_err(storage)
    }

    /// Size check run after every put: STM/WM evict, LTM archives per tenant.
    pub fn enforce_limits(&self, tier: Tier, tenant: Option<&str>) -> Result<(SizeCheck, Vec<String>)> {
        let scope = if tier.is_tenant_scoped() { tenant } else { None };
        let count = self.count_active(tier, scope)?;
        let check = enforce_size_limits(tier, count, &self.limits);
        let excess = check.excess();
        if excess == 0 {
            return Ok((check, Vec::new()));
        }

        let victims = self.oldest(tier, scope, excess)?;
        if tier.is_evicting() {
            self.delete_rows(tier, &victims)?;
            info!(tier = %tier, evicted = victims.len(), limit = ?check.limit, "evicted oldest entries over size limit");
        } else {
            self.archive(tier, &victims)?;
            info!(tier = %tier, archived = victims.len(), tenant = ?scope, "archived oldest unread entries over size limit");
        }
        Ok((check, victims))
    }

    /// Move entries out of the active set; they stay on disk for audit.
    pub fn archive(&self, tier: Tier, ids: &[String]) -> Result<usize> {
        if tier.is_immutable() {
            return Err(FabricError::GovernanceImmutable);
        }
        let mut db = self.db.lock();
        let tx = db.transaction().map_err(storage)?;
        let mut archived = 0;
        for id in ids {
            archived += tx
                .execute(
                    "UPDATE entries SET archived = 1 WHERE tier = ?1 AND id = ?2 AND archived = 0",
                    params![tier.id_prefix(), id],
                )
                .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(archived)
    }

    fn delete_rows(&self, tier: Tier, ids: &[String]) -> Result<usize> {
        let mut db = self.db.lock();
        let tx = db.transaction().map_err(storage)?;
        let mut deleted = 0;
        for id in ids {
            deleted += tx
                .execute(
                    "DELETE FROM entries WHERE tier = ?1 AND id = ?2",
                    params![tier.id_prefix(), id],
                )
                .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(deleted)
    }

    fn expired(&self, tier: Tier, now: DateTime<Utc>) -> Result<Vec<String>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT id FROM entries
                 WHERE tier = ?1 AND archived = 0 AND expires_at IS NOT NULL AND expires_at <= ?2",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![tier.id_prefix(), timestamp::format(&now)], |row| row.get(0))
            .map_err(storage)?;
        rows.collect::<std::result::Result<Vec<String>, _>>()
            .map_err(storage)
    }

    /// Remove entries by policy. STM/WM/EM rows are deleted; LTM rows are
    /// archived. SM and Governance Memory are never pruned.
    pub fn prune(&self, tier: Tier, policy: PrunePolicy) -> Result<Vec<String>> {
        if matches!(tier, Tier::Sm | Tier::Governance) {
            return Err(FabricError::GuardrailViolation {
                rule: "programmatic_deletion".into(),
                reason: format!("{tier} entries are never pruned"),
            });
        }

        let victims = match policy {
            PrunePolicy::ToLimit(n) if tier.is_tenant_scoped() => {
                let mut victims = Vec::new();
                for tenant in self.tenants_in(tier)? {
                    let count = self.count_active(tier, Some(&tenant))?;
                    if count > n {
                        victims.extend(self.oldest(tier, Some(&tenant), count - n)?);
                    }
                }
                victims
            }
            PrunePolicy::ToLimit(n) => {
                let count = self.count_active(tier, None)?;
                self.oldest(tier, None, count.saturating_sub(n))?
            }
            PrunePolicy::Expired(now) => self.expired(tier, now)?,
            PrunePolicy::All if tier.is_tenant_scoped() => {
                return Err(FabricError::ArcApprovalRequired(
                    "LTM entries are removed only by approved deletion".into(),
                ));
            }
            PrunePolicy::All => {
                let count = self.count_active(tier, None)?;
                self.oldest(tier, None, count)?
            }
        };

        if victims.is_empty() {
            return Ok(victims);
        }
        if tier.is_tenant_scoped() {
            self.archive(tier, &victims)?;
        } else {
            self.delete_rows(tier, &victims)?;
        }
        info!(tier = %tier, count = victims.len(), ?policy, "pruned entries");
        Ok(victims)
    }

    /// Full version history, oldest first, ending with the current version.
    pub fn versions(&self, tier: Tier, id: &str, tenant: Option<&str>) -> Result<Vec<MemoryEntry>> {
        if tier.is_tenant_scoped() && tenant.is_none() {
            return Ok(Vec::new());
        }
        let scope = if tier.is_tenant_scoped() { tenant } else { None };
        let rows = {
            let db = self.db.lock();
            let mut stmt = db
                .prepare(
                    "SELECT tenant_id, body, sealed FROM entry_versions
                     WHERE tier = ?1 AND id = ?2 AND (?3 IS NULL OR tenant_id = ?3)
                     ORDER BY version",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![tier.id_prefix(), id, scope], |row| {
                    Ok(StoredRow {
                        tenant_id: row.get(0)?,
                        body: row.get(1)?,
                        sealed: row.get(2)?,
                    })
                })
                .map_err(storage)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(storage)?
        };

        let mut history = rows
            .iter()
            .map(|row| decode(&self.keyring, row))
            .collect::<Result<Vec<_>>>()?;
        if let Some(current) = self.peek(tier, id, tenant)? {
            history.push(current);
        }
        Ok(history)
    }

    pub fn version(
        &self,
        tier: Tier,
        id: &str,
        version: u64,
        tenant: Option<&str>,
    ) -> Result<Option<MemoryEntry>> {
        Ok(self
            .versions(tier, id, tenant)?
            .into_iter()
            .find(|e| e.version() == version))
    }

    /// Remove the live entry. Prior versions stay in the history table.
    /// Callers gate this behind ARC approval.
    pub fn erase(&self, tier: Tier, id: &str, tenant: Option<&str>) -> Result<bool> {
        match tier {
            Tier::Governance => return Err(FabricError::GovernanceImmutable),
            Tier::Sm => {
                return Err(FabricError::GuardrailViolation {
                    rule: "programmatic_deletion".into(),
                    reason: "SM entries are never deleted".into(),
                });
            }
            Tier::Stm | Tier::Wm | Tier::Em | Tier::Ltm => {}
        }
        let scope = if tier.is_tenant_scoped() { tenant } else { None };
        let db = self.db.lock();
        let rows = db
            .execute(
                "DELETE FROM entries WHERE tier = ?1 AND id = ?2 AND (?3 IS NULL OR tenant_id = ?3)",
                params![tier.id_prefix(), id, scope],
            )
            .map_err(storage)?;
        if rows > 0 {
            info!(tier = %tier, id, "erased entry");
        }
        Ok(rows > 0)
    }
}

/// Lazy, finite iterator over query results, paging by insertion order.
pub struct EntryCursor {
    db: Arc<Mutex<Connection>>,
    keyring: Arc<Keyring>,
    tier: Tier,
    filter: QueryFilter,
    after_seq: i64,
    buffer: VecDeque<StoredRow>,
    yielded: usize,
    exhausted: bool,
}

impl EntryCursor {
    /// Rewind to the first match; later pages see the store as it is now.
    pub fn restart(&mut self) {
        self.after_seq = 0;
        self.buffer.clear();
        self.yielded = 0;
        self.exhausted = self.tier.is_tenant_scoped() && self.filter.tenant_id.is_none();
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    fn fetch_page(&mut self) -> Result<()> {
        let f = &self.filter;
        let mut sql =
            String::from("SELECT seq, tenant_id, body, sealed FROM entries WHERE tier = ?1 AND seq > ?2");
        let mut args = vec![
            SqlValue::Text(self.tier.id_prefix().into()),
            SqlValue::Integer(self.after_seq),
        ];
        let mut clause = |sql: &mut String, column: &str, op: &str, value: SqlValue| {
            args.push(value);
            sql.push_str(&format!(" AND {column} {op} ?{}", args.len()));
        };

        if !f.include_archived {
            sql.push_str(" AND archived = 0");
        }
        if let Some(t) = &f.tenant_id {
            clause(&mut sql, "tenant_id", "=", SqlValue::Text(t.clone()));
        }
        if let Some(e) = f.embodiment {
            clause(&mut sql, "embodiment", "=", SqlValue::Text(e.as_str().into()));
        }
        if let Some(s) = &f.session_id {
            clause(&mut sql, "session_id", "=", SqlValue::Text(s.clone()));
        }
        if let Some(c) = &f.category {
            clause(&mut sql, "category", "=", SqlValue::Text(c.clone()));
        }
        if let Some(a) = &f.actor {
            clause(&mut sql, "actor", "=", SqlValue::Text(a.clone()));
        }
        if let Some(since) = &f.since {
            clause(&mut sql, "updated_at", ">=", SqlValue::Text(timestamp::format(since)));
        }
        if let Some(until) = &f.until {
            clause(&mut sql, "updated_at", "<=", SqlValue::Text(timestamp::format(until)));
        }
        if let Some(label) = sensitivity_label(f.sensitivity) {
            clause(&mut sql, "sensitivity", "=", SqlValue::Text(label.into()));
        }
        drop(clause);
        if !f.tags.is_empty() {
            let first = args.len() + 1;
            let slots: Vec<String> = (first..first + f.tags.len()).map(|i| format!("?{i}")).collect();
            args.extend(f.tags.iter().map(|t| SqlValue::Text(t.clone())));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(entries.tags) WHERE json_each.value IN ({}))",
                slots.join(", ")
            ));
        }

        let page = match f.limit {
            Some(limit) => PAGE_SIZE.min(limit.saturating_sub(self.yielded)),
            None => PAGE_SIZE,
        };
        sql.push_str(&format!(" ORDER BY seq LIMIT {page}"));

        let db = self.db.lock();
        let mut fetched = Vec::new();
        {
            let mut stmt = db.prepare(&sql).map_err(storage)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        StoredRow {
                            tenant_id: row.get(1)?,
                            body: row.get(2)?,
                            sealed: row.get(3)?,
                        },
                    ))
                })
                .map_err(storage)?;
            for row in rows {
                fetched.push(row.map_err(storage)?);
            }
        }

        if fetched.len() < page {
            self.exhausted = true;
        }
        if self.tier.is_tenant_scoped() && !fetched.is_empty() {
            let now = timestamp::format(&now_millis());
            for (seq, _) in &fetched {
                db.execute(
                    "UPDATE entries SET last_read_at = ?1 WHERE seq = ?2",
                    params![now, seq],
                )
                .map_err(storage)?;
            }
        }
        for (seq, row) in fetched {
            self.after_seq = seq;
            self.buffer.push_back(row);
        }
        Ok(())
    }
}

impl Iterator for EntryCursor {
    type Item = Result<MemoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.filter.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let row = self.buffer.pop_front()?;
        self.yielded += 1;
        Some(decode(&self.keyring, &row))
    }
}
