use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use foreman_core::entry::timestamp;
use foreman_core::{Embodiment, FabricError, Result, Severity, Tier, now_millis};

const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS audit_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        timestamp TEXT NOT NULL,
        category TEXT NOT NULL,
        event_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        source TEXT NOT NULL,
        entry_id TEXT,
        tenant_id TEXT,
        description TEXT NOT NULL,
        metadata TEXT NOT NULL,
        prev_checksum TEXT NOT NULL,
        checksum TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS access_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        entry_id TEXT NOT NULL,
        tier TEXT NOT NULL,
        tenant_id TEXT,
        accessed_by TEXT NOT NULL,
        access_type TEXT NOT NULL,
        result TEXT NOT NULL,
        tenant_verified INTEGER NOT NULL,
        reason TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_audit_category ON audit_log(category);
    CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
    CREATE INDEX IF NOT EXISTS idx_access_entry ON access_log(entry_id);

    CREATE TRIGGER IF NOT EXISTS audit_log_no_update
    BEFORE UPDATE ON audit_log
    BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;

    CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
    BEFORE DELETE ON audit_log
    BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;

    CREATE TRIGGER IF NOT EXISTS access_log_no_update
    BEFORE UPDATE ON access_log
    BEGIN SELECT RAISE(ABORT, 'access log is append-only'); END;

    CREATE TRIGGER IF NOT EXISTS access_log_no_delete
    BEFORE DELETE ON access_log
    BEGIN SELECT RAISE(ABORT, 'access log is append-only'); END;
";

fn storage(e: rusqlite::Error) -> FabricError {
    FabricError::Storage(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    BoundaryViolation,
    SyncEvent,
    ArcDecision,
    SecurityEvent,
    MemoryOperation,
}

impl AuditCategory {
    pub const ALL: [AuditCategory; 5] = [
        AuditCategory::BoundaryViolation,
        AuditCategory::SyncEvent,
        AuditCategory::ArcDecision,
        AuditCategory::SecurityEvent,
        AuditCategory::MemoryOperation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::BoundaryViolation => "boundary_violation",
            AuditCategory::SyncEvent => "sync_event",
            AuditCategory::ArcDecision => "arc_decision",
            AuditCategory::SecurityEvent => "security_event",
            AuditCategory::MemoryOperation => "memory_operation",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditCategory {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        AuditCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| FabricError::InvalidEntry(format!("unknown audit category: {s}")))
    }
}

/// An event to append. Built by callers, sealed into an [`AuditEvent`] by the log.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub category: AuditCategory,
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    pub description: String,
    pub entry_id: Option<String>,
    pub tenant_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        category: AuditCategory,
        event_type: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            category,
            event_type: event_type.into(),
            severity,
            source: "fabric".into(),
            description: description.into(),
            entry_id: None,
            tenant_id: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn source(mut self, source: impl fmt::Display) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn entry(mut self, id: impl Into<String>) -> Self {
        self.entry_id = Some(id.into());
        self
    }

    pub fn tenant(mut self, tenant: Option<&str>) -> Self {
        self.tenant_id = tenant.map(str::to_string);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A persisted, immutable audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub seq: i64,
    pub id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    pub entry_id: Option<String>,
    pub tenant_id: Option<String>,
    pub description: String,
    pub metadata: serde_json::Value,
    pub checksum: String,
}

/// Filters for [`AuditLog::query`]. Results are newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditFilter {
    pub category: Option<AuditCategory>,
    /// Minimum severity, inclusive.
    pub min_severity: Option<Severity>,
    pub source: Option<String>,
    pub event_type: Option<String>,
    pub entry_id: Option<String>,
    pub tenant_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn category(category: AuditCategory) -> Self {
        Self {
            category: Some(category),
            ..Self::default()
        }
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }
}

/// Result of walking the checksum chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub verified: usize,
    pub broken_at: Option<i64>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Read,
    Write,
    Update,
    Delete,
}

impl AccessType {
    fn as_str(&self) -> &'static str {
        match self {
            AccessType::Read => "read",
            AccessType::Write => "write",
            AccessType::Update => "update",
            AccessType::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "write" => AccessType::Write,
            "update" => AccessType::Update,
            "delete" => AccessType::Delete,
            _ => AccessType::Read,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessResult {
    Granted,
    Denied,
}

/// One access to a tenant-scoped entry, granted or denied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogRecord {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub entry_id: String,
    pub tier: Tier,
    pub tenant_id: Option<String>,
    pub accessed_by: Embodiment,
    pub access_type: AccessType,
    pub result: AccessResult,
    pub tenant_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn chain_hash(prev: &str, fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev.as_bytes());
    for field in fields {
        hasher.update(&[0x1f]);
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Append-only governance ledger plus the LTM access log.
///
/// Each event's checksum covers the previous event's checksum, so editing or
/// removing a row anywhere breaks [`AuditLog::verify_chain`]. The SQL layer
/// additionally refuses `UPDATE` and `DELETE` on both tables.
#[derive(Clone)]
pub struct AuditLog {
    db: Arc<Mutex<Connection>>,
}

impl AuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening audit log");
        let conn = Connection::open(path).map_err(storage)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory log (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    pub fn append(&self, record: AuditRecord) -> Result<AuditEvent> {
        let id = Uuid::new_v4().to_string();
        let ts = now_millis();
        let ts_text = timestamp::format(&ts);
        let metadata_text = serde_json::to_string(&record.metadata)?;

        let db = self.db.lock();
        let prev: String = db
            .query_row(
                "SELECT checksum FROM audit_log ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?
            .unwrap_or_else(|| GENESIS.to_string());

        let checksum = chain_hash(
            &prev,
            &[
                id.as_str(),
                ts_text.as_str(),
                record.category.as_str(),
                record.event_type.as_str(),
                record.severity.as_str(),
                record.source.as_str(),
                record.entry_id.as_deref().unwrap_or(""),
                record.tenant_id.as_deref().unwrap_or(""),
                record.description.as_str(),
                metadata_text.as_str(),
            ],
        );

        db.execute(
            "INSERT INTO audit_log (id, timestamp, category, event_type, severity, source, entry_id,
                                    tenant_id, description, metadata, prev_checksum, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                ts_text,
                record.category.as_str(),
                record.event_type,
                record.severity.as_str(),
                record.source,
                record.entry_id,
                record.tenant_id,
                record.description,
                metadata_text,
                prev,
                checksum,
            ],
        )
        .map_err(storage)?;
        let seq = db.last_insert_rowid();
        drop(db);

        debug!(
            seq,
            category = %record.category,
            event_type = %record.event_type,
            severity = %record.severity,
            "audit event appended"
        );

        Ok(AuditEvent {
            seq,
            id,
            timestamp: ts,
            category: record.category,
            event_type: record.event_type,
            severity: record.severity,
            source: record.source,
            entry_id: record.entry_id,
            tenant_id: record.tenant_id,
            description: record.description,
            metadata: record.metadata,
            checksum,
        })
    }

    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        let mut sql = String::from(
            "SELECT seq, id, timestamp, category, event_type, severity, source, entry_id, tenant_id,
                    description, metadata, checksum
             FROM audit_log WHERE 1 = 1",
        );
        let mut args: Vec<SqlValue> = Vec::new();
        let mut clause = |sql: &mut String, column: &str, op: &str, value: String| {
            args.push(SqlValue::Text(value));
            sql.push_str(&format!(" AND {column} {op} ?{}", args.len()));
        };

        if let Some(c) = filter.category {
            clause(&mut sql, "category", "=", c.as_str().into());
        }
        if let Some(s) = &filter.source {
            clause(&mut sql, "source", "=", s.clone());
        }
        if let Some(t) = &filter.event_type {
            clause(&mut sql, "event_type", "=", t.clone());
        }
        if let Some(e) = &filter.entry_id {
            clause(&mut sql, "entry_id", "=", e.clone());
        }
        if let Some(t) = &filter.tenant_id {
            clause(&mut sql, "tenant_id", "=", t.clone());
        }
        if let Some(since) = &filter.since {
            clause(&mut sql, "timestamp", ">=", timestamp::format(since));
        }
        if let Some(until) = &filter.until {
            clause(&mut sql, "timestamp", "<=", timestamp::format(until));
        }
        if let Some(min) = filter.min_severity {
            let allowed: Vec<&str> = [Severity::Low, Severity::Medium, Severity::High, Severity::Critical]
                .into_iter()
                .filter(|s| *s >= min)
                .map(|s| s.as_str())
                .collect();
            sql.push_str(&format!(" AND severity IN ('{}')", allowed.join("', '")));
        }
        sql.push_str(" ORDER BY seq DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let db = self.db.lock();
        let mut stmt = db.prepare(&sql).map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                ))
            })
            .map_err(storage)?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, id, ts, category, event_type, severity, source, entry_id, tenant_id, description, metadata, checksum) =
                row.map_err(storage)?;
            events.push(AuditEvent {
                seq,
                id,
                timestamp: timestamp::parse(&ts)
                    .map_err(|e| FabricError::Storage(format!("bad audit timestamp: {e}")))?,
                category: category.parse()?,
                event_type,
                severity: severity.parse()?,
                source,
                entry_id,
                tenant_id,
                description,
                metadata: serde_json::from_str(&metadata)?,
                checksum,
            });
        }
        Ok(events)
    }

    pub fn len(&self) -> Result<usize> {
        let db = self.db.lock();
        let n: i64 = db
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .map_err(storage)?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Recompute every checksum from the stored fields, oldest first.
    pub fn verify_chain(&self) -> Result<ChainReport> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT seq, id, timestamp, category, event_type, severity, source, entry_id, tenant_id,
                        description, metadata, prev_checksum, checksum
                 FROM audit_log ORDER BY seq",
            )
            .map_err(storage)?;
        let mut rows = stmt.query([]).map_err(storage)?;

        let mut expected_prev = GENESIS.to_string();
        let mut verified = 0;
        while let Some(row) = rows.next().map_err(storage)? {
            let seq: i64 = row.get(0).map_err(storage)?;
            let text = |i: usize| -> Result<String> {
                row.get::<_, Option<String>>(i)
                    .map(Option::unwrap_or_default)
                    .map_err(storage)
            };
            let prev = text(11)?;
            let checksum = text(12)?;
            let fields = (1..=10).map(text).collect::<Result<Vec<String>>>()?;
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            let recomputed = chain_hash(&prev, &fields);
            if prev != expected_prev || recomputed != checksum {
                warn!(seq, "audit chain broken");
                return Ok(ChainReport {
                    verified,
                    broken_at: Some(seq),
                });
            }
            expected_prev = checksum;
            verified += 1;
        }
        Ok(ChainReport {
            verified,
            broken_at: None,
        })
    }

    pub fn record_access(&self, record: &AccessLogRecord) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO access_log (timestamp, entry_id, tier, tenant_id, accessed_by, access_type,
                                     result, tenant_verified, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                timestamp::format(&record.timestamp),
                record.entry_id,
                record.tier.id_prefix(),
                record.tenant_id,
                record.accessed_by.as_str(),
                record.access_type.as_str(),
                match record.result {
                    AccessResult::Granted => "granted",
                    AccessResult::Denied => "denied",
                },
                record.tenant_verified,
                record.reason,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    /// Accesses to `entry_id`, oldest first; limited to `tenant` when given.
    pub fn access_log(&self, entry_id: &str, tenant: Option<&str>) -> Result<Vec<AccessLogRecord>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT timestamp, entry_id, tier, tenant_id, accessed_by, access_type, result,
                        tenant_verified, reason
                 FROM access_log
                 WHERE entry_id = ?1 AND (?2 IS NULL OR tenant_id = ?2)
                 ORDER BY seq",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![entry_id, tenant], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .map_err(storage)?;

        let mut records = Vec::new();
        for row in rows {
            let (ts, entry_id, tier, tenant_id, accessed_by, access_type, result, tenant_verified, reason) =
                row.map_err(storage)?;
            records.push(AccessLogRecord {
                timestamp: timestamp::parse(&ts)
                    .map_err(|e| FabricError::Storage(format!("bad access timestamp: {e}")))?,
                entry_id,
                tier: tier.parse()?,
                tenant_id,
                accessed_by: accessed_by.parse()?,
                access_type: AccessType::parse(&access_type),
                result: if result == "denied" {
                    AccessResult::Denied
                } else {
                    AccessResult::Granted
                },
                tenant_verified,
                reason,
            });
        }
        Ok(records)
    }
}
