use foreman_core::{Embodiment, MemoryEntry, Result, Tier, now_millis};
use foreman_memory::{AccessLogRecord, AccessResult, AccessType, AuditLog, EntryCursor};

/// Lazy, restartable result of [`MemoryFabric::recall`](crate::MemoryFabric::recall).
///
/// LTM cursors write one access-log record per entry actually yielded.
pub struct RecallCursor {
    inner: EntryCursor,
    trail: Option<AccessTrail>,
}

struct AccessTrail {
    audit: AuditLog,
    reader: Embodiment,
    authenticated: Option<String>,
}

impl AccessTrail {
    fn record(&self, entry: &MemoryEntry) -> Result<()> {
        self.audit.record_access(&AccessLogRecord {
            timestamp: now_millis(),
            entry_id: entry.id.clone(),
            tier: entry.tier,
            tenant_id: entry.tenant_id.clone(),
            accessed_by: self.reader,
            access_type: AccessType::Read,
            result: AccessResult::Granted,
            tenant_verified: entry.tenant_id.is_some() && entry.tenant_id == self.authenticated,
            reason: None,
        })
    }
}

impl RecallCursor {
    pub(crate) fn new(inner: EntryCursor) -> Self {
        Self { inner, trail: None }
    }

    pub(crate) fn with_access_log(
        mut self,
        audit: AuditLog,
        reader: Embodiment,
        authenticated: Option<&str>,
    ) -> Self {
        self.trail = Some(AccessTrail {
            audit,
            reader,
            authenticated: authenticated.map(str::to_string),
        });
        self
    }

    pub fn tier(&self) -> Tier {
        self.inner.tier()
    }

    /// Start over from the first match.
    pub fn restart(&mut self) {
        self.inner.restart();
    }
}

impl Iterator for RecallCursor {
    type Item = Result<MemoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if let (Ok(entry), Some(trail)) = (&item, &self.trail)
            && let Err(e) = trail.record(entry)
        {
            return Some(Err(e));
        }
        Some(item)
    }
}
