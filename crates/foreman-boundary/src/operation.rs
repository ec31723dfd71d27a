use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use foreman_core::{AccessMode, Embodiment, EntryMetadata, MemoryEntry, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Update,
    Delete,
    /// An attempt to change the privilege table or the isolation rules.
    ModifyBoundary,
}

impl OperationKind {
    /// Privilege needed; `None` for operations the privilege table does not cover.
    pub fn access_mode(&self) -> Option<AccessMode> {
        match self {
            OperationKind::Read => Some(AccessMode::Read),
            OperationKind::Write | OperationKind::Update | OperationKind::Delete => {
                Some(AccessMode::Write)
            }
            OperationKind::ModifyBoundary => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, OperationKind::Read)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::ModifyBoundary => "modify_boundary",
        }
    }
}

/// An operation submitted for boundary checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub tier: Tier,
    /// Embodiment the operation claims to come from.
    pub embodiment: Embodiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    /// File-like target path, checked against constitutional paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}

impl MemoryOperation {
    pub fn new(kind: OperationKind, tier: Tier, embodiment: Embodiment) -> Self {
        Self {
            kind,
            tier,
            embodiment,
            tenant_id: None,
            entry_id: None,
            target: None,
            content: None,
            metadata: None,
        }
    }

    pub fn read(tier: Tier, embodiment: Embodiment) -> Self {
        Self::new(OperationKind::Read, tier, embodiment)
    }

    pub fn write(tier: Tier, embodiment: Embodiment) -> Self {
        Self::new(OperationKind::Write, tier, embodiment)
    }

    /// An operation carrying everything the enforcer needs to know about `entry`.
    ///
    /// The content checked is every caller-supplied string on the entry: the
    /// payload plus its type, category, actor, session and tags.
    pub fn for_entry(kind: OperationKind, entry: &MemoryEntry) -> Self {
        let content = json!({
            "data": entry.content.data,
            "type": entry.content.kind,
            "category": entry.category,
            "actor": entry.actor,
            "session": entry.session_id,
            "tags": entry.tags,
        });
        Self {
            kind,
            tier: entry.tier,
            embodiment: entry.embodiment,
            tenant_id: entry.tenant_id.clone(),
            entry_id: Some(entry.id.clone()),
            target: None,
            content: Some(content),
            metadata: Some(entry.metadata.clone()),
        }
    }

    pub fn tenant(mut self, tenant: Option<&str>) -> Self {
        self.tenant_id = tenant.map(str::to_string);
        self
    }

    pub fn entry(mut self, id: impl Into<String>) -> Self {
        self.entry_id = Some(id.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }
}

/// Who is asking: the calling embodiment and the tenant it authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryContext {
    pub embodiment: Embodiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated_tenant_id: Option<String>,
}

impl BoundaryContext {
    pub fn new(embodiment: Embodiment) -> Self {
        Self {
            embodiment,
            authenticated_tenant_id: None,
        }
    }

    pub fn for_tenant(embodiment: Embodiment, tenant: impl Into<String>) -> Self {
        Self {
            embodiment,
            authenticated_tenant_id: Some(tenant.into()),
        }
    }

    pub fn tenant(&self) -> Option<&str> {
        self.authenticated_tenant_id.as_deref()
    }
}
