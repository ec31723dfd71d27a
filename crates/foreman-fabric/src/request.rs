use foreman_core::{MemoryContent, Tier};

/// A new entry to store.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub tier: Tier,
    pub category: String,
    pub actor: String,
    pub content: MemoryContent,
    /// Owning tenant. LTM defaults to the caller's authenticated tenant.
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
    pub tags: Vec<String>,
    /// File-like path the entry describes, checked against constitutional paths.
    pub target: Option<String>,
}

impl StoreRequest {
    pub fn new(
        tier: Tier,
        category: impl Into<String>,
        actor: impl Into<String>,
        content: MemoryContent,
    ) -> Self {
        Self {
            tier,
            category: category.into(),
            actor: actor.into(),
            content,
            tenant_id: None,
            session_id: None,
            tags: Vec::new(),
            target: None,
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session_id = Some(session.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// New content for an existing entry.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub tier: Tier,
    pub id: String,
    pub content: MemoryContent,
    pub tenant_id: Option<String>,
    /// Required for LTM; recorded in the access log.
    pub reason: Option<String>,
}

impl UpdateRequest {
    pub fn new(tier: Tier, id: impl Into<String>, content: MemoryContent) -> Self {
        Self {
            tier,
            id: id.into(),
            content,
            tenant_id: None,
            reason: None,
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
