use std::collections::BTreeSet;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::types::{Embodiment, Sensitivity, Tier};

/// Current time truncated to the millisecond precision used on the wire.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Timestamps travel as RFC 3339 with milliseconds and an explicit `Z`.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_some(&super::format(ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| super::parse(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationBoundary {
    Tenant,
    #[serde(rename = "none")]
    Shared,
}

/// Entry payload: an opaque JSON blob tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<Sensitivity>,
}

impl MemoryContent {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            sensitivity: None,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }

    /// Checked at the API boundary before anything else sees the payload.
    pub fn validate_for(&self, tier: Tier) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(FabricError::InvalidEntry("content type must not be empty".into()));
        }
        if tier == Tier::Ltm && self.sensitivity.is_none() {
            return Err(FabricError::InvalidEntry(
                "LTM content requires a sensitivity label".into(),
            ));
        }
        Ok(())
    }

    /// Stable textual form; object keys serialize in sorted order.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    pub encrypted: bool,
    pub isolation_boundary: IsolationBoundary,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatile: Option<bool>,
}

/// The unit of storage in every tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: String,
    pub tier: Tier,
    pub embodiment: Embodiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub category: String,
    pub actor: String,
    pub content: MemoryContent,
    pub metadata: EntryMetadata,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl MemoryEntry {
    /// Fresh version-1 entry with tier-appropriate metadata.
    pub fn new(
        tier: Tier,
        embodiment: Embodiment,
        category: impl Into<String>,
        actor: impl Into<String>,
        content: MemoryContent,
    ) -> Self {
        let now = now_millis();
        let tenant_scoped = tier.is_tenant_scoped();
        Self {
            id: format!("{}_{}", tier.id_prefix(), Uuid::new_v4().simple()),
            tier,
            embodiment,
            tenant_id: None,
            session_id: None,
            category: category.into(),
            actor: actor.into(),
            content,
            metadata: EntryMetadata {
                created_at: now,
                updated_at: now,
                version: 1,
                encrypted: tenant_scoped,
                isolation_boundary: if tenant_scoped {
                    IsolationBoundary::Tenant
                } else {
                    IsolationBoundary::Shared
                },
                expires_at: None,
                volatile: (tier == Tier::Stm).then_some(true),
            },
            tags: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_id = Some(session.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    /// Next version of this entry carrying new content.
    pub fn next_version(&self, content: MemoryContent) -> Self {
        let mut next = self.clone();
        next.content = content;
        next.metadata.version = self.metadata.version + 1;
        next.metadata.updated_at = now_millis().max(self.metadata.updated_at);
        next
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.expires_at.is_some_and(|at| at <= now)
    }

    /// Structural invariants every stored entry must satisfy.
    pub fn check_invariants(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FabricError::InvalidEntry("entry id must not be empty".into()));
        }
        if self.metadata.version == 0 {
            return Err(FabricError::InvalidEntry("version must be at least 1".into()));
        }
        if self.metadata.updated_at < self.metadata.created_at {
            return Err(FabricError::InvalidEntry("updatedAt precedes createdAt".into()));
        }
        self.content.validate_for(self.tier)?;
        if self.tier == Tier::Ltm {
            if self.tenant_id.as_deref().is_none_or(|t| t.trim().is_empty()) {
                return Err(FabricError::InvalidEntry("LTM entries require a tenantId".into()));
            }
            if !self.metadata.encrypted {
                return Err(FabricError::EncryptionPolicyViolation(
                    "LTM entries must be encrypted at rest".into(),
                ));
            }
        }
        Ok(())
    }
}
