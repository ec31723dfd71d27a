//! Conflict detection and per-tier resolution.
//!
//! Two copies of one entry conflict when they carry the same version with
//! different bodies or timestamps (a simultaneous write), or when their
//! versions disagree. How a conflict is settled depends on the tier:
//!
//! | Tier            | Strategy                                        |
//! |-----------------|-------------------------------------------------|
//! | STM / WM / EM   | last write wins; losers kept in the audit log   |
//! | LTM             | highest version wins; equal versions fail       |
//! | SM              | escalated to an ARC review                      |
//! | Governance      | never resolved; Governance Memory is immutable  |

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_boundary::{ArcAction, ArcReviewQueue};
use foreman_core::{
    Embodiment, EventBus, FabricError, FabricEvent, MemoryContent, MemoryEntry, Result, Severity,
    Tier,
};
use foreman_memory::{AuditCategory, AuditLog, AuditRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    SimultaneousWrite,
    VersionMismatch,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::SimultaneousWrite => "simultaneous_write",
            ConflictType::VersionMismatch => "version_mismatch",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One embodiment's copy of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    /// Embodiment holding this copy.
    pub embodiment: Embodiment,
    pub entry: MemoryEntry,
}

impl VersionSnapshot {
    pub fn new(embodiment: Embodiment, entry: MemoryEntry) -> Self {
        Self { embodiment, entry }
    }

    pub fn version(&self) -> u64 {
        self.entry.version()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.entry.metadata.updated_at
    }

    pub fn content(&self) -> &MemoryContent {
        &self.entry.content
    }

    /// Total order used by last-write-wins: timestamp, then version, then
    /// embodiment, then the canonical content text.
    fn lww_cmp(&self, other: &Self) -> Ordering {
        self.timestamp()
            .cmp(&other.timestamp())
            .then_with(|| self.version().cmp(&other.version()))
            .then_with(|| self.embodiment.cmp(&other.embodiment))
            .then_with(|| self.content().canonical().cmp(&other.content().canonical()))
    }

    fn summary(&self) -> serde_json::Value {
        json!({
            "embodiment": self.embodiment,
            "version": self.version(),
            "timestamp": foreman_core::entry::timestamp::format(&self.timestamp()),
            "content": self.content(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub entry_id: String,
    pub tier: Tier,
    pub conflict_type: ConflictType,
    pub conflicting_versions: Vec<VersionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Compare two copies of what should be the same entry.
///
/// Copies of different entries, or identical copies, do not conflict.
pub fn detect_conflict(a: &VersionSnapshot, b: &VersionSnapshot) -> Option<ConflictRecord> {
    if a.entry.id != b.entry.id || a.entry.tier != b.entry.tier {
        return None;
    }
    let conflict_type = if a.version() == b.version() {
        if a.timestamp() == b.timestamp() && a.content() == b.content() {
            return None;
        }
        ConflictType::SimultaneousWrite
    } else {
        ConflictType::VersionMismatch
    };
    Some(ConflictRecord {
        entry_id: a.entry.id.clone(),
        tier: a.entry.tier,
        conflict_type,
        conflicting_versions: vec![a.clone(), b.clone()],
        resolution: None,
    })
}

/// The copy with the latest timestamp. Ties break on version, embodiment and
/// content so every replica picks the same winner.
pub fn resolve_last_write_wins(versions: &[VersionSnapshot]) -> Option<&VersionSnapshot> {
    versions.iter().max_by(|a, b| a.lww_cmp(b))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Resolved { winner: VersionSnapshot },
    PendingArcResolution { review_id: Uuid },
}

impl Resolution {
    pub fn winner(&self) -> Option<&VersionSnapshot> {
        match self {
            Resolution::Resolved { winner } => Some(winner),
            Resolution::PendingArcResolution { .. } => None,
        }
    }
}

/// Applies the per-tier strategy and records the outcome.
#[derive(Clone)]
pub struct ConflictResolver {
    audit: AuditLog,
    reviews: Arc<ArcReviewQueue>,
    events: Option<EventBus>,
}

impl ConflictResolver {
    pub fn new(audit: AuditLog, reviews: Arc<ArcReviewQueue>) -> Self {
        Self {
            audit,
            reviews,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn reviews(&self) -> &Arc<ArcReviewQueue> {
        &self.reviews
    }

    pub fn resolve(&self, conflict: &ConflictRecord) -> Result<Resolution> {
        if let Some(events) = &self.events {
            events.publish(FabricEvent::ConflictDetected {
                tier: conflict.tier,
                id: conflict.entry_id.clone(),
                conflict_type: conflict.conflict_type.to_string(),
            });
        }

        match conflict.tier {
            Tier::Governance => {
                warn!(entry_id = %conflict.entry_id, "conflict on Governance Memory");
                Err(FabricError::GovernanceImmutable)
            }
            Tier::Stm | Tier::Wm | Tier::Em => {
                let winner = resolve_last_write_wins(&conflict.conflicting_versions)
                    .cloned()
                    .ok_or_else(|| FabricError::ConflictUnresolvable("no versions to compare".into()))?;
                self.record_winner(conflict, &winner, "last_write_wins")?;
                Ok(Resolution::Resolved { winner })
            }
            Tier::Ltm => {
                let mut ranked: Vec<&VersionSnapshot> = conflict.conflicting_versions.iter().collect();
                ranked.sort_by_key(|v| std::cmp::Reverse(v.version()));
                match ranked.as_slice() {
                    [] => Err(FabricError::ConflictUnresolvable("no versions to compare".into())),
                    [first, second, ..] if first.version() == second.version() => {
                        Err(FabricError::ConflictUnresolvable(format!(
                            "LTM entry {} has divergent copies at version {}",
                            conflict.entry_id,
                            first.version()
                        )))
                    }
                    [first, ..] => {
                        let winner = (*first).clone();
                        self.record_winner(conflict, &winner, "highest_version")?;
                        Ok(Resolution::Resolved { winner })
                    }
                }
            }
            Tier::Sm => {
                let candidates = conflict
                    .conflicting_versions
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let review_id = self.reviews.escalate(
                    ArcAction::SmConflictResolution,
                    conflict.tier,
                    &conflict.entry_id,
                    &format!("{} on Semantic Memory", conflict.conflict_type),
                    candidates,
                );
                self.audit.append(
                    AuditRecord::new(
                        AuditCategory::ArcDecision,
                        "sm_conflict_escalated",
                        Severity::Medium,
                        format!("SM conflict on {} escalated to ARC review", conflict.entry_id),
                    )
                    .source("sync")
                    .entry(conflict.entry_id.clone())
                    .metadata(json!({
                        "reviewId": review_id,
                        "conflictType": conflict.conflict_type,
                        "versions": conflict.conflicting_versions.iter().map(VersionSnapshot::summary).collect::<Vec<_>>(),
                    })),
                )?;
                if let Some(events) = &self.events {
                    events.publish(FabricEvent::ArcEscalated {
                        review_id,
                        entry_id: conflict.entry_id.clone(),
                    });
                }
                Ok(Resolution::PendingArcResolution { review_id })
            }
        }
    }

    /// Losing copies survive only in the audit record written here.
    fn record_winner(&self, conflict: &ConflictRecord, winner: &VersionSnapshot, strategy: &str) -> Result<()> {
        let losers: Vec<serde_json::Value> = conflict
            .conflicting_versions
            .iter()
            .filter(|v| *v != winner)
            .map(VersionSnapshot::summary)
            .collect();
        info!(
            entry_id = %conflict.entry_id,
            tier = %conflict.tier,
            strategy,
            winner = %winner.embodiment,
            "conflict resolved"
        );
        self.audit.append(
            AuditRecord::new(
                AuditCategory::SyncEvent,
                "conflict_resolved",
                Severity::Low,
                format!(
                    "{} on {} resolved by {strategy}",
                    conflict.conflict_type, conflict.entry_id
                ),
            )
            .source("sync")
            .entry(conflict.entry_id.clone())
            .tenant(winner.entry.tenant_id.as_deref())
            .metadata(json!({
                "strategy": strategy,
                "conflictType": conflict.conflict_type,
                "winner": winner.summary(),
                "losers": losers,
            })),
        )?;
        Ok(())
    }
}
