//! Authority Review Checkpoint (ARC): human approval for LTM erasure and
//! for resolving SM conflicts.
//!
//! An approval is an opaque capability token bound to one action on one
//! entry by one named approver. Whoever holds the signing key issues tokens;
//! the fabric only verifies them.

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ring::hmac;
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use foreman_config::ArcConfig;
use foreman_core::{FabricError, Result, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcAction {
    LtmDeletion,
    SmConflictResolution,
}

impl ArcAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArcAction::LtmDeletion => "ltm_deletion",
            ArcAction::SmConflictResolution => "sm_conflict_resolution",
        }
    }
}

impl fmt::Display for ArcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque approval token. Its contents mean nothing outside a verifier.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArcToken(String);

impl ArcToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ArcToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ArcToken(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArcApproval {
    pub approver: String,
    pub token: ArcToken,
}

/// Checks that an approval really authorizes `action` on `entry_id`.
pub trait ArcVerifier: Send + Sync {
    fn verify(&self, approval: &ArcApproval, action: ArcAction, entry_id: &str) -> Result<()>;
}

/// HMAC-SHA256 tokens over `action | entry id | approver`.
pub struct HmacArcVerifier {
    key: hmac::Key,
}

impl HmacArcVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Key from `[arc] signing_key`, or a random one when none is configured.
    pub fn from_config(config: &ArcConfig) -> Result<Self> {
        match &config.signing_key {
            Some(encoded) => {
                let secret = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| FabricError::Config(format!("arc.signing_key is not base64: {e}")))?;
                Ok(Self::new(&secret))
            }
            None => {
                warn!("no ARC signing key configured; approvals will not survive a restart");
                let key = hmac::Key::generate(hmac::HMAC_SHA256, &SystemRandom::new())
                    .map_err(|_| FabricError::Crypto("system RNG unavailable".into()))?;
                Ok(Self { key })
            }
        }
    }

    fn message(action: ArcAction, entry_id: &str, approver: &str) -> String {
        format!("{}|{entry_id}|{approver}", action.as_str())
    }

    /// Issue an approval. Called by the review authority, not by embodiments.
    pub fn issue(&self, action: ArcAction, entry_id: &str, approver: &str) -> ArcApproval {
        let tag = hmac::sign(&self.key, Self::message(action, entry_id, approver).as_bytes());
        info!(action = %action, entry_id, approver, "issued ARC approval");
        ArcApproval {
            approver: approver.to_string(),
            token: ArcToken(URL_SAFE_NO_PAD.encode(tag.as_ref())),
        }
    }
}

impl ArcVerifier for HmacArcVerifier {
    fn verify(&self, approval: &ArcApproval, action: ArcAction, entry_id: &str) -> Result<()> {
        if approval.approver.trim().is_empty() {
            return Err(FabricError::ArcApprovalInvalid("approver must be named".into()));
        }
        let tag = URL_SAFE_NO_PAD
            .decode(approval.token.as_str())
            .map_err(|_| FabricError::ArcApprovalInvalid("malformed token".into()))?;
        hmac::verify(
            &self.key,
            Self::message(action, entry_id, &approval.approver).as_bytes(),
            &tag,
        )
        .map_err(|_| {
            FabricError::ArcApprovalInvalid(format!(
                "token does not authorize {action} of {entry_id} by {}",
                approval.approver
            ))
        })
    }
}

// ── Review queue ───────────────────────────────────────────────

/// A conflict waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArcReview {
    pub id: Uuid,
    pub action: ArcAction,
    pub tier: Tier,
    pub entry_id: String,
    pub reason: String,
    /// Competing versions, in the order a decision refers to them.
    pub candidates: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArcDecision {
    /// Apply `candidates[choice]`.
    Approve { approval: ArcApproval, choice: usize },
    Reject { approver: String },
}

/// Pending ARC reviews.
///
/// New reviews are also pushed to a channel so an external reviewer (a UI,
/// a chat bridge) can be notified; the receiver is taken once.
pub struct ArcReviewQueue {
    pending: Mutex<HashMap<Uuid, ArcReview>>,
    notify_tx: mpsc::Sender<ArcReview>,
    notify_rx: Mutex<Option<mpsc::Receiver<ArcReview>>>,
}

impl Default for ArcReviewQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ArcReviewQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            pending: Mutex::new(HashMap::new()),
            notify_tx: tx,
            notify_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn take_receiver(&self) -> Option<mpsc::Receiver<ArcReview>> {
        self.notify_rx.lock().take()
    }

    pub fn escalate(
        &self,
        action: ArcAction,
        tier: Tier,
        entry_id: &str,
        reason: &str,
        candidates: Vec<serde_json::Value>,
    ) -> Uuid {
        let review = ArcReview {
            id: Uuid::new_v4(),
            action,
            tier,
            entry_id: entry_id.to_string(),
            reason: reason.to_string(),
            candidates,
            created_at: Utc::now(),
        };
        let id = review.id;
        info!(review_id = %id, action = %action, entry_id, "escalated to ARC review");
        self.pending.lock().insert(id, review.clone());
        if self.notify_tx.try_send(review).is_err() {
            debug!(review_id = %id, "no reviewer listening; review stays pending");
        }
        id
    }

    pub fn get(&self, id: Uuid) -> Option<ArcReview> {
        self.pending.lock().get(&id).cloned()
    }

    /// Pending reviews, oldest first.
    pub fn pending(&self) -> Vec<ArcReview> {
        let mut reviews: Vec<ArcReview> = self.pending.lock().values().cloned().collect();
        reviews.sort_by_key(|r| r.created_at);
        reviews
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Settle review `id`. An approval must verify for the review's action and
    /// entry; a rejection only needs a named approver. The review stays pending
    /// when the decision is refused. Returns the closed review and, when
    /// approved, the chosen candidate.
    pub fn decide(
        &self,
        id: Uuid,
        decision: &ArcDecision,
        verifier: &dyn ArcVerifier,
    ) -> Result<(ArcReview, Option<serde_json::Value>)> {
        let review = self
            .get(id)
            .ok_or_else(|| FabricError::ArcApprovalInvalid(format!("no pending ARC review {id}")))?;
        let chosen = match decision {
            ArcDecision::Approve { approval, choice } => {
                verifier.verify(approval, review.action, &review.entry_id)?;
                let candidate = review.candidates.get(*choice).cloned().ok_or_else(|| {
                    FabricError::ArcApprovalInvalid(format!(
                        "choice {choice} out of range ({} candidates)",
                        review.candidates.len()
                    ))
                })?;
                info!(review_id = %id, approver = %approval.approver, choice, "ARC review approved");
                Some(candidate)
            }
            ArcDecision::Reject { approver } => {
                if approver.trim().is_empty() {
                    return Err(FabricError::ArcApprovalInvalid("approver must be named".into()));
                }
                info!(review_id = %id, approver = %approver, "ARC review rejected");
                None
            }
        };
        let review = self.close(id)?;
        Ok((review, chosen))
    }

    /// Close a review without a decision record.
    pub fn close(&self, id: Uuid) -> Result<ArcReview> {
        self.pending.lock().remove(&id).ok_or_else(|| {
            FabricError::ArcApprovalInvalid(format!("no pending ARC review {id}"))
        })
    }
}
