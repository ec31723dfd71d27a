use foreman_config::TierConfig;
use foreman_core::Tier;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub stm_max_entries: usize,
    pub wm_max_entries: usize,
    pub ltm_archive_threshold: usize,
}

impl TierLimits {
    /// Active-entry ceiling for `tier`; `None` means unbounded.
    pub fn limit_for(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Stm => Some(self.stm_max_entries),
            Tier::Wm => Some(self.wm_max_entries),
            Tier::Ltm => Some(self.ltm_archive_threshold),
            Tier::Em | Tier::Sm | Tier::Governance => None,
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self::from(&TierConfig::default())
    }
}

impl From<&TierConfig> for TierLimits {
    fn from(config: &TierConfig) -> Self {
        Self {
            stm_max_entries: config.stm_max_entries,
            wm_max_entries: config.wm_max_entries,
            ltm_archive_threshold: config.ltm_archive_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeAction {
    PruningTriggered,
}

/// Outcome of a size-limit check. Exceeding a limit is never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeCheck {
    pub within_limit: bool,
    pub limit: Option<usize>,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SizeAction>,
}

impl SizeCheck {
    pub fn unbounded(count: usize) -> Self {
        Self {
            within_limit: true,
            limit: None,
            count,
            action: None,
        }
    }

    /// How many entries must go to get back under the limit.
    pub fn excess(&self) -> usize {
        self.limit.map_or(0, |limit| self.count.saturating_sub(limit))
    }
}

pub fn enforce_size_limits(tier: Tier, count: usize, limits: &TierLimits) -> SizeCheck {
    match limits.limit_for(tier) {
        None => SizeCheck::unbounded(count),
        Some(limit) => {
            let within_limit = count <= limit;
            SizeCheck {
                within_limit,
                limit: Some(limit),
                count,
                action: (!within_limit).then_some(SizeAction::PruningTriggered),
            }
        }
    }
}
