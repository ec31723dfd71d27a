use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FabricError;

/// Tenant identifier as carried on entries and boundary contexts.
pub type TenantId = String;

/// Identifier of one running embodiment process (several may share an embodiment kind).
pub type InstanceId = String;

/// Memory tier, ordered from most volatile to most durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "STM")]
    Stm,
    #[serde(rename = "WM")]
    Wm,
    #[serde(rename = "EM")]
    Em,
    #[serde(rename = "LTM")]
    Ltm,
    #[serde(rename = "SM")]
    Sm,
    #[serde(rename = "Governance Memory")]
    Governance,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Stm,
        Tier::Wm,
        Tier::Em,
        Tier::Ltm,
        Tier::Sm,
        Tier::Governance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Stm => "STM",
            Tier::Wm => "WM",
            Tier::Em => "EM",
            Tier::Ltm => "LTM",
            Tier::Sm => "SM",
            Tier::Governance => "Governance Memory",
        }
    }

    /// Short lowercase key, used for entry id prefixes and storage columns.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Tier::Stm => "stm",
            Tier::Wm => "wm",
            Tier::Em => "em",
            Tier::Ltm => "ltm",
            Tier::Sm => "sm",
            Tier::Governance => "gov",
        }
    }

    /// STM never leaves its origin embodiment.
    pub fn is_synchronized(&self) -> bool {
        !matches!(self, Tier::Stm)
    }

    pub fn is_tenant_scoped(&self) -> bool {
        matches!(self, Tier::Ltm)
    }

    pub fn is_immutable(&self) -> bool {
        matches!(self, Tier::Governance)
    }

    /// Tiers whose entries are evicted (not archived) when over their size limit.
    pub fn is_evicting(&self) -> bool {
        matches!(self, Tier::Stm | Tier::Wm)
    }

    /// Tiers resolved by last-write-wins when concurrent writes collide.
    pub fn is_last_write_wins(&self) -> bool {
        matches!(self, Tier::Stm | Tier::Wm | Tier::Em)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stm" => Ok(Tier::Stm),
            "wm" => Ok(Tier::Wm),
            "em" => Ok(Tier::Em),
            "ltm" => Ok(Tier::Ltm),
            "sm" => Ok(Tier::Sm),
            "gov" | "governance" | "governance memory" => Ok(Tier::Governance),
            _ => Err(FabricError::UnknownTier(s.to_string())),
        }
    }
}

/// A cooperating agent process sharing the fabric under its own privilege set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Embodiment {
    Foreman,
    ForemanApp,
    LocalBuilder,
    IsmsRuntime,
    CommandMaturion,
    MarketingMaturion,
}

impl Embodiment {
    pub const ALL: [Embodiment; 6] = [
        Embodiment::Foreman,
        Embodiment::ForemanApp,
        Embodiment::LocalBuilder,
        Embodiment::IsmsRuntime,
        Embodiment::CommandMaturion,
        Embodiment::MarketingMaturion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Embodiment::Foreman => "foreman",
            Embodiment::ForemanApp => "foreman_app",
            Embodiment::LocalBuilder => "local_builder",
            Embodiment::IsmsRuntime => "isms_runtime",
            Embodiment::CommandMaturion => "command_maturion",
            Embodiment::MarketingMaturion => "marketing_maturion",
        }
    }
}

impl fmt::Display for Embodiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Embodiment {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Embodiment::ALL
            .into_iter()
            .find(|e| e.as_str() == s.trim())
            .ok_or_else(|| FabricError::UnknownEmbodiment(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(FabricError::InvalidEntry(format!("unknown severity: {s}"))),
        }
    }
}

/// Sensitivity label required on LTM content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    High,
    Medium,
    Low,
}

/// Read or write, as requested of the privilege table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("read"),
            AccessMode::Write => f.write_str("write"),
        }
    }
}
