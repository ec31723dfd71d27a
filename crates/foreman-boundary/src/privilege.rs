use std::fmt;

use foreman_core::{AccessMode, Embodiment, Tier};
use serde::Serialize;

/// What one embodiment may do on one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Access {
    pub read: bool,
    pub write: bool,
}

impl Access {
    pub const NONE: Access = Access {
        read: false,
        write: false,
    };
    pub const READ: Access = Access {
        read: true,
        write: false,
    };
    pub const READ_WRITE: Access = Access {
        read: true,
        write: true,
    };

    pub fn allows(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read,
            AccessMode::Write => self.write,
        }
    }

    pub fn is_none(&self) -> bool {
        !self.read && !self.write
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match (self.read, self.write) {
            (true, true) => "rw",
            (true, false) => "r",
            (false, true) => "w",
            (false, false) => "-",
        };
        f.write_str(label)
    }
}

/// The static privilege table.
///
/// Every (embodiment, tier) pair is spelled out; there is no wildcard arm, so
/// a new tier or embodiment does not compile until it is placed in the table.
/// Only `isms_runtime` touches LTM. Governance "write" means append.
pub fn privilege(embodiment: Embodiment, tier: Tier) -> Access {
    use Access as A;
    match embodiment {
        Embodiment::Foreman => match tier {
            Tier::Stm => A::READ_WRITE,
            Tier::Wm => A::READ_WRITE,
            Tier::Em => A::READ_WRITE,
            Tier::Ltm => A::NONE,
            Tier::Sm => A::READ,
            Tier::Governance => A::READ_WRITE,
        },
        Embodiment::ForemanApp => match tier {
            Tier::Stm => A::READ_WRITE,
            Tier::Wm => A::READ_WRITE,
            Tier::Em => A::READ_WRITE,
            Tier::Ltm => A::NONE,
            Tier::Sm => A::READ,
            Tier::Governance => A::READ,
        },
        Embodiment::LocalBuilder => match tier {
            Tier::Stm => A::READ_WRITE,
            Tier::Wm => A::READ_WRITE,
            Tier::Em => A::READ,
            Tier::Ltm => A::NONE,
            Tier::Sm => A::READ,
            Tier::Governance => A::READ,
        },
        Embodiment::IsmsRuntime => match tier {
            Tier::Stm => A::READ_WRITE,
            Tier::Wm => A::READ_WRITE,
            Tier::Em => A::READ_WRITE,
            Tier::Ltm => A::READ_WRITE,
            Tier::Sm => A::READ_WRITE,
            Tier::Governance => A::READ_WRITE,
        },
        Embodiment::CommandMaturion => match tier {
            Tier::Stm => A::READ_WRITE,
            Tier::Wm => A::READ_WRITE,
            Tier::Em => A::NONE,
            Tier::Ltm => A::NONE,
            Tier::Sm => A::READ,
            Tier::Governance => A::READ,
        },
        Embodiment::MarketingMaturion => match tier {
            Tier::Stm => A::READ_WRITE,
            Tier::Wm => A::READ_WRITE,
            Tier::Em => A::NONE,
            Tier::Ltm => A::NONE,
            Tier::Sm => A::READ,
            Tier::Governance => A::READ,
        },
    }
}

pub fn has_privilege(embodiment: Embodiment, tier: Tier, mode: AccessMode) -> bool {
    privilege(embodiment, tier).allows(mode)
}

/// Embodiments that may read `tier`, in declaration order.
pub fn readers(tier: Tier) -> Vec<Embodiment> {
    Embodiment::ALL
        .into_iter()
        .filter(|e| privilege(*e, tier).read)
        .collect()
}

pub fn writers(tier: Tier) -> Vec<Embodiment> {
    Embodiment::ALL
        .into_iter()
        .filter(|e| privilege(*e, tier).write)
        .collect()
}

/// The whole table, row by row, for display.
pub fn matrix() -> Vec<(Embodiment, [Access; 6])> {
    Embodiment::ALL
        .into_iter()
        .map(|e| (e, Tier::ALL.map(|t| privilege(e, t))))
        .collect()
}
