//! Computation targets.
//!
//! A target is the thing a value is computed for: a security, a position, a
//! portfolio node, or a primitive (an identifier with no further structure).
//! Target types form a closed hierarchy; a function declared for a type also
//! applies to every subtype, and narrower declarations outrank broader ones
//! during resolution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TraitError;
use crate::ids::TargetId;

/// Target type in the closed target hierarchy.
///
/// ```text
/// Any
///  ├── Primitive
///  ├── Portfolio
///  ├── PortfolioNode
///  ├── Position
///  └── Security
///       ├── Bond
///       │    ├── GovernmentBond
///       │    └── CorporateBond
///       ├── Equity
///       ├── EquityOption
///       ├── Swap
///       └── Future
/// ```
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// Root of the hierarchy; functions declared for it apply to everything.
    Any,
    /// A bare identifier.
    Primitive,
    /// A whole portfolio.
    Portfolio,
    /// A node within a portfolio tree.
    PortfolioNode,
    /// A position in a security.
    Position,
    /// Any security.
    Security,
    /// Any bond.
    Bond,
    /// Sovereign bond.
    GovernmentBond,
    /// Corporate bond.
    CorporateBond,
    /// Equity.
    Equity,
    /// Option on an equity.
    EquityOption,
    /// Interest rate swap.
    Swap,
    /// Exchange traded future.
    Future,
}

impl TargetType {
    /// Every target type, parents before children.
    pub const ALL: [TargetType; 13] = [
        TargetType::Any,
        TargetType::Primitive,
        TargetType::Portfolio,
        TargetType::PortfolioNode,
        TargetType::Position,
        TargetType::Security,
        TargetType::Bond,
        TargetType::GovernmentBond,
        TargetType::CorporateBond,
        TargetType::Equity,
        TargetType::EquityOption,
        TargetType::Swap,
        TargetType::Future,
    ];

    /// Returns the immediate supertype, or `None` for [`TargetType::Any`].
    pub fn parent(&self) -> Option<TargetType> {
        match self {
            TargetType::Any => None,
            TargetType::Primitive
            | TargetType::Portfolio
            | TargetType::PortfolioNode
            | TargetType::Position
            | TargetType::Security => Some(TargetType::Any),
            TargetType::Bond
            | TargetType::Equity
            | TargetType::EquityOption
            | TargetType::Swap
            | TargetType::Future => Some(TargetType::Security),
            TargetType::GovernmentBond | TargetType::CorporateBond => Some(TargetType::Bond),
        }
    }

    /// Distance from the root. Larger is more specific.
    pub fn depth(&self) -> u8 {
        let mut depth = 0;
        let mut current = *self;
        while let Some(parent) = current.parent() {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Returns true if a target of type `other` is an instance of `self`.
    pub fn is_assignable_from(&self, other: TargetType) -> bool {
        let mut current = Some(other);
        while let Some(t) = current {
            if t == *self {
                return true;
            }
            current = t.parent();
        }
        false
    }

    /// Canonical lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Any => "any",
            TargetType::Primitive => "primitive",
            TargetType::Portfolio => "portfolio",
            TargetType::PortfolioNode => "portfolio_node",
            TargetType::Position => "position",
            TargetType::Security => "security",
            TargetType::Bond => "bond",
            TargetType::GovernmentBond => "government_bond",
            TargetType::CorporateBond => "corporate_bond",
            TargetType::Equity => "equity",
            TargetType::EquityOption => "equity_option",
            TargetType::Swap => "swap",
            TargetType::Future => "future",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = TraitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TargetType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| TraitError::ParseError(format!("unknown target type '{}'", s)))
    }
}

/// Reference to a computation target: its type plus its identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ComputationTarget {
    /// Target type.
    pub target_type: TargetType,
    /// Target identifier.
    pub id: TargetId,
}

impl ComputationTarget {
    /// Create a new target reference.
    pub fn new(target_type: TargetType, id: impl Into<TargetId>) -> Self {
        Self {
            target_type,
            id: id.into(),
        }
    }

    /// Create a primitive target.
    pub fn primitive(id: impl Into<TargetId>) -> Self {
        Self::new(TargetType::Primitive, id)
    }

    /// Create a security target of the given type.
    pub fn security(target_type: TargetType, id: impl Into<TargetId>) -> Self {
        Self::new(target_type, id)
    }
}

impl fmt::Display for ComputationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_type, self.id)
    }
}
