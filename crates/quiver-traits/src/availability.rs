//! External data availability sources.
//!
//! The graph builder consults an availability source before resolving a
//! requirement through functions. An available requirement becomes a leaf:
//! no node is created and its value is expected in the computation cache
//! when the consuming node runs.

use std::collections::HashSet;

use crate::value::{ValueRequirement, ValueSpecification};

/// Source of externally supplied values (e.g. market data snapshots).
pub trait DataAvailabilityProvider: Send + Sync {
    /// Returns true if the requirement is satisfied by external data.
    fn is_available(&self, requirement: &ValueRequirement) -> bool;

    /// The specification under which the external value is published.
    fn specification(&self, requirement: &ValueRequirement) -> ValueSpecification {
        ValueSpecification::external(requirement)
    }
}

/// Availability source backed by an explicit set of requirements.
#[derive(Debug, Clone, Default)]
pub struct FixedAvailabilityProvider {
    available: HashSet<ValueRequirement>,
}

impl FixedAvailabilityProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a requirement as available.
    pub fn add_requirement(&mut self, requirement: ValueRequirement) {
        self.available.insert(requirement);
    }

    /// Builder-style variant of [`add_requirement`](Self::add_requirement).
    pub fn with_requirement(mut self, requirement: ValueRequirement) -> Self {
        self.add_requirement(requirement);
        self
    }

    /// Number of available requirements.
    pub fn len(&self) -> usize {
        self.available.len()
    }

    /// Returns true if nothing is available.
    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }
}

impl DataAvailabilityProvider for FixedAvailabilityProvider {
    fn is_available(&self, requirement: &ValueRequirement) -> bool {
        self.available.contains(requirement)
    }
}

/// Availability source with nothing available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAvailability;

impl DataAvailabilityProvider for NoAvailability {
    fn is_available(&self, _requirement: &ValueRequirement) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ComputationTarget, TargetType};

    #[test]
    fn test_fixed_availability() {
        let target = ComputationTarget::security(TargetType::Equity, "AAPL");
        let price = ValueRequirement::new("MarketPrice", target.clone());
        let provider = FixedAvailabilityProvider::new().with_requirement(price.clone());

        assert!(provider.is_available(&price));
        assert!(!provider.is_available(&ValueRequirement::new("Volume", target)));
        assert!(provider.specification(&price).is_external());
        assert!(!NoAvailability.is_available(&price));
    }
}
