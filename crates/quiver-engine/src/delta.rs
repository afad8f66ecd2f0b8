//! Change detection between cycles.
//!
//! A [`DeltaDefinition`] decides whether a requested value moved since the
//! previous cycle; [`CycleDelta`] is the per-root view the engine attaches to
//! every [`CycleReport`](crate::CycleReport).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use quiver_traits::{Value, ValueRequirement, ValueSpecification};

use crate::executor::{ExecutionResult, RootOutcome};

// =============================================================================
// COMPARERS
// =============================================================================

/// Decides whether two numeric values differ.
pub trait DeltaComparer: Send + Sync + fmt::Debug {
    /// Returns true if `current` is a change from `previous`.
    fn is_delta(&self, previous: f64, current: f64) -> bool;
}

/// Any difference is a change.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactComparer;

impl DeltaComparer for ExactComparer {
    fn is_delta(&self, previous: f64, current: f64) -> bool {
        if previous.is_nan() || current.is_nan() {
            return previous.is_nan() != current.is_nan();
        }
        previous != current
    }
}

/// Moves larger than an absolute tolerance are changes.
#[derive(Debug, Clone, Copy)]
pub struct ToleranceComparer {
    tolerance: f64,
}

impl ToleranceComparer {
    /// Create a comparer. The sign of `tolerance` is ignored.
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.abs(),
        }
    }

    /// The tolerance.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }
}

impl DeltaComparer for ToleranceComparer {
    fn is_delta(&self, previous: f64, current: f64) -> bool {
        if previous.is_nan() || current.is_nan() {
            return previous.is_nan() != current.is_nan();
        }
        (previous - current).abs() > self.tolerance
    }
}

// =============================================================================
// DEFINITION
// =============================================================================

/// Change rule for computed values.
///
/// A different specification is always a change. Numeric values (scalars
/// and vectors of equal length) go through the comparer; everything else is
/// compared for equality.
#[derive(Debug, Clone)]
pub struct DeltaDefinition {
    comparer: Arc<dyn DeltaComparer>,
}

impl DeltaDefinition {
    /// Definition using a custom numeric comparer.
    pub fn new(comparer: Arc<dyn DeltaComparer>) -> Self {
        Self { comparer }
    }

    /// Every difference is a change.
    pub fn exact() -> Self {
        Self::new(Arc::new(ExactComparer))
    }

    /// Numeric moves within `tolerance` are not changes. Zero is exact.
    pub fn with_tolerance(tolerance: f64) -> Self {
        if tolerance == 0.0 {
            Self::exact()
        } else {
            Self::new(Arc::new(ToleranceComparer::new(tolerance)))
        }
    }

    /// Returns true if the value moved.
    pub fn is_delta(&self, previous: &Value, current: &Value) -> bool {
        match (previous, current) {
            (Value::Vector(a), Value::Vector(b)) => {
                a.len() != b.len() || a.iter().zip(b).any(|(x, y)| self.comparer.is_delta(*x, *y))
            }
            _ => match (previous.as_f64(), current.as_f64()) {
                (Some(a), Some(b)) => self.comparer.is_delta(a, b),
                _ => previous != current,
            },
        }
    }

    /// Returns true if a computed value moved, comparing its specification
    /// first.
    pub fn is_computed_delta(
        &self,
        previous: Option<(&ValueSpecification, &Value)>,
        current: Option<(&ValueSpecification, &Value)>,
    ) -> bool {
        match (previous, current) {
            (None, None) => false,
            (None, Some(_)) | (Some(_), None) => true,
            (Some((prev_spec, prev)), Some((spec, value))) => {
                prev_spec != spec || self.is_delta(prev, value)
            }
        }
    }
}

impl Default for DeltaDefinition {
    fn default() -> Self {
        Self::exact()
    }
}

// =============================================================================
// CYCLE DELTA
// =============================================================================

/// How a requested value moved since the previous cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// First value for this requirement.
    Added,
    /// Value moved.
    Changed,
    /// Value did not move.
    Unchanged,
    /// A value existed last cycle but none was produced this cycle.
    Removed,
}

/// Delta entry for one requested value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RootDelta {
    /// The requested value.
    pub requirement: ValueRequirement,
    /// Movement.
    pub kind: DeltaKind,
    /// Value reported by the previous cycle.
    pub previous: Option<Value>,
    /// Value produced by this cycle.
    pub current: Option<Value>,
}

/// Per-root changes between two cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleDelta {
    entries: Vec<RootDelta>,
}

impl CycleDelta {
    /// All entries, in root order.
    pub fn entries(&self) -> &[RootDelta] {
        &self.entries
    }

    /// Entries whose value was added, changed or removed.
    pub fn changed(&self) -> impl Iterator<Item = &RootDelta> {
        self.entries.iter().filter(|e| e.kind != DeltaKind::Unchanged)
    }

    /// Returns true if any requested value moved.
    pub fn has_changes(&self) -> bool {
        self.changed().next().is_some()
    }

    /// Movement of a requested value, if it was part of the cycle.
    pub fn kind(&self, requirement: &ValueRequirement) -> Option<DeltaKind> {
        self.entries
            .iter()
            .find(|e| &e.requirement == requirement)
            .map(|e| e.kind)
    }
}

/// Root values reported by the last cycle, keyed by requirement.
#[derive(Debug, Default)]
pub(crate) struct PreviousResults {
    values: HashMap<ValueRequirement, (ValueSpecification, Value)>,
}

impl PreviousResults {
    /// Compare an execution against the stored values, then store its values.
    ///
    /// Requirements absent from the execution keep their stored value.
    pub(crate) fn advance(
        &mut self,
        definition: &DeltaDefinition,
        execution: &ExecutionResult,
    ) -> CycleDelta {
        let mut entries = Vec::with_capacity(execution.roots.len());

        for root in &execution.roots {
            let current = match &root.outcome {
                RootOutcome::Value(value) => Some((&root.specification, value)),
                _ => None,
            };
            let previous = self.values.get(&root.requirement).map(|(s, v)| (s, v));

            let kind = match (previous, current) {
                (None, None) => continue,
                (None, Some(_)) => DeltaKind::Added,
                (Some(_), None) => DeltaKind::Removed,
                (Some(_), Some(_)) if definition.is_computed_delta(previous, current) => {
                    DeltaKind::Changed
                }
                (Some(_), Some(_)) => DeltaKind::Unchanged,
            };

            entries.push(RootDelta {
                requirement: root.requirement.clone(),
                kind,
                previous: previous.map(|(_, v)| v.clone()),
                current: current.map(|(_, v)| v.clone()),
            });
        }

        for root in &execution.roots {
            match &root.outcome {
                RootOutcome::Value(value) => {
                    self.values.insert(
                        root.requirement.clone(),
                        (root.specification.clone(), value.clone()),
                    );
                }
                _ => {
                    self.values.remove(&root.requirement);
                }
            }
        }

        CycleDelta { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_traits::{ComputationTarget, FunctionId, TargetType, ValueProperties};
    use rust_decimal_macros::dec;

    fn spec(function: &str) -> ValueSpecification {
        ValueSpecification::new(
            "PresentValue",
            ComputationTarget::security(TargetType::Bond, "B1"),
            ValueProperties::new(),
            FunctionId::new(function),
        )
    }

    #[test]
    fn test_exact_definition() {
        let exact = DeltaDefinition::exact();
        assert!(!exact.is_delta(&Value::Double(1.0), &Value::Double(1.0)));
        assert!(exact.is_delta(&Value::Double(1.0), &Value::Double(1.0 + 1e-12)));
        assert!(!exact.is_delta(&Value::Double(f64::NAN), &Value::Double(f64::NAN)));
        assert!(exact.is_delta(&Value::Text("a".into()), &Value::Text("b".into())));
    }

    #[test]
    fn test_tolerance_definition() {
        let loose = DeltaDefinition::with_tolerance(0.01);
        assert!(!loose.is_delta(&Value::Double(100.0), &Value::Double(100.005)));
        assert!(loose.is_delta(&Value::Double(100.0), &Value::Double(100.02)));
        assert!(!loose.is_delta(&Value::Decimal(dec!(1.000)), &Value::Double(1.001)));
        assert!(!loose.is_delta(&Value::Vector(vec![1.0, 2.0]), &Value::Vector(vec![1.001, 2.0])));
        assert!(loose.is_delta(&Value::Vector(vec![1.0]), &Value::Vector(vec![1.0, 2.0])));
    }

    #[test]
    fn test_specification_change_is_delta() {
        let definition = DeltaDefinition::exact();
        let value = Value::Double(1.0);
        assert!(definition.is_computed_delta(
            Some((&spec("PV_A"), &value)),
            Some((&spec("PV_B"), &value))
        ));
        assert!(!definition.is_computed_delta(
            Some((&spec("PV_A"), &value)),
            Some((&spec("PV_A"), &value))
        ));
        assert!(definition.is_computed_delta(None, Some((&spec("PV_A"), &value))));
        assert!(!definition.is_computed_delta(None, None));
    }
}
