//! The value model: what is asked for, what is produced, and the values
//! themselves.
//!
//! A [`ValueRequirement`] is a request ("PresentValue of bond X in USD"). A
//! [`ValueSpecification`] is what a particular function commits to
//! producing. Both are plain data with structural equality so they can key
//! memo tables and caches.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::FunctionId;
use crate::target::ComputationTarget;

// =============================================================================
// PROPERTIES AND CONSTRAINTS
// =============================================================================

/// Resolved property values carried by a specification (e.g. `Currency=USD`).
#[derive(Debug, Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueProperties(BTreeMap<String, String>);

impl ValueProperties {
    /// Creates an empty property set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Sets a property in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Gets a property value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns true if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ValueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Accepted values for one named property of a requirement.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintPattern {
    /// Property must be present; any value is accepted.
    Any,
    /// Property must equal this value.
    Exact(String),
    /// Property must be one of these values.
    OneOf(BTreeSet<String>),
}

impl ConstraintPattern {
    /// Returns true if the (possibly absent) property value is accepted.
    pub fn accepts(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (_, None) => false,
            (ConstraintPattern::Any, Some(_)) => true,
            (ConstraintPattern::Exact(expected), Some(v)) => expected == v,
            (ConstraintPattern::OneOf(allowed), Some(v)) => allowed.contains(v),
        }
    }
}

impl fmt::Display for ConstraintPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintPattern::Any => f.write_str("*"),
            ConstraintPattern::Exact(v) => f.write_str(v),
            ConstraintPattern::OneOf(values) => {
                let joined: Vec<&str> = values.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", joined.join("|"))
            }
        }
    }
}

/// Constraint set of a requirement: property name → accepted pattern.
#[derive(Debug, Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueConstraints(BTreeMap<String, ConstraintPattern>);

impl ValueConstraints {
    /// Creates an empty (unconstrained) set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constraint.
    pub fn with(mut self, name: impl Into<String>, pattern: ConstraintPattern) -> Self {
        self.0.insert(name.into(), pattern);
        self
    }

    /// Returns true if there are no constraints.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gets the pattern for a property.
    pub fn get(&self, name: &str) -> Option<&ConstraintPattern> {
        self.0.get(name)
    }

    /// Iterates over `(name, pattern)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConstraintPattern)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns true if every constraint accepts the corresponding property.
    pub fn is_satisfied_by(&self, properties: &ValueProperties) -> bool {
        self.0
            .iter()
            .all(|(name, pattern)| pattern.accepts(properties.get(name)))
    }

    /// Properties implied by the exact constraints.
    pub fn implied_properties(&self) -> ValueProperties {
        let mut props = ValueProperties::new();
        for (name, pattern) in &self.0 {
            if let ConstraintPattern::Exact(v) = pattern {
                props.insert(name.clone(), v.clone());
            }
        }
        props
    }
}

// =============================================================================
// REQUIREMENT AND SPECIFICATION
// =============================================================================

/// A request for a named value on a target, with constraints.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueRequirement {
    /// Value name (e.g. "PresentValue").
    pub value_name: String,
    /// Target the value is computed for.
    pub target: ComputationTarget,
    /// Constraints on the producing specification's properties.
    pub constraints: ValueConstraints,
}

impl ValueRequirement {
    /// Creates an unconstrained requirement.
    pub fn new(value_name: impl Into<String>, target: ComputationTarget) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints: ValueConstraints::new(),
        }
    }

    /// Adds an exact-value constraint.
    pub fn with_constraint(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints = self
            .constraints
            .with(name, ConstraintPattern::Exact(value.into()));
        self
    }

    /// Adds an arbitrary constraint pattern.
    pub fn with_pattern(mut self, name: impl Into<String>, pattern: ConstraintPattern) -> Self {
        self.constraints = self.constraints.with(name, pattern);
        self
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)?;
        if !self.constraints.is_empty() {
            let parts: Vec<String> = self
                .constraints
                .iter()
                .map(|(k, p)| format!("{}={}", k, p))
                .collect();
            write!(f, "{{{}}}", parts.join(","))?;
        }
        Ok(())
    }
}

/// A concrete, producible value identity.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueSpecification {
    /// Value name.
    pub value_name: String,
    /// Target the value is computed for.
    pub target: ComputationTarget,
    /// Property values chosen by the producer.
    pub properties: ValueProperties,
    /// Producing function, or `None` for externally supplied data.
    pub function_id: Option<FunctionId>,
}

impl ValueSpecification {
    /// Creates a specification produced by a function.
    pub fn new(
        value_name: impl Into<String>,
        target: ComputationTarget,
        properties: ValueProperties,
        function_id: FunctionId,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties,
            function_id: Some(function_id),
        }
    }

    /// Specification for an externally supplied value satisfying `requirement`.
    pub fn external(requirement: &ValueRequirement) -> Self {
        Self {
            value_name: requirement.value_name.clone(),
            target: requirement.target.clone(),
            properties: requirement.constraints.implied_properties(),
            function_id: None,
        }
    }

    /// Returns true if this specification satisfies the requirement.
    pub fn satisfies(&self, requirement: &ValueRequirement) -> bool {
        self.value_name == requirement.value_name
            && self.target == requirement.target
            && requirement.constraints.is_satisfied_by(&self.properties)
    }

    /// Returns true if the value is supplied from outside the graph.
    pub fn is_external(&self) -> bool {
        self.function_id.is_none()
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)?;
        if !self.properties.is_empty() {
            write!(f, "{{{}}}", self.properties)?;
        }
        match &self.function_id {
            Some(id) => write!(f, "@{}", id),
            None => f.write_str("@external"),
        }
    }
}

// =============================================================================
// VALUES
// =============================================================================

/// A computed value. Functions are opaque; the engine only moves values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Value {
    /// Floating point scalar.
    Double(f64),
    /// Decimal scalar.
    Decimal(Decimal),
    /// Vector of floats (e.g. curve points, sensitivities).
    Vector(Vec<f64>),
    /// Text.
    Text(String),
    /// Arbitrary structured value.
    Json(serde_json::Value),
}

impl Value {
    /// Returns the value as `f64` when it is a scalar.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Decimal(d) => d.to_f64(),
            Value::Json(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

/// A value together with the specification it satisfies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    /// What the value is.
    pub specification: ValueSpecification,
    /// The value.
    pub value: Value,
}

impl ComputedValue {
    /// Creates a computed value.
    pub fn new(specification: ValueSpecification, value: impl Into<Value>) -> Self {
        Self {
            specification,
            value: value.into(),
        }
    }
}
