//! Function definitions.
//!
//! Functions are the opaque analytics the engine wires together. The engine
//! only needs to know what a function requires and what it produces for a
//! target; [`FunctionDefinition::invoke`] is a pure computation over resolved
//! inputs and is only ever called by an invoker.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::FunctionId;
use crate::target::{ComputationTarget, TargetType};
use crate::value::{
    ComputedValue, Value, ValueConstraints, ValueProperties, ValueRequirement, ValueSpecification,
};

// =============================================================================
// VALIDITY
// =============================================================================

/// Half-open validity interval `[earliest, latest)`. `None` bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    /// Earliest instant the function may be invoked for (inclusive).
    pub earliest: Option<DateTime<Utc>>,
    /// Latest instant the function may be invoked for (exclusive).
    pub latest: Option<DateTime<Utc>>,
}

impl Validity {
    /// Valid at every instant.
    pub fn always() -> Self {
        Self::default()
    }

    /// Valid from `earliest` onwards.
    pub fn starting(earliest: DateTime<Utc>) -> Self {
        Self {
            earliest: Some(earliest),
            latest: None,
        }
    }

    /// Valid strictly before `latest`.
    pub fn until(latest: DateTime<Utc>) -> Self {
        Self {
            earliest: None,
            latest: Some(latest),
        }
    }

    /// Valid in `[earliest, latest)`.
    pub fn between(earliest: DateTime<Utc>, latest: DateTime<Utc>) -> Self {
        Self {
            earliest: Some(earliest),
            latest: Some(latest),
        }
    }

    /// Returns true if `instant` lies within the interval.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.earliest.map_or(true, |e| instant >= e) && self.latest.map_or(true, |l| instant < l)
    }
}

// =============================================================================
// ERRORS AND INPUTS
// =============================================================================

/// Error raised by a function invocation.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum FunctionError {
    /// The computation itself failed.
    #[error("invocation failed: {0}")]
    InvocationFailed(String),

    /// A required input was not supplied.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// An input had an unusable shape (e.g. text where a number was expected).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Resolved inputs handed to a function.
#[derive(Debug, Clone, Default)]
pub struct FunctionInputs {
    values: HashMap<ValueSpecification, Value>,
}

impl FunctionInputs {
    /// Creates an empty input set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an input value.
    pub fn insert(&mut self, specification: ValueSpecification, value: Value) {
        self.values.insert(specification, value);
    }

    /// Gets an input by exact specification.
    pub fn get(&self, specification: &ValueSpecification) -> Option<&Value> {
        self.values.get(specification)
    }

    /// Gets the first input with the given value name.
    pub fn by_name(&self, value_name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(spec, _)| spec.value_name == value_name)
            .map(|(_, v)| v)
    }

    /// Gets a scalar input by value name.
    pub fn scalar(&self, value_name: &str) -> Result<f64, FunctionError> {
        let value = self
            .by_name(value_name)
            .ok_or_else(|| FunctionError::MissingInput(value_name.to_string()))?;
        value
            .as_f64()
            .ok_or_else(|| FunctionError::InvalidInput(format!("{} is not a scalar", value_name)))
    }

    /// Iterates over all inputs.
    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &Value)> {
        self.values.iter()
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no inputs.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// =============================================================================
// FUNCTION DEFINITION
// =============================================================================

/// A function the engine can place in a dependency graph.
pub trait FunctionDefinition: Send + Sync + fmt::Debug {
    /// Unique function identifier.
    fn id(&self) -> &FunctionId;

    /// The target type this function is declared for.
    fn target_type(&self) -> TargetType;

    /// Declared priority; higher wins among equally specific candidates.
    fn priority(&self) -> i32 {
        0
    }

    /// Interval during which the function may be used.
    fn validity(&self) -> Validity {
        Validity::always()
    }

    /// Returns true if the function applies to the target.
    fn can_apply_to(&self, target: &ComputationTarget) -> bool {
        self.target_type().is_assignable_from(target.target_type)
    }

    /// Specifications the function produces for the target.
    fn results(&self, target: &ComputationTarget) -> Vec<ValueSpecification>;

    /// Requirements the function needs as inputs for the target.
    fn requirements(&self, target: &ComputationTarget) -> Vec<ValueRequirement>;

    /// Computes the desired outputs from resolved inputs.
    fn invoke(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        desired: &[ValueSpecification],
    ) -> Result<Vec<ComputedValue>, FunctionError>;
}

// =============================================================================
// CLOSURE-BACKED FUNCTION
// =============================================================================

#[derive(Debug, Clone)]
struct InputDeclaration {
    value_name: String,
    target: Option<ComputationTarget>,
    constraints: ValueConstraints,
}

/// A single-output function backed by a closure.
///
/// ```rust,ignore
/// let pv = ComputeFunction::new("PV", TargetType::Security, "PresentValue", |_, inputs| {
///     Ok(Value::Double(inputs.scalar("Price")? / inputs.scalar("DiscountFactor")?))
/// })
/// .requires("Price")
/// .requires("DiscountFactor");
/// ```
pub struct ComputeFunction<F> {
    id: FunctionId,
    target_type: TargetType,
    output_name: String,
    output_properties: ValueProperties,
    inputs: Vec<InputDeclaration>,
    priority: i32,
    validity: Validity,
    compute: F,
}

impl<F> ComputeFunction<F>
where
    F: Fn(&ComputationTarget, &FunctionInputs) -> Result<Value, FunctionError> + Send + Sync,
{
    /// Creates a function producing `output_name` for targets of `target_type`.
    pub fn new(
        id: impl Into<FunctionId>,
        target_type: TargetType,
        output_name: impl Into<String>,
        compute: F,
    ) -> Self {
        Self {
            id: id.into(),
            target_type,
            output_name: output_name.into(),
            output_properties: ValueProperties::new(),
            inputs: Vec::new(),
            priority: 0,
            validity: Validity::always(),
            compute,
        }
    }

    /// Requires a value on the same target.
    pub fn requires(mut self, value_name: impl Into<String>) -> Self {
        self.inputs.push(InputDeclaration {
            value_name: value_name.into(),
            target: None,
            constraints: ValueConstraints::new(),
        });
        self
    }

    /// Requires a constrained value on the same target.
    pub fn requires_constrained(
        mut self,
        value_name: impl Into<String>,
        constraints: ValueConstraints,
    ) -> Self {
        self.inputs.push(InputDeclaration {
            value_name: value_name.into(),
            target: None,
            constraints,
        });
        self
    }

    /// Requires a value on a fixed other target (e.g. a curve or an index).
    pub fn requires_on(mut self, value_name: impl Into<String>, target: ComputationTarget) -> Self {
        self.inputs.push(InputDeclaration {
            value_name: value_name.into(),
            target: Some(target),
            constraints: ValueConstraints::new(),
        });
        self
    }

    /// Sets a property on the produced specification.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.output_properties.insert(name, value);
        self
    }

    /// Sets the declared priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the validity interval.
    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    fn output_spec(&self, target: &ComputationTarget) -> ValueSpecification {
        ValueSpecification::new(
            self.output_name.clone(),
            target.clone(),
            self.output_properties.clone(),
            self.id.clone(),
        )
    }
}

impl<F> fmt::Debug for ComputeFunction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeFunction")
            .field("id", &self.id)
            .field("target_type", &self.target_type)
            .field("output_name", &self.output_name)
            .field("priority", &self.priority)
            .finish()
    }
}

impl<F> FunctionDefinition for ComputeFunction<F>
where
    F: Fn(&ComputationTarget, &FunctionInputs) -> Result<Value, FunctionError> + Send + Sync,
{
    fn id(&self) -> &FunctionId {
        &self.id
    }

    fn target_type(&self) -> TargetType {
        self.target_type
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn validity(&self) -> Validity {
        self.validity
    }

    fn results(&self, target: &ComputationTarget) -> Vec<ValueSpecification> {
        vec![self.output_spec(target)]
    }

    fn requirements(&self, target: &ComputationTarget) -> Vec<ValueRequirement> {
        self.inputs
            .iter()
            .map(|input| ValueRequirement {
                value_name: input.value_name.clone(),
                target: input.target.clone().unwrap_or_else(|| target.clone()),
                constraints: input.constraints.clone(),
            })
            .collect()
    }

    fn invoke(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        _desired: &[ValueSpecification],
    ) -> Result<Vec<ComputedValue>, FunctionError> {
        let value = (self.compute)(target, inputs)?;
        Ok(vec![ComputedValue::new(self.output_spec(target), value)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validity_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let validity = Validity::between(start, end);

        assert!(validity.contains(start));
        assert!(validity.contains(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        assert!(!validity.contains(end));
        assert!(Validity::always().contains(end));
        assert!(!Validity::starting(end).contains(start));
    }

    #[test]
    fn test_compute_function_requirements() {
        let target = ComputationTarget::security(TargetType::Bond, "B1");
        let curve = ComputationTarget::primitive("USD.SOFR");
        let f = ComputeFunction::new("PV", TargetType::Security, "PresentValue", |_, inputs| {
            Ok(Value::Double(inputs.scalar("Price")?))
        })
        .requires("Price")
        .requires_on("DiscountCurve", curve.clone())
        .with_property("Currency", "USD");

        let reqs = f.requirements(&target);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].target, target);
        assert_eq!(reqs[1].target, curve);

        let results = f.results(&target);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].properties.get("Currency"), Some("USD"));
        assert_eq!(results[0].function_id.as_ref(), Some(f.id()));
    }

    #[test]
    fn test_compute_function_invoke() {
        let target = ComputationTarget::security(TargetType::Equity, "E1");
        let f = ComputeFunction::new("DOUBLE", TargetType::Equity, "Doubled", |_, inputs| {
            Ok(Value::Double(inputs.scalar("Price")? * 2.0))
        })
        .requires("Price");

        let mut inputs = FunctionInputs::new();
        let price_spec = ValueSpecification::external(&ValueRequirement::new("Price", target.clone()));
        inputs.insert(price_spec, Value::Double(21.0));

        let out = f.invoke(&target, &inputs, &f.results(&target)).unwrap();
        assert_eq!(out[0].value, Value::Double(42.0));

        let missing = f.invoke(&target, &FunctionInputs::new(), &[]);
        assert_eq!(missing, Err(FunctionError::MissingInput("Price".into())));
    }
}
