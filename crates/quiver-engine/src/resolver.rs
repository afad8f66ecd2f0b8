//! Function repository and resolver.
//!
//! The [`FunctionRepository`] is the explicit registry of function
//! definitions. A [`FunctionResolver`] is bound to a resolution instant,
//! producing a [`CompiledFunctionResolver`] that only sees functions valid at
//! that instant and ranks candidates for each requirement.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use quiver_traits::{FunctionDefinition, FunctionId, TraitError, ValueRequirement, ValueSpecification};

use crate::error::{EngineError, EngineResult};

// =============================================================================
// REPOSITORY
// =============================================================================

/// Registry of function definitions, in registration order.
#[derive(Default)]
pub struct FunctionRepository {
    functions: Vec<Arc<dyn FunctionDefinition>>,
    index: HashMap<FunctionId, usize>,
}

impl FunctionRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. IDs must be unique.
    pub fn register(&mut self, function: Arc<dyn FunctionDefinition>) -> Result<(), TraitError> {
        let id = function.id().clone();
        if self.index.contains_key(&id) {
            return Err(TraitError::AlreadyExists(format!("function {}", id)));
        }
        self.index.insert(id, self.functions.len());
        self.functions.push(function);
        Ok(())
    }

    /// Builder-style registration.
    pub fn with_function(
        mut self,
        function: impl FunctionDefinition + 'static,
    ) -> Result<Self, TraitError> {
        self.register(Arc::new(function))?;
        Ok(self)
    }

    /// Look up a function by ID.
    pub fn get(&self, id: &FunctionId) -> Option<Arc<dyn FunctionDefinition>> {
        self.index.get(id).map(|&i| Arc::clone(&self.functions[i]))
    }

    /// Registration position of a function.
    pub fn registration(&self, id: &FunctionId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn FunctionDefinition>> {
        self.functions.iter()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRepository")
            .field("functions", &self.functions.len())
            .finish()
    }
}

// =============================================================================
// RANKING
// =============================================================================

/// A function able to produce a specification satisfying a requirement.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The function.
    pub function: Arc<dyn FunctionDefinition>,
    /// The specification it produces for the requirement.
    pub specification: ValueSpecification,
    /// Registration position in the repository.
    pub registration: usize,
}

impl Candidate {
    /// Depth of the function's declared target type.
    pub fn specificity(&self) -> u8 {
        self.function.target_type().depth()
    }

    /// Function ID.
    pub fn function_id(&self) -> &FunctionId {
        self.function.id()
    }
}

/// Orders candidates; the first after sorting is tried first.
pub trait RankingStrategy: Send + Sync + fmt::Debug {
    /// Compare two candidates for the same requirement.
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering;
}

/// Narrower target type first, then higher priority, then earlier registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecificityRanking;

impl RankingStrategy for SpecificityRanking {
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        b.specificity()
            .cmp(&a.specificity())
            .then_with(|| b.function.priority().cmp(&a.function.priority()))
            .then_with(|| a.registration.cmp(&b.registration))
    }
}

/// Priority first, then specificity, then registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityRanking;

impl RankingStrategy for PriorityRanking {
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        b.function
            .priority()
            .cmp(&a.function.priority())
            .then_with(|| b.specificity().cmp(&a.specificity()))
            .then_with(|| a.registration.cmp(&b.registration))
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Unbound resolver over a repository.
#[derive(Debug, Clone)]
pub struct FunctionResolver {
    repository: Arc<FunctionRepository>,
    ranking: Arc<dyn RankingStrategy>,
}

impl FunctionResolver {
    /// Create a resolver with [`SpecificityRanking`].
    pub fn new(repository: Arc<FunctionRepository>) -> Self {
        Self {
            repository,
            ranking: Arc::new(SpecificityRanking),
        }
    }

    /// Replace the ranking strategy.
    pub fn with_ranking(mut self, ranking: Arc<dyn RankingStrategy>) -> Self {
        self.ranking = ranking;
        self
    }

    /// The underlying repository.
    pub fn repository(&self) -> &Arc<FunctionRepository> {
        &self.repository
    }

    /// Fix the resolver to an instant, keeping only functions valid then.
    pub fn bind(&self, instant: DateTime<Utc>) -> EngineResult<CompiledFunctionResolver> {
        let functions: Vec<(usize, Arc<dyn FunctionDefinition>)> = self
            .repository
            .iter()
            .enumerate()
            .filter(|(_, f)| f.validity().contains(instant))
            .map(|(i, f)| (i, Arc::clone(f)))
            .collect();

        if functions.is_empty() {
            return Err(EngineError::NoFunctionsAvailable { instant });
        }

        debug!(
            instant = %instant,
            valid = functions.len(),
            registered = self.repository.len(),
            "Bound function resolver"
        );

        Ok(CompiledFunctionResolver {
            instant,
            functions,
            ranking: Arc::clone(&self.ranking),
        })
    }
}

/// Resolver fixed to one instant.
#[derive(Debug, Clone)]
pub struct CompiledFunctionResolver {
    instant: DateTime<Utc>,
    functions: Vec<(usize, Arc<dyn FunctionDefinition>)>,
    ranking: Arc<dyn RankingStrategy>,
}

impl CompiledFunctionResolver {
    /// The resolution instant.
    pub fn instant(&self) -> DateTime<Utc> {
        self.instant
    }

    /// Number of functions valid at the instant.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if no function is valid.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Ranked candidates for a requirement. Empty is not an error.
    pub fn resolve(&self, requirement: &ValueRequirement) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .functions
            .iter()
            .filter(|(_, f)| f.can_apply_to(&requirement.target))
            .filter_map(|(registration, f)| {
                f.results(&requirement.target)
                    .into_iter()
                    .find(|spec| spec.satisfies(requirement))
                    .map(|specification| Candidate {
                        function: Arc::clone(f),
                        specification,
                        registration: *registration,
                    })
            })
            .collect();

        candidates.sort_by(|a, b| self.ranking.compare(a, b));

        trace!(
            requirement = %requirement,
            candidates = candidates.len(),
            "Resolved requirement"
        );
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use quiver_traits::{
        ComputationTarget, ComputeFunction, FunctionError, FunctionInputs, TargetType, Validity,
        Value,
    };

    fn constant(
        id: &str,
        target_type: TargetType,
        output: &str,
        v: f64,
    ) -> ComputeFunction<
        impl Fn(&ComputationTarget, &FunctionInputs) -> Result<Value, FunctionError> + Send + Sync,
    > {
        ComputeFunction::new(id, target_type, output, move |_, _| Ok(Value::Double(v)))
    }

    fn at(y: i32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).unwrap()
    }

    fn repository(functions: Vec<Arc<dyn FunctionDefinition>>) -> Arc<FunctionRepository> {
        let mut repo = FunctionRepository::new();
        for f in functions {
            repo.register(f).unwrap();
        }
        Arc::new(repo)
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut repo = FunctionRepository::new();
        repo.register(Arc::new(constant("F", TargetType::Bond, "X", 1.0)))
            .unwrap();
        let dup = repo.register(Arc::new(constant("F", TargetType::Bond, "Y", 1.0)));
        assert!(matches!(dup, Err(TraitError::AlreadyExists(_))));
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.registration(&FunctionId::new("F")), Some(0));
    }

    #[test]
    fn test_narrower_target_type_wins() {
        let repo = repository(vec![
            Arc::new(constant("GENERIC", TargetType::Security, "PresentValue", 1.0)),
            Arc::new(constant("BOND", TargetType::Bond, "PresentValue", 2.0)),
        ]);
        let resolver = FunctionResolver::new(repo).bind(at(2024, 1)).unwrap();
        let target = ComputationTarget::security(TargetType::CorporateBond, "C1");

        let candidates = resolver.resolve(&ValueRequirement::new("PresentValue", target));
        let ids: Vec<&str> = candidates.iter().map(|c| c.function_id().as_str()).collect();
        assert_eq!(ids, vec!["BOND", "GENERIC"]);
    }

    #[test]
    fn test_priority_then_registration_break_ties() {
        let repo = repository(vec![
            Arc::new(constant("FIRST", TargetType::Bond, "Price", 1.0)),
            Arc::new(constant("SECOND", TargetType::Bond, "Price", 2.0)),
            Arc::new(ComputeFunction::new("PREFERRED", TargetType::Bond, "Price", |_, _| {
                Ok(Value::Double(3.0))
            })
            .with_priority(5)),
        ]);
        let resolver = FunctionResolver::new(repo).bind(at(2024, 1)).unwrap();
        let target = ComputationTarget::security(TargetType::Bond, "B1");

        let ids: Vec<String> = resolver
            .resolve(&ValueRequirement::new("Price", target))
            .iter()
            .map(|c| c.function_id().to_string())
            .collect();
        assert_eq!(ids, vec!["PREFERRED", "FIRST", "SECOND"]);
    }

    #[test]
    fn test_priority_ranking_strategy() {
        let repo = repository(vec![
            Arc::new(constant("NARROW", TargetType::Bond, "Price", 1.0)),
            Arc::new(
                ComputeFunction::new("BROAD", TargetType::Security, "Price", |_, _| {
                    Ok(Value::Double(2.0))
                })
                .with_priority(1),
            ),
        ]);
        let resolver = FunctionResolver::new(repo)
            .with_ranking(Arc::new(PriorityRanking))
            .bind(at(2024, 1))
            .unwrap();
        let target = ComputationTarget::security(TargetType::Bond, "B1");
        let candidates = resolver.resolve(&ValueRequirement::new("Price", target));
        assert_eq!(candidates[0].function_id().as_str(), "BROAD");
    }

    #[test]
    fn test_bind_filters_by_validity() {
        let repo = repository(vec![
            Arc::new(
                constant("OLD", TargetType::Bond, "Price", 1.0)
                    .with_validity(Validity::until(at(2024, 1))),
            ),
            Arc::new(
                constant("NEW", TargetType::Bond, "Price", 2.0)
                    .with_validity(Validity::starting(at(2024, 1))),
            ),
        ]);
        let resolver = FunctionResolver::new(repo);
        let target = ComputationTarget::security(TargetType::Bond, "B1");
        let req = ValueRequirement::new("Price", target);

        let before = resolver.bind(at(2023, 6)).unwrap();
        assert_eq!(before.resolve(&req)[0].function_id().as_str(), "OLD");

        let after = resolver.bind(at(2024, 1)).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after.resolve(&req)[0].function_id().as_str(), "NEW");
    }

    #[test]
    fn test_no_functions_available() {
        let repo = repository(vec![Arc::new(
            constant("OLD", TargetType::Bond, "Price", 1.0)
                .with_validity(Validity::until(at(2020, 1))),
        )]);
        let err = FunctionResolver::new(repo).bind(at(2024, 1)).unwrap_err();
        assert!(matches!(err, EngineError::NoFunctionsAvailable { .. }));
    }

    #[test]
    fn test_unknown_value_is_empty_not_error() {
        let repo = repository(vec![Arc::new(constant("F", TargetType::Bond, "Price", 1.0))]);
        let resolver = FunctionResolver::new(repo).bind(at(2024, 1)).unwrap();
        let target = ComputationTarget::security(TargetType::Equity, "E1");
        assert!(resolver.resolve(&ValueRequirement::new("Price", target)).is_empty());
    }

    #[test]
    fn test_constraints_filter_candidates() {
        let repo = repository(vec![
            Arc::new(constant("USD", TargetType::Bond, "PV", 1.0).with_property("Currency", "USD")),
            Arc::new(constant("EUR", TargetType::Bond, "PV", 2.0).with_property("Currency", "EUR")),
        ]);
        let resolver = FunctionResolver::new(repo).bind(at(2024, 1)).unwrap();
        let target = ComputationTarget::security(TargetType::Bond, "B1");
        let req = ValueRequirement::new("PV", target).with_constraint("Currency", "EUR");

        let candidates = resolver.resolve(&req);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].function_id().as_str(), "EUR");
        assert_eq!(candidates[0].specification.properties.get("Currency"), Some("EUR"));
    }
}
