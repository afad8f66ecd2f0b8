//! End-to-end tests: build, dispatch and execute through the engine facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::Utc;
use rust_decimal_macros::dec;

use quiver_engine::traits::{
    BuildMode, CalculationJob, CacheMode, ComputationTarget, ComputedValue, ComputeFunction,
    EngineConfig, FixedAvailabilityProvider, FunctionError, FunctionInputs, InvokerId, JobFailure,
    JobId, JobInvocationReceiver, JobInvoker, TargetType, Value, ValueRequirement, ValueSpecification,
};
use quiver_engine::{
    EngineBuilder, EngineError, FailureCause, JobState, ResolutionFailure, RootOutcome,
    TotallingStatistics,
};

// =============================================================================
// TEST FIXTURES
// =============================================================================

fn bond(id: &str) -> ComputationTarget {
    ComputationTarget::security(TargetType::Bond, id)
}

fn market_data(target: &ComputationTarget, price: f64, discount_factor: f64) -> Vec<ComputedValue> {
    vec![
        ComputedValue::new(
            ValueSpecification::external(&ValueRequirement::new("Price", target.clone())),
            price,
        ),
        ComputedValue::new(
            ValueSpecification::external(&ValueRequirement::new("DiscountFactor", target.clone())),
            discount_factor,
        ),
    ]
}

fn availability(targets: &[ComputationTarget]) -> FixedAvailabilityProvider {
    let mut provider = FixedAvailabilityProvider::new();
    for target in targets {
        provider.add_requirement(ValueRequirement::new("Price", target.clone()));
        provider.add_requirement(ValueRequirement::new("DiscountFactor", target.clone()));
    }
    provider
}

fn present_value() -> ComputeFunction<
    impl Fn(&ComputationTarget, &FunctionInputs) -> Result<Value, FunctionError> + Send + Sync,
> {
    ComputeFunction::new("PV", TargetType::Security, "PresentValue", |_, inputs| {
        let price = inputs.scalar("Price")?;
        let df = inputs.scalar("DiscountFactor")?;
        if df == 0.0 {
            return Err(FunctionError::InvalidInput("zero discount factor".into()));
        }
        Ok(Value::Double(price / df))
    })
    .requires("Price")
    .requires("DiscountFactor")
}

/// Accepts every job and immediately reports it failed.
#[derive(Debug)]
struct FailingInvoker {
    id: InvokerId,
    invocations: AtomicUsize,
}

impl FailingInvoker {
    fn new(id: &str) -> Self {
        Self {
            id: InvokerId::new(id),
            invocations: AtomicUsize::new(0),
        }
    }
}

impl JobInvoker for FailingInvoker {
    fn id(&self) -> &InvokerId {
        &self.id
    }

    fn capacity(&self) -> usize {
        1
    }

    fn try_invoke(&self, job: CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        receiver.job_failed(
            &self.id,
            job.job_id(),
            JobFailure::InvokerFailed {
                invoker: self.id.clone(),
                message: "node lost".into(),
            },
        );
        true
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[tokio::test]
async fn test_present_value_end_to_end() {
    let target = bond("UST-10Y");
    let engine = EngineBuilder::new()
        .with_config(EngineConfig::minimal())
        .with_function(present_value())
        .with_availability(availability(&[target.clone()]))
        .with_local_invokers(2)
        .build()
        .unwrap();

    let pv = ValueRequirement::new("PresentValue", target.clone());
    let report = engine
        .run_cycle(&[pv.clone()], Utc::now(), market_data(&target, 100.0, 0.95))
        .await
        .unwrap();

    assert!(report.is_complete());
    let value = report.execution.value(&pv).and_then(Value::as_f64).unwrap();
    assert_relative_eq!(value, 105.263, epsilon = 1e-3);
    assert_relative_eq!(value, 100.0 / 0.95, epsilon = 1e-12);

    let built = engine.build_graph(&[pv.clone()], Utc::now()).unwrap();
    let spec = &built.graph.roots()[0].specification;
    assert!(engine.cache().contains(spec));
}

#[tokio::test]
async fn test_failed_invoker_redispatches_to_second() {
    let target = bond("B1");
    let failing = Arc::new(FailingInvoker::new("flaky"));
    let engine = EngineBuilder::new()
        .with_config(EngineConfig::minimal())
        .with_function(present_value())
        .with_availability(availability(&[target.clone()]))
        .with_invoker(Arc::clone(&failing) as Arc<dyn JobInvoker>)
        .with_local_invokers(1)
        .build()
        .unwrap();

    let pv = ValueRequirement::new("PresentValue", target.clone());
    let report = engine
        .run_cycle(&[pv.clone()], Utc::now(), market_data(&target, 100.0, 0.95))
        .await
        .unwrap();

    assert_eq!(failing.invocations.load(Ordering::SeqCst), 1);
    assert!(report.is_complete());
    assert_eq!(engine.dispatcher().job_state(JobId(1)), Some(JobState::Completed));
    assert_eq!(engine.dispatcher().stats().retried, 1);

    let root = &report.execution.roots[0];
    assert_eq!(
        engine.cache().get(&root.specification).and_then(|v| v.as_f64()),
        Some(100.0 / 0.95)
    );
}

#[tokio::test]
async fn test_retry_exhaustion_fails_root() {
    let target = bond("B1");
    let mut config = EngineConfig::minimal();
    config.dispatch.max_attempts = 2;
    let engine = EngineBuilder::new()
        .with_config(config)
        .with_function(present_value())
        .with_availability(availability(&[target.clone()]))
        .with_invoker(Arc::new(FailingInvoker::new("a")))
        .with_invoker(Arc::new(FailingInvoker::new("b")))
        .build()
        .unwrap();

    let pv = ValueRequirement::new("PresentValue", target.clone());
    let report = engine
        .run_cycle(&[pv.clone()], Utc::now(), market_data(&target, 100.0, 0.95))
        .await
        .unwrap();

    match report.execution.outcome(&pv) {
        Some(RootOutcome::Failed(chain)) => match &chain.root_cause().unwrap().cause {
            FailureCause::JobAborted(JobFailure::RetryExhausted { attempts, .. }) => {
                assert_eq!(*attempts, 2)
            }
            other => panic!("unexpected cause {other:?}"),
        },
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(engine.dispatcher().job_state(JobId(1)), Some(JobState::Aborted));
}

#[tokio::test]
async fn test_independent_leaves_form_one_batch() {
    let targets: Vec<ComputationTarget> = (0..50).map(|i| bond(&format!("B{}", i))).collect();
    let statistics = Arc::new(TotallingStatistics::new());
    let mut config = EngineConfig::minimal();
    config.executor.max_job_size = 1000;
    let engine = EngineBuilder::new()
        .with_config(config)
        .with_function(present_value())
        .with_availability(availability(&targets))
        .with_local_invokers(4)
        .with_statistics(statistics.clone())
        .build()
        .unwrap();

    let requirements: Vec<ValueRequirement> = targets
        .iter()
        .map(|t| ValueRequirement::new("PresentValue", t.clone()))
        .collect();
    let inputs: Vec<ComputedValue> = targets
        .iter()
        .flat_map(|t| market_data(t, 100.0, 0.5))
        .collect();

    let report = engine.run_cycle(&requirements, Utc::now(), inputs).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.execution.batches, 1);
    assert_eq!(report.execution.nodes_executed, 50);
    let totals = statistics.totals();
    assert_eq!(totals.jobs, 1);
    assert_relative_eq!(totals.mean_job_size(), 50.0);
    assert_eq!(totals.nodes_executed, 50);
}

#[tokio::test]
async fn test_cycle_detected_in_strict_build() {
    let engine = EngineBuilder::new()
        .with_config(EngineConfig::minimal())
        .with_function(
            ComputeFunction::new("F_A", TargetType::Bond, "A", |_, _| Ok(Value::Double(1.0)))
                .requires("B"),
        )
        .with_function(
            ComputeFunction::new("F_B", TargetType::Bond, "B", |_, _| Ok(Value::Double(1.0)))
                .requires("A"),
        )
        .with_local_invokers(1)
        .build()
        .unwrap();

    let a = ValueRequirement::new("A", bond("B1"));
    match engine.build_graph(&[a.clone()], Utc::now()) {
        Err(EngineError::CyclicDependency { path }) => {
            assert_eq!(path.first(), Some(&a));
            assert_eq!(path.last(), Some(&a));
        }
        other => panic!("expected cycle, got {other:?}"),
    }

    let outcome = engine
        .build_graph_with_mode(&[a.clone()], Utc::now(), BuildMode::BestEffort)
        .unwrap();
    assert!(outcome.graph.is_empty());
    assert!(matches!(
        outcome.failures[0].reason,
        ResolutionFailure::CyclicDependency { .. }
    ));
}

#[tokio::test]
async fn test_shared_input_collapses_to_one_node() {
    let target = bond("B1");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let engine = EngineBuilder::new()
        .with_config(EngineConfig::minimal())
        .with_function(
            ComputeFunction::new("YIELD", TargetType::Bond, "Yield", move |_, inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Double(inputs.scalar("Price")? / 2000.0))
            })
            .requires("Price"),
        )
        .with_function(
            ComputeFunction::new("DUR", TargetType::Bond, "Duration", |_, inputs| {
                Ok(Value::Double(inputs.scalar("Yield")? * 10.0))
            })
            .requires("Yield"),
        )
        .with_function(
            ComputeFunction::new("CVX", TargetType::Bond, "Convexity", |_, inputs| {
                Ok(Value::Double(inputs.scalar("Yield")? * 100.0))
            })
            .requires("Yield"),
        )
        .with_availability(availability(&[target.clone()]))
        .with_local_invokers(2)
        .build()
        .unwrap();

    let requirements = [
        ValueRequirement::new("Duration", target.clone()),
        ValueRequirement::new("Convexity", target.clone()),
    ];
    let outcome = engine.build_graph(&requirements, Utc::now()).unwrap();
    assert_eq!(outcome.graph.node_count(), 3);
    assert_eq!(outcome.graph.edge_count(), 2);

    let report = engine
        .run_cycle(&requirements, Utc::now(), market_data(&target, 100.0, 0.95))
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.execution.batches, 2);
}

#[tokio::test]
async fn test_narrower_target_function_wins() {
    let target = ComputationTarget::security(TargetType::GovernmentBond, "UST-2Y");
    let engine = EngineBuilder::new()
        .with_config(EngineConfig::minimal())
        .with_function(ComputeFunction::new(
            "GENERIC",
            TargetType::Security,
            "Spread",
            |_, _| Ok(Value::Double(1.0)),
        ))
        .with_function(ComputeFunction::new(
            "GOVT",
            TargetType::GovernmentBond,
            "Spread",
            |_, _| Ok(Value::Double(2.0)),
        ))
        .with_local_invokers(1)
        .build()
        .unwrap();

    let spread = ValueRequirement::new("Spread", target);
    let outcome = engine.build_graph(&[spread.clone()], Utc::now()).unwrap();
    let functions: Vec<String> = outcome
        .graph
        .functions()
        .into_iter()
        .map(|f| f.to_string())
        .collect();
    assert_eq!(functions, vec!["GOVT".to_string()]);

    let report = engine
        .run_cycle(&[spread.clone()], Utc::now(), std::iter::empty())
        .await
        .unwrap();
    assert_eq!(report.execution.value(&spread), Some(&Value::Double(2.0)));
}

#[tokio::test]
async fn test_failure_propagates_without_touching_siblings() {
    let good = bond("GOOD");
    let bad = bond("BAD");
    let engine = EngineBuilder::new()
        .with_config(EngineConfig::minimal())
        .with_function(present_value())
        .with_function(
            ComputeFunction::new("SCALED", TargetType::Bond, "ScaledValue", |_, inputs| {
                Ok(Value::Double(inputs.scalar("PresentValue")? * 2.0))
            })
            .requires("PresentValue"),
        )
        .with_availability(availability(&[good.clone(), bad.clone()]))
        .with_local_invokers(2)
        .build()
        .unwrap();

    let good_req = ValueRequirement::new("ScaledValue", good.clone());
    let bad_req = ValueRequirement::new("ScaledValue", bad.clone());
    let mut inputs = market_data(&good, 100.0, 0.5);
    inputs.extend(market_data(&bad, 100.0, 0.0));

    let report = engine
        .run_cycle(&[good_req.clone(), bad_req.clone()], Utc::now(), inputs)
        .await
        .unwrap();

    assert_eq!(report.execution.value(&good_req), Some(&Value::Double(400.0)));
    let failures: Vec<_> = report.execution.failures().collect();
    assert_eq!(failures.len(), 1);
    let (requirement, chain) = failures[0];
    assert_eq!(requirement, &bad_req);
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.root_cause().unwrap().target, bad);
    assert!(matches!(
        chain.root_cause().unwrap().cause,
        FailureCause::FunctionFailed(_)
    ));
}

#[tokio::test]
async fn test_best_effort_keeps_satisfiable_roots() {
    let target = bond("B1");
    let mut config = EngineConfig::minimal();
    config.build.mode = BuildMode::BestEffort;
    let engine = EngineBuilder::new()
        .with_config(config)
        .with_function(present_value())
        .with_availability(availability(&[target.clone()]))
        .with_local_invokers(1)
        .build()
        .unwrap();

    let pv = ValueRequirement::new("PresentValue", target.clone());
    let missing = ValueRequirement::new("Theta", target.clone());
    let report = engine
        .run_cycle(&[pv.clone(), missing.clone()], Utc::now(), market_data(&target, 100.0, 0.95))
        .await
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.unsatisfied.len(), 1);
    assert_eq!(report.unsatisfied[0].requirement, missing);
    assert_eq!(report.unsatisfied[0].reason, ResolutionFailure::NoCandidates);
    assert!(report.execution.value(&pv).is_some());
}

#[tokio::test]
async fn test_incremental_mode_reuses_previous_outputs() {
    let target = bond("B1");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut config = EngineConfig::minimal();
    config.cache.mode = CacheMode::Incremental;
    let engine = EngineBuilder::new()
        .with_config(config)
        .with_function(
            ComputeFunction::new("PV", TargetType::Bond, "PresentValue", move |_, inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Double(inputs.scalar("Price")? / inputs.scalar("DiscountFactor")?))
            })
            .requires("Price")
            .requires("DiscountFactor"),
        )
        .with_availability(availability(&[target.clone()]))
        .with_local_invokers(1)
        .build()
        .unwrap();

    let pv = ValueRequirement::new("PresentValue", target.clone());
    let instant = Utc::now();
    engine
        .run_cycle(&[pv.clone()], instant, market_data(&target, 100.0, 0.95))
        .await
        .unwrap();
    let second = engine
        .run_cycle(&[pv.clone()], instant, std::iter::empty())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(second.is_complete());
    assert_eq!(engine.cached_graphs(), 1);
}

#[tokio::test]
async fn test_cancelled_execution_reports_cancelled_roots() {
    let target = bond("B1");
    let engine = EngineBuilder::new()
        .with_config(EngineConfig::minimal())
        .with_function(
            ComputeFunction::new("SLOW", TargetType::Bond, "Slow", |_, _| {
                std::thread::sleep(std::time::Duration::from_millis(200));
                Ok(Value::Double(1.0))
            }),
        )
        .with_function(
            ComputeFunction::new("AFTER", TargetType::Bond, "After", |_, inputs| {
                Ok(Value::Double(inputs.scalar("Slow")? + 1.0))
            })
            .requires("Slow"),
        )
        .with_local_invokers(1)
        .build()
        .unwrap();

    let after = ValueRequirement::new("After", target.clone());
    let cycle = engine.begin_cycle();
    let graph = engine.build_graph(&[after.clone()], Utc::now()).unwrap();
    let handle = engine.execute(Arc::clone(&graph.graph), cycle).unwrap();
    handle.cancel();
    let result = handle.wait().await.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.outcome(&after), Some(&RootOutcome::Cancelled));
}

fn slow_then_after_engine(config: EngineConfig) -> quiver_engine::ComputationEngine {
    EngineBuilder::new()
        .with_config(config)
        .with_function(
            ComputeFunction::new("SLOW", TargetType::Bond, "Slow", |_, _| {
                std::thread::sleep(std::time::Duration::from_millis(300));
                Ok(Value::Double(1.0))
            }),
        )
        .with_function(
            ComputeFunction::new("AFTER", TargetType::Bond, "After", |_, inputs| {
                Ok(Value::Double(inputs.scalar("Slow")? + 1.0))
            })
            .requires("Slow"),
        )
        .with_local_invokers(1)
        .build()
        .unwrap()
}

async fn wait_for_cache(engine: &quiver_engine::ComputationEngine, spec: &ValueSpecification) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !engine.cache().contains(spec) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("in-flight result never reached the cache");
}

#[tokio::test]
async fn test_cancel_mid_flight_still_commits_running_job() {
    let engine = slow_then_after_engine(EngineConfig::minimal());
    let target = bond("B1");
    let after = ValueRequirement::new("After", target.clone());
    let slow = ValueRequirement::new("Slow", target);

    let cycle = engine.begin_cycle();
    let outcome = engine.build_graph(&[after.clone()], Utc::now()).unwrap();
    let slow_spec = outcome
        .graph
        .nodes()
        .find(|(_, node)| node.function_id().as_str() == "SLOW")
        .map(|(_, node)| node.outputs[0].clone())
        .unwrap();
    assert_eq!(slow_spec.value_name, slow.value_name);

    let handle = engine.execute(Arc::clone(&outcome.graph), cycle).unwrap();
    while engine.dispatcher().stats().dispatched == 0 {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    handle.cancel();
    let result = handle.wait().await.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.outcome(&after), Some(&RootOutcome::Cancelled));
    assert_eq!(result.jobs, 1);

    wait_for_cache(&engine, &slow_spec).await;
    assert_eq!(engine.cache().get(&slow_spec), Some(Value::Double(1.0)));
    let after_spec = outcome.graph.root_for(&after).unwrap().specification.clone();
    assert!(!engine.cache().contains(&after_spec));
}

#[tokio::test]
async fn test_graph_deadline_cancels_execution() {
    let mut config = EngineConfig::minimal();
    config.executor.deadline_ms = Some(50);
    let engine = slow_then_after_engine(config);
    let after = ValueRequirement::new("After", bond("B1"));

    let report = engine
        .run_cycle(&[after.clone()], Utc::now(), std::iter::empty())
        .await
        .unwrap();

    assert!(report.execution.cancelled);
    assert!(!report.execution.aborted);
    assert_eq!(report.execution.outcome(&after), Some(&RootOutcome::Cancelled));
    assert!(report.execution.duration < std::time::Duration::from_millis(300));
    assert!(!report.is_complete());
}

#[tokio::test]
async fn test_decimal_inputs() {
    let target = bond("B1");
    let engine = EngineBuilder::new()
        .with_config(EngineConfig::minimal())
        .with_function(present_value())
        .with_availability(availability(&[target.clone()]))
        .with_local_invokers(1)
        .build()
        .unwrap();

    let pv = ValueRequirement::new("PresentValue", target.clone());
    let inputs = vec![
        ComputedValue::new(
            ValueSpecification::external(&ValueRequirement::new("Price", target.clone())),
            dec!(99.5),
        ),
        ComputedValue::new(
            ValueSpecification::external(&ValueRequirement::new("DiscountFactor", target.clone())),
            dec!(0.5),
        ),
    ];
    let report = engine.run_cycle(&[pv.clone()], Utc::now(), inputs).await.unwrap();
    assert_eq!(report.execution.value(&pv), Some(&Value::Double(199.0)));
}
