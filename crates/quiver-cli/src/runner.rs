//! Cycle runner.

use chrono::Utc;
use tracing::info;

use quiver_engine::{ComputationEngine, CycleReport, EngineBuilder};

use crate::config::RunnerConfig;
use crate::demo;

/// Build an engine with the valuation functions for the configured targets.
pub fn build_engine(config: &RunnerConfig) -> anyhow::Result<ComputationEngine> {
    let builder = EngineBuilder::new()
        .with_config(config.engine.clone())
        .with_function(demo::present_value())
        .with_function(demo::dv01())
        .with_availability(demo::availability(&config.targets));

    let builder = if config.local_invokers == 0 {
        builder.with_local_invokers_per_core(1)
    } else {
        builder.with_local_invokers(config.local_invokers)
    };
    Ok(builder.build()?)
}

/// Run the configured number of cycles and return their reports.
pub async fn run(config: &RunnerConfig) -> anyhow::Result<Vec<CycleReport>> {
    let engine = build_engine(config)?;
    let requirements = demo::requirements(&config.targets);
    let instant = Utc::now();

    let mut reports = Vec::with_capacity(config.cycles as usize);
    for index in 0..config.cycles {
        let inputs = demo::market_data(&config.targets, config.price_shift, index);
        let report = engine.run_cycle(&requirements, instant, inputs).await?;
        info!(
            cycle = %report.cycle,
            succeeded = report.execution.roots.len() - report.execution.failures().count(),
            failed = report.execution.failures().count(),
            changed = report.delta.changed().count(),
            duration_ms = report.execution.duration.as_millis() as u64,
            "Cycle complete"
        );
        reports.push(report);
    }

    engine.shutdown().await?;
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use approx::assert_relative_eq;
    use quiver_engine::RootOutcome;
    use quiver_traits::{CacheMode, EngineConfig, TargetType, Value};

    fn config() -> RunnerConfig {
        RunnerConfig {
            engine: EngineConfig::minimal(),
            cycles: 2,
            local_invokers: 2,
            price_shift: 1.0,
            targets: vec![
                TargetConfig {
                    id: "UST-10Y".into(),
                    target_type: TargetType::GovernmentBond,
                    price: 100.0,
                    discount_factor: 0.95,
                },
                TargetConfig {
                    id: "BAD".into(),
                    target_type: TargetType::Equity,
                    price: 10.0,
                    discount_factor: 0.0,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_run_cycles() {
        let reports = run(&config()).await.unwrap();
        assert_eq!(reports.len(), 2);

        let pv = |report: &CycleReport| {
            report
                .execution
                .roots
                .iter()
                .find(|r| r.requirement.to_string() == "PresentValue[government_bond:UST-10Y]")
                .and_then(|r| match &r.outcome {
                    RootOutcome::Value(v) => v.as_f64(),
                    _ => None,
                })
                .unwrap()
        };
        assert_relative_eq!(pv(&reports[0]), 100.0 / 0.95, epsilon = 1e-9);
        assert_relative_eq!(pv(&reports[1]), 101.0 / 0.95, epsilon = 1e-9);

        let failures: Vec<_> = reports[0].execution.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.to_string(), "PresentValue[equity:BAD]");

        let dv01 = reports[0]
            .execution
            .roots
            .iter()
            .find(|r| r.requirement.value_name == "DV01")
            .map(|r| r.outcome.clone());
        assert!(matches!(dv01, Some(RootOutcome::Value(Value::Double(_)))));
    }

    #[tokio::test]
    async fn test_incremental_run_follows_price_shift() {
        let mut config = config();
        config.engine.cache.mode = CacheMode::Incremental;
        config.targets.truncate(1);
        config.cycles = 3;

        let reports = run(&config).await.unwrap();
        let pv = |report: &CycleReport| {
            report
                .execution
                .roots
                .iter()
                .find(|r| r.requirement.value_name == "PresentValue")
                .and_then(|r| match &r.outcome {
                    RootOutcome::Value(v) => v.as_f64(),
                    _ => None,
                })
                .unwrap()
        };
        assert_relative_eq!(pv(&reports[1]), 101.0 / 0.95, epsilon = 1e-9);
        assert_relative_eq!(pv(&reports[2]), 102.0 / 0.95, epsilon = 1e-9);
        assert!(reports[2].delta.has_changes());
        assert!(reports[2]
            .delta
            .changed()
            .any(|d| d.requirement.value_name == "PresentValue"));
    }
}
