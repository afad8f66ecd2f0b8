//! Execution statistics.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use quiver_traits::CycleId;

/// Receives per-graph execution statistics.
pub trait StatisticsGatherer: Send + Sync {
    /// Called once all jobs for a graph have been formed.
    fn graph_processed(&self, cycle: CycleId, total_jobs: usize, mean_job_size: f64);

    /// Called when a graph execution finishes.
    ///
    /// `execution_nanos` is the sum of worker-reported job durations and
    /// `duration` the wall-clock time of the whole execution.
    fn graph_executed(
        &self,
        cycle: CycleId,
        node_count: usize,
        execution_nanos: u64,
        duration: Duration,
    );
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardingStatistics;

impl StatisticsGatherer for DiscardingStatistics {
    fn graph_processed(&self, _cycle: CycleId, _total_jobs: usize, _mean_job_size: f64) {}

    fn graph_executed(
        &self,
        _cycle: CycleId,
        _node_count: usize,
        _execution_nanos: u64,
        _duration: Duration,
    ) {
    }
}

/// Running totals across executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsTotals {
    /// Graphs processed.
    pub graphs_processed: u64,
    /// Jobs formed.
    pub jobs: u64,
    /// Node invocations packed into jobs.
    pub job_items: f64,
    /// Graphs executed.
    pub graphs_executed: u64,
    /// Nodes executed.
    pub nodes_executed: u64,
    /// Worker time.
    pub execution_nanos: u64,
    /// Wall-clock time.
    pub wall_nanos: u64,
    /// Last cycle reported.
    pub last_cycle: Option<CycleId>,
}

impl StatisticsTotals {
    /// Mean number of node invocations per job.
    pub fn mean_job_size(&self) -> f64 {
        if self.jobs == 0 {
            0.0
        } else {
            self.job_items / self.jobs as f64
        }
    }

    /// Mean worker time per executed node.
    pub fn mean_node_nanos(&self) -> f64 {
        if self.nodes_executed == 0 {
            0.0
        } else {
            self.execution_nanos as f64 / self.nodes_executed as f64
        }
    }
}

/// Accumulates totals in memory.
#[derive(Debug, Default)]
pub struct TotallingStatistics {
    totals: Mutex<StatisticsTotals>,
}

impl TotallingStatistics {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current totals.
    pub fn totals(&self) -> StatisticsTotals {
        *self.totals.lock()
    }

    /// Reset to zero.
    pub fn reset(&self) {
        *self.totals.lock() = StatisticsTotals::default();
    }
}

impl StatisticsGatherer for TotallingStatistics {
    fn graph_processed(&self, cycle: CycleId, total_jobs: usize, mean_job_size: f64) {
        let mut totals = self.totals.lock();
        totals.graphs_processed += 1;
        totals.jobs += total_jobs as u64;
        totals.job_items += mean_job_size * total_jobs as f64;
        totals.last_cycle = Some(cycle);
    }

    fn graph_executed(
        &self,
        cycle: CycleId,
        node_count: usize,
        execution_nanos: u64,
        duration: Duration,
    ) {
        let mut totals = self.totals.lock();
        totals.graphs_executed += 1;
        totals.nodes_executed += node_count as u64;
        totals.execution_nanos += execution_nanos;
        totals.wall_nanos += duration.as_nanos() as u64;
        totals.last_cycle = Some(cycle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_totalling() {
        let stats = TotallingStatistics::new();
        stats.graph_processed(CycleId(1), 4, 2.5);
        stats.graph_processed(CycleId(2), 2, 1.0);
        stats.graph_executed(CycleId(2), 12, 6_000, Duration::from_millis(3));

        let totals = stats.totals();
        assert_eq!(totals.graphs_processed, 2);
        assert_eq!(totals.jobs, 6);
        assert_relative_eq!(totals.mean_job_size(), 2.0);
        assert_relative_eq!(totals.mean_node_nanos(), 500.0);
        assert_eq!(totals.wall_nanos, 3_000_000);
        assert_eq!(totals.last_cycle, Some(CycleId(2)));

        stats.reset();
        assert_eq!(stats.totals().graphs_processed, 0);
    }
}
