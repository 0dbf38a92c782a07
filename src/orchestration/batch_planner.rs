//! # Batch Planner
//!
//! Decides how a stage's input is cut into batches and how many workers drain
//! them. Pure computation, no I/O.
//!
//! Two policies are available (see [`PlanningPolicy`]):
//!
//! - **Tiered**: batch size and worker cap come from the tier table.
//! - **TargetDuration**: batch size from the tier table, workers sized so the
//!   estimated stage runtime fits `target_stage_duration_seconds`.
//!
//! Under either policy the worker count never exceeds the batch count, and the
//! per-stage platform ceiling is applied by [`BatchPlanner::plan_for_stage`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{PlannerConfig, PlanningPolicy, StageSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub max_workers: usize,
    pub batch_count: usize,
}

impl BatchPlan {
    /// Plan for an empty input: no batches, no workers.
    pub const EMPTY: BatchPlan = BatchPlan {
        batch_size: 0,
        max_workers: 0,
        batch_count: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.batch_count == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchPlanner {
    config: PlannerConfig,
}

impl BatchPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan `total_items` with an estimated per-item cost in minutes.
    pub fn plan(&self, total_items: usize, estimated_item_cost_minutes: f64) -> BatchPlan {
        if total_items == 0 {
            return BatchPlan::EMPTY;
        }

        let limits = self.config.limits_for(total_items);
        let batch_size = limits.batch_size.max(1);
        let batch_count = total_items.div_ceil(batch_size);

        let desired_workers = match self.config.policy {
            PlanningPolicy::Tiered => limits.max_workers,
            PlanningPolicy::TargetDuration => self.workers_for_target(
                total_items,
                estimated_item_cost_minutes,
            ),
        };
        let max_workers = desired_workers.clamp(1, batch_count);

        debug!(
            total_items,
            batch_size,
            batch_count,
            max_workers,
            policy = ?self.config.policy,
            "📐 PLANNER: computed batch plan"
        );

        BatchPlan {
            batch_size,
            max_workers,
            batch_count,
        }
    }

    /// [`Self::plan`] with the stage's cost estimate, capped by its concurrency ceiling.
    pub fn plan_for_stage(&self, total_items: usize, settings: &StageSettings) -> BatchPlan {
        let mut plan = self.plan(total_items, settings.estimated_item_cost_minutes);
        if plan.max_workers > settings.max_workers {
            debug!(
                planned = plan.max_workers,
                ceiling = settings.max_workers,
                "📐 PLANNER: capping workers at stage ceiling"
            );
            plan.max_workers = settings.max_workers.max(1);
        }
        plan
    }

    fn workers_for_target(&self, total_items: usize, cost_minutes: f64) -> usize {
        let estimated_seconds = total_items as f64 * cost_minutes.max(0.0) * 60.0;
        let target = self.config.target_stage_duration_seconds.max(1) as f64;
        let workers = (estimated_seconds / target).ceil();
        if workers.is_finite() && workers >= 1.0 {
            workers.min(usize::MAX as f64) as usize
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_plans_nothing() {
        let plan = BatchPlanner::default().plan(0, 1.0);
        assert_eq!(plan, BatchPlan::EMPTY);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_137_items_use_six_batches_of_25() {
        let plan = BatchPlanner::default().plan(137, 1.0);
        assert_eq!(plan.batch_size, 25);
        assert_eq!(plan.batch_count, 6);
        assert_eq!(plan.max_workers, 6);
    }

    #[test]
    fn test_tier_boundaries() {
        let planner = BatchPlanner::default();
        assert_eq!(planner.plan(1_000, 1.0).max_workers, 10);
        assert_eq!(planner.plan(5_000, 1.0).max_workers, 30);
        let large = planner.plan(50_000, 1.0);
        assert_eq!((large.batch_size, large.max_workers), (50, 50));
        let huge = planner.plan(200_000, 1.0);
        assert_eq!((huge.batch_size, huge.max_workers), (100, 100));
    }

    #[test]
    fn test_small_inputs_get_one_worker() {
        let plan = BatchPlanner::default().plan(3, 1.0);
        assert_eq!(plan.batch_count, 1);
        assert_eq!(plan.max_workers, 1);
    }

    #[test]
    fn test_stage_ceiling_caps_workers() {
        let settings = StageSettings {
            max_workers: 4,
            ..StageSettings::default()
        };
        let plan = BatchPlanner::default().plan_for_stage(1_000, &settings);
        assert_eq!(plan.max_workers, 4);
        assert_eq!(plan.batch_count, 40);
    }

    #[test]
    fn test_target_duration_policy() {
        let planner = BatchPlanner::new(PlannerConfig {
            policy: PlanningPolicy::TargetDuration,
            target_stage_duration_seconds: 600,
            ..PlannerConfig::default()
        });

        // 1000 items * 1 min = 60000 s; / 600 s = 100 workers, bounded by 40 batches
        assert_eq!(planner.plan(1_000, 1.0).max_workers, 40);
        // 100 items * 0.17 min = 1020 s; / 600 s = 2 workers
        assert_eq!(planner.plan(100, 0.17).max_workers, 2);
        // zero cost still gets a worker
        assert_eq!(planner.plan(100, 0.0).max_workers, 1);
    }
}
