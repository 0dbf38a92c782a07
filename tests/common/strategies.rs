//! proptest strategies for planner and batch inputs.

use batchflow_core::config::{PlannerConfig, PlannerTier, PlanningPolicy, TierLimits};
use proptest::prelude::*;

/// Valid tier tables: strictly ascending boundaries, positive sizes.
pub fn planner_config_strategy() -> impl Strategy<Value = PlannerConfig> {
    (
        prop::collection::vec((1usize..5_000, 1usize..200, 1usize..150), 0..5),
        1usize..200,
        1usize..150,
        prop_oneof![Just(PlanningPolicy::Tiered), Just(PlanningPolicy::TargetDuration)],
        1u64..7_200,
    )
        .prop_map(|(steps, overflow_batch, overflow_workers, policy, target)| {
            let mut up_to = 0;
            let tiers = steps
                .into_iter()
                .map(|(step, batch_size, max_workers)| {
                    up_to += step;
                    PlannerTier {
                        up_to,
                        batch_size,
                        max_workers,
                    }
                })
                .collect();
            PlannerConfig {
                policy,
                tiers,
                overflow: TierLimits {
                    batch_size: overflow_batch,
                    max_workers: overflow_workers,
                },
                target_stage_duration_seconds: target,
            }
        })
}

pub fn item_cost_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![Just(0.0), 0.01f64..5.0]
}
