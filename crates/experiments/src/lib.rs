//! # Experiments
//!
//! Sticky A/B assignment with an adaptive Thompson Sampling allocator.
//!
//! ## Allocation Flow
//!
//! 1. **Lookup**: an existing assignment for the subject is returned unchanged
//! 2. **History**: recent assignment counts and reward-weighted goals per variant
//! 3. **Warm-up**: below the observation threshold, configured weights with a control floor
//! 4. **Sampling**: one Beta posterior draw per variant becomes its raw score
//! 5. **Plan**: raw scores become integer weights summing to 100 with per-variant minimums
//! 6. **Draw**: a weighted pick is stored, first writer wins
//!
//! When the bandit is disabled or history is unavailable, assignment falls
//! back to a deterministic hash bucket over the configured weights.

pub mod bandit;
pub mod engine;
pub mod error;
pub mod hashing;
pub mod random;
pub mod sampling;
pub mod types;
pub mod weights;

pub use bandit::{
    baseline_plan, compute_bandit_weights, reward_weight, AllocationReason, BanditAllocation, BanditOptions,
    VariantDiagnostics,
};
pub use engine::{pick_variant_weighted, ExperimentConfig, ExperimentEngine};
pub use error::{ExperimentError, Result};
pub use hashing::{djb2, pick_variant};
pub use random::{RandomSource, SeededRandom, ThreadRandom};
pub use types::{parse_variants, Experiment, GoalInput, Subject, Variant};
pub use weights::{apply_control_floor, normalize_weight_plan, WeightPlan};
