//! Thompson Sampling weight allocation.
//!
//! Each variant gets a Beta posterior from its recent assignments and
//! reward-weighted goals. One draw per variant becomes its raw score, which
//! is then turned into a constrained integer plan.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use store::ExperimentRepository;
use tracing::debug;

use crate::error::Result;
use crate::random::RandomSource;
use crate::sampling::sample_beta;
use crate::types::Variant;
use crate::weights::{apply_control_floor, normalize_weight_plan, WeightPlan};

/// Reward credited per unit of goal value
pub fn reward_weight(metric_name: &str) -> f64 {
    match metric_name {
        "order" | "booking_success" => 1.0,
        "add_to_cart" => 0.25,
        "favorite" => 0.1,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BanditOptions {
    pub lookback_days: u32,
    pub min_observations: u64,
    pub min_weight: u32,
    pub control_floor: u32,
}

impl Default for BanditOptions {
    fn default() -> Self {
        Self {
            lookback_days: 14,
            min_observations: 80,
            min_weight: 5,
            control_floor: 22,
        }
    }
}

impl BanditOptions {
    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_min_observations(mut self, min: u64) -> Self {
        self.min_observations = min;
        self
    }

    pub fn with_min_weight(mut self, min: u32) -> Self {
        self.min_weight = min;
        self
    }

    pub fn with_control_floor(mut self, floor: u32) -> Self {
        self.control_floor = floor;
        self
    }

    /// Options with every knob forced into its allowed range
    pub fn clamped(&self) -> Self {
        Self {
            lookback_days: self.lookback_days.clamp(3, 45),
            min_observations: self.min_observations.max(20),
            min_weight: self.min_weight.max(2),
            control_floor: self.control_floor.clamp(20, 60),
        }
    }
}

/// Why an allocation has the weights it has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationReason {
    /// Too few assignments yet; configured weights with the control floor
    WarmupBaseline,
    ThompsonSampling,
    /// Fewer than two variants
    BanditNotApplicable,
    /// The history query failed
    HistoryUnavailable,
}

/// Posterior summary of one variant
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantDiagnostics {
    pub variant: String,
    pub assignments: u64,
    pub reward: f64,
    pub posterior_mean: f64,
    pub sampled_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditAllocation {
    /// Whether the weights should drive a random draw
    pub enabled: bool,
    pub reason: AllocationReason,
    pub lookback_days: u32,
    pub total_assignments: u64,
    pub weights: WeightPlan,
    pub diagnostics: Vec<VariantDiagnostics>,
}

impl BanditAllocation {
    pub fn not_applicable(lookback_days: u32) -> Self {
        Self {
            enabled: false,
            reason: AllocationReason::BanditNotApplicable,
            lookback_days,
            total_assignments: 0,
            weights: WeightPlan::default(),
            diagnostics: Vec::new(),
        }
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Configured weights normalized and floored, used without history
pub fn baseline_plan(variants: &[Variant], options: &BanditOptions) -> WeightPlan {
    let options = options.clamped();
    let configured: BTreeMap<String, f64> = variants.iter().map(|v| (v.name.clone(), v.weight)).collect();
    let base = normalize_weight_plan(variants, &configured, options.min_weight);
    apply_control_floor(variants, &base, options.control_floor, options.min_weight)
}

/// Compute adaptive weights from the recent history of an experiment
pub fn compute_bandit_weights(
    repo: &dyn ExperimentRepository,
    rng: &dyn RandomSource,
    experiment_key: &str,
    variants: &[Variant],
    options: &BanditOptions,
    now: DateTime<Utc>,
) -> Result<BanditAllocation> {
    let options = options.clamped();
    if experiment_key.trim().is_empty() || variants.len() < 2 {
        return Ok(BanditAllocation::not_applicable(options.lookback_days));
    }

    let since = now - Duration::days(i64::from(options.lookback_days));
    let counts = repo.assignment_counts_since(experiment_key, since)?;
    let goals = repo.goal_totals_since(experiment_key, since)?;

    let assignments: BTreeMap<String, u64> = counts.into_iter().map(|row| (row.variant, row.count)).collect();
    let mut rewards: BTreeMap<String, f64> = BTreeMap::new();
    for goal in goals {
        *rewards.entry(goal.variant).or_insert(0.0) += goal.total * reward_weight(&goal.metric_name);
    }

    let total_assignments: u64 = assignments.values().sum();
    if total_assignments < options.min_observations {
        debug!(experiment_key, total_assignments, "bandit warm-up, using baseline");
        return Ok(BanditAllocation {
            enabled: true,
            reason: AllocationReason::WarmupBaseline,
            lookback_days: options.lookback_days,
            total_assignments,
            weights: baseline_plan(variants, &options),
            diagnostics: Vec::new(),
        });
    }

    let mut raw_scores = BTreeMap::new();
    let mut diagnostics = Vec::with_capacity(variants.len());
    for variant in variants {
        let n = assignments.get(&variant.name).copied().unwrap_or(0) as f64;
        let reward = rewards.get(&variant.name).copied().unwrap_or(0.0).max(0.0);
        let pseudo_success = reward.min(n).max(0.0);
        let alpha = 1.0 + pseudo_success;
        let beta = 1.0 + (n - pseudo_success).max(0.0);
        let sample = sample_beta(rng, alpha, beta);

        raw_scores.insert(variant.name.clone(), sample);
        diagnostics.push(VariantDiagnostics {
            variant: variant.name.clone(),
            assignments: n as u64,
            reward: round(reward, 2),
            posterior_mean: round(alpha / (alpha + beta), 4),
            sampled_score: round(sample, 4),
        });
    }

    let normalized = normalize_weight_plan(variants, &raw_scores, options.min_weight);
    let weights = apply_control_floor(variants, &normalized, options.control_floor, options.min_weight);
    debug!(experiment_key, total_assignments, ?weights, "thompson sampling weights");

    Ok(BanditAllocation {
        enabled: true,
        reason: AllocationReason::ThompsonSampling,
        lookback_days: options.lookback_days,
        total_assignments,
        weights,
        diagnostics,
    })
}
