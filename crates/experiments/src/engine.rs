//! # Experiment Engine
//!
//! Assigns subjects to experiment variants and records goal events.
//!
//! An assignment is sticky: once stored it is returned as is. New
//! assignments draw from the bandit weights when the bandit is enabled and
//! applicable, and otherwise fall back to the deterministic hash bucket.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use store::{Assignment, ExperimentRepository, GoalEvent, SubjectRefs};
use tracing::{debug, info, instrument, warn};

use crate::bandit::{baseline_plan, compute_bandit_weights, AllocationReason, BanditAllocation, BanditOptions};
use crate::error::{ExperimentError, Result};
use crate::hashing::pick_variant;
use crate::random::RandomSource;
use crate::types::{Experiment, GoalInput, Subject, Variant};

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub bandit_enabled: bool,
    pub bandit: BanditOptions,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            bandit_enabled: true,
            bandit: BanditOptions::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn with_bandit_enabled(mut self, enabled: bool) -> Self {
        self.bandit_enabled = enabled;
        self
    }

    pub fn with_bandit_options(mut self, options: BanditOptions) -> Self {
        self.bandit = options;
        self
    }
}

/// Weighted draw over the variants using one uniform sample
pub fn pick_variant_weighted(variants: &[Variant], rng: &dyn RandomSource) -> String {
    let positive: Vec<&Variant> = variants.iter().filter(|v| v.weight > 0.0).collect();
    let total: f64 = positive.iter().map(|v| v.weight).sum();
    if total <= 0.0 {
        return variants
            .first()
            .map(|v| v.name.clone())
            .unwrap_or_else(|| "control".to_string());
    }

    let bucket = rng.next_f64() * total;
    let mut cursor = 0.0;
    for variant in &positive {
        cursor += variant.weight;
        if bucket <= cursor {
            return variant.name.clone();
        }
    }
    positive
        .last()
        .map(|v| v.name.clone())
        .unwrap_or_else(|| "control".to_string())
}

pub struct ExperimentEngine {
    repo: Arc<dyn ExperimentRepository>,
    rng: Arc<dyn RandomSource>,
    config: ExperimentConfig,
}

impl ExperimentEngine {
    pub fn new(repo: Arc<dyn ExperimentRepository>, rng: Arc<dyn RandomSource>) -> Self {
        Self {
            repo,
            rng,
            config: ExperimentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExperimentConfig) -> Self {
        self.config = config;
        self
    }

    /// Enabled experiments with parsed variants, ordered by key
    pub fn list_active_experiments(&self) -> Result<Vec<Experiment>> {
        let rows = self.repo.enabled_experiments()?;
        Ok(rows.into_iter().map(Experiment::from).collect())
    }

    pub fn compute_bandit_weights(&self, experiment_key: &str, variants: &[Variant]) -> Result<BanditAllocation> {
        compute_bandit_weights(
            self.repo.as_ref(),
            self.rng.as_ref(),
            experiment_key,
            variants,
            &self.config.bandit,
            Utc::now(),
        )
    }

    /// Allocation for a new assignment; history failures degrade to baseline
    pub fn allocation_for(&self, experiment: &Experiment) -> BanditAllocation {
        match self.compute_bandit_weights(&experiment.experiment_key, &experiment.variants) {
            Ok(allocation) => allocation,
            Err(err) => {
                warn!(
                    experiment_key = %experiment.experiment_key,
                    "bandit history unavailable, using baseline: {}", err
                );
                let options = self.config.bandit.clamped();
                BanditAllocation {
                    enabled: experiment.variants.len() >= 2,
                    reason: AllocationReason::HistoryUnavailable,
                    lookback_days: options.lookback_days,
                    total_assignments: 0,
                    weights: baseline_plan(&experiment.variants, &options),
                    diagnostics: Vec::new(),
                }
            }
        }
    }

    /// Variant map for every enabled experiment.
    ///
    /// Subjects without a user or session id get an empty map.
    #[instrument(skip(self), fields(user_id = ?subject.user_id, session_id = ?subject.session_id))]
    pub fn get_assignments(&self, subject: &Subject) -> Result<BTreeMap<String, String>> {
        let Some(subject_key) = subject.key() else {
            return Ok(BTreeMap::new());
        };

        let mut assignments = BTreeMap::new();
        for experiment in self.list_active_experiments()? {
            let variant = self.assign(&experiment, &subject_key, subject)?;
            assignments.insert(experiment.experiment_key, variant);
        }
        Ok(assignments)
    }

    fn assign(&self, experiment: &Experiment, subject_key: &str, subject: &Subject) -> Result<String> {
        if let Some(existing) = self.repo.assignment(&experiment.experiment_key, subject_key)? {
            return Ok(existing.variant);
        }

        let deterministic = || pick_variant(&experiment.experiment_key, subject_key, &experiment.variants);
        let variant = if self.config.bandit_enabled {
            let allocation = self.allocation_for(experiment);
            if allocation.enabled {
                pick_variant_weighted(&allocation.weights.as_variants(), self.rng.as_ref())
            } else {
                deterministic()
            }
        } else {
            deterministic()
        };

        let assignment = Assignment {
            experiment_key: experiment.experiment_key.clone(),
            subject_key: subject_key.to_string(),
            user_id: subject.user_id,
            session_id: subject.session_id.clone(),
            variant,
            assigned_at: Utc::now(),
        };

        match self.persist(&assignment) {
            Some(stored) => {
                if stored.variant != assignment.variant {
                    debug!(subject_key, winner = %stored.variant, "lost assignment race");
                }
                Ok(stored.variant)
            }
            None => Ok(deterministic()),
        }
    }

    /// Insert with one retry; `None` when both attempts fail
    fn persist(&self, assignment: &Assignment) -> Option<Assignment> {
        for attempt in 1..=2 {
            match self.repo.insert_assignment(assignment) {
                Ok(stored) => return Some(stored),
                Err(err) => warn!(
                    experiment_key = %assignment.experiment_key,
                    attempt,
                    "assignment write failed: {}", err
                ),
            }
        }
        warn!(
            experiment_key = %assignment.experiment_key,
            "assignment not persisted, serving deterministic bucket"
        );
        None
    }

    /// Append one goal event. Key and metric are required.
    pub fn track_goal(&self, input: GoalInput) -> Result<()> {
        let experiment_key = input.experiment_key.trim();
        let metric_name = input.metric_name.trim();
        if experiment_key.is_empty() {
            return Err(ExperimentError::InvalidGoal("experiment key is empty".to_string()));
        }
        if metric_name.is_empty() {
            return Err(ExperimentError::InvalidGoal("metric name is empty".to_string()));
        }

        let variant = input
            .variant
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("control");
        let value = input.value.filter(|v| v.is_finite()).unwrap_or(1.0);

        self.repo.insert_goal(&GoalEvent {
            experiment_key: experiment_key.to_string(),
            variant: variant.to_string(),
            metric_name: metric_name.to_string(),
            bike_id: input.bike_id,
            subject: SubjectRefs {
                user_id: input.user_id,
                session_id: input.session_id.clone(),
            },
            value,
            created_at: Utc::now(),
        })?;
        info!(experiment_key, variant, metric_name, value, "goal tracked");
        Ok(())
    }
}
