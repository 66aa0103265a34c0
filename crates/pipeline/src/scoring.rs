//! Personalized bike scoring.
//!
//! Each candidate gets a linear score over catalog rank, profile affinities,
//! behavioral popularity and price fit. Strategy variants add their own
//! modifiers and the total is scaled by how fresh the profile is.

use experiments::RandomSource;
use rayon::prelude::*;
use sources::{strategy_of, Candidate, RetrievalJob, EXPLORE_STRATEGY};
use std::collections::BTreeMap;
use std::sync::Arc;
use store::{BikeBehaviorMetrics, CatalogBike, Profile};
use tracing::debug;

/// A candidate with its ranking score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredBike {
    pub bike: CatalogBike,
    pub source: RetrievalJob,
    pub score: f64,
}

/// Coefficients of the linear score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub rank: f64,
    pub discipline: f64,
    pub brand: f64,
    pub category: f64,
    pub behavior: f64,
    pub price_fit: f64,
    /// Upper bound of the explore jitter
    pub explore_jitter: f64,
    /// Bonus per add-to-cart under the high-intent strategy
    pub high_intent_cart: f64,
    pub budget_bonus: f64,
    pub recency_offset: f64,
    pub recency_min: f64,
    pub recency_max: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            rank: 20.0,
            discipline: 120.0,
            brand: 95.0,
            category: 80.0,
            behavior: 0.8,
            price_fit: 0.25,
            explore_jitter: 8.0,
            high_intent_cart: 8.0,
            budget_bonus: 15.0,
            recency_offset: 0.25,
            recency_min: 0.4,
            recency_max: 1.2,
        }
    }
}

impl ScoringWeights {
    pub fn with_explore_jitter(mut self, jitter: f64) -> Self {
        self.explore_jitter = jitter;
        self
    }

    pub fn with_price_fit(mut self, weight: f64) -> Self {
        self.price_fit = weight;
        self
    }
}

/// Weighted popularity from behavior counters
pub fn behavior_signal(metrics: &BikeBehaviorMetrics) -> f64 {
    metrics.detail_clicks as f64 * 4.0 + metrics.favorites as f64 * 12.0 + metrics.add_to_cart as f64 * 20.0
}

/// Whether a price falls in the bonus band of a budget cluster
pub fn in_budget_band(cluster: &str, price: f64) -> bool {
    if price <= 0.0 {
        return false;
    }
    match cluster {
        "budget" => price < 1500.0,
        "mid" => (1500.0..2600.0).contains(&price),
        "high" => (2600.0..4200.0).contains(&price),
        "premium" => price >= 4200.0,
        _ => false,
    }
}

/// Closeness of a price to the profile's weighted average, in `[0, 100]`
pub fn price_distance_fit(price: f64, weighted_price: f64) -> f64 {
    if weighted_price <= 0.0 || price <= 0.0 {
        return 0.0;
    }
    let delta = (price - weighted_price).abs() / weighted_price;
    (100.0 - delta * 100.0).max(0.0)
}

/// Distance fit plus the in-band bonus
pub fn price_fit(price: f64, weighted_price: f64, budget_cluster: &str, bonus: f64) -> f64 {
    let mut fit = price_distance_fit(price, weighted_price);
    if in_budget_band(budget_cluster, price) {
        fit += bonus;
    }
    fit
}

fn lookup(primary: &BTreeMap<String, f64>, fallback: &BTreeMap<String, f64>, key: &str) -> f64 {
    if key.is_empty() {
        return 0.0;
    }
    primary
        .get(key)
        .or_else(|| fallback.get(key))
        .copied()
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

fn lookup_brand(primary: &BTreeMap<String, f64>, fallback: &BTreeMap<String, f64>, brand: &str) -> f64 {
    let exact = lookup(primary, fallback, brand);
    if exact != 0.0 || brand.is_empty() {
        return exact;
    }
    primary
        .iter()
        .chain(fallback.iter())
        .find(|(key, _)| key.eq_ignore_ascii_case(brand))
        .map(|(_, value)| *value)
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

/// Scores candidates against a profile and the active strategy
#[derive(Clone)]
pub struct BikeScorer {
    weights: ScoringWeights,
    rng: Arc<dyn RandomSource>,
}

impl BikeScorer {
    pub fn new(rng: Arc<dyn RandomSource>) -> Self {
        Self {
            weights: ScoringWeights::default(),
            rng,
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Multiplier from profile freshness, never below `recency_min`
    pub fn recency_factor(&self, recency_decay: f64) -> f64 {
        let w = &self.weights;
        let decay = if recency_decay.is_finite() { recency_decay } else { 1.0 };
        (decay + w.recency_offset).clamp(w.recency_min, w.recency_max)
    }

    pub fn score_bike(&self, bike: &CatalogBike, profile: &Profile, strategy: &str) -> f64 {
        let draw = if strategy == EXPLORE_STRATEGY { self.rng.next_f64() } else { 0.0 };
        self.score_with_draw(bike, profile, strategy, draw)
    }

    /// Score with a pre-drawn uniform value for the explore jitter
    fn score_with_draw(&self, bike: &CatalogBike, profile: &Profile, strategy: &str, draw: f64) -> f64 {
        let w = &self.weights;
        let features = &profile.feature_store;

        let discipline = bike.discipline_label().to_lowercase();
        let category = bike.category_label().to_lowercase();
        let discipline_affinity = lookup(&features.discipline_embedding, &profile.disciplines, &discipline);
        let brand_affinity = lookup_brand(&features.brand_embedding, &profile.brands, bike.brand_label());
        let category_affinity = lookup(&features.category_embedding, &profile.categories, &category);

        let weighted_price = if features.weighted_average_price > 0.0 {
            features.weighted_average_price
        } else {
            profile.weighted_average_price
        };
        let fit = price_fit(bike.price, weighted_price, &features.budget_cluster, w.budget_bonus);

        let mut score = bike.rank * w.rank
            + discipline_affinity * w.discipline
            + brand_affinity * w.brand
            + category_affinity * w.category
            + behavior_signal(&bike.behavior) * w.behavior
            + fit * w.price_fit;

        match strategy {
            "explore" => score += draw * w.explore_jitter,
            "high_intent" => score += bike.behavior.add_to_cart as f64 * w.high_intent_cart,
            _ => {}
        }

        score * self.recency_factor(features.recency_decay)
    }

    /// Score the whole pool in parallel, keeping pool order.
    ///
    /// Jitter draws are taken in pool order before the parallel pass, so a
    /// seeded source gives the same scores on every run.
    pub fn score_candidates(
        &self,
        candidates: Vec<Candidate>,
        profile: &Profile,
        assignments: &BTreeMap<String, String>,
    ) -> Vec<ScoredBike> {
        let strategy = strategy_of(assignments);
        let draws: Vec<f64> = if strategy == EXPLORE_STRATEGY {
            (0..candidates.len()).map(|_| self.rng.next_f64()).collect()
        } else {
            vec![0.0; candidates.len()]
        };
        let scored: Vec<ScoredBike> = candidates
            .into_par_iter()
            .zip(draws)
            .map(|(candidate, draw)| {
                let score = self.score_with_draw(&candidate.bike, profile, strategy, draw);
                ScoredBike {
                    bike: candidate.bike,
                    source: candidate.source,
                    score,
                }
            })
            .collect();
        debug!("Scored {} candidates (strategy {})", scored.len(), strategy);
        scored
    }
}
