//! Candidate types shared by retrieval and ranking.

use serde::Serialize;
use std::collections::BTreeMap;
use store::{BikeId, CatalogBike};

/// Experiment whose variant selects the recommendation strategy
pub const STRATEGY_EXPERIMENT: &str = "recommendation_strategy";

/// Strategy variant that enables the random long-tail job
pub const EXPLORE_STRATEGY: &str = "explore";

/// Variant name used when no strategy is assigned
pub const CONTROL_STRATEGY: &str = "control";

/// Active recommendation strategy for a set of assignments
pub fn strategy_of(assignments: &BTreeMap<String, String>) -> &str {
    assignments
        .get(STRATEGY_EXPERIMENT)
        .map(String::as_str)
        .unwrap_or(CONTROL_STRATEGY)
}

/// Which retrieval job produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalJob {
    /// Highest catalog rank overall
    TopRank,
    /// Profile's top disciplines
    Disciplines,
    /// Profile's top brands
    Brands,
    /// Price band of the budget cluster
    Budget,
    /// Random long-tail sample
    Explore,
}

/// A bike in the candidate pool
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bike: CatalogBike,
    /// First job that returned the bike
    pub source: RetrievalJob,
}

impl Candidate {
    pub fn new(bike: CatalogBike, source: RetrievalJob) -> Self {
        Self { bike, source }
    }

    pub fn id(&self) -> BikeId {
        self.bike.id
    }
}

/// Retrieval price range for a budget cluster.
///
/// Neighbouring ranges overlap.
pub fn budget_range(cluster: &str) -> Option<(f64, f64)> {
    match cluster.trim().to_lowercase().as_str() {
        "budget" => Some((0.0, 1700.0)),
        "mid" => Some((1200.0, 3000.0)),
        "high" => Some((2200.0, 4800.0)),
        "premium" => Some((3600.0, 20000.0)),
        _ => None,
    }
}

/// Keys with the highest positive values, at most `limit` (at least one)
pub fn top_keys(map: &BTreeMap<String, f64>, limit: usize) -> Vec<String> {
    let mut entries: Vec<(&String, f64)> = map
        .iter()
        .filter(|(key, value)| !key.trim().is_empty() && value.is_finite() && **value > 0.0)
        .map(|(key, value)| (key, *value))
        .collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .into_iter()
        .take(limit.max(1))
        .map(|(key, _)| key.clone())
        .collect()
}
