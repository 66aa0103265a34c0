//! Ranking pipeline for bike candidates.
//!
//! This crate provides:
//! - [`BikeScorer`] for the personalized linear score
//! - [`diversify_ranking`] for the brand/discipline repetition penalty
//! - [`LlmReranker`] for the optional, timeout-bounded LLM rerank
//!
//! ## Architecture
//! The pipeline processes a candidate pool in stages:
//! 1. Scoring turns each candidate into a [`ScoredBike`]
//! 2. Diversification reorders the scored list
//! 3. The reranker may move the model's picks to the front
//!
//! ## Example Usage
//! ```ignore
//! use pipeline::{diversify_ranking, BikeScorer, LlmReranker};
//!
//! let scored = BikeScorer::new(rng.clone()).score_candidates(pool, &profile, &assignments);
//! let diversified = diversify_ranking(scored);
//! let ranked = reranker.maybe_rerank(diversified, &profile).await;
//! ```

pub mod diversify;
pub mod rerank;
pub mod scoring;

// Re-export main types
pub use diversify::{diversify_ranking, diversify_with, DiversityPenalty};
pub use rerank::{apply_order, build_prompt, parse_ranked_ids, LlmReranker, RerankConfig, RerankError};
pub use scoring::{behavior_signal, in_budget_band, price_distance_fit, price_fit, BikeScorer, ScoredBike, ScoringWeights};
