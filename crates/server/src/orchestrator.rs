//! # Recommendation Orchestrator
//!
//! This module coordinates the recommendation pipeline:
//! 1. Resolve the profile and the experiment assignments (in parallel)
//! 2. Build the candidate pool for the assigned strategy
//! 3. Score every candidate against the profile
//! 4. Diversify the scored ranking
//! 5. Optionally let the LLM reorder the top of the ranking
//! 6. Slice the requested page and strip internal scores
//!
//! Profile failures fail the request. Assignment failures degrade to no
//! assignments, which means the control strategy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use experiments::{ExperimentEngine, Subject};
use metrics::{ProfileQuery, ProfileService};
use pipeline::{diversify_ranking, BikeScorer, LlmReranker, ScoredBike};
use sources::{strategy_of, CandidatePoolBuilder};
use store::Profile;

use crate::response::{
    BikeRecommendation, RecommendationRequest, RecommendationResponse, RequestContext, RetrievalSummary,
};

/// Paging bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecommendationConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            default_limit: 24,
            max_limit: 60,
        }
    }
}

impl RecommendationConfig {
    /// Requested limit clamped to `1..=max_limit`
    pub fn clamp_limit(&self, limit: Option<usize>) -> usize {
        limit.unwrap_or(self.default_limit).clamp(1, self.max_limit.max(1))
    }
}

/// Main orchestrator that coordinates the recommendation pipeline
#[derive(Clone)]
pub struct RecommendationOrchestrator {
    profiles: ProfileService,
    experiments: Arc<ExperimentEngine>,
    pool_builder: Arc<CandidatePoolBuilder>,
    scorer: BikeScorer,
    reranker: LlmReranker,
    config: RecommendationConfig,
}

impl RecommendationOrchestrator {
    pub fn new(
        profiles: ProfileService,
        experiments: Arc<ExperimentEngine>,
        pool_builder: Arc<CandidatePoolBuilder>,
        scorer: BikeScorer,
    ) -> Self {
        Self {
            profiles,
            experiments,
            pool_builder,
            scorer,
            reranker: LlmReranker::disabled(),
            config: RecommendationConfig::default(),
        }
    }

    pub fn with_reranker(mut self, reranker: LlmReranker) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_config(mut self, config: RecommendationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RecommendationConfig {
        &self.config
    }

    /// Main entry point: one page of personalized bikes
    #[instrument(skip(self, request), fields(user_id = ?ctx.user_id, session_id = ?ctx.session_id))]
    pub async fn get_personalized_recommendations(
        &self,
        request: RecommendationRequest,
        ctx: RequestContext,
    ) -> Result<RecommendationResponse> {
        let start_time = Instant::now();
        let limit = self.config.clamp_limit(request.limit);
        let offset = request.offset.unwrap_or(0);

        let (profile, assignments) = self.resolve_context(request.profile, &ctx).await?;
        let strategy = strategy_of(&assignments).to_string();
        debug!("Resolved profile {:?} with strategy {}", profile.person_key, strategy);

        let (ranked, retrieval) = self.rank(profile.clone(), assignments.clone()).await?;
        info!(
            "Ranked {} candidates for strategy {}",
            retrieval.candidate_count, retrieval.strategy
        );

        let ranked = self.reranker.maybe_rerank(ranked, &profile).await;
        let bikes = paginate(ranked, offset, limit);

        info!(
            "Returning {} bikes (offset {}, limit {}) in {:.2?}",
            bikes.len(),
            offset,
            limit,
            start_time.elapsed()
        );

        Ok(RecommendationResponse {
            success: true,
            bikes,
            profile_used: profile,
            experiments: assignments,
            retrieval,
        })
    }

    /// Fetch the profile and the assignments in parallel
    async fn resolve_context(
        &self,
        profile_override: Option<Profile>,
        ctx: &RequestContext,
    ) -> Result<(Profile, BTreeMap<String, String>)> {
        let profile_task = tokio::task::spawn_blocking({
            let profiles = self.profiles.clone();
            let query = ProfileQuery {
                user_id: ctx.user_id,
                session_id: ctx.session_id.clone(),
            };
            move || match profile_override {
                Some(profile) => Ok(profile),
                None => profiles.get_profile(&query),
            }
        });
        let assignment_task = tokio::task::spawn_blocking({
            let experiments = self.experiments.clone();
            let subject = Subject {
                user_id: ctx.user_id,
                session_id: ctx.session_id.clone(),
            };
            move || experiments.get_assignments(&subject)
        });

        let (profile_result, assignment_result) = tokio::join!(profile_task, assignment_task);

        let profile = profile_result
            .context("Profile task panicked")?
            .context("Failed to load profile")?;
        let assignments = match assignment_result.context("Assignment task panicked")? {
            Ok(assignments) => assignments,
            Err(err) => {
                warn!("Experiment assignment failed, serving control: {}", err);
                BTreeMap::new()
            }
        };

        Ok((profile, assignments))
    }

    /// Pool, score and diversify on the blocking pool
    async fn rank(
        &self,
        profile: Profile,
        assignments: BTreeMap<String, String>,
    ) -> Result<(Vec<ScoredBike>, RetrievalSummary)> {
        let pool_builder = self.pool_builder.clone();
        let scorer = self.scorer.clone();

        tokio::task::spawn_blocking(move || -> Result<(Vec<ScoredBike>, RetrievalSummary)> {
            let signals = pool_builder.signals(&profile);
            let pool = pool_builder
                .build_candidate_pool(&profile, &assignments)
                .context("Failed to build candidate pool")?;

            let retrieval = RetrievalSummary {
                candidate_count: pool.len(),
                strategy: strategy_of(&assignments).to_string(),
                top_disciplines: signals.top_disciplines,
                top_brands: signals.top_brands,
                budget_cluster: signals.budget_cluster,
            };

            let scored = scorer.score_candidates(pool, &profile, &assignments);
            Ok((diversify_ranking(scored), retrieval))
        })
        .await
        .context("Ranking task panicked")?
    }
}

/// Slice one page out of the ranking and drop the scores
pub fn paginate(ranked: Vec<ScoredBike>, offset: usize, limit: usize) -> Vec<BikeRecommendation> {
    ranked
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|item| BikeRecommendation::from_bike(item.bike, item.source))
        .collect()
}
