//! Service wiring over one store.
//!
//! [`Platform`] builds every service from a single [`SqliteStore`] and
//! exposes their operations as async calls; blocking store work runs on
//! `spawn_blocking`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use experiments::{
    BanditAllocation, Experiment, ExperimentConfig, ExperimentEngine, GoalInput, RandomSource, Subject,
};
use llm_client::{ContentGenerator, GrpcLlmClient};
use metrics::{IdentityResolver, IngestConfig, IngestContext, IngestPipeline, IngestReport, ProfileConfig};
use metrics::{ProfileQuery, ProfileService, SearchInput, SearchReport};
use pipeline::{BikeScorer, LlmReranker, RerankConfig, ScoringWeights};
use sources::{CandidatePoolBuilder, PoolConfig};
use store::{ExperimentRepository, Profile, SqliteStore};

use crate::orchestrator::{RecommendationConfig, RecommendationOrchestrator};
use crate::response::{RecommendationRequest, RecommendationResponse, RequestContext};

/// Settings of every service
#[derive(Debug, Clone, Default)]
pub struct PlatformConfig {
    pub ingest: IngestConfig,
    pub profile: ProfileConfig,
    pub experiment: ExperimentConfig,
    pub pool: PoolConfig,
    pub scoring: ScoringWeights,
    pub rerank: RerankConfig,
    pub recommendation: RecommendationConfig,
    /// gRPC address of the LLM gateway, e.g. `http://127.0.0.1:50051`
    pub llm_gateway_addr: Option<String>,
}

impl PlatformConfig {
    pub fn with_bandit_enabled(mut self, enabled: bool) -> Self {
        self.experiment = self.experiment.with_bandit_enabled(enabled);
        self
    }

    pub fn with_rerank(mut self, rerank: RerankConfig) -> Self {
        self.rerank = rerank;
        self
    }

    pub fn with_llm_gateway(mut self, addr: impl Into<String>) -> Self {
        self.llm_gateway_addr = Some(addr.into());
        self
    }
}

pub struct Platform {
    store: Arc<SqliteStore>,
    ingest: Arc<IngestPipeline>,
    profiles: ProfileService,
    experiments: Arc<ExperimentEngine>,
    recommendations: RecommendationOrchestrator,
}

impl Platform {
    /// Wire all services.
    ///
    /// With rerank enabled and a gateway address set, a lazily connecting
    /// gRPC client is created; this needs a running tokio runtime.
    pub fn new(store: Arc<SqliteStore>, rng: Arc<dyn RandomSource>, config: PlatformConfig) -> Result<Self> {
        let generator: Option<Arc<dyn ContentGenerator>> = match (&config.llm_gateway_addr, config.rerank.enabled) {
            (Some(addr), true) => {
                let client = GrpcLlmClient::connect_lazy(addr.clone()).context("Invalid LLM gateway address")?;
                info!("LLM rerank enabled via {}", client.gateway_address());
                Some(Arc::new(client))
            }
            (None, true) => {
                warn!("LLM rerank enabled without a gateway address; rerank stays off");
                None
            }
            _ => None,
        };
        Ok(Self::with_generator(store, rng, config, generator))
    }

    /// Wire all services around a given content generator
    pub fn with_generator(
        store: Arc<SqliteStore>,
        rng: Arc<dyn RandomSource>,
        config: PlatformConfig,
        generator: Option<Arc<dyn ContentGenerator>>,
    ) -> Self {
        let profiles = ProfileService::new(store.clone(), store.clone()).with_config(config.profile.clone());
        let ingest = IngestPipeline::new(store.clone(), IdentityResolver::new(store.clone()), profiles.clone())
            .with_config(config.ingest.clone());
        let experiments =
            Arc::new(ExperimentEngine::new(store.clone(), rng.clone()).with_config(config.experiment.clone()));
        let pool_builder = Arc::new(CandidatePoolBuilder::new(store.clone(), rng.clone()).with_config(config.pool.clone()));
        let scorer = BikeScorer::new(rng).with_weights(config.scoring.clone());

        let recommendations = RecommendationOrchestrator::new(profiles.clone(), experiments.clone(), pool_builder, scorer)
            .with_reranker(LlmReranker::new(generator, config.rerank.clone()))
            .with_config(config.recommendation);

        Self {
            store,
            ingest: Arc::new(ingest),
            profiles,
            experiments,
            recommendations,
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn recommendations(&self) -> &RecommendationOrchestrator {
        &self.recommendations
    }

    /// Ingest a batch of loosely typed events
    pub async fn ingest(&self, events: Vec<Value>, ctx: IngestContext) -> Result<IngestReport> {
        let ingest = self.ingest.clone();
        tokio::task::spawn_blocking(move || ingest.ingest_json(events, &ctx))
            .await
            .context("Ingest task panicked")
    }

    /// Record a storefront search for the context's session or user
    pub async fn track_search(&self, input: SearchInput, ctx: IngestContext) -> Result<SearchReport> {
        let ingest = self.ingest.clone();
        tokio::task::spawn_blocking(move || ingest.track_search(input, &ctx))
            .await
            .context("Search task panicked")?
            .context("Failed to record search")
    }

    pub async fn profile(&self, query: ProfileQuery) -> Result<Profile> {
        let profiles = self.profiles.clone();
        tokio::task::spawn_blocking(move || profiles.get_profile(&query))
            .await
            .context("Profile task panicked")?
            .context("Failed to load profile")
    }

    pub async fn assignments(&self, subject: Subject) -> Result<BTreeMap<String, String>> {
        let experiments = self.experiments.clone();
        tokio::task::spawn_blocking(move || experiments.get_assignments(&subject))
            .await
            .context("Assignment task panicked")?
            .context("Failed to assign variants")
    }

    /// Current bandit allocation of one experiment
    pub async fn bandit_weights(&self, experiment_key: String) -> Result<BanditAllocation> {
        let experiments = self.experiments.clone();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<BanditAllocation> {
            let row = store
                .experiment(&experiment_key)?
                .ok_or_else(|| anyhow!("Unknown experiment {experiment_key}"))?;
            let experiment = Experiment::from(row);
            Ok(experiments.compute_bandit_weights(&experiment.experiment_key, &experiment.variants)?)
        })
        .await
        .context("Weights task panicked")?
    }

    pub async fn track_goal(&self, goal: GoalInput) -> Result<()> {
        let experiments = self.experiments.clone();
        tokio::task::spawn_blocking(move || experiments.track_goal(goal))
            .await
            .context("Goal task panicked")?
            .context("Failed to track goal")
    }

    pub async fn recommend(
        &self,
        request: RecommendationRequest,
        ctx: RequestContext,
    ) -> Result<RecommendationResponse> {
        self.recommendations.get_personalized_recommendations(request, ctx).await
    }
}
