//! Optional LLM rerank of the diversified ranking.
//!
//! The top of the ranking is sent to a [`ContentGenerator`] as compact JSON
//! together with a profile summary, and the model is asked for
//! `{"ids":[...]}`. Listed ids move to the front in the model's order; the
//! rest keep their relative order. Any failure leaves the ranking untouched.

use llm_client::{ContentGenerator, LlmClientError};
use serde::Serialize;
use serde_json::Value;
use sources::top_keys;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use store::{BikeId, Profile};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::scoring::ScoredBike;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM call failed: {0}")]
    Generator(#[from] LlmClientError),

    #[error("No JSON object in LLM reply")]
    MissingJson,

    #[error("Malformed JSON in LLM reply: {0}")]
    Json(#[from] serde_json::Error),

    #[error("LLM reply listed no usable ids")]
    EmptyIds,

    #[error("No LLM generator configured")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, RerankError>;

#[derive(Debug, Clone, PartialEq)]
pub struct RerankConfig {
    pub enabled: bool,
    pub timeout: Duration,
    /// How many leading bikes are shown to the model
    pub top_n: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_millis(2500),
            top_n: 20,
        }
    }
}

impl RerankConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompactBike<'a> {
    id: BikeId,
    brand: &'a str,
    discipline: Option<&'a str>,
    price: f64,
    rank: f64,
    score: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileSummary {
    top_disciplines: Vec<String>,
    top_brands: Vec<String>,
    budget_cluster: String,
    weighted_average_price: f64,
    intent_score: f64,
}

impl ProfileSummary {
    fn from_profile(profile: &Profile) -> Self {
        let features = &profile.feature_store;
        Self {
            top_disciplines: top_keys(&features.discipline_embedding, 3),
            top_brands: top_keys(&features.brand_embedding, 3),
            budget_cluster: features.budget_cluster.clone(),
            weighted_average_price: features.weighted_average_price,
            intent_score: features.intent_score,
        }
    }
}

/// Prompt listing the leading `top_n` bikes
pub fn build_prompt(bikes: &[ScoredBike], profile: &Profile, top_n: usize) -> Result<String> {
    let compact: Vec<CompactBike<'_>> = bikes
        .iter()
        .take(top_n)
        .map(|item| {
            let discipline = item.bike.discipline_label();
            CompactBike {
                id: item.bike.id,
                brand: item.bike.brand_label(),
                discipline: if discipline.is_empty() { None } else { Some(discipline) },
                price: item.bike.price,
                rank: item.bike.rank,
                score: (item.score * 100.0).round() / 100.0,
            }
        })
        .collect();

    Ok([
        r#"Return JSON only: {"ids":[...]}"#.to_string(),
        "Re-rank bike ids for this profile (intent-first, then price-fit).".to_string(),
        format!("Profile: {}", serde_json::to_string(&ProfileSummary::from_profile(profile))?),
        format!("Candidates: {}", serde_json::to_string(&compact)?),
    ]
    .join("\n"))
}

fn as_bike_id(value: &Value) -> Option<BikeId> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract the id list from the outermost `{...}` of a reply
pub fn parse_ranked_ids(text: &str) -> Result<Vec<BikeId>> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(RerankError::MissingJson);
    };
    if end <= start {
        return Err(RerankError::MissingJson);
    }

    let parsed: Value = serde_json::from_str(&text[start..=end])?;
    let ids: Vec<BikeId> = parsed
        .get("ids")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(as_bike_id).collect())
        .unwrap_or_default();

    if ids.is_empty() {
        return Err(RerankError::EmptyIds);
    }
    Ok(ids)
}

/// Move listed ids to the front; unknown and repeated ids are ignored
pub fn apply_order(bikes: Vec<ScoredBike>, ids: &[BikeId]) -> Vec<ScoredBike> {
    let mut slots: Vec<Option<ScoredBike>> = bikes.into_iter().map(Some).collect();
    let mut placed = HashSet::new();
    let mut ordered = Vec::with_capacity(slots.len());

    for id in ids {
        if !placed.insert(*id) {
            continue;
        }
        let found = slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|item| item.bike.id == *id));
        if let Some(item) = found.and_then(Option::take) {
            ordered.push(item);
        }
    }
    ordered.extend(slots.into_iter().flatten());
    ordered
}

/// Feature-flagged reranker
#[derive(Clone)]
pub struct LlmReranker {
    generator: Option<Arc<dyn ContentGenerator>>,
    config: RerankConfig,
}

impl LlmReranker {
    pub fn new(generator: Option<Arc<dyn ContentGenerator>>, config: RerankConfig) -> Self {
        Self { generator, config }
    }

    /// Reranker that always returns its input
    pub fn disabled() -> Self {
        Self::new(None, RerankConfig::default())
    }

    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.config.enabled && self.generator.is_some()
    }

    /// Ask the model for an order, bounded by the configured timeout
    pub async fn ranked_ids(&self, bikes: &[ScoredBike], profile: &Profile) -> Result<Vec<BikeId>> {
        let Some(generator) = self.generator.as_ref() else {
            return Err(RerankError::NotConfigured);
        };
        let prompt = build_prompt(bikes, profile, self.config.top_n)?;
        let reply = tokio::time::timeout(self.config.timeout, generator.generate_content(&prompt))
            .await
            .map_err(|_| RerankError::Timeout(self.config.timeout))??;
        parse_ranked_ids(&reply)
    }

    /// Rerank when enabled; any failure returns the input order
    #[instrument(skip(self, bikes, profile), fields(candidates = bikes.len()))]
    pub async fn maybe_rerank(&self, bikes: Vec<ScoredBike>, profile: &Profile) -> Vec<ScoredBike> {
        if !self.is_active() || bikes.is_empty() {
            return bikes;
        }
        match self.ranked_ids(&bikes, profile).await {
            Ok(ids) => {
                debug!("LLM returned {} ids", ids.len());
                apply_order(bikes, &ids)
            }
            Err(err) => {
                warn!("LLM rerank skipped: {}", err);
                bikes
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sources::RetrievalJob;
    use store::{BikeBehaviorMetrics, CatalogBike};

    fn scored(id: BikeId, score: f64) -> ScoredBike {
        ScoredBike {
            bike: CatalogBike {
                id,
                name: format!("Bike {id}"),
                brand: "Trek".to_string(),
                model: None,
                discipline: Some("road".to_string()),
                category: None,
                price: 2000.0,
                rank: 3.0,
                main_image: None,
                images: Vec::new(),
                behavior: BikeBehaviorMetrics::empty(id),
            },
            source: RetrievalJob::TopRank,
            score,
        }
    }

    fn ranking() -> Vec<ScoredBike> {
        (1..=5).map(|id| scored(id, 100.0 - id as f64)).collect()
    }

    fn ids(items: &[ScoredBike]) -> Vec<BikeId> {
        items.iter().map(|item| item.bike.id).collect()
    }

    enum Behavior {
        Reply(&'static str),
        Fail,
        Hang,
    }

    struct MockGenerator(Behavior);

    #[async_trait]
    impl ContentGenerator for MockGenerator {
        async fn generate_content(&self, _prompt: &str) -> llm_client::Result<String> {
            match &self.0 {
                Behavior::Reply(text) => Ok(text.to_string()),
                Behavior::Fail => Err(LlmClientError::Request("unavailable".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(r#"{"ids":[5]}"#.to_string())
                }
            }
        }
    }

    fn reranker(behavior: Behavior) -> LlmReranker {
        LlmReranker::new(
            Some(Arc::new(MockGenerator(behavior))),
            RerankConfig::default()
                .with_enabled(true)
                .with_timeout(Duration::from_millis(50)),
        )
    }

    #[test]
    fn test_parse_ranked_ids() {
        assert_eq!(parse_ranked_ids(r#"Sure! {"ids":[3, "1", 2.0]} done"#).unwrap(), vec![3, 1, 2]);
        assert!(matches!(parse_ranked_ids("no json"), Err(RerankError::MissingJson)));
        assert!(matches!(parse_ranked_ids("} {"), Err(RerankError::MissingJson)));
        assert!(matches!(parse_ranked_ids(r#"{"ids": [1,"#), Err(RerankError::MissingJson)));
        assert!(matches!(parse_ranked_ids(r#"{"ids": oops}"#), Err(RerankError::Json(_))));
        assert!(matches!(parse_ranked_ids(r#"{"ids": []}"#), Err(RerankError::EmptyIds)));
        assert!(matches!(parse_ranked_ids(r#"{"order": [1]}"#), Err(RerankError::EmptyIds)));
    }

    #[test]
    fn test_apply_order_moves_listed_ids_first() {
        let reordered = apply_order(ranking(), &[4, 99, 2, 4]);
        assert_eq!(ids(&reordered), vec![4, 2, 1, 3, 5]);
    }

    #[test]
    fn test_prompt_is_compact_and_bounded() {
        let bikes: Vec<ScoredBike> = (1..=30).map(|id| scored(id, id as f64)).collect();
        let prompt = build_prompt(&bikes, &Profile::neutral(None, Some("s".to_string())), 20).unwrap();
        assert!(prompt.starts_with(r#"Return JSON only: {"ids":[...]}"#));
        assert!(prompt.contains(r#""id":20,"#));
        assert!(!prompt.contains(r#""id":21,"#));
        assert!(prompt.contains(r#""budgetCluster":"unknown""#));
    }

    #[tokio::test]
    async fn test_rerank_applies_model_order() {
        let profile = Profile::neutral(None, Some("s".to_string()));
        let out = reranker(Behavior::Reply(r#"{"ids":[3,5]}"#)).maybe_rerank(ranking(), &profile).await;
        assert_eq!(ids(&out), vec![3, 5, 1, 2, 4]);
    }

    #[tokio::test]
    async fn test_failures_keep_input_order() {
        let profile = Profile::neutral(None, Some("s".to_string()));
        for behavior in [Behavior::Fail, Behavior::Hang, Behavior::Reply("I cannot help"), Behavior::Reply(r#"{"ids":[]}"#)] {
            let out = reranker(behavior).maybe_rerank(ranking(), &profile).await;
            assert_eq!(ids(&out), vec![1, 2, 3, 4, 5]);
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let profile = Profile::neutral(None, Some("s".to_string()));
        let err = reranker(Behavior::Hang).ranked_ids(&ranking(), &profile).await.unwrap_err();
        assert!(matches!(err, RerankError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_disabled_reranker_is_passthrough() {
        let profile = Profile::neutral(None, Some("s".to_string()));
        let disabled = LlmReranker::new(
            Some(Arc::new(MockGenerator(Behavior::Reply(r#"{"ids":[5]}"#)))),
            RerankConfig::default(),
        );
        assert!(!disabled.is_active());
        assert_eq!(ids(&disabled.maybe_rerank(ranking(), &profile).await), vec![1, 2, 3, 4, 5]);
        assert_eq!(ids(&LlmReranker::disabled().maybe_rerank(ranking(), &profile).await), vec![1, 2, 3, 4, 5]);
    }
}
