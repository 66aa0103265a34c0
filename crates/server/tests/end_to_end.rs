//! End-to-end tests over the wired platform.
//!
//! Events go in through ingestion, come back out as profile features, and
//! drive assignments, bandit weights and the recommendation page.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use experiments::{AllocationReason, BanditOptions, ExperimentConfig, GoalInput, SeededRandom, Subject};
use metrics::{IngestContext, ProfileQuery, SearchInput};
use server::{demo_catalog, seed_demo, Platform, PlatformConfig, RecommendationRequest, RequestContext};
use store::{CatalogRepository, SqliteStore};

fn catalog_only_platform() -> Platform {
    let store = SqliteStore::in_memory().unwrap();
    for bike in demo_catalog() {
        store.upsert_bike(&bike, true).unwrap();
    }
    Platform::new(Arc::new(store), Arc::new(SeededRandom::new(11)), PlatformConfig::default()).unwrap()
}

fn seeded_platform(config: PlatformConfig) -> Platform {
    let store = SqliteStore::in_memory().unwrap();
    seed_demo(&store).unwrap();
    Platform::new(Arc::new(store), Arc::new(SeededRandom::new(11)), config).unwrap()
}

async fn browse_trek_road(platform: &Platform, session_id: &str) {
    let events = vec![
        json!({"type": "impression", "bikeId": 1, "eventId": "e1"}),
        json!({"type": "click", "bikeId": 1, "eventId": "e2"}),
        json!({"type": "click", "bikeId": 2, "eventId": "e3"}),
        json!({"type": "favorite", "bikeId": 1, "eventId": "e4"}),
        json!({"type": "cart_add", "bikeId": 2, "eventId": "e5"}),
        json!({"type": "not a real event", "bikeId": "x"}),
    ];
    let report = platform
        .ingest(events, IngestContext::for_session(session_id).with_source("storefront"))
        .await
        .unwrap();
    assert_eq!(report.accepted, 5);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.funnel_contract.map(|c| c.violations_total), Some(0));
}

#[tokio::test]
async fn test_session_events_personalize_recommendations() {
    let platform = catalog_only_platform();
    browse_trek_road(&platform, "sess-trek").await;

    let response = platform
        .recommend(RecommendationRequest::page(6, 0), RequestContext::session("sess-trek"))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.bikes.len(), 6);
    assert_eq!(response.bikes[0].brand, "Trek");
    assert_eq!(response.bikes[0].discipline.as_deref(), Some("road"));
    assert_eq!(response.retrieval.top_brands, vec!["Trek".to_string()]);
    assert_eq!(response.retrieval.top_disciplines, vec!["road".to_string()]);
    assert_eq!(response.retrieval.strategy, "control");
    assert_eq!(response.profile_used.session_id.as_deref(), Some("sess-trek"));
    assert!(response.profile_used.intent_score > 0.0);
}

#[tokio::test]
async fn test_search_filters_personalize_recommendations() {
    let platform = catalog_only_platform();
    let report = platform
        .track_search(
            SearchInput {
                query: Some("gravel race".to_string()),
                category: Some("gravel".to_string()),
                brand: Some("Canyon".to_string()),
                ..SearchInput::default()
            },
            IngestContext::for_session("sess-search"),
        )
        .await
        .unwrap();
    assert!(report.accepted);

    let response = platform
        .recommend(RecommendationRequest::page(4, 0), RequestContext::session("sess-search"))
        .await
        .unwrap();

    assert_eq!(response.bikes[0].name, "Canyon Grail CF SL");
    assert_eq!(response.retrieval.top_brands, vec!["Canyon".to_string()]);
    assert!(response.retrieval.top_disciplines.contains(&"gravel".to_string()));
}

#[tokio::test]
async fn test_unknown_visitor_gets_catalog_rank_order() {
    let platform = catalog_only_platform();

    let response = platform
        .recommend(RecommendationRequest::page(3, 0), RequestContext::session("fresh"))
        .await
        .unwrap();

    // Specialized Tarmac SL7 has the highest catalog rank (4.8)
    let names: Vec<&str> = response.bikes.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names[0], "Specialized Tarmac SL7");
    assert_eq!(response.retrieval.budget_cluster, "unknown");
    assert!(response.profile_used.person_key.is_none());
}

#[tokio::test]
async fn test_logged_in_user_keeps_session_history() {
    let platform = catalog_only_platform();
    browse_trek_road(&platform, "sess-login").await;
    platform
        .ingest(
            vec![json!({"type": "page_view", "eventId": "login"})],
            IngestContext::for_session("sess-login").with_user(501),
        )
        .await
        .unwrap();

    let profile = platform
        .profile(ProfileQuery {
            user_id: Some(501),
            session_id: None,
        })
        .await
        .unwrap();

    assert!(profile.interaction_count >= 5);
    assert!(profile.feature_store.brand_embedding.contains_key("Trek"));
}

#[tokio::test]
async fn test_assignments_are_sticky_across_requests() {
    let platform = seeded_platform(PlatformConfig::default());
    let ctx = RequestContext::session("sticky");

    let first = platform
        .recommend(RecommendationRequest::default(), ctx.clone())
        .await
        .unwrap();
    let second = platform.recommend(RecommendationRequest::default(), ctx).await.unwrap();
    let direct = platform
        .assignments(Subject {
            user_id: None,
            session_id: Some("sticky".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(first.experiments.len(), 2);
    assert_eq!(first.experiments, second.experiments);
    assert_eq!(first.experiments, direct);
    assert_eq!(
        first.retrieval.strategy,
        first.experiments["recommendation_strategy"]
    );
}

#[tokio::test]
async fn test_goals_feed_bandit_weights() {
    let config = PlatformConfig {
        experiment: ExperimentConfig::default()
            .with_bandit_options(BanditOptions::default().with_min_observations(20)),
        ..PlatformConfig::default()
    };
    let platform = seeded_platform(config);

    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for i in 0..20 {
        let session_id = format!("visitor-{i}");
        let assignments = platform
            .assignments(Subject {
                user_id: None,
                session_id: Some(session_id.clone()),
            })
            .await
            .unwrap();
        let variant = assignments["checkout_cta"].clone();
        *seen.entry(variant.clone()).or_default() += 1;
        platform
            .track_goal(GoalInput {
                experiment_key: "checkout_cta".to_string(),
                variant: Some(variant),
                metric_name: "add_to_cart".to_string(),
                session_id: Some(session_id),
                ..GoalInput::default()
            })
            .await
            .unwrap();
    }

    let allocation = platform.bandit_weights("checkout_cta".to_string()).await.unwrap();
    assert_eq!(allocation.reason, AllocationReason::ThompsonSampling);
    assert_eq!(allocation.total_assignments, 20);
    assert_eq!(allocation.weights.total(), 100);
    assert!(allocation.weights.get("control") >= 22);
    assert_eq!(allocation.diagnostics.len(), 2);
    assert_eq!(seen.values().sum::<usize>(), 20);
}

#[tokio::test]
async fn test_goal_and_weight_errors() {
    let platform = seeded_platform(PlatformConfig::default());

    let missing_metric = platform
        .track_goal(GoalInput {
            experiment_key: "checkout_cta".to_string(),
            ..GoalInput::default()
        })
        .await;
    assert!(missing_metric.is_err());

    assert!(platform.bandit_weights("no_such_experiment".to_string()).await.is_err());
}

#[tokio::test]
async fn test_inactive_bikes_are_never_recommended() {
    let platform = catalog_only_platform();
    let mut retired = demo_catalog().remove(0);
    retired.rank = 99.0;
    platform.store().upsert_bike(&retired, false).unwrap();

    let response = platform
        .recommend(RecommendationRequest::page(60, 0), RequestContext::session("any"))
        .await
        .unwrap();

    assert_eq!(response.bikes.len(), demo_catalog().len() - 1);
    assert!(response.bikes.iter().all(|b| b.id != retired.id));
}
