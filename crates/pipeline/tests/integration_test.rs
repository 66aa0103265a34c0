//! Integration tests for the ranking pipeline.
//!
//! These tests run retrieval, scoring and diversification together over an
//! in-memory catalog.

use experiments::SeededRandom;
use pipeline::{diversify_ranking, BikeScorer, LlmReranker};
use sources::CandidatePoolBuilder;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use store::{BikeBehaviorMetrics, BikeId, CatalogBike, CatalogRepository, Profile, SqliteStore};

fn bike(id: BikeId, brand: &str, discipline: &str, price: f64, rank: f64) -> CatalogBike {
    CatalogBike {
        id,
        name: format!("{brand} {discipline} {id}"),
        brand: brand.to_string(),
        model: None,
        discipline: Some(discipline.to_string()),
        category: None,
        price,
        rank,
        main_image: None,
        images: Vec::new(),
        behavior: BikeBehaviorMetrics::empty(id),
    }
}

fn create_test_catalog() -> Arc<SqliteStore> {
    let store = SqliteStore::in_memory().unwrap();
    let bikes = vec![
        bike(1, "Trek", "road", 2100.0, 3.0),
        bike(2, "Trek", "road", 2300.0, 3.0),
        bike(3, "Trek", "road", 2500.0, 3.0),
        bike(4, "Canyon", "mtb", 2000.0, 3.5),
        bike(5, "Cube", "city", 800.0, 4.0),
        bike(6, "Specialized", "gravel", 3900.0, 2.0),
        bike(7, "Orbea", "road", 2200.0, 2.5),
    ];
    for b in &bikes {
        store.upsert_bike(b, true).unwrap();
    }
    // Inactive listings never reach the pool
    store.upsert_bike(&bike(8, "Trek", "road", 2000.0, 5.0), false).unwrap();
    Arc::new(store)
}

fn road_trek_profile() -> Profile {
    let mut profile = Profile::neutral(Some(7), None);
    let features = &mut profile.feature_store;
    features.discipline_embedding.insert("road".to_string(), 1.0);
    features.brand_embedding.insert("Trek".to_string(), 1.0);
    features.weighted_average_price = 2200.0;
    features.budget_cluster = "mid".to_string();
    profile
}

#[tokio::test]
async fn test_full_ranking_prefers_profile_matches() {
    let catalog = create_test_catalog();
    let rng = Arc::new(SeededRandom::new(1));
    let profile = road_trek_profile();
    let assignments = BTreeMap::new();

    let pool = CandidatePoolBuilder::new(catalog, rng.clone())
        .build_candidate_pool(&profile, &assignments)
        .unwrap();
    assert_eq!(pool.len(), 7);

    let scored = BikeScorer::new(rng).score_candidates(pool, &profile, &assignments);
    let ranked = LlmReranker::disabled()
        .maybe_rerank(diversify_ranking(scored), &profile)
        .await;

    let ids: Vec<BikeId> = ranked.iter().map(|b| b.bike.id).collect();
    assert_eq!(ranked[0].bike.brand, "Trek");
    assert!(!ids.contains(&8));
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
}

#[test]
fn test_weak_profile_falls_back_to_catalog_rank() {
    let catalog = create_test_catalog();
    let rng = Arc::new(SeededRandom::new(1));
    let mut profile = road_trek_profile();
    profile.feature_store.discipline_embedding.insert("road".to_string(), 0.01);
    profile.feature_store.brand_embedding.insert("Trek".to_string(), 0.01);
    profile.feature_store.weighted_average_price = 0.0;
    profile.feature_store.budget_cluster = "unknown".to_string();

    let pool = CandidatePoolBuilder::new(catalog.clone(), rng.clone())
        .build_candidate_pool(&profile, &BTreeMap::new())
        .unwrap();
    let scored = BikeScorer::new(rng).score_candidates(pool, &profile, &BTreeMap::new());
    let ranked = diversify_ranking(scored);

    assert_eq!(ranked.len(), 7);
    assert_eq!(ranked[0].bike.id, 5);
    assert_eq!(ranked[1].bike.id, 4);
    // The inactive listing is still readable directly
    assert_eq!(catalog.bike(8).unwrap().map(|b| b.id), Some(8));
}
