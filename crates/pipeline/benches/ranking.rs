//! Benchmarks for scoring and diversification
//!
//! Run with: cargo bench --package pipeline

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use experiments::SeededRandom;
use pipeline::{diversify_ranking, BikeScorer};
use sources::{Candidate, RetrievalJob};
use std::collections::BTreeMap;
use std::sync::Arc;
use store::{BikeBehaviorMetrics, CatalogBike, Profile};

fn pool(size: i64) -> Vec<Candidate> {
    let brands = ["Trek", "Canyon", "Specialized", "Cube", "Giant", "Orbea"];
    let disciplines = ["road", "mtb", "gravel", "city", "e-bike"];
    (1..=size)
        .map(|id| {
            let i = id as usize;
            let mut behavior = BikeBehaviorMetrics::empty(id);
            behavior.detail_clicks = (id % 13) as u64;
            behavior.add_to_cart = (id % 5) as u64;
            let bike = CatalogBike {
                id,
                name: format!("Bike {id}"),
                brand: brands[i % brands.len()].to_string(),
                model: None,
                discipline: Some(disciplines[i % disciplines.len()].to_string()),
                category: None,
                price: 400.0 + (id % 90) as f64 * 60.0,
                rank: (id % 17) as f64 / 4.0,
                main_image: None,
                images: Vec::new(),
                behavior,
            };
            Candidate::new(bike, RetrievalJob::TopRank)
        })
        .collect()
}

fn profile() -> Profile {
    let mut profile = Profile::neutral(Some(1), None);
    let features = &mut profile.feature_store;
    features.discipline_embedding.insert("road".to_string(), 1.0);
    features.brand_embedding.insert("Trek".to_string(), 1.0);
    features.weighted_average_price = 2200.0;
    features.budget_cluster = "mid".to_string();
    features.recency_decay = 0.8;
    profile
}

fn bench_score_candidates(c: &mut Criterion) {
    let scorer = BikeScorer::new(Arc::new(SeededRandom::new(3)));
    let profile = profile();
    let candidates = pool(420);
    let explore: BTreeMap<String, String> =
        [("recommendation_strategy".to_string(), "explore".to_string())].into_iter().collect();

    c.bench_function("score_candidates_420", |b| {
        b.iter(|| {
            let scored = scorer.score_candidates(black_box(candidates.clone()), &profile, &explore);
            black_box(scored)
        })
    });
}

fn bench_diversify(c: &mut Criterion) {
    let scorer = BikeScorer::new(Arc::new(SeededRandom::new(3)));
    let scored = scorer.score_candidates(pool(420), &profile(), &BTreeMap::new());

    c.bench_function("diversify_ranking_420", |b| {
        b.iter(|| {
            let ranked = diversify_ranking(black_box(scored.clone()));
            black_box(ranked)
        })
    });
}

criterion_group!(benches, bench_score_candidates, bench_diversify);
criterion_main!(benches);
