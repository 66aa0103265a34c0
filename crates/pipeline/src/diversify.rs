//! Diversification of a scored ranking.
//!
//! ## Algorithm
//! 1. Sort by score, highest first
//! 2. Walk the sorted list; each bike loses `brand × repeats_of_its_brand +
//!    discipline × repeats_of_its_discipline` counted over the bikes placed before it
//! 3. Stable sort by the penalized score
//!
//! The result is a permutation of the input; scores are left untouched.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::scoring::ScoredBike;

/// Penalty per earlier bike sharing a brand or discipline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiversityPenalty {
    pub brand: f64,
    pub discipline: f64,
}

impl Default for DiversityPenalty {
    fn default() -> Self {
        Self {
            brand: 1.8,
            discipline: 1.2,
        }
    }
}

fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

fn group_key(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Reorder with the default repetition penalty
pub fn diversify_ranking(scored: Vec<ScoredBike>) -> Vec<ScoredBike> {
    diversify_with(scored, DiversityPenalty::default())
}

pub fn diversify_with(mut scored: Vec<ScoredBike>, penalty: DiversityPenalty) -> Vec<ScoredBike> {
    scored.sort_by(|a, b| by_score_desc(a.score, b.score));

    let mut brand_seen: HashMap<String, u32> = HashMap::new();
    let mut discipline_seen: HashMap<String, u32> = HashMap::new();
    let mut adjusted: Vec<(f64, ScoredBike)> = Vec::with_capacity(scored.len());

    for item in scored {
        let brand = group_key(item.bike.brand_label(), "unknown_brand");
        let discipline = group_key(item.bike.discipline_label(), "unknown_discipline");
        let brand_repeat = brand_seen.entry(brand).or_insert(0);
        let discipline_repeat = discipline_seen.entry(discipline).or_insert(0);

        let cost = f64::from(*brand_repeat) * penalty.brand + f64::from(*discipline_repeat) * penalty.discipline;
        *brand_repeat += 1;
        *discipline_repeat += 1;
        adjusted.push((item.score - cost, item));
    }

    adjusted.sort_by(|a, b| by_score_desc(a.0, b.0));
    adjusted.into_iter().map(|(_, item)| item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sources::RetrievalJob;
    use store::{BikeBehaviorMetrics, BikeId, CatalogBike};

    fn scored(id: BikeId, brand: &str, discipline: &str, score: f64) -> ScoredBike {
        ScoredBike {
            bike: CatalogBike {
                id,
                name: format!("{brand} {id}"),
                brand: brand.to_string(),
                model: None,
                discipline: Some(discipline.to_string()),
                category: None,
                price: 1000.0,
                rank: 1.0,
                main_image: None,
                images: Vec::new(),
                behavior: BikeBehaviorMetrics::empty(id),
            },
            source: RetrievalJob::TopRank,
            score,
        }
    }

    fn ids(items: &[ScoredBike]) -> Vec<BikeId> {
        items.iter().map(|item| item.bike.id).collect()
    }

    #[test]
    fn test_repeated_brand_is_pushed_down() {
        let ranking = diversify_ranking(vec![
            scored(2, "Trek", "road", 99.5),
            scored(1, "Trek", "road", 100.0),
            scored(3, "Canyon", "mtb", 99.0),
        ]);
        // Bike 2 pays 1.8 + 1.2 for following bike 1
        assert_eq!(ids(&ranking), vec![1, 3, 2]);
    }

    #[test]
    fn test_clear_winners_keep_their_place() {
        let ranking = diversify_ranking(vec![
            scored(1, "Trek", "road", 300.0),
            scored(2, "Trek", "road", 200.0),
            scored(3, "Canyon", "mtb", 100.0),
        ]);
        assert_eq!(ids(&ranking), vec![1, 2, 3]);
    }

    #[test]
    fn test_grouping_ignores_case_and_whitespace() {
        let ranking = diversify_ranking(vec![
            scored(1, "Trek", "Road", 10.0),
            scored(2, " trek ", "road", 9.9),
            scored(3, "Cube", "city", 8.0),
        ]);
        assert_eq!(ids(&ranking), vec![1, 3, 2]);
    }

    #[test]
    fn test_only_reorders() {
        let brands = ["Trek", "Canyon", "Cube"];
        let disciplines = ["road", "gravel"];
        let input: Vec<ScoredBike> = (1..=60)
            .map(|id| {
                let i = id as usize;
                scored(id, brands[i % 3], disciplines[i % 2], ((id * 37) % 101) as f64 / 3.0)
            })
            .collect();
        let output = diversify_ranking(input.clone());

        assert_eq!(output.len(), input.len());
        let mut before = ids(&input);
        let mut after = ids(&output);
        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after);
        for item in &output {
            let original = input.iter().find(|i| i.bike.id == item.bike.id).unwrap();
            assert_eq!(original.score, item.score);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(diversify_ranking(Vec::new()).is_empty());
    }
}
