//! Behavior profiles and the materialized feature store.
//!
//! A profile is rebuilt from the person's most recent interactions: each one
//! contributes its event weight, decayed by age, to discipline, brand and
//! category affinities and to a weighted average price. Storefront searches
//! feed the same affinities through their brand, category and price filters.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use store::{
    EventType, FeatureStore, IdentityRepository, PersonInteraction, Profile, ProfileRepository, SearchEvent, UserId,
};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::identity::IdentityResolver;

/// Profile weight of one interaction, before recency decay
pub fn profile_weight(event_type: &EventType) -> f64 {
    match event_type {
        EventType::Impression => 0.6,
        EventType::Hover => 0.4,
        EventType::GallerySwipe => 0.8,
        EventType::ScrollStop => 0.3,
        EventType::Dwell => 1.0,
        EventType::DetailOpen | EventType::ProductView => 1.6,
        EventType::Share => 1.4,
        EventType::Favorite => 2.4,
        EventType::AddToCart => 3.2,
        EventType::CheckoutStart => 3.6,
        EventType::BookingStart => 3.8,
        EventType::CheckoutSubmitSuccess => 4.5,
        EventType::BookingSuccess => 5.0,
        EventType::Order => 6.0,
        _ => 0.0,
    }
}

/// Purchase-intent contribution of one event; deeper funnel stages weigh more
pub fn intent_weight(event_type: &EventType) -> f64 {
    match event_type {
        EventType::PageView => 0.1,
        EventType::Impression => 0.2,
        EventType::CatalogView => 0.3,
        EventType::FirstClick => 0.5,
        EventType::DetailOpen | EventType::ProductView => 1.5,
        EventType::Favorite => 2.0,
        EventType::AddToCart => 4.0,
        EventType::CheckoutStart | EventType::BookingStart => 5.0,
        EventType::CheckoutSubmitSuccess | EventType::BookingSuccess => 7.0,
        EventType::Order => 10.0,
        _ => 0.0,
    }
}

const BRAND_FACTOR: f64 = 0.8;
const MIN_RECENCY: f64 = 0.05;
/// Profile weight of one search, before recency decay
const SEARCH_WEIGHT: f64 = 1.2;
const SEARCH_INTENT: f64 = 0.3;

/// One price band of the budget clustering
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetBand {
    pub label: String,
    /// Exclusive upper bound; `None` for the open-ended top band
    pub upper: Option<f64>,
}

impl BudgetBand {
    pub fn new(label: impl Into<String>, upper: Option<f64>) -> Self {
        Self {
            label: label.into(),
            upper,
        }
    }
}

/// Map a price onto its band label. Bands must be sorted by upper bound.
pub fn budget_cluster(price: f64, bands: &[BudgetBand]) -> &str {
    if !price.is_finite() || price <= 0.0 {
        return FeatureStore::UNKNOWN_CLUSTER;
    }
    bands
        .iter()
        .find(|band| band.upper.is_none_or(|upper| price < upper))
        .map(|band| band.label.as_str())
        .unwrap_or(FeatureStore::UNKNOWN_CLUSTER)
}

#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// Most recent interactions considered per person
    pub max_interactions: usize,
    pub half_life_hours: f64,
    pub budget_bands: Vec<BudgetBand>,
    /// Entries kept per embedding
    pub embedding_top_n: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            max_interactions: 500,
            half_life_hours: 168.0,
            budget_bands: vec![
                BudgetBand::new("budget", Some(1500.0)),
                BudgetBand::new("mid", Some(2600.0)),
                BudgetBand::new("high", Some(4200.0)),
                BudgetBand::new("premium", None),
            ],
            embedding_top_n: 12,
        }
    }
}

impl ProfileConfig {
    pub fn with_max_interactions(mut self, max: usize) -> Self {
        self.max_interactions = max;
        self
    }

    pub fn with_half_life_hours(mut self, hours: f64) -> Self {
        self.half_life_hours = hours;
        self
    }

    pub fn with_budget_bands(mut self, bands: Vec<BudgetBand>) -> Self {
        self.budget_bands = bands;
        self
    }
}

/// Who a profile is requested for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileQuery {
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn label(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Keep the `top_n` strongest entries, scaled so the strongest is 1.0
pub fn normalize_embedding(raw: &BTreeMap<String, f64>, top_n: usize) -> BTreeMap<String, f64> {
    let mut entries: Vec<(&String, f64)> = raw
        .iter()
        .map(|(key, weight)| (key, *weight))
        .filter(|(_, weight)| *weight > 0.0)
        .collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    entries.truncate(top_n);

    let max = entries.first().map(|(_, weight)| *weight).unwrap_or(0.0);
    if max <= 0.0 {
        return BTreeMap::new();
    }
    entries
        .into_iter()
        .map(|(key, weight)| (key.clone(), round(weight / max, 4)))
        .collect()
}

/// Price a search points at: the middle of its range, or its one bound
pub fn search_price(search: &SearchEvent) -> Option<f64> {
    let valid = |price: Option<f64>| price.filter(|p| p.is_finite() && *p > 0.0);
    match (valid(search.min_price), valid(search.max_price)) {
        (Some(min), Some(max)) => Some((min + max) / 2.0),
        (Some(bound), None) | (None, Some(bound)) => Some(bound),
        (None, None) => None,
    }
}

/// Aggregate interactions (newest first) into a profile.
///
/// Pure function; `now` anchors the recency decay.
pub fn build_profile(
    person_key: Option<String>,
    interactions: &[PersonInteraction],
    now: DateTime<Utc>,
    config: &ProfileConfig,
) -> Profile {
    build_profile_with_searches(person_key, interactions, &[], now, config)
}

/// [`build_profile`] with the person's searches folded in
pub fn build_profile_with_searches(
    person_key: Option<String>,
    interactions: &[PersonInteraction],
    searches: &[SearchEvent],
    now: DateTime<Utc>,
    config: &ProfileConfig,
) -> Profile {
    let mut disciplines: BTreeMap<String, f64> = BTreeMap::new();
    let mut brands: BTreeMap<String, f64> = BTreeMap::new();
    let mut categories: BTreeMap<String, f64> = BTreeMap::new();
    let mut price_sum = 0.0;
    let mut price_weight = 0.0;
    let mut intent_score = 0.0;
    let mut last_event_at: Option<DateTime<Utc>> = None;

    let decay = |at: DateTime<Utc>| -> f64 {
        let age_hours = (now - at).num_milliseconds().max(0) as f64 / 3_600_000.0;
        0.5f64.powf(age_hours / config.half_life_hours.max(1.0))
    };

    for interaction in interactions.iter().take(config.max_interactions) {
        last_event_at = Some(last_event_at.map_or(interaction.created_at, |seen| seen.max(interaction.created_at)));
        intent_score += intent_weight(&interaction.event_type);

        let base = profile_weight(&interaction.event_type);
        let Some(bike) = interaction.bike.as_ref() else {
            continue;
        };
        if base <= 0.0 {
            continue;
        }
        let weight = base * decay(interaction.created_at);

        let discipline = label(bike.discipline.as_deref()).or_else(|| label(bike.category.as_deref()));
        if let Some(discipline) = discipline {
            *disciplines.entry(discipline.to_lowercase()).or_insert(0.0) += weight;
        }
        if let Some(brand) = label(Some(bike.brand.as_str())) {
            *brands.entry(brand).or_insert(0.0) += weight * BRAND_FACTOR;
        }
        if let Some(category) = label(bike.category.as_deref()) {
            *categories.entry(category.to_lowercase()).or_insert(0.0) += weight;
        }
        if let Some(price) = bike.price.filter(|p| p.is_finite() && *p > 0.0) {
            price_sum += price * weight;
            price_weight += weight;
        }
    }

    for search in searches.iter().take(config.max_interactions) {
        last_event_at = Some(last_event_at.map_or(search.created_at, |seen| seen.max(search.created_at)));
        intent_score += SEARCH_INTENT;
        let weight = SEARCH_WEIGHT * decay(search.created_at);

        if let Some(brand) = label(search.brand.as_deref()) {
            *brands.entry(brand).or_insert(0.0) += weight * BRAND_FACTOR;
        }
        // Storefront category filters name either a discipline or a category
        if let Some(category) = label(search.category.as_deref()) {
            let key = category.to_lowercase();
            *disciplines.entry(key.clone()).or_insert(0.0) += weight;
            *categories.entry(key).or_insert(0.0) += weight;
        }
        if let Some(price) = search_price(search) {
            price_sum += price * weight;
            price_weight += weight;
        }
    }

    let weighted_average_price = if price_weight > 0.0 { round(price_sum / price_weight, 2) } else { 0.0 };
    let recency_decay = last_event_at.map_or(1.0, |at| round(decay(at).max(MIN_RECENCY), 4));
    let intent_score = round(intent_score, 3);

    let feature_store = FeatureStore {
        person_key: person_key.clone(),
        discipline_embedding: normalize_embedding(&disciplines, config.embedding_top_n),
        brand_embedding: normalize_embedding(&brands, config.embedding_top_n),
        category_embedding: normalize_embedding(&categories, config.embedding_top_n),
        weighted_average_price,
        budget_cluster: budget_cluster(weighted_average_price, &config.budget_bands).to_string(),
        intent_score,
        recency_decay,
        recency_half_life_hours: config.half_life_hours,
        last_event_at,
        updated_at: now,
    };

    Profile {
        person_key,
        user_id: None,
        session_id: None,
        disciplines,
        brands,
        categories,
        price_sum: round(price_sum, 2),
        price_weight: round(price_weight, 4),
        weighted_average_price,
        intent_score,
        interaction_count: interactions.len().min(config.max_interactions),
        last_event_at,
        feature_store,
    }
}

/// Builds profiles from stored interactions and keeps the feature store fresh
#[derive(Clone)]
pub struct ProfileService {
    identity: IdentityResolver,
    interactions: Arc<dyn IdentityRepository>,
    features: Arc<dyn ProfileRepository>,
    config: ProfileConfig,
}

impl ProfileService {
    pub fn new(interactions: Arc<dyn IdentityRepository>, features: Arc<dyn ProfileRepository>) -> Self {
        Self {
            identity: IdentityResolver::new(interactions.clone()),
            interactions,
            features,
            config: ProfileConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProfileConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }

    /// Resolve the subject to its person keys and build a fresh profile.
    ///
    /// Unknown subjects get [`Profile::neutral`].
    #[instrument(skip(self), fields(user_id = ?query.user_id, session_id = ?query.session_id))]
    pub fn get_profile(&self, query: &ProfileQuery) -> Result<Profile> {
        let keys = self
            .identity
            .person_keys_for(query.user_id, query.session_id.as_deref())?;
        let Some(primary) = keys.first().cloned() else {
            debug!("no identity nodes, returning neutral profile");
            return Ok(Profile::neutral(query.user_id, query.session_id.clone()));
        };

        let mut profile = self.build_for_keys(primary, &keys)?;
        if profile.last_event_at.is_some() {
            self.persist_if_changed(&profile.feature_store)?;
        }
        profile.user_id = query.user_id;
        profile.session_id = query.session_id.clone();
        Ok(profile)
    }

    /// Recompute and persist the features of one person
    pub fn refresh_person(&self, person_key: &str) -> Result<FeatureStore> {
        let keys = vec![person_key.to_string()];
        let profile = self.build_for_keys(person_key.to_string(), &keys)?;
        if profile.last_event_at.is_some() {
            self.features.save_features(&profile.feature_store)?;
        }
        Ok(profile.feature_store)
    }

    /// Write features unless the stored row already holds the same values.
    ///
    /// Returns whether a write happened.
    pub fn persist_if_changed(&self, features: &FeatureStore) -> Result<bool> {
        let Some(person_key) = features.person_key.as_deref() else {
            return Ok(false);
        };
        let unchanged = self.features.load_features(person_key)?.is_some_and(|mut stored| {
            stored.updated_at = features.updated_at;
            stored == *features
        });
        if unchanged {
            return Ok(false);
        }
        self.features.save_features(features)?;
        Ok(true)
    }

    fn build_for_keys(&self, primary: String, keys: &[String]) -> Result<Profile> {
        let interactions = self
            .interactions
            .interactions_for_persons(keys, self.config.max_interactions)?;
        let searches = self.interactions.searches_for_persons(keys, self.config.max_interactions)?;
        if interactions.is_empty() && searches.is_empty() {
            let mut neutral = Profile::neutral(None, None);
            neutral.person_key = Some(primary.clone());
            neutral.feature_store.person_key = Some(primary);
            return Ok(neutral);
        }

        let profile = build_profile_with_searches(Some(primary), &interactions, &searches, Utc::now(), &self.config);
        debug!(
            interactions = profile.interaction_count,
            cluster = %profile.feature_store.budget_cluster,
            "profile rebuilt"
        );
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IngestContext;
    use crate::ingest::IngestPipeline;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use store::{BikeSnapshot, SqliteStore};

    /// Feature repository that counts writes
    struct CountingFeatures {
        inner: Arc<SqliteStore>,
        saves: AtomicUsize,
    }

    impl ProfileRepository for CountingFeatures {
        fn load_features(&self, person_key: &str) -> store::Result<Option<FeatureStore>> {
            self.inner.load_features(person_key)
        }

        fn save_features(&self, features: &FeatureStore) -> store::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save_features(features)
        }
    }

    fn road_trek(event_type: EventType, at: DateTime<Utc>) -> PersonInteraction {
        PersonInteraction {
            event_type,
            created_at: at,
            bike: Some(BikeSnapshot {
                id: 1,
                brand: "Trek".to_string(),
                discipline: Some("Road".to_string()),
                category: Some("road".to_string()),
                price: Some(2000.0),
            }),
        }
    }

    #[test]
    fn test_budget_cluster_bands() {
        let bands = ProfileConfig::default().budget_bands;
        assert_eq!(budget_cluster(0.0, &bands), "unknown");
        assert_eq!(budget_cluster(-3.0, &bands), "unknown");
        assert_eq!(budget_cluster(900.0, &bands), "budget");
        assert_eq!(budget_cluster(1500.0, &bands), "mid");
        assert_eq!(budget_cluster(2599.0, &bands), "mid");
        assert_eq!(budget_cluster(4199.0, &bands), "high");
        assert_eq!(budget_cluster(9000.0, &bands), "premium");
    }

    #[test]
    fn test_affinities_increase_with_each_interaction() {
        let now = Utc::now();
        let config = ProfileConfig::default();
        let mut interactions = Vec::new();
        let mut previous = build_profile(None, &interactions, now, &config);

        for event_type in [EventType::Impression, EventType::DetailOpen, EventType::AddToCart, EventType::Order] {
            interactions.insert(0, road_trek(event_type, now));
            let next = build_profile(None, &interactions, now, &config);
            assert!(next.disciplines.get("road").copied().unwrap_or(0.0) > previous.disciplines.get("road").copied().unwrap_or(0.0));
            assert!(next.brands.get("Trek").copied().unwrap_or(0.0) > previous.brands.get("Trek").copied().unwrap_or(0.0));
            assert!(next.intent_score > previous.intent_score);
            previous = next;
        }
        assert_eq!(previous.weighted_average_price, 2000.0);
        assert_eq!(previous.feature_store.budget_cluster, "mid");
        assert_eq!(previous.feature_store.discipline_embedding.get("road"), Some(&1.0));
    }

    #[test]
    fn test_intent_rises_with_funnel_depth() {
        let stages = [
            EventType::PageView,
            EventType::DetailOpen,
            EventType::AddToCart,
            EventType::CheckoutStart,
            EventType::CheckoutSubmitSuccess,
            EventType::Order,
        ];
        for pair in stages.windows(2) {
            assert!(intent_weight(&pair[1]) > intent_weight(&pair[0]));
        }
    }

    #[test]
    fn test_old_interactions_decay() {
        let now = Utc::now();
        let config = ProfileConfig::default();
        let fresh = build_profile(None, &[road_trek(EventType::DetailOpen, now)], now, &config);
        let stale = build_profile(None, &[road_trek(EventType::DetailOpen, now - Duration::hours(168))], now, &config);

        assert!((fresh.disciplines["road"] - 1.6).abs() < 1e-9);
        assert!((stale.disciplines["road"] - 0.8).abs() < 1e-6);
        assert_eq!(fresh.feature_store.recency_decay, 1.0);
        assert_eq!(stale.feature_store.recency_decay, 0.5);
    }

    #[test]
    fn test_empty_profile_is_neutral() {
        let profile = build_profile(None, &[], Utc::now(), &ProfileConfig::default());
        assert_eq!(profile.feature_store.recency_decay, 1.0);
        assert_eq!(profile.feature_store.budget_cluster, "unknown");
        assert_eq!(profile.weighted_average_price, 0.0);
    }

    #[test]
    fn test_embedding_keeps_top_n() {
        let raw: BTreeMap<String, f64> = (0..20).map(|i| (format!("d{i:02}"), i as f64 + 1.0)).collect();
        let normalized = normalize_embedding(&raw, 12);
        assert_eq!(normalized.len(), 12);
        assert_eq!(normalized.get("d19"), Some(&1.0));
        assert!(!normalized.contains_key("d00"));
    }

    #[test]
    fn test_searches_feed_affinities_and_price() {
        let now = Utc::now();
        let search = SearchEvent {
            session_id: Some("s".to_string()),
            user_id: None,
            person_key: None,
            query: Some("gravel".to_string()),
            category: Some("Gravel".to_string()),
            brand: Some("Canyon".to_string()),
            min_price: Some(1000.0),
            max_price: Some(2000.0),
            created_at: now,
        };
        let profile = build_profile_with_searches(None, &[], &[search], now, &ProfileConfig::default());

        assert!((profile.brands["Canyon"] - 0.96).abs() < 1e-9);
        assert!((profile.disciplines["gravel"] - 1.2).abs() < 1e-9);
        assert_eq!(profile.weighted_average_price, 1500.0);
        assert_eq!(profile.feature_store.budget_cluster, "mid");
        assert_eq!(profile.intent_score, 0.3);
        assert_eq!(profile.interaction_count, 0);
        assert_eq!(profile.last_event_at, Some(now));
    }

    #[test]
    fn test_search_price_uses_range_middle_or_bound() {
        let mut search = SearchEvent {
            session_id: None,
            user_id: None,
            person_key: None,
            query: None,
            category: None,
            brand: Some("Trek".to_string()),
            min_price: Some(1000.0),
            max_price: Some(3000.0),
            created_at: Utc::now(),
        };
        assert_eq!(search_price(&search), Some(2000.0));
        search.min_price = None;
        assert_eq!(search_price(&search), Some(3000.0));
        search.max_price = Some(f64::NAN);
        assert_eq!(search_price(&search), None);
    }

    #[test]
    fn test_profile_reads_do_not_rewrite_unchanged_features() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let counting = Arc::new(CountingFeatures {
            inner: store.clone(),
            saves: AtomicUsize::new(0),
        });
        let profiles = ProfileService::new(store.clone(), counting.clone());
        let pipeline = IngestPipeline::new(store.clone(), IdentityResolver::new(store.clone()), profiles.clone());

        let report = pipeline.ingest_json(
            vec![json!({"type": "page_view", "eventId": "p1"})],
            &IngestContext::for_session("sess-read"),
        );
        assert_eq!(report.accepted, 1);
        assert_eq!(counting.saves.load(Ordering::SeqCst), 1);

        let query = ProfileQuery {
            user_id: None,
            session_id: Some("sess-read".to_string()),
        };
        for _ in 0..3 {
            let profile = profiles.get_profile(&query).unwrap();
            assert_eq!(profile.interaction_count, 1);
        }
        assert_eq!(counting.saves.load(Ordering::SeqCst), 1);

        let mut changed = store.load_features("session:sess-read").unwrap().unwrap();
        changed.intent_score += 1.0;
        assert!(profiles.persist_if_changed(&changed).unwrap());
        assert!(!profiles.persist_if_changed(&changed).unwrap());
        assert_eq!(counting.saves.load(Ordering::SeqCst), 2);
    }
}
