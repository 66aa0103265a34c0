//! # Ingestion Pipeline
//!
//! Accepts a batch of raw client events and turns it into durable state:
//! 1. Drop the batch for bots, cap its size
//! 2. Validate and canonicalize every event
//! 3. Resolve the batch's identity tokens to a person key
//! 4. Deduplicate on `(session_id, event_id)` within the batch and the store
//! 5. Persist each event with its bike and session rollups in one transaction
//! 6. Check the stored events against the funnel contracts
//! 7. Refresh the person's feature store
//!
//! Every event is isolated: a malformed event or a failed write is counted
//! and logged, never fatal for the rest of the batch.
//!
//! Storefront searches take a shorter path through [`IngestPipeline::track_search`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use store::{EventMetadata, EventRepository, NormalizedEvent, RecordOutcome, SearchEvent};
use tracing::{debug, info, instrument, warn};

use crate::aggregation::{bike_delta, session_delta};
use crate::contract::{validate_funnel_contract, FunnelContractReport};
use crate::error::Result;
use crate::events::{clean, normalize_event, IngestContext, RawEvent, RejectReason};
use crate::identity::{IdentityResolver, IdentityTokens};
use crate::profile::ProfileService;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Events beyond this many per batch are dropped unprocessed
    pub max_batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { max_batch_size: 200 }
    }
}

impl IngestConfig {
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }
}

/// Outcome counters of one ingestion call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicate_dropped: usize,
    pub rejected: usize,
    /// Not processed at all (bot batch or over the batch cap)
    pub dropped: usize,
    /// Store writes that failed after validation
    pub failed: usize,
    pub bike_updates: usize,
    pub person_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Contract coverage of the stored events; absent when nothing was stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funnel_contract: Option<FunnelContractReport>,
}

/// A storefront search as submitted by the client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchInput {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchReport {
    pub accepted: bool,
    pub person_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn search_price(price: Option<f64>) -> Option<f64> {
    price.filter(|p| p.is_finite() && *p >= 0.0)
}

pub struct IngestPipeline {
    events: Arc<dyn EventRepository>,
    identity: IdentityResolver,
    profiles: ProfileService,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(events: Arc<dyn EventRepository>, identity: IdentityResolver, profiles: ProfileService) -> Self {
        Self {
            events,
            identity,
            profiles,
            config: IngestConfig::default(),
        }
    }

    pub fn with_config(mut self, config: IngestConfig) -> Self {
        self.config = config;
        self
    }

    /// Decode loosely-typed JSON entries one by one, then ingest them.
    ///
    /// An entry that does not decode counts as rejected.
    pub fn ingest_json(&self, values: Vec<serde_json::Value>, ctx: &IngestContext) -> IngestReport {
        let mut undecodable = 0;
        let raw: Vec<RawEvent> = values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<RawEvent>(value) {
                Ok(event) => Some(event),
                Err(err) => {
                    debug!("{}", RejectReason::Undecodable(err.to_string()));
                    undecodable += 1;
                    None
                }
            })
            .collect();

        let mut report = self.ingest_events(raw, ctx);
        report.rejected += undecodable;
        report
    }

    #[instrument(skip(self, raw, ctx), fields(batch = raw.len(), session_id = ?ctx.session_id))]
    pub fn ingest_events(&self, mut raw: Vec<RawEvent>, ctx: &IngestContext) -> IngestReport {
        let mut report = IngestReport::default();

        if ctx.is_bot {
            report.dropped = raw.len();
            report.reason = Some("bot_filtered".to_string());
            info!(dropped = report.dropped, "bot batch dropped");
            return report;
        }

        if raw.len() > self.config.max_batch_size {
            report.dropped = raw.len() - self.config.max_batch_size;
            raw.truncate(self.config.max_batch_size);
            warn!(dropped = report.dropped, "batch over cap, tail dropped");
        }

        let now = Utc::now();
        let mut events: Vec<NormalizedEvent> = Vec::with_capacity(raw.len());
        for event in &raw {
            match normalize_event(event, ctx, now) {
                Ok(normalized) => events.push(normalized),
                Err(reason) => {
                    debug!(%reason, raw_type = %event.event_type, "event rejected");
                    report.rejected += 1;
                }
            }
        }
        if events.is_empty() {
            return report;
        }

        let mut tokens = IdentityTokens::extract(ctx, events.iter().map(|e| &e.metadata));
        if tokens.session_id.is_none() {
            tokens.session_id = events.first().map(|e| e.session_id.clone());
        }
        if tokens.user_id.is_none() {
            tokens.user_id = events.iter().find_map(|e| e.user_id);
        }
        let person_key = match self.identity.resolve(&tokens, now) {
            Ok(key) => key,
            Err(err) => {
                warn!("identity resolution failed, continuing without person key: {}", err);
                None
            }
        };
        report.person_key = person_key.clone();

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut stored: Vec<NormalizedEvent> = Vec::new();
        for mut event in events {
            if let Some(event_id) = event.event_id.clone() {
                let key = (event.session_id.clone(), event_id);
                if seen.contains(&key) {
                    report.duplicate_dropped += 1;
                    continue;
                }
                match self.events.event_exists(&key.0, &key.1) {
                    Ok(true) => {
                        report.duplicate_dropped += 1;
                        seen.insert(key);
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => warn!("duplicate lookup failed, relying on unique insert: {}", err),
                }
                seen.insert(key);
            }

            event.person_key = person_key.clone();
            let bike = bike_delta(&event);
            let session = session_delta(&event, &tokens, person_key.as_deref(), ctx.is_bot);

            match self.events.record_event(&event, bike, session.as_ref()) {
                Ok(RecordOutcome::Inserted) => {
                    report.accepted += 1;
                    if bike.is_some() {
                        report.bike_updates += 1;
                    }
                    stored.push(event);
                }
                Ok(RecordOutcome::Duplicate) => report.duplicate_dropped += 1,
                Err(err) => {
                    warn!(event_type = %event.event_type, "event write failed: {}", err);
                    report.failed += 1;
                }
            }
        }

        if !stored.is_empty() {
            let contract = validate_funnel_contract(&stored, ctx);
            if contract.violations_total > 0 {
                warn!(
                    violations = contract.violations_total,
                    by_event = %contract.compact_violations(),
                    "funnel contract violations"
                );
            }
            report.funnel_contract = Some(contract);
        }

        if report.accepted > 0 {
            if let Some(key) = person_key.as_deref() {
                if let Err(err) = self.profiles.refresh_person(key) {
                    warn!(person_key = key, "feature refresh failed: {}", err);
                }
            }
        }

        info!(
            accepted = report.accepted,
            duplicates = report.duplicate_dropped,
            rejected = report.rejected,
            "batch ingested"
        );
        report
    }

    /// Record one storefront search and fold it into the person's profile.
    ///
    /// A search with no query, category or brand is not stored. Store
    /// failures are returned; a failed profile refresh is only logged.
    #[instrument(skip(self, input, ctx), fields(session_id = ?ctx.session_id))]
    pub fn track_search(&self, input: SearchInput, ctx: &IngestContext) -> Result<SearchReport> {
        if ctx.is_bot {
            return Ok(SearchReport {
                reason: Some("bot_filtered".to_string()),
                ..SearchReport::default()
            });
        }

        let query = clean(input.query.as_deref(), 256);
        let category = clean(input.category.as_deref(), 128);
        let brand = clean(input.brand.as_deref(), 128);
        if query.is_none() && category.is_none() && brand.is_none() {
            debug!("empty search ignored");
            return Ok(SearchReport {
                reason: Some("empty_search".to_string()),
                ..SearchReport::default()
            });
        }

        let now = Utc::now();
        let tokens = IdentityTokens::extract(ctx, std::iter::empty::<&EventMetadata>());
        let person_key = self.identity.resolve(&tokens, now)?;

        self.events.record_search(&SearchEvent {
            session_id: tokens.session_id.clone(),
            user_id: tokens.user_id,
            person_key: person_key.clone(),
            query,
            category,
            brand,
            min_price: search_price(input.min_price),
            max_price: search_price(input.max_price),
            created_at: now,
        })?;

        if let Some(key) = person_key.as_deref() {
            if let Err(err) = self.profiles.refresh_person(key) {
                warn!(person_key = key, "feature refresh failed: {}", err);
            }
        }
        info!(person_key = ?person_key, "search recorded");

        Ok(SearchReport {
            accepted: true,
            person_key,
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use store::{
        BikeBehaviorMetrics, CatalogBike, CatalogRepository, FunnelStage, IdentityRepository, ProfileRepository,
        SqliteStore,
    };

    fn pipeline(store: &Arc<SqliteStore>) -> IngestPipeline {
        let identity = IdentityResolver::new(store.clone());
        let profiles = ProfileService::new(store.clone(), store.clone());
        IngestPipeline::new(store.clone(), identity, profiles)
    }

    fn seed_bike(store: &SqliteStore, id: i64) {
        store
            .upsert_bike(
                &CatalogBike {
                    id,
                    name: "Trek Domane".to_string(),
                    brand: "Trek".to_string(),
                    model: None,
                    discipline: Some("road".to_string()),
                    category: Some("road".to_string()),
                    price: 2000.0,
                    rank: 0.8,
                    main_image: None,
                    images: vec![],
                    behavior: BikeBehaviorMetrics::empty(id),
                },
                true,
            )
            .unwrap();
    }

    #[test]
    fn test_example_batch_aggregates() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        seed_bike(&store, 11);
        let ctx = IngestContext::for_session("sess-1").with_source("storefront");

        let batch = vec![
            json!({"type": "click", "bikeId": 11, "eventId": "e1"}),
            json!({"type": "click", "bikeId": 11, "eventId": "e1"}),
            json!({"type": "impression", "bikeId": 11, "eventId": "e2"}),
            json!({"type": "dwell", "bikeId": 11, "ms": 15000, "eventId": "e3"}),
            json!({"type": "cart_add", "bikeId": 11, "eventId": "e4"}),
            json!({"type": "favorite", "bikeId": 11, "eventId": "e5"}),
        ];
        let report = pipeline(&store).ingest_json(batch, &ctx);

        assert_eq!(report.accepted, 5);
        assert_eq!(report.duplicate_dropped, 1);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.person_key.as_deref(), Some("session:sess-1"));

        let metrics = store.bike_metrics(11).unwrap().unwrap();
        assert_eq!(metrics.detail_clicks, 1);
        assert_eq!(metrics.impressions, 1);
        assert_eq!(metrics.add_to_cart, 1);
        assert_eq!(metrics.favorites, 1);
        assert_eq!(metrics.dwell_time_ms_sum, 15000);

        let fact = store.session_fact("sess-1").unwrap().unwrap();
        assert_eq!(fact.event_count, 5);
        assert_eq!(fact.counters.get(FunnelStage::ProductView), 1);
        assert_eq!(fact.counters.get(FunnelStage::AddToCart), 1);
        assert_eq!(fact.dwell_ms_sum, 15000);

        let features = store.load_features("session:sess-1").unwrap().unwrap();
        assert_eq!(features.budget_cluster, "mid");

        let contract = report.funnel_contract.unwrap();
        assert_eq!(contract.checked_events, 4);
        assert_eq!(contract.violations_total, 0);
    }

    #[test]
    fn test_contract_violations_are_reported_not_rejected() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let batch = vec![
            json!({"type": "cart_add", "eventId": "c1"}),
            json!({"type": "checkout_step", "eventId": "c2"}),
            json!({"type": "page_view", "eventId": "c3"}),
        ];
        let report = pipeline(&store).ingest_json(batch, &IngestContext::for_session("sess-c"));

        assert_eq!(report.accepted, 3);
        let contract = report.funnel_contract.unwrap();
        assert_eq!(contract.checked_events, 2);
        assert_eq!(contract.violations_total, 2);
        assert_eq!(contract.compact_violations(), "add_to_cart:1, checkout_step:1");
    }

    #[test]
    fn test_concurrent_duplicate_batches_count_once() {
        fn batch() -> Vec<serde_json::Value> {
            vec![
                json!({"type": "impression", "bikeId": 11, "eventId": "r1"}),
                json!({"type": "click", "bikeId": 11, "eventId": "r2"}),
                json!({"type": "cart_add", "bikeId": 11, "eventId": "r3"}),
            ]
        }
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        seed_bike(&store, 11);
        let pipeline = pipeline(&store);
        let ctx = IngestContext::for_session("sess-race");
        let (pipeline, ctx) = (&pipeline, &ctx);

        let reports: Vec<IngestReport> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(move || pipeline.ingest_json(batch(), ctx)))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert_eq!(reports.iter().map(|r| r.accepted).sum::<usize>(), 3);
        assert_eq!(reports.iter().map(|r| r.duplicate_dropped).sum::<usize>(), 21);
        assert_eq!(store.event_count().unwrap(), 3);

        let metrics = store.bike_metrics(11).unwrap().unwrap();
        assert_eq!(metrics.impressions, 1);
        assert_eq!(metrics.detail_clicks, 1);
        assert_eq!(metrics.add_to_cart, 1);
        assert_eq!(store.session_fact("sess-race").unwrap().unwrap().event_count, 3);
    }

    #[test]
    fn test_search_updates_profile_affinities() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let pipeline = pipeline(&store);
        let ctx = IngestContext::for_session("sess-search");

        let report = pipeline
            .track_search(
                SearchInput {
                    query: Some(" gravel race ".to_string()),
                    category: Some("Gravel".to_string()),
                    brand: Some("Canyon".to_string()),
                    min_price: Some(2000.0),
                    max_price: Some(3000.0),
                },
                &ctx,
            )
            .unwrap();
        assert!(report.accepted);
        assert_eq!(report.person_key.as_deref(), Some("session:sess-search"));

        let searches = store.searches_for_persons(&["session:sess-search".to_string()], 5).unwrap();
        assert_eq!(searches[0].query.as_deref(), Some("gravel race"));

        let features = store.load_features("session:sess-search").unwrap().unwrap();
        assert_eq!(features.brand_embedding.get("Canyon"), Some(&1.0));
        assert_eq!(features.discipline_embedding.get("gravel"), Some(&1.0));
        assert_eq!(features.weighted_average_price, 2500.0);
        assert_eq!(features.budget_cluster, "mid");
    }

    #[test]
    fn test_empty_and_bot_searches_are_not_stored() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let pipeline = pipeline(&store);

        let empty = pipeline
            .track_search(
                SearchInput {
                    query: Some("   ".to_string()),
                    min_price: Some(500.0),
                    ..SearchInput::default()
                },
                &IngestContext::for_session("sess-empty"),
            )
            .unwrap();
        assert!(!empty.accepted);
        assert_eq!(empty.reason.as_deref(), Some("empty_search"));

        let mut bot_ctx = IngestContext::for_session("sess-bot");
        bot_ctx.is_bot = true;
        let bot = pipeline
            .track_search(
                SearchInput {
                    brand: Some("Trek".to_string()),
                    ..SearchInput::default()
                },
                &bot_ctx,
            )
            .unwrap();
        assert_eq!(bot.reason.as_deref(), Some("bot_filtered"));

        let keys = ["session:sess-empty".to_string(), "session:sess-bot".to_string()];
        assert!(store.searches_for_persons(&keys, 5).unwrap().is_empty());
    }

    #[test]
    fn test_reingesting_same_event_id_is_idempotent() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let pipeline = pipeline(&store);
        let ctx = IngestContext::for_session("sess-2");
        let batch = || vec![json!({"type": "impression", "bikeId": 3, "eventId": "only-once"})];

        let first = pipeline.ingest_json(batch(), &ctx);
        let second = pipeline.ingest_json(batch(), &ctx);

        assert_eq!(first.accepted, 1);
        assert_eq!(second.accepted, 0);
        assert_eq!(second.duplicate_dropped, 1);
        assert_eq!(store.bike_metrics(3).unwrap().unwrap().impressions, 1);
    }

    #[test]
    fn test_rejected_events_do_not_abort_batch() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let ctx = IngestContext::for_session("sess-3");
        let batch = vec![
            json!({"type": "", "bikeId": 1}),
            json!({"type": "click", "bikeId": -4}),
            json!({"type": "dwell", "bikeId": 1, "ms": -1}),
            json!({"type": "click", "bikeId": 1, "metadata": {"hacker": 1}}),
            json!("not an object"),
            json!({"type": "click", "bikeId": 1}),
        ];
        let report = pipeline(&store).ingest_json(batch, &ctx);
        assert_eq!(report.rejected, 5);
        assert_eq!(report.accepted, 1);
    }

    #[test]
    fn test_unknown_type_is_stored_without_aggregates() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let report = pipeline(&store).ingest_events(
            vec![RawEvent {
                event_type: "teleport".to_string(),
                bike_id: Some(9),
                ..RawEvent::default()
            }],
            &IngestContext::for_session("sess-4"),
        );
        assert_eq!(report.accepted, 1);
        assert_eq!(report.bike_updates, 0);
        assert_eq!(store.event_count().unwrap(), 1);
        assert!(store.bike_metrics(9).unwrap().is_none());
    }

    #[test]
    fn test_bot_batches_and_overflow_are_dropped() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut ctx = IngestContext::for_session("bot");
        ctx.is_bot = true;
        let events = || (0..5).map(|_| RawEvent { event_type: "impression".to_string(), ..RawEvent::default() }).collect::<Vec<_>>();

        let bot = pipeline(&store).ingest_events(events(), &ctx);
        assert_eq!(bot.dropped, 5);
        assert_eq!(bot.reason.as_deref(), Some("bot_filtered"));

        let capped = pipeline(&store)
            .with_config(IngestConfig::default().with_max_batch_size(3))
            .ingest_events(events(), &IngestContext::for_session("human"));
        assert_eq!(capped.dropped, 2);
        assert_eq!(capped.accepted, 3);
    }

    #[test]
    fn test_user_login_links_to_session_person() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let pipeline = pipeline(&store);
        let anonymous = pipeline.ingest_json(
            vec![json!({"type": "page_view"})],
            &IngestContext::for_session("sess-5"),
        );
        let logged_in = pipeline.ingest_json(
            vec![json!({"type": "page_view"})],
            &IngestContext::for_session("sess-5").with_user(77),
        );
        assert_eq!(anonymous.person_key, logged_in.person_key);
    }
}
