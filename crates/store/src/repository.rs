//! Repository traits implemented by the durable store.
//!
//! Services depend on these traits rather than on [`crate::SqliteStore`]
//! so tests can swap in failing or instrumented implementations.

use crate::error::Result;
use crate::types::*;
use chrono::{DateTime, Utc};

/// Append-only behavioral events plus the rollups derived from them
pub trait EventRepository: Send + Sync {
    /// Whether an event with this `(session_id, event_id)` is already stored
    fn event_exists(&self, session_id: &str, event_id: &str) -> Result<bool>;

    /// Persist one event and apply its rollup deltas atomically.
    ///
    /// Either the event row, the bike delta and the session delta are all
    /// written, or none of them are. A duplicate `(session_id, event_id)`
    /// returns [`RecordOutcome::Duplicate`] without touching any aggregate.
    fn record_event(
        &self,
        event: &NormalizedEvent,
        bike_delta: Option<(BikeId, BikeMetricDelta)>,
        session_delta: Option<&SessionFactDelta>,
    ) -> Result<RecordOutcome>;

    /// Append one storefront search
    fn record_search(&self, search: &SearchEvent) -> Result<()>;

    fn bike_metrics(&self, bike_id: BikeId) -> Result<Option<BikeBehaviorMetrics>>;

    fn session_fact(&self, session_id: &str) -> Result<Option<SessionFact>>;

    /// Number of stored events, for diagnostics
    fn event_count(&self) -> Result<u64>;
}

/// Identity graph nodes
pub trait IdentityRepository: Send + Sync {
    fn find_identity(&self, identity_type: IdentityType, value: &str) -> Result<Option<IdentityNode>>;

    /// Insert the node or refresh `last_seen_at`, backfilling only empty refs.
    ///
    /// An existing node's `person_key` is never rewritten.
    fn upsert_identity(
        &self,
        identity_type: IdentityType,
        value: &str,
        person_key: &str,
        refs: &IdentityRefs,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;

    /// All events of the given person keys, newest first, joined with bikes
    fn interactions_for_persons(&self, person_keys: &[String], limit: usize) -> Result<Vec<PersonInteraction>>;

    /// Searches of the given person keys, newest first
    fn searches_for_persons(&self, person_keys: &[String], limit: usize) -> Result<Vec<SearchEvent>>;
}

/// Materialized per-person feature rows
pub trait ProfileRepository: Send + Sync {
    fn load_features(&self, person_key: &str) -> Result<Option<FeatureStore>>;

    fn save_features(&self, features: &FeatureStore) -> Result<()>;
}

/// Experiment definitions, assignments and goals
pub trait ExperimentRepository: Send + Sync {
    fn experiment(&self, experiment_key: &str) -> Result<Option<ExperimentRow>>;

    /// Enabled experiments ordered by key
    fn enabled_experiments(&self) -> Result<Vec<ExperimentRow>>;

    fn upsert_experiment(&self, experiment: &ExperimentRow) -> Result<()>;

    fn assignment(&self, experiment_key: &str, subject_key: &str) -> Result<Option<Assignment>>;

    /// Insert an assignment unless one already exists for the subject.
    ///
    /// Returns the assignment that is stored after the call, which is the
    /// earlier one when two writers race.
    fn insert_assignment(&self, assignment: &Assignment) -> Result<Assignment>;

    fn assignment_counts_since(&self, experiment_key: &str, since: DateTime<Utc>) -> Result<Vec<VariantCount>>;

    fn goal_totals_since(&self, experiment_key: &str, since: DateTime<Utc>) -> Result<Vec<GoalTotal>>;

    fn insert_goal(&self, goal: &GoalEvent) -> Result<()>;
}

/// Read-only view of the active bike catalog
pub trait CatalogRepository: Send + Sync {
    /// Active bikes matching the query, with their behavior rollups attached
    fn query_bikes(&self, query: &BikeQuery) -> Result<Vec<CatalogBike>>;

    fn bike(&self, bike_id: BikeId) -> Result<Option<CatalogBike>>;

    fn upsert_bike(&self, bike: &CatalogBike, active: bool) -> Result<()>;
}
