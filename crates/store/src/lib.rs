//! # Store Crate
//!
//! Durable state for the personalization platform: behavioral events, their
//! per-bike and per-session rollups, the identity graph, the feature store,
//! experiments, and the read-only catalog view.
//!
//! ## Main Components
//!
//! - **types**: Core domain types (NormalizedEvent, SessionFact, IdentityNode, FeatureStore, CatalogBike)
//! - **repository**: Traits the services depend on
//! - **sqlite**: The SQLite implementation of every repository
//! - **error**: Error types for store access
//!
//! ## Example Usage
//!
//! ```ignore
//! use store::{CatalogRepository, SqliteStore, BikeQuery, BikeFilter, BikeOrder};
//!
//! let store = SqliteStore::open("velo.db")?;
//! let bikes = store.query_bikes(&BikeQuery {
//!     filter: BikeFilter::All,
//!     order: BikeOrder::RankDesc,
//!     limit: 24,
//! })?;
//! println!("{} active bikes", bikes.len());
//! ```

pub mod error;
pub mod repository;
mod schema;
pub mod sqlite;
pub mod types;

pub use error::{Result, StoreError};
pub use repository::{CatalogRepository, EventRepository, ExperimentRepository, IdentityRepository, ProfileRepository};
pub use sqlite::SqliteStore;
pub use types::{
    // Type aliases
    BikeId,
    UserId,
    // Events
    Attribution,
    EventMetadata,
    EventType,
    NormalizedEvent,
    RecordOutcome,
    // Rollups
    BikeBehaviorMetrics,
    BikeCounter,
    BikeMetricDelta,
    FunnelCounters,
    FunnelStage,
    SessionFact,
    SessionFactDelta,
    // Identity
    IdentityNode,
    IdentityRefs,
    IdentityType,
    // Profile
    BikeSnapshot,
    FeatureStore,
    PersonInteraction,
    Profile,
    SearchEvent,
    // Experiments
    Assignment,
    ExperimentRow,
    GoalEvent,
    GoalTotal,
    SubjectRefs,
    VariantCount,
    // Catalog
    BikeFilter,
    BikeOrder,
    BikeQuery,
    CatalogBike,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_starts_empty() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.event_count().unwrap(), 0);
        assert!(store.bike(1).unwrap().is_none());
        assert!(store.experiment("missing").unwrap().is_none());
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("velo-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("idempotent.db");
        drop(SqliteStore::open(&path).unwrap());
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.event_count().unwrap(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }
}
