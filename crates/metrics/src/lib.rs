//! # Metrics Crate
//!
//! Behavioral event ingestion, cross-session identity and the profile
//! feature store.
//!
//! ## Main Components
//!
//! - **events**: Raw event decoding and alias normalization
//! - **aggregation**: Per-bike and per-session rollup deltas
//! - **contract**: Required-field coverage of funnel events
//! - **identity**: Identity graph resolution and hashing
//! - **ingest**: The batch ingestion pipeline
//! - **profile**: Affinity, budget and intent features

pub mod aggregation;
pub mod contract;
pub mod error;
pub mod events;
pub mod identity;
pub mod ingest;
pub mod profile;

pub use contract::{validate_funnel_contract, ContractCoverage, FunnelContractReport};
pub use error::{IngestError, Result};
pub use events::{normalize_event, normalize_event_type, IngestContext, RawEvent, RejectReason};
pub use identity::{hash_identity, IdentityResolver, IdentityTokens};
pub use ingest::{IngestConfig, IngestPipeline, IngestReport, SearchInput, SearchReport};
pub use profile::{
    budget_cluster, build_profile, build_profile_with_searches, BudgetBand, ProfileConfig, ProfileQuery, ProfileService,
};
