//! Server crate for the bike personalization platform.
//!
//! This crate wires the store, ingestion, experiment and ranking crates
//! together and hosts the orchestrator behind the recommendation endpoint.
//!
//! - **orchestrator**: The recommendation flow, profile to page
//! - **platform**: All services over one store, as async calls
//! - **response**: Request and response shapes
//! - **demo**: Demo catalog for local runs

pub mod demo;
pub mod orchestrator;
pub mod platform;
pub mod response;

pub use demo::{demo_catalog, demo_experiments, seed_demo};
pub use orchestrator::{paginate, RecommendationConfig, RecommendationOrchestrator};
pub use platform::{Platform, PlatformConfig};
pub use response::{
    pick_valid_image, BikeRecommendation, RecommendationRequest, RecommendationResponse, RequestContext,
    RetrievalSummary,
};
