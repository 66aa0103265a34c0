//! Simple test harness for the recommendation flow.
//!
//! Seeds the demo catalog, replays a short browsing session and prints the
//! personalized page for it. Set `VELO_DB_PATH` to use a file store and
//! `RUST_LOG` to change the log filter.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use experiments::ThreadRandom;
use metrics::IngestContext;
use server::{seed_demo, Platform, PlatformConfig, RecommendationRequest, RequestContext};
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,server=debug,sources=debug,pipeline=debug")),
        )
        .init();

    info!("Starting bike recommendation test harness");

    let store = match std::env::var("VELO_DB_PATH") {
        Ok(path) => SqliteStore::open(path)?,
        Err(_) => SqliteStore::in_memory()?,
    };
    let store = Arc::new(store);
    seed_demo(&store)?;

    let platform = Platform::new(store, Arc::new(ThreadRandom), PlatformConfig::default())?;

    let session_id = "harness-session";
    let events = vec![
        json!({"type": "impression", "bikeId": 1, "eventId": "h1"}),
        json!({"type": "click", "bikeId": 1, "eventId": "h2"}),
        json!({"type": "dwell", "bikeId": 1, "ms": 22000, "eventId": "h3"}),
        json!({"type": "click", "bikeId": 2, "eventId": "h4"}),
        json!({"type": "favorite", "bikeId": 7, "eventId": "h5"}),
    ];
    let report = platform
        .ingest(events, IngestContext::for_session(session_id).with_source("harness"))
        .await?;
    info!(
        "Ingested {} events ({} rejected, {} duplicates)",
        report.accepted, report.rejected, report.duplicate_dropped
    );

    let response = platform
        .recommend(RecommendationRequest::page(10, 0), RequestContext::session(session_id))
        .await?;

    info!(
        "Strategy {} over {} candidates, budget {}",
        response.retrieval.strategy, response.retrieval.candidate_count, response.retrieval.budget_cluster
    );
    info!("Top disciplines: {}", response.retrieval.top_disciplines.join(", "));
    info!("Top brands: {}", response.retrieval.top_brands.join(", "));
    for (i, bike) in response.bikes.iter().enumerate() {
        info!(
            "{}. {} [{}] {:.0} EUR via {:?}",
            i + 1,
            bike.name,
            bike.discipline.as_deref().unwrap_or("-"),
            bike.price,
            bike.retrieved_by
        );
    }

    Ok(())
}
