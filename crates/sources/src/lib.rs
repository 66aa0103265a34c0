//! # Sources Crate
//!
//! Candidate retrieval for bike recommendations.
//!
//! ## Components
//!
//! ### Candidate Pool
//! Parallel retrieval jobs over the active catalog:
//! - Top rank: best-ranked bikes overall (~240)
//! - Disciplines: bikes in the profile's top-3 disciplines (~220)
//! - Brands: bikes from the profile's top-3 brands (~180)
//! - Budget: bikes inside the budget-cluster price band (~200)
//! - Explore: random long-tail sample, explore strategy only (~120)
//!
//! The union is deduplicated by bike id and capped at 420 bikes.
//!
//! ## Example Usage
//!
//! ```ignore
//! use experiments::ThreadRandom;
//! use sources::CandidatePoolBuilder;
//! use std::sync::Arc;
//!
//! let builder = CandidatePoolBuilder::new(store.clone(), Arc::new(ThreadRandom));
//! let pool = builder.build_candidate_pool(&profile, &assignments)?;
//! ```

pub mod pool;
pub mod types;

pub use pool::{CandidatePoolBuilder, PoolConfig, RetrievalSignals};
pub use types::{
    budget_range, strategy_of, top_keys, Candidate, RetrievalJob, CONTROL_STRATEGY, EXPLORE_STRATEGY,
    STRATEGY_EXPERIMENT,
};
