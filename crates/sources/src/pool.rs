//! Candidate Pool - parallel catalog retrieval
//!
//! Builds the set of bikes a recommendation request will score.
//!
//! ## Algorithm
//! 1. Derive the profile's top disciplines, top brands and budget band
//! 2. Plan one retrieval job per signal that is present:
//!    - top catalog rank (always)
//!    - top disciplines
//!    - top brands
//!    - budget-cluster price band
//!    - random long-tail sample (explore strategy only)
//! 3. Run the jobs in parallel on rayon
//! 4. Union by bike id in job order, first occurrence wins
//! 5. Cap the pool size

use anyhow::{Context, Result};
use experiments::RandomSource;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use store::{BikeFilter, BikeOrder, BikeQuery, CatalogBike, CatalogRepository, Profile};
use tracing::{debug, instrument};

use crate::types::{budget_range, strategy_of, top_keys, Candidate, RetrievalJob, EXPLORE_STRATEGY};

/// Per-job row limits and the pool cap
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub top_rank_limit: usize,
    pub discipline_limit: usize,
    pub brand_limit: usize,
    pub budget_limit: usize,
    pub explore_limit: usize,
    /// Rows scanned before the explore sample is drawn
    pub explore_scan: usize,
    /// How many top disciplines and brands to retrieve for
    pub top_n: usize,
    pub max_pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            top_rank_limit: 240,
            discipline_limit: 220,
            brand_limit: 180,
            budget_limit: 200,
            explore_limit: 120,
            explore_scan: 1000,
            top_n: 3,
            max_pool_size: 420,
        }
    }
}

impl PoolConfig {
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn with_explore_limit(mut self, limit: usize) -> Self {
        self.explore_limit = limit;
        self
    }
}

/// Retrieval signals taken from a profile
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSignals {
    pub top_disciplines: Vec<String>,
    pub top_brands: Vec<String>,
    pub budget_cluster: String,
}

impl RetrievalSignals {
    /// Prefer the feature-store embeddings, fall back to raw affinities
    pub fn from_profile(profile: &Profile, top_n: usize) -> Self {
        let features = &profile.feature_store;
        let disciplines = if features.discipline_embedding.is_empty() {
            &profile.disciplines
        } else {
            &features.discipline_embedding
        };
        let brands = if features.brand_embedding.is_empty() {
            &profile.brands
        } else {
            &features.brand_embedding
        };
        Self {
            top_disciplines: top_keys(disciplines, top_n),
            top_brands: top_keys(brands, top_n),
            budget_cluster: features.budget_cluster.clone(),
        }
    }
}

/// Builds candidate pools from the catalog
pub struct CandidatePoolBuilder {
    catalog: Arc<dyn CatalogRepository>,
    rng: Arc<dyn RandomSource>,
    config: PoolConfig,
}

impl CandidatePoolBuilder {
    pub fn new(catalog: Arc<dyn CatalogRepository>, rng: Arc<dyn RandomSource>) -> Self {
        Self {
            catalog,
            rng,
            config: PoolConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn signals(&self, profile: &Profile) -> RetrievalSignals {
        RetrievalSignals::from_profile(profile, self.config.top_n)
    }

    /// Jobs to run for these signals, in union order
    pub fn plan(&self, signals: &RetrievalSignals, strategy: &str) -> Vec<(RetrievalJob, BikeQuery)> {
        let config = &self.config;
        let mut jobs = vec![(
            RetrievalJob::TopRank,
            BikeQuery {
                filter: BikeFilter::All,
                order: BikeOrder::RankDesc,
                limit: config.top_rank_limit,
            },
        )];

        if !signals.top_disciplines.is_empty() {
            jobs.push((
                RetrievalJob::Disciplines,
                BikeQuery {
                    filter: BikeFilter::Disciplines(signals.top_disciplines.clone()),
                    order: BikeOrder::RankDesc,
                    limit: config.discipline_limit,
                },
            ));
        }

        if !signals.top_brands.is_empty() {
            jobs.push((
                RetrievalJob::Brands,
                BikeQuery {
                    filter: BikeFilter::Brands(signals.top_brands.clone()),
                    order: BikeOrder::RankDesc,
                    limit: config.brand_limit,
                },
            ));
        }

        if let Some((min, max)) = budget_range(&signals.budget_cluster) {
            jobs.push((
                RetrievalJob::Budget,
                BikeQuery {
                    filter: BikeFilter::PriceBand { min, max },
                    order: BikeOrder::RankDesc,
                    limit: config.budget_limit,
                },
            ));
        }

        if strategy == EXPLORE_STRATEGY {
            jobs.push((
                RetrievalJob::Explore,
                BikeQuery {
                    filter: BikeFilter::All,
                    order: BikeOrder::IdAsc,
                    limit: config.explore_scan.max(config.explore_limit),
                },
            ));
        }

        jobs
    }

    /// Retrieve and union the candidate pool for a profile
    #[instrument(skip(self, profile, assignments), fields(person_key = ?profile.person_key))]
    pub fn build_candidate_pool(&self, profile: &Profile, assignments: &BTreeMap<String, String>) -> Result<Vec<Candidate>> {
        let signals = self.signals(profile);
        let strategy = strategy_of(assignments);
        let jobs = self.plan(&signals, strategy);
        debug!("Running {} retrieval jobs (strategy {})", jobs.len(), strategy);

        // Step 1: run every job in parallel, preserving job order
        let chunks: Vec<(RetrievalJob, Vec<CatalogBike>)> = jobs
            .par_iter()
            .map(|(job, query)| {
                let rows = self
                    .catalog
                    .query_bikes(query)
                    .with_context(|| format!("retrieval job {job:?} failed"))?;
                let rows = if *job == RetrievalJob::Explore {
                    self.sample(rows, self.config.explore_limit)
                } else {
                    rows
                };
                Ok((*job, rows))
            })
            .collect::<Result<Vec<_>>>()?;

        // Step 2: union by id, first occurrence wins
        let mut seen = HashSet::new();
        let mut pool = Vec::new();
        for (job, rows) in chunks {
            debug!("{:?} returned {} rows", job, rows.len());
            for bike in rows {
                if bike.id <= 0 || !seen.insert(bike.id) {
                    continue;
                }
                pool.push(Candidate::new(bike, job));
            }
        }

        pool.truncate(self.config.max_pool_size);
        debug!("Candidate pool holds {} bikes", pool.len());
        Ok(pool)
    }

    /// Uniform sample without replacement (partial Fisher-Yates)
    fn sample(&self, mut rows: Vec<CatalogBike>, count: usize) -> Vec<CatalogBike> {
        let take = count.min(rows.len());
        for i in 0..take {
            let remaining = rows.len() - i;
            let offset = ((self.rng.next_f64() * remaining as f64) as usize).min(remaining - 1);
            rows.swap(i, i + offset);
        }
        rows.truncate(take);
        rows
    }
}
