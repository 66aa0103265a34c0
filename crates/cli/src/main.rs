use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use experiments::{GoalInput, RandomSource, SeededRandom, Subject, ThreadRandom};
use metrics::{IngestContext, ProfileQuery, SearchInput};
use pipeline::RerankConfig;
use server::{
    seed_demo, Platform, PlatformConfig, RecommendationRequest, RecommendationResponse, RequestContext,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{BikeId, CatalogRepository, ExperimentRepository, ExperimentRow, SqliteStore, UserId};
use tokio::sync::Semaphore;
use tracing::info;

/// velo-recs - Bike personalization and experimentation platform
#[derive(Parser)]
#[command(name = "velo-recs")]
#[command(about = "Event ingestion, bandit experiments and personalized bike ranking", long_about = None)]
struct Cli {
    /// Path to the SQLite database
    #[arg(short, long, env = "VELO_DB_PATH", default_value = "velo.db")]
    db_path: PathBuf,

    /// Use Thompson Sampling weights for new assignments
    #[arg(long, env = "ENABLE_EXPERIMENT_BANDIT", default_value_t = true, action = ArgAction::Set)]
    bandit: bool,

    /// Let the LLM gateway reorder the top of each ranking
    #[arg(long, env = "ENABLE_LLM_RERANK", default_value_t = false, action = ArgAction::Set)]
    llm_rerank: bool,

    /// gRPC address of the LLM gateway
    #[arg(long, env = "LLM_GATEWAY_ADDR")]
    llm_gateway: Option<String>,

    /// LLM call budget in milliseconds
    #[arg(long, env = "LLM_TIMEOUT_MS", default_value = "2500")]
    llm_timeout_ms: u64,

    /// Seed for reproducible draws
    #[arg(long)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the demo catalog and experiments
    Seed,

    /// Create or update an experiment
    Experiment {
        #[arg(long)]
        key: String,

        #[arg(long)]
        name: Option<String>,

        /// Variants as JSON, e.g. '[{"name":"control","weight":50},{"name":"explore","weight":50}]'
        #[arg(long)]
        variants: Option<String>,

        /// Store the experiment disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Ingest a JSON array of events for one session
    Ingest {
        #[arg(long)]
        session_id: String,

        #[arg(long)]
        user_id: Option<UserId>,

        #[arg(long, default_value = "cli")]
        source: String,

        /// File holding the events; reads the --events argument otherwise
        #[arg(long, conflicts_with = "events")]
        file: Option<PathBuf>,

        /// Inline JSON array of events
        #[arg(long)]
        events: Option<String>,
    },

    /// Record a storefront search
    Search {
        #[arg(long)]
        session_id: String,

        #[arg(long)]
        user_id: Option<UserId>,

        #[arg(long)]
        query: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        brand: Option<String>,

        #[arg(long)]
        min_price: Option<f64>,

        #[arg(long)]
        max_price: Option<f64>,
    },

    /// Show the profile of a user or session
    Profile {
        #[arg(long)]
        user_id: Option<UserId>,

        #[arg(long)]
        session_id: Option<String>,
    },

    /// Show or create experiment assignments
    Assign {
        #[arg(long)]
        user_id: Option<UserId>,

        #[arg(long)]
        session_id: Option<String>,
    },

    /// Show the bandit allocation of an experiment
    Weights {
        #[arg(long)]
        key: String,
    },

    /// Record a goal for an experiment variant
    Goal {
        #[arg(long)]
        key: String,

        #[arg(long)]
        metric: String,

        #[arg(long)]
        variant: Option<String>,

        #[arg(long)]
        value: Option<f64>,

        #[arg(long)]
        bike_id: Option<BikeId>,

        #[arg(long)]
        user_id: Option<UserId>,

        #[arg(long)]
        session_id: Option<String>,
    },

    /// Get personalized bike recommendations
    Recommend {
        #[arg(long)]
        user_id: Option<UserId>,

        #[arg(long)]
        session_id: Option<String>,

        #[arg(long, default_value = "24")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Run benchmark to test performance
    Benchmark {
        /// Number of requests to make
        #[arg(long, default_value = "100")]
        requests: usize,

        /// Number of concurrent requests
        #[arg(long, default_value = "10")]
        concurrent: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let store = Arc::new(
        SqliteStore::open(&cli.db_path)
            .with_context(|| format!("Failed to open database {}", cli.db_path.display()))?,
    );
    let rng: Arc<dyn RandomSource> = match cli.seed {
        Some(seed) => Arc::new(SeededRandom::new(seed)),
        None => Arc::new(ThreadRandom),
    };
    let platform = Arc::new(Platform::new(store, rng, platform_config(&cli))?);

    // Dispatch to appropriate command handler
    match cli.command {
        Commands::Seed => handle_seed(&platform)?,
        Commands::Experiment {
            key,
            name,
            variants,
            disabled,
        } => handle_experiment(&platform, key, name, variants, !disabled)?,
        Commands::Ingest {
            session_id,
            user_id,
            source,
            file,
            events,
        } => handle_ingest(&platform, session_id, user_id, source, file, events).await?,
        Commands::Search {
            session_id,
            user_id,
            query,
            category,
            brand,
            min_price,
            max_price,
        } => {
            let mut ctx = IngestContext::for_session(session_id).with_source("cli");
            ctx.user_id = user_id;
            let input = SearchInput {
                query,
                category,
                brand,
                min_price,
                max_price,
            };
            let report = platform.track_search(input, ctx).await?;
            if report.accepted {
                println!(
                    "{} Search recorded for {}",
                    "✓".green(),
                    report.person_key.as_deref().unwrap_or("(anonymous)")
                );
            } else {
                println!("{} Search ignored: {}", "✗".yellow(), report.reason.as_deref().unwrap_or("unknown"));
            }
        }
        Commands::Profile { user_id, session_id } => handle_profile(&platform, user_id, session_id).await?,
        Commands::Assign { user_id, session_id } => handle_assign(&platform, user_id, session_id).await?,
        Commands::Weights { key } => handle_weights(&platform, key).await?,
        Commands::Goal {
            key,
            metric,
            variant,
            value,
            bike_id,
            user_id,
            session_id,
        } => {
            let goal = GoalInput {
                experiment_key: key,
                variant,
                metric_name: metric,
                bike_id,
                user_id,
                session_id,
                value,
            };
            platform.track_goal(goal).await?;
            println!("{} Goal recorded", "✓".green());
        }
        Commands::Recommend {
            user_id,
            session_id,
            limit,
            offset,
            json,
        } => {
            let ctx = RequestContext { user_id, session_id };
            let response = platform.recommend(RecommendationRequest::page(limit, offset), ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_recommendations(&response);
            }
        }
        Commands::Benchmark {
            requests,
            concurrent,
        } => handle_benchmark(platform, requests, concurrent).await?,
    }

    Ok(())
}

fn platform_config(cli: &Cli) -> PlatformConfig {
    let rerank = RerankConfig::default()
        .with_enabled(cli.llm_rerank)
        .with_timeout(Duration::from_millis(cli.llm_timeout_ms));
    let config = PlatformConfig::default()
        .with_bandit_enabled(cli.bandit)
        .with_rerank(rerank);
    match &cli.llm_gateway {
        Some(addr) => config.with_llm_gateway(addr.clone()),
        None => config,
    }
}

/// Handle the 'seed' command
fn handle_seed(platform: &Platform) -> Result<()> {
    let count = seed_demo(platform.store()).context("Failed to seed demo data")?;
    println!("{} Seeded {} bikes and the demo experiments", "✓".green(), count);
    Ok(())
}

/// Handle the 'experiment' command
fn handle_experiment(
    platform: &Platform,
    key: String,
    name: Option<String>,
    variants: Option<String>,
    enabled: bool,
) -> Result<()> {
    if key.trim().is_empty() {
        return Err(anyhow!("Experiment key must not be empty"));
    }
    if let Some(raw) = &variants {
        serde_json::from_str::<serde_json::Value>(raw).context("Variants must be valid JSON")?;
    }
    let row = ExperimentRow {
        experiment_key: key.clone(),
        name,
        variants_json: variants,
        enabled,
    };
    platform.store().upsert_experiment(&row)?;

    let parsed = experiments::Experiment::from(row);
    println!("{}", format!("Experiment {}", key).bold().blue());
    println!("{}Enabled: {}", "• ".green(), enabled);
    for variant in parsed.variants {
        println!("{}{} (weight {})", "• ".cyan(), variant.name, variant.weight);
    }
    Ok(())
}

/// Handle the 'ingest' command
async fn handle_ingest(
    platform: &Platform,
    session_id: String,
    user_id: Option<UserId>,
    source: String,
    file: Option<PathBuf>,
    events: Option<String>,
) -> Result<()> {
    let raw = match (file, events) {
        (Some(path), _) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read events from {}", path.display()))?,
        (None, Some(inline)) => inline,
        (None, None) => return Err(anyhow!("Pass --file or --events")),
    };
    let values: Vec<serde_json::Value> = serde_json::from_str(&raw).context("Events must be a JSON array")?;

    let mut ctx = IngestContext::for_session(session_id).with_source(source);
    ctx.user_id = user_id;
    let report = platform.ingest(values, ctx).await?;

    println!("{}", "Ingestion report:".bold().blue());
    println!("{}Accepted: {}", "• ".green(), report.accepted);
    println!("{}Duplicates dropped: {}", "• ".yellow(), report.duplicate_dropped);
    println!("{}Rejected: {}", "• ".red(), report.rejected);
    println!("{}Dropped: {}", "• ".red(), report.dropped);
    println!("{}Failed: {}", "• ".red(), report.failed);
    println!("{}Bike updates: {}", "• ".cyan(), report.bike_updates);
    if let Some(person) = &report.person_key {
        println!("{}Person: {}", "• ".cyan(), person);
    }
    if let Some(reason) = &report.reason {
        println!("{}Reason: {}", "• ".yellow(), reason);
    }
    if let Some(contract) = &report.funnel_contract {
        println!(
            "{}Funnel contract {}: {} checked, {} violations",
            "• ".cyan(),
            contract.version,
            contract.checked_events,
            contract.violations_total
        );
        for row in contract.by_event.iter().filter(|row| row.violations > 0) {
            println!("  - {} ({}): {:.2}% covered", row.event_type, row.stage, row.coverage_pct);
        }
    }
    Ok(())
}

/// Handle the 'profile' command
async fn handle_profile(platform: &Platform, user_id: Option<UserId>, session_id: Option<String>) -> Result<()> {
    let profile = platform.profile(ProfileQuery { user_id, session_id }).await?;
    let features = &profile.feature_store;

    println!(
        "{}",
        format!("Profile {}", profile.person_key.as_deref().unwrap_or("(anonymous)")).bold().blue()
    );
    println!("{}Interactions: {}", "• ".green(), profile.interaction_count);
    println!("{}Intent score: {:.2}", "• ".green(), features.intent_score);
    println!(
        "{}Budget: {} (weighted price {:.0})",
        "• ".green(),
        features.budget_cluster,
        features.weighted_average_price
    );
    println!("{}Recency decay: {:.3}", "• ".green(), features.recency_decay);
    print_embedding("Disciplines", &features.discipline_embedding);
    print_embedding("Brands", &features.brand_embedding);
    print_embedding("Categories", &features.category_embedding);
    Ok(())
}

fn print_embedding(label: &str, embedding: &std::collections::BTreeMap<String, f64>) {
    let mut entries: Vec<_> = embedding.iter().collect();
    entries.sort_by(|a, b| b.1.total_cmp(a.1));
    println!("{}:", label);
    for (key, value) in entries {
        println!("  - {}: {:.3}", key, value);
    }
}

/// Handle the 'assign' command
async fn handle_assign(platform: &Platform, user_id: Option<UserId>, session_id: Option<String>) -> Result<()> {
    let assignments = platform.assignments(Subject { user_id, session_id }).await?;
    if assignments.is_empty() {
        println!("{}", "No assignments (no subject or no active experiments)".yellow());
        return Ok(());
    }
    println!("{}", "Assignments:".bold().blue());
    for (key, variant) in assignments {
        println!("{}{} → {}", "• ".green(), key, variant.bold());
    }
    Ok(())
}

/// Handle the 'weights' command
async fn handle_weights(platform: &Platform, key: String) -> Result<()> {
    let allocation = platform.bandit_weights(key.clone()).await?;
    println!("{}", format!("Bandit allocation for {}", key).bold().blue());
    println!(
        "{}Reason: {:?} ({} assignments over {} days)",
        "• ".green(),
        allocation.reason,
        allocation.total_assignments,
        allocation.lookback_days
    );
    for (variant, weight) in allocation.weights.iter() {
        println!("  - {}: {}%", variant, weight);
    }
    for d in &allocation.diagnostics {
        println!(
            "  {} n={} reward={:.2} mean={:.4} sample={:.4}",
            d.variant.cyan(),
            d.assignments,
            d.reward,
            d.posterior_mean,
            d.sampled_score
        );
    }
    Ok(())
}

/// Handle the 'benchmark' command
async fn handle_benchmark(platform: Arc<Platform>, requests: usize, concurrent: usize) -> Result<()> {
    if requests == 0 {
        return Err(anyhow!("Benchmark needs at least one request"));
    }
    let active = platform.store().query_bikes(&store::BikeQuery {
        filter: store::BikeFilter::All,
        order: store::BikeOrder::IdAsc,
        limit: 1,
    })?;
    if active.is_empty() {
        return Err(anyhow!("Catalog is empty; run `velo-recs seed` first"));
    }

    info!("Running {} requests, {} at a time", requests, concurrent.max(1));
    let limiter = Arc::new(Semaphore::new(concurrent.max(1)));
    let wall = Instant::now();
    let mut handles = vec![];
    for _ in 0..requests {
        let orchestrator = platform.recommendations().clone();
        let limiter = limiter.clone();
        let session_id = format!("bench-{}", rand::random::<u32>());
        let handle = tokio::spawn(async move {
            let _permit = limiter.acquire_owned().await?;
            let start = Instant::now();
            orchestrator
                .get_personalized_recommendations(RecommendationRequest::page(24, 0), RequestContext::session(session_id))
                .await?;
            Ok::<_, anyhow::Error>(start.elapsed())
        });
        handles.push(handle);
    }

    let mut timings = vec![];
    for handle in handles {
        let elapsed = handle.await??;
        timings.push(elapsed);
    }
    let total_time = wall.elapsed();

    let summed: Duration = timings.iter().sum();
    let avg_latency = summed / (timings.len() as u32);
    timings.sort();
    let percentile = |p: f32| timings[((timings.len() as f32 * p) as usize).min(timings.len() - 1)];
    let throughput = requests as f32 / total_time.as_secs_f32();

    println!("{}", "Benchmark results:".bold().blue());
    println!("Total time: {:?}", total_time);
    println!("Average latency: {:?}", avg_latency);
    println!("P50 latency: {:?}", percentile(0.50));
    println!("P95 latency: {:?}", percentile(0.95));
    println!("P99 latency: {:?}", percentile(0.99));
    println!("Throughput: {:.2} requests/second", throughput);

    Ok(())
}

/// Helper function to format and print recommendations
fn print_recommendations(response: &RecommendationResponse) {
    let retrieval = &response.retrieval;
    println!("{}", "Bike Recommendations:".bold().blue());
    println!(
        "Strategy {} · {} candidates · budget {}",
        retrieval.strategy.bold(),
        retrieval.candidate_count,
        retrieval.budget_cluster
    );
    if !retrieval.top_disciplines.is_empty() {
        println!("Top disciplines: {}", retrieval.top_disciplines.join(", "));
    }
    if !retrieval.top_brands.is_empty() {
        println!("Top brands: {}", retrieval.top_brands.join(", "));
    }

    for (i, bike) in response.bikes.iter().enumerate() {
        println!(
            "{}. {} [{} / {}] {:.0} EUR - via {:?}",
            (i + 1).to_string().green(),
            bike.name,
            bike.discipline.as_deref().unwrap_or("-"),
            bike.category.as_deref().unwrap_or("-"),
            bike.price,
            bike.retrieved_by
        );
    }
    if !response.experiments.is_empty() {
        println!("{}", "Experiments:".bold());
        for (key, variant) in &response.experiments {
            println!("  - {}: {}", key, variant);
        }
    }
}
