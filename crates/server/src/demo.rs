//! Demo catalog and experiments for local runs.

use store::{BikeBehaviorMetrics, CatalogBike, CatalogRepository, ExperimentRepository, ExperimentRow, SqliteStore};
use tracing::info;

/// (brand, model, discipline, category, price, rank)
const DEMO_BIKES: &[(&str, &str, &str, &str, f64, f64)] = &[
    ("Trek", "Domane SL 5", "road", "endurance", 3299.0, 4.6),
    ("Trek", "Emonda ALR 5", "road", "race", 2199.0, 4.3),
    ("Trek", "Marlin 7", "mtb", "hardtail", 1099.0, 4.1),
    ("Specialized", "Tarmac SL7", "road", "race", 5499.0, 4.8),
    ("Specialized", "Diverge E5", "gravel", "allroad", 1399.0, 3.9),
    ("Specialized", "Stumpjumper", "mtb", "trail", 4199.0, 4.5),
    ("Canyon", "Endurace CF 7", "road", "endurance", 2499.0, 4.4),
    ("Canyon", "Grail CF SL", "gravel", "race", 2999.0, 4.2),
    ("Canyon", "Spectral 125", "mtb", "trail", 3599.0, 4.0),
    ("Cube", "Attain GTC", "road", "endurance", 1699.0, 3.6),
    ("Cube", "Hyde Pro", "city", "urban", 999.0, 3.4),
    ("Cube", "Kathmandu Hybrid", "ebike", "trekking", 3299.0, 3.8),
    ("Orbea", "Orca M30", "road", "race", 2399.0, 4.0),
    ("Orbea", "Terra H40", "gravel", "allroad", 1799.0, 3.7),
    ("Giant", "Escape 2", "city", "fitness", 649.0, 3.2),
    ("Giant", "Trance X 29", "mtb", "enduro", 3899.0, 4.3),
    ("Scott", "Addict RC", "road", "race", 6299.0, 4.7),
    ("Scott", "Sub Cross", "city", "trekking", 899.0, 3.1),
    ("Bianchi", "Via Nirone 7", "road", "endurance", 1299.0, 3.5),
    ("Riese & Muller", "Load 75", "ebike", "cargo", 7499.0, 4.1),
];

pub fn demo_catalog() -> Vec<CatalogBike> {
    DEMO_BIKES
        .iter()
        .zip(1i64..)
        .map(|(&(brand, model, discipline, category, price, rank), id)| CatalogBike {
            id,
            name: format!("{brand} {model}"),
            brand: brand.to_string(),
            model: Some(model.to_string()),
            discipline: Some(discipline.to_string()),
            category: Some(category.to_string()),
            price,
            rank,
            main_image: Some(format!("https://images.example.com/bikes/{id}.jpg")),
            images: vec![format!("https://images.example.com/bikes/{id}-side.jpg")],
            behavior: BikeBehaviorMetrics::empty(id),
        })
        .collect()
}

pub fn demo_experiments() -> Vec<ExperimentRow> {
    vec![
        ExperimentRow {
            experiment_key: "recommendation_strategy".to_string(),
            name: Some("Recommendation strategy".to_string()),
            variants_json: Some(r#"[{"name":"control","weight":70},{"name":"explore","weight":30}]"#.to_string()),
            enabled: true,
        },
        ExperimentRow {
            experiment_key: "checkout_cta".to_string(),
            name: Some("Checkout call to action".to_string()),
            variants_json: Some(r#"[{"name":"control","weight":50},{"name":"urgent","weight":50}]"#.to_string()),
            enabled: true,
        },
    ]
}

/// Load the demo catalog and experiments; returns how many bikes were written
pub fn seed_demo(store: &SqliteStore) -> store::Result<usize> {
    let bikes = demo_catalog();
    for bike in &bikes {
        store.upsert_bike(bike, true)?;
    }
    for experiment in demo_experiments() {
        store.upsert_experiment(&experiment)?;
    }
    info!("Seeded {} demo bikes", bikes.len());
    Ok(bikes.len())
}
