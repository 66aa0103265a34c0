use serde::{Deserialize, Serialize};
use store::{BikeId, ExperimentRow, UserId};

/// One arm of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub weight: f64,
}

impl Variant {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Enabled experiment with its parsed variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub experiment_key: String,
    pub name: String,
    pub variants: Vec<Variant>,
}

impl From<ExperimentRow> for Experiment {
    fn from(row: ExperimentRow) -> Self {
        Self {
            variants: parse_variants(row.variants_json.as_deref()),
            name: row.name.unwrap_or_else(|| row.experiment_key.clone()),
            experiment_key: row.experiment_key,
        }
    }
}

fn default_variants() -> Vec<Variant> {
    vec![Variant::new("control", 50.0), Variant::new("treatment", 50.0)]
}

#[derive(Deserialize)]
struct LooseVariant {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    weight: Option<serde_json::Value>,
}

/// Parse a stored variants list.
///
/// Missing, malformed or empty lists default to control 50 / treatment 50.
/// Blank names become `variant`, non-numeric weights become 1, and
/// non-positive weights are dropped.
pub fn parse_variants(raw: Option<&str>) -> Vec<Variant> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return default_variants();
    };
    let Ok(parsed) = serde_json::from_str::<Vec<LooseVariant>>(raw) else {
        return default_variants();
    };
    if parsed.is_empty() {
        return default_variants();
    }

    let variants: Vec<Variant> = parsed
        .into_iter()
        .map(|item| {
            let name = item
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "variant".to_string());
            let weight = match item.weight {
                Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(1.0),
                Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().unwrap_or(1.0),
                _ => 1.0,
            };
            Variant::new(name, weight)
        })
        .filter(|variant| variant.weight.is_finite() && variant.weight > 0.0)
        .collect();

    if variants.is_empty() { default_variants() } else { variants }
}

/// Who is being assigned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
}

impl Subject {
    /// `user:<id>` when a user is known, otherwise `session:<id>`
    pub fn key(&self) -> Option<String> {
        if let Some(id) = self.user_id {
            return Some(format!("user:{id}"));
        }
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("session:{s}"))
    }
}

/// Goal reported by storefront or checkout flows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalInput {
    pub experiment_key: String,
    #[serde(default)]
    pub variant: Option<String>,
    pub metric_name: String,
    #[serde(default)]
    pub bike_id: Option<BikeId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
}
