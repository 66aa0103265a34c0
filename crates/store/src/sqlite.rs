//! SQLite-backed implementation of every repository trait.

use crate::error::{Result, StoreError};
use crate::repository::*;
use crate::schema::SCHEMA;
use crate::types::*;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Durable store over a single SQLite connection.
///
/// All writes for one event go through one transaction, so readers never
/// observe an event without its rollups.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening store at {:?}", path);
        Self::bootstrap(Connection::open(path)?)
    }

    /// Fresh private database, used by tests and the benchmark command
    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|err| StoreError::Migration(err.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    match ms {
        None => Ok(None),
        Some(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
    }
}

fn count(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: Option<i64> = row.get(idx)?;
    Ok(value.unwrap_or(0).max(0) as u64)
}

// =============================================================================
// Events
// =============================================================================

const SESSION_BASE_COLUMNS: &str = "session_id, person_key, user_id, crm_lead_id, customer_email_hash, \
     customer_phone_hash, first_seen_at, last_seen_at, event_count, dwell_ms_sum, first_source_path, \
     last_source_path, entry_referrer, utm_source, utm_medium, utm_campaign, click_id, landing_path, is_bot";
const SESSION_STAGE_OFFSET: usize = 19;

fn apply_bike_delta(conn: &Connection, bike_id: BikeId, delta: BikeMetricDelta, now: i64) -> rusqlite::Result<usize> {
    match delta {
        BikeMetricDelta::Increment(counter) => {
            let column = counter.column();
            let sql = format!(
                "INSERT INTO bike_behavior_metrics (bike_id, {column}, updated_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(bike_id) DO UPDATE SET {column} = {column} + 1, updated_at = excluded.updated_at"
            );
            conn.execute(&sql, params![bike_id, now])
        }
        BikeMetricDelta::DwellMs(ms) => conn.execute(
            "INSERT INTO bike_behavior_metrics (bike_id, dwell_time_ms_sum, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(bike_id) DO UPDATE SET dwell_time_ms_sum = dwell_time_ms_sum + excluded.dwell_time_ms_sum,
                 updated_at = excluded.updated_at",
            params![bike_id, ms as i64, now],
        ),
    }
}

fn apply_session_delta(conn: &Connection, delta: &SessionFactDelta) -> rusqlite::Result<usize> {
    let seen = to_ms(delta.seen_at);
    conn.execute(
        "INSERT OR IGNORE INTO metrics_session_facts (session_id, first_seen_at, last_seen_at) VALUES (?1, ?2, ?2)",
        params![delta.session_id, seen],
    )?;

    let stage_clause = delta
        .stage
        .map(|stage| {
            let column = stage.column();
            format!(", {column} = {column} + 1")
        })
        .unwrap_or_default();
    let sql = format!(
        "UPDATE metrics_session_facts SET
            event_count = event_count + 1,
            first_seen_at = MIN(first_seen_at, ?2),
            last_seen_at = MAX(last_seen_at, ?2),
            person_key = COALESCE(?3, person_key),
            user_id = COALESCE(?4, user_id),
            crm_lead_id = COALESCE(?5, crm_lead_id),
            customer_email_hash = COALESCE(?6, customer_email_hash),
            customer_phone_hash = COALESCE(?7, customer_phone_hash),
            dwell_ms_sum = dwell_ms_sum + ?8,
            first_source_path = COALESCE(first_source_path, ?9),
            last_source_path = COALESCE(?9, last_source_path),
            entry_referrer = COALESCE(entry_referrer, ?10),
            utm_source = COALESCE(utm_source, ?11),
            utm_medium = COALESCE(utm_medium, ?12),
            utm_campaign = COALESCE(utm_campaign, ?13),
            click_id = COALESCE(click_id, ?14),
            landing_path = COALESCE(landing_path, ?15),
            is_bot = MAX(is_bot, ?16){stage_clause}
         WHERE session_id = ?1"
    );
    let attribution = &delta.attribution;
    conn.execute(
        &sql,
        params![
            delta.session_id,
            seen,
            delta.person_key,
            delta.user_id,
            delta.crm_lead_id,
            delta.customer_email_hash,
            delta.customer_phone_hash,
            delta.dwell_ms as i64,
            delta.source_path,
            delta.referrer,
            attribution.utm_source,
            attribution.utm_medium,
            attribution.utm_campaign,
            attribution.click_id,
            attribution.landing_path,
            delta.is_bot as i64,
        ],
    )
}

fn map_session_fact(row: &Row<'_>) -> rusqlite::Result<SessionFact> {
    let mut counters = BTreeMap::new();
    for (offset, stage) in FunnelStage::ALL.iter().enumerate() {
        counters.insert(*stage, count(row, SESSION_STAGE_OFFSET + offset)?);
    }
    Ok(SessionFact {
        session_id: row.get(0)?,
        person_key: row.get(1)?,
        user_id: row.get(2)?,
        crm_lead_id: row.get(3)?,
        customer_email_hash: row.get(4)?,
        customer_phone_hash: row.get(5)?,
        first_seen_at: ts(row, 6)?,
        last_seen_at: ts(row, 7)?,
        event_count: count(row, 8)?,
        dwell_ms_sum: count(row, 9)?,
        first_source_path: row.get(10)?,
        last_source_path: row.get(11)?,
        entry_referrer: row.get(12)?,
        attribution: Attribution {
            utm_source: row.get(13)?,
            utm_medium: row.get(14)?,
            utm_campaign: row.get(15)?,
            click_id: row.get(16)?,
            landing_path: row.get(17)?,
        },
        is_bot: row.get::<_, i64>(18)? != 0,
        counters: FunnelCounters(counters),
    })
}

const METRIC_COLUMNS: &str = "impressions, detail_clicks, hovers, gallery_swipes, favorites, add_to_cart, \
     shares, scroll_stops, orders, bounces, dwell_time_ms_sum";

fn map_metrics(row: &Row<'_>, bike_id: BikeId, offset: usize) -> rusqlite::Result<BikeBehaviorMetrics> {
    Ok(BikeBehaviorMetrics {
        bike_id,
        impressions: count(row, offset)?,
        detail_clicks: count(row, offset + 1)?,
        hovers: count(row, offset + 2)?,
        gallery_swipes: count(row, offset + 3)?,
        favorites: count(row, offset + 4)?,
        add_to_cart: count(row, offset + 5)?,
        shares: count(row, offset + 6)?,
        scroll_stops: count(row, offset + 7)?,
        orders: count(row, offset + 8)?,
        bounces: count(row, offset + 9)?,
        dwell_time_ms_sum: count(row, offset + 10)?,
    })
}

impl EventRepository for SqliteStore {
    fn event_exists(&self, session_id: &str, event_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM metric_events WHERE session_id = ?1 AND event_id = ?2",
                params![session_id, event_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn record_event(
        &self,
        event: &NormalizedEvent,
        bike_delta: Option<(BikeId, BikeMetricDelta)>,
        session_delta: Option<&SessionFactDelta>,
    ) -> Result<RecordOutcome> {
        let metadata_json =
            serde_json::to_string(&event.metadata).map_err(|err| StoreError::json("metadata_json", err))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO metric_events
                (event_type, raw_type, bike_id, session_id, event_id, user_id, person_key, value,
                 metadata_json, dwell_ms, source, source_path, referrer, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                event.event_type.as_str(),
                event.raw_type,
                event.bike_id,
                event.session_id,
                event.event_id,
                event.user_id,
                event.person_key,
                event.value,
                metadata_json,
                event.dwell_ms.map(|ms| ms as i64),
                event.source,
                event.source_path,
                event.referrer,
                to_ms(event.created_at),
            ],
        )?;
        if inserted == 0 {
            debug!(session_id = %event.session_id, event_id = ?event.event_id, "duplicate event skipped");
            return Ok(RecordOutcome::Duplicate);
        }

        if let Some((bike_id, delta)) = bike_delta {
            apply_bike_delta(&tx, bike_id, delta, to_ms(event.created_at))?;
        }
        if let Some(delta) = session_delta {
            apply_session_delta(&tx, delta)?;
        }
        tx.commit()?;
        Ok(RecordOutcome::Inserted)
    }

    fn record_search(&self, search: &SearchEvent) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO search_events
                (session_id, user_id, person_key, query, category, brand, min_price, max_price, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                search.session_id,
                search.user_id,
                search.person_key,
                search.query,
                search.category,
                search.brand,
                search.min_price,
                search.max_price,
                to_ms(search.created_at),
            ],
        )?;
        Ok(())
    }

    fn bike_metrics(&self, bike_id: BikeId) -> Result<Option<BikeBehaviorMetrics>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {METRIC_COLUMNS} FROM bike_behavior_metrics WHERE bike_id = ?1");
        let metrics = conn
            .query_row(&sql, params![bike_id], |row| map_metrics(row, bike_id, 0))
            .optional()?;
        Ok(metrics)
    }

    fn session_fact(&self, session_id: &str) -> Result<Option<SessionFact>> {
        let conn = self.conn()?;
        let stage_columns = FunnelStage::ALL
            .iter()
            .map(|stage| stage.column())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {SESSION_BASE_COLUMNS}, {stage_columns} FROM metrics_session_facts WHERE session_id = ?1"
        );
        let fact = conn
            .query_row(&sql, params![session_id], map_session_fact)
            .optional()?;
        Ok(fact)
    }

    fn event_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM metric_events", [], |row| row.get(0))?;
        Ok(total.max(0) as u64)
    }
}

// =============================================================================
// Identity
// =============================================================================

fn map_identity(row: &Row<'_>) -> rusqlite::Result<(String, IdentityNode)> {
    let raw_type: String = row.get(0)?;
    let node = IdentityNode {
        identity_type: IdentityType::Session,
        identity_value: row.get(1)?,
        person_key: row.get(2)?,
        user_id: row.get(3)?,
        session_id: row.get(4)?,
        crm_lead_id: row.get(5)?,
        first_seen_at: ts(row, 6)?,
        last_seen_at: ts(row, 7)?,
    };
    Ok((raw_type, node))
}

impl IdentityRepository for SqliteStore {
    fn find_identity(&self, identity_type: IdentityType, value: &str) -> Result<Option<IdentityNode>> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT identity_type, identity_value, person_key, user_id, session_id, crm_lead_id,
                        first_seen_at, last_seen_at
                 FROM crm_identity_nodes WHERE identity_type = ?1 AND identity_value = ?2",
                params![identity_type.as_str(), value],
                map_identity,
            )
            .optional()?;

        match found {
            None => Ok(None),
            Some((raw_type, mut node)) => {
                node.identity_type = IdentityType::parse(&raw_type).ok_or_else(|| StoreError::InvalidValue {
                    field: "identity_type".to_string(),
                    value: raw_type.clone(),
                })?;
                Ok(Some(node))
            }
        }
    }

    fn upsert_identity(
        &self,
        identity_type: IdentityType,
        value: &str,
        person_key: &str,
        refs: &IdentityRefs,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO crm_identity_nodes
                (identity_type, identity_value, person_key, user_id, session_id, crm_lead_id, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(identity_type, identity_value) DO UPDATE SET
                last_seen_at = MAX(last_seen_at, excluded.last_seen_at),
                user_id = COALESCE(user_id, excluded.user_id),
                session_id = COALESCE(session_id, excluded.session_id),
                crm_lead_id = COALESCE(crm_lead_id, excluded.crm_lead_id)",
            params![
                identity_type.as_str(),
                value,
                person_key,
                refs.user_id,
                refs.session_id,
                refs.crm_lead_id,
                to_ms(seen_at),
            ],
        )?;
        Ok(())
    }

    fn interactions_for_persons(&self, person_keys: &[String], limit: usize) -> Result<Vec<PersonInteraction>> {
        if person_keys.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; person_keys.len()].join(", ");
        let sql = format!(
            "SELECT e.event_type, e.created_at, b.id, b.brand, b.discipline, b.category, b.price
             FROM metric_events e
             LEFT JOIN bikes b ON b.id = e.bike_id
             WHERE e.person_key IN ({placeholders})
             ORDER BY e.created_at DESC, e.id DESC
             LIMIT {limit}"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(person_keys.iter()), |row| {
            let raw_type: String = row.get(0)?;
            let bike_id: Option<BikeId> = row.get(2)?;
            let bike = match bike_id {
                None => None,
                Some(id) => Some(BikeSnapshot {
                    id,
                    brand: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    discipline: row.get(4)?,
                    category: row.get(5)?,
                    price: row.get(6)?,
                }),
            };
            Ok(PersonInteraction {
                event_type: EventType::from_canonical(&raw_type),
                created_at: ts(row, 1)?,
                bike,
            })
        })?;
        let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collected)
    }

    fn searches_for_persons(&self, person_keys: &[String], limit: usize) -> Result<Vec<SearchEvent>> {
        if person_keys.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; person_keys.len()].join(", ");
        let sql = format!(
            "SELECT session_id, user_id, person_key, query, category, brand, min_price, max_price, created_at
             FROM search_events
             WHERE person_key IN ({placeholders})
             ORDER BY created_at DESC, id DESC
             LIMIT {limit}"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(person_keys.iter()), |row| {
            Ok(SearchEvent {
                session_id: row.get(0)?,
                user_id: row.get(1)?,
                person_key: row.get(2)?,
                query: row.get(3)?,
                category: row.get(4)?,
                brand: row.get(5)?,
                min_price: row.get(6)?,
                max_price: row.get(7)?,
                created_at: ts(row, 8)?,
            })
        })?;
        let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collected)
    }
}

// =============================================================================
// Feature store
// =============================================================================

fn encode_map(column: &str, map: &BTreeMap<String, f64>) -> Result<String> {
    serde_json::to_string(map).map_err(|err| StoreError::json(column, err))
}

fn decode_map(column: &str, raw: &str) -> Result<BTreeMap<String, f64>> {
    serde_json::from_str(raw).map_err(|err| StoreError::json(column, err))
}

impl ProfileRepository for SqliteStore {
    fn load_features(&self, person_key: &str) -> Result<Option<FeatureStore>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT discipline_embedding_json, brand_embedding_json, category_embedding_json,
                        weighted_average_price, budget_cluster, intent_score, recency_decay,
                        recency_half_life_hours, last_event_at, updated_at
                 FROM user_feature_store WHERE person_key = ?1",
                params![person_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        FeatureStore {
                            person_key: Some(person_key.to_string()),
                            discipline_embedding: BTreeMap::new(),
                            brand_embedding: BTreeMap::new(),
                            category_embedding: BTreeMap::new(),
                            weighted_average_price: row.get(3)?,
                            budget_cluster: row.get(4)?,
                            intent_score: row.get(5)?,
                            recency_decay: row.get(6)?,
                            recency_half_life_hours: row.get(7)?,
                            last_event_at: opt_ts(row, 8)?,
                            updated_at: ts(row, 9)?,
                        },
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((disciplines, brands, categories, mut features)) => {
                features.discipline_embedding = decode_map("discipline_embedding_json", &disciplines)?;
                features.brand_embedding = decode_map("brand_embedding_json", &brands)?;
                features.category_embedding = decode_map("category_embedding_json", &categories)?;
                Ok(Some(features))
            }
        }
    }

    fn save_features(&self, features: &FeatureStore) -> Result<()> {
        let Some(person_key) = features.person_key.as_deref() else {
            return Err(StoreError::InvalidValue {
                field: "person_key".to_string(),
                value: "<none>".to_string(),
            });
        };
        let disciplines = encode_map("discipline_embedding_json", &features.discipline_embedding)?;
        let brands = encode_map("brand_embedding_json", &features.brand_embedding)?;
        let categories = encode_map("category_embedding_json", &features.category_embedding)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_feature_store
                (person_key, discipline_embedding_json, brand_embedding_json, category_embedding_json,
                 weighted_average_price, budget_cluster, intent_score, recency_decay,
                 recency_half_life_hours, last_event_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(person_key) DO UPDATE SET
                discipline_embedding_json = excluded.discipline_embedding_json,
                brand_embedding_json = excluded.brand_embedding_json,
                category_embedding_json = excluded.category_embedding_json,
                weighted_average_price = excluded.weighted_average_price,
                budget_cluster = excluded.budget_cluster,
                intent_score = excluded.intent_score,
                recency_decay = excluded.recency_decay,
                recency_half_life_hours = excluded.recency_half_life_hours,
                last_event_at = excluded.last_event_at,
                updated_at = excluded.updated_at",
            params![
                person_key,
                disciplines,
                brands,
                categories,
                features.weighted_average_price,
                features.budget_cluster,
                features.intent_score,
                features.recency_decay,
                features.recency_half_life_hours,
                features.last_event_at.map(to_ms),
                to_ms(features.updated_at),
            ],
        )?;
        Ok(())
    }
}

// =============================================================================
// Experiments
// =============================================================================

fn map_experiment(row: &Row<'_>) -> rusqlite::Result<ExperimentRow> {
    Ok(ExperimentRow {
        experiment_key: row.get(0)?,
        name: row.get(1)?,
        variants_json: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
    })
}

fn map_assignment(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        experiment_key: row.get(0)?,
        subject_key: row.get(1)?,
        user_id: row.get(2)?,
        session_id: row.get(3)?,
        variant: row.get(4)?,
        assigned_at: ts(row, 5)?,
    })
}

const ASSIGNMENT_SELECT: &str = "SELECT experiment_key, subject_key, user_id, session_id, variant, assigned_at
     FROM ab_assignments WHERE experiment_key = ?1 AND subject_key = ?2";

impl ExperimentRepository for SqliteStore {
    fn experiment(&self, experiment_key: &str) -> Result<Option<ExperimentRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT experiment_key, name, variants_json, enabled FROM ab_experiments WHERE experiment_key = ?1",
                params![experiment_key],
                map_experiment,
            )
            .optional()?;
        Ok(row)
    }

    fn enabled_experiments(&self) -> Result<Vec<ExperimentRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT experiment_key, name, variants_json, enabled FROM ab_experiments
             WHERE enabled = 1 ORDER BY experiment_key ASC",
        )?;
        let rows = stmt.query_map([], map_experiment)?;
        let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collected)
    }

    fn upsert_experiment(&self, experiment: &ExperimentRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ab_experiments (experiment_key, name, variants_json, enabled) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(experiment_key) DO UPDATE SET
                name = excluded.name, variants_json = excluded.variants_json, enabled = excluded.enabled",
            params![
                experiment.experiment_key,
                experiment.name,
                experiment.variants_json,
                experiment.enabled as i64,
            ],
        )?;
        Ok(())
    }

    fn assignment(&self, experiment_key: &str, subject_key: &str) -> Result<Option<Assignment>> {
        let conn = self.conn()?;
        let found = conn
            .query_row(ASSIGNMENT_SELECT, params![experiment_key, subject_key], map_assignment)
            .optional()?;
        Ok(found)
    }

    fn insert_assignment(&self, assignment: &Assignment) -> Result<Assignment> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO ab_assignments (experiment_key, subject_key, user_id, session_id, variant, assigned_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                assignment.experiment_key,
                assignment.subject_key,
                assignment.user_id,
                assignment.session_id,
                assignment.variant,
                to_ms(assignment.assigned_at),
            ],
        )?;
        let stored = conn.query_row(
            ASSIGNMENT_SELECT,
            params![assignment.experiment_key, assignment.subject_key],
            map_assignment,
        )?;
        Ok(stored)
    }

    fn assignment_counts_since(&self, experiment_key: &str, since: DateTime<Utc>) -> Result<Vec<VariantCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT variant, COUNT(*) FROM ab_assignments
             WHERE experiment_key = ?1 AND assigned_at >= ?2
             GROUP BY variant ORDER BY variant",
        )?;
        let rows = stmt.query_map(params![experiment_key, to_ms(since)], |row| {
            Ok(VariantCount {
                variant: row.get(0)?,
                count: count(row, 1)?,
            })
        })?;
        let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collected)
    }

    fn goal_totals_since(&self, experiment_key: &str, since: DateTime<Utc>) -> Result<Vec<GoalTotal>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT variant, metric_name, COALESCE(SUM(value), 0) FROM ab_goal_events
             WHERE experiment_key = ?1 AND created_at >= ?2
             GROUP BY variant, metric_name ORDER BY variant, metric_name",
        )?;
        let rows = stmt.query_map(params![experiment_key, to_ms(since)], |row| {
            Ok(GoalTotal {
                variant: row.get(0)?,
                metric_name: row.get(1)?,
                total: row.get(2)?,
            })
        })?;
        let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collected)
    }

    fn insert_goal(&self, goal: &GoalEvent) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ab_goal_events (experiment_key, variant, metric_name, bike_id, user_id, session_id, value, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                goal.experiment_key,
                goal.variant,
                goal.metric_name,
                goal.bike_id,
                goal.subject.user_id,
                goal.subject.session_id,
                goal.value,
                to_ms(goal.created_at),
            ],
        )?;
        Ok(())
    }
}

// =============================================================================
// Catalog
// =============================================================================

const BIKE_COLUMNS: &str = "b.id, b.name, b.brand, b.model, b.discipline, b.category, b.price, b.rank, \
     b.main_image, b.images_json, m.impressions, m.detail_clicks, m.hovers, m.gallery_swipes, m.favorites, \
     m.add_to_cart, m.shares, m.scroll_stops, m.orders, m.bounces, m.dwell_time_ms_sum";

fn map_bike(row: &Row<'_>) -> rusqlite::Result<(CatalogBike, String)> {
    let id: BikeId = row.get(0)?;
    let bike = CatalogBike {
        id,
        name: row.get(1)?,
        brand: row.get(2)?,
        model: row.get(3)?,
        discipline: row.get(4)?,
        category: row.get(5)?,
        price: row.get(6)?,
        rank: row.get(7)?,
        main_image: row.get(8)?,
        images: Vec::new(),
        behavior: map_metrics(row, id, 10)?,
    };
    Ok((bike, row.get(9)?))
}

fn attach_images(rows: Vec<(CatalogBike, String)>) -> Result<Vec<CatalogBike>> {
    rows.into_iter()
        .map(|(mut bike, images_json)| {
            bike.images = serde_json::from_str(&images_json).map_err(|err| StoreError::json("images_json", err))?;
            Ok(bike)
        })
        .collect()
}

fn lowered(values: &[String]) -> Vec<Value> {
    values
        .iter()
        .map(|value| Value::Text(value.trim().to_lowercase()))
        .collect()
}

impl CatalogRepository for SqliteStore {
    fn query_bikes(&self, query: &BikeQuery) -> Result<Vec<CatalogBike>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let (clause, values): (String, Vec<Value>) = match &query.filter {
            BikeFilter::All => (String::new(), Vec::new()),
            BikeFilter::Disciplines(names) | BikeFilter::Brands(names) if names.is_empty() => {
                return Ok(Vec::new());
            }
            BikeFilter::Disciplines(names) => (
                format!(
                    " AND LOWER(TRIM(COALESCE(NULLIF(TRIM(b.discipline), ''), b.category, ''))) IN ({})",
                    vec!["?"; names.len()].join(", ")
                ),
                lowered(names),
            ),
            BikeFilter::Brands(names) => (
                format!(" AND LOWER(TRIM(b.brand)) IN ({})", vec!["?"; names.len()].join(", ")),
                lowered(names),
            ),
            BikeFilter::PriceBand { min, max } => (
                " AND b.price >= ? AND b.price <= ?".to_string(),
                vec![Value::Real(*min), Value::Real(*max)],
            ),
        };
        let order = match query.order {
            BikeOrder::RankDesc => "b.rank DESC, b.id ASC",
            BikeOrder::IdAsc => "b.id ASC",
        };
        let sql = format!(
            "SELECT {BIKE_COLUMNS} FROM bikes b
             LEFT JOIN bike_behavior_metrics m ON m.bike_id = b.id
             WHERE b.is_active = 1{clause}
             ORDER BY {order}
             LIMIT {}",
            query.limit
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), map_bike)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        attach_images(rows)
    }

    fn bike(&self, bike_id: BikeId) -> Result<Option<CatalogBike>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {BIKE_COLUMNS} FROM bikes b
             LEFT JOIN bike_behavior_metrics m ON m.bike_id = b.id
             WHERE b.id = ?1"
        );
        let row = conn.query_row(&sql, params![bike_id], map_bike).optional()?;
        Ok(attach_images(row.into_iter().collect())?.pop())
    }

    fn upsert_bike(&self, bike: &CatalogBike, active: bool) -> Result<()> {
        let images_json = serde_json::to_string(&bike.images).map_err(|err| StoreError::json("images_json", err))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bikes (id, name, brand, model, discipline, category, price, rank, main_image, images_json, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, brand = excluded.brand, model = excluded.model,
                discipline = excluded.discipline, category = excluded.category, price = excluded.price,
                rank = excluded.rank, main_image = excluded.main_image, images_json = excluded.images_json,
                is_active = excluded.is_active",
            params![
                bike.id,
                bike.name,
                bike.brand,
                bike.model,
                bike.discipline,
                bike.category,
                bike.price,
                bike.rank,
                bike.main_image,
                images_json,
                active as i64,
            ],
        )?;
        Ok(())
    }
}
