//! Table definitions. Every statement is idempotent.

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bikes (
    id              INTEGER PRIMARY KEY,
    name            TEXT NOT NULL,
    brand           TEXT NOT NULL DEFAULT '',
    model           TEXT,
    discipline      TEXT,
    category        TEXT,
    price           REAL NOT NULL DEFAULT 0,
    rank            REAL NOT NULL DEFAULT 0,
    main_image      TEXT,
    images_json     TEXT NOT NULL DEFAULT '[]',
    is_active       INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS bike_behavior_metrics (
    bike_id             INTEGER PRIMARY KEY,
    impressions         INTEGER NOT NULL DEFAULT 0,
    detail_clicks       INTEGER NOT NULL DEFAULT 0,
    hovers              INTEGER NOT NULL DEFAULT 0,
    gallery_swipes      INTEGER NOT NULL DEFAULT 0,
    favorites           INTEGER NOT NULL DEFAULT 0,
    add_to_cart         INTEGER NOT NULL DEFAULT 0,
    shares              INTEGER NOT NULL DEFAULT 0,
    scroll_stops        INTEGER NOT NULL DEFAULT 0,
    orders              INTEGER NOT NULL DEFAULT 0,
    bounces             INTEGER NOT NULL DEFAULT 0,
    dwell_time_ms_sum   INTEGER NOT NULL DEFAULT 0,
    updated_at          INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS metric_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type      TEXT NOT NULL,
    raw_type        TEXT NOT NULL,
    bike_id         INTEGER,
    session_id      TEXT NOT NULL,
    event_id        TEXT,
    user_id         INTEGER,
    person_key      TEXT,
    value           REAL NOT NULL DEFAULT 1,
    metadata_json   TEXT NOT NULL DEFAULT '{}',
    dwell_ms        INTEGER,
    source          TEXT,
    source_path     TEXT,
    referrer        TEXT,
    created_at      INTEGER NOT NULL,
    UNIQUE (session_id, event_id)
);
CREATE INDEX IF NOT EXISTS idx_metric_events_person ON metric_events (person_key, created_at);

CREATE TABLE IF NOT EXISTS search_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      TEXT,
    user_id         INTEGER,
    person_key      TEXT,
    query           TEXT,
    category        TEXT,
    brand           TEXT,
    min_price       REAL,
    max_price       REAL,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_search_events_person ON search_events (person_key, created_at);

CREATE TABLE IF NOT EXISTS metrics_session_facts (
    session_id                  TEXT PRIMARY KEY,
    person_key                  TEXT,
    user_id                     INTEGER,
    crm_lead_id                 TEXT,
    customer_email_hash         TEXT,
    customer_phone_hash         TEXT,
    first_seen_at               INTEGER NOT NULL,
    last_seen_at                INTEGER NOT NULL,
    event_count                 INTEGER NOT NULL DEFAULT 0,
    page_views                  INTEGER NOT NULL DEFAULT 0,
    first_clicks                INTEGER NOT NULL DEFAULT 0,
    catalog_views               INTEGER NOT NULL DEFAULT 0,
    product_views               INTEGER NOT NULL DEFAULT 0,
    add_to_cart                 INTEGER NOT NULL DEFAULT 0,
    checkout_starts             INTEGER NOT NULL DEFAULT 0,
    checkout_steps              INTEGER NOT NULL DEFAULT 0,
    checkout_validation_errors  INTEGER NOT NULL DEFAULT 0,
    checkout_submit_attempts    INTEGER NOT NULL DEFAULT 0,
    checkout_submit_success     INTEGER NOT NULL DEFAULT 0,
    checkout_submit_failed      INTEGER NOT NULL DEFAULT 0,
    forms_seen                  INTEGER NOT NULL DEFAULT 0,
    forms_first_input           INTEGER NOT NULL DEFAULT 0,
    form_submit_attempts        INTEGER NOT NULL DEFAULT 0,
    form_validation_errors      INTEGER NOT NULL DEFAULT 0,
    booking_starts              INTEGER NOT NULL DEFAULT 0,
    booking_success             INTEGER NOT NULL DEFAULT 0,
    orders                      INTEGER NOT NULL DEFAULT 0,
    dwell_ms_sum                INTEGER NOT NULL DEFAULT 0,
    first_source_path           TEXT,
    last_source_path            TEXT,
    entry_referrer              TEXT,
    utm_source                  TEXT,
    utm_medium                  TEXT,
    utm_campaign                TEXT,
    click_id                    TEXT,
    landing_path                TEXT,
    is_bot                      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS crm_identity_nodes (
    identity_type   TEXT NOT NULL,
    identity_value  TEXT NOT NULL,
    person_key      TEXT NOT NULL,
    user_id         INTEGER,
    session_id      TEXT,
    crm_lead_id     TEXT,
    first_seen_at   INTEGER NOT NULL,
    last_seen_at    INTEGER NOT NULL,
    PRIMARY KEY (identity_type, identity_value)
);
CREATE INDEX IF NOT EXISTS idx_identity_person ON crm_identity_nodes (person_key);

CREATE TABLE IF NOT EXISTS user_feature_store (
    person_key                  TEXT PRIMARY KEY,
    discipline_embedding_json   TEXT NOT NULL DEFAULT '{}',
    brand_embedding_json        TEXT NOT NULL DEFAULT '{}',
    category_embedding_json     TEXT NOT NULL DEFAULT '{}',
    weighted_average_price      REAL NOT NULL DEFAULT 0,
    budget_cluster              TEXT NOT NULL DEFAULT 'unknown',
    intent_score                REAL NOT NULL DEFAULT 0,
    recency_decay               REAL NOT NULL DEFAULT 1,
    recency_half_life_hours     REAL NOT NULL DEFAULT 168,
    last_event_at               INTEGER,
    updated_at                  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ab_experiments (
    experiment_key  TEXT PRIMARY KEY,
    name            TEXT,
    variants_json   TEXT,
    enabled         INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS ab_assignments (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_key  TEXT NOT NULL,
    subject_key     TEXT NOT NULL,
    user_id         INTEGER,
    session_id      TEXT,
    variant         TEXT NOT NULL,
    assigned_at     INTEGER NOT NULL,
    UNIQUE (experiment_key, subject_key)
);

CREATE TABLE IF NOT EXISTS ab_goal_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_key  TEXT NOT NULL,
    variant         TEXT NOT NULL,
    metric_name     TEXT NOT NULL,
    bike_id         INTEGER,
    user_id         INTEGER,
    session_id      TEXT,
    value           REAL NOT NULL DEFAULT 1,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_goal_events_key ON ab_goal_events (experiment_key, created_at);
"#;
