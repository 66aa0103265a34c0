//! Core domain types for the personalization store.
//!
//! Everything that crosses the repository boundary lives here: events and
//! their rollups, identity nodes, feature-store rows, experiment rows, and the
//! read-only catalog view of a bike.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Type Aliases
// =============================================================================

/// Catalog identifier of a bike listing
pub type BikeId = i64;

/// Marketplace account identifier
pub type UserId = i64;

// =============================================================================
// Events
// =============================================================================

/// Canonical behavioral event vocabulary.
///
/// Free-form client types are folded onto these names during ingestion.
/// Anything that does not map is kept verbatim as `Unknown` so it is still
/// persisted, but it never touches an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Impression,
    DetailOpen,
    ProductView,
    Hover,
    GallerySwipe,
    Favorite,
    AddToCart,
    Share,
    ScrollStop,
    Dwell,
    Order,
    Bounce,
    PageView,
    FirstClick,
    CatalogView,
    CheckoutStart,
    CheckoutStep,
    CheckoutValidationError,
    CheckoutSubmitAttempt,
    CheckoutSubmitSuccess,
    CheckoutSubmitFailed,
    CheckoutAbandon,
    FormSeen,
    FormFirstInput,
    FormSubmitAttempt,
    FormValidationError,
    BookingStart,
    BookingSuccess,
    Unknown(String),
}

impl EventType {
    /// Every canonical (non-`Unknown`) variant
    pub const CANONICAL: [EventType; 28] = [
        EventType::Impression,
        EventType::DetailOpen,
        EventType::ProductView,
        EventType::Hover,
        EventType::GallerySwipe,
        EventType::Favorite,
        EventType::AddToCart,
        EventType::Share,
        EventType::ScrollStop,
        EventType::Dwell,
        EventType::Order,
        EventType::Bounce,
        EventType::PageView,
        EventType::FirstClick,
        EventType::CatalogView,
        EventType::CheckoutStart,
        EventType::CheckoutStep,
        EventType::CheckoutValidationError,
        EventType::CheckoutSubmitAttempt,
        EventType::CheckoutSubmitSuccess,
        EventType::CheckoutSubmitFailed,
        EventType::CheckoutAbandon,
        EventType::FormSeen,
        EventType::FormFirstInput,
        EventType::FormSubmitAttempt,
        EventType::FormValidationError,
        EventType::BookingStart,
        EventType::BookingSuccess,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventType::Impression => "impression",
            EventType::DetailOpen => "detail_open",
            EventType::ProductView => "product_view",
            EventType::Hover => "hover",
            EventType::GallerySwipe => "gallery_swipe",
            EventType::Favorite => "favorite",
            EventType::AddToCart => "add_to_cart",
            EventType::Share => "share",
            EventType::ScrollStop => "scroll_stop",
            EventType::Dwell => "dwell",
            EventType::Order => "order",
            EventType::Bounce => "bounce",
            EventType::PageView => "page_view",
            EventType::FirstClick => "first_click",
            EventType::CatalogView => "catalog_view",
            EventType::CheckoutStart => "checkout_start",
            EventType::CheckoutStep => "checkout_step",
            EventType::CheckoutValidationError => "checkout_validation_error",
            EventType::CheckoutSubmitAttempt => "checkout_submit_attempt",
            EventType::CheckoutSubmitSuccess => "checkout_submit_success",
            EventType::CheckoutSubmitFailed => "checkout_submit_failed",
            EventType::CheckoutAbandon => "checkout_abandon",
            EventType::FormSeen => "form_seen",
            EventType::FormFirstInput => "form_first_input",
            EventType::FormSubmitAttempt => "form_submit_attempt",
            EventType::FormValidationError => "form_validation_error",
            EventType::BookingStart => "booking_start",
            EventType::BookingSuccess => "booking_success",
            EventType::Unknown(raw) => raw.as_str(),
        }
    }

    /// Map a canonical name back to its variant; anything else is `Unknown`
    pub fn from_canonical(name: &str) -> Self {
        Self::CANONICAL
            .iter()
            .find(|candidate| candidate.as_str() == name)
            .cloned()
            .unwrap_or_else(|| EventType::Unknown(name.to_string()))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Unknown(_))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        EventType::from_canonical(&value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

/// First-touch marketing attribution carried by an event or a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Attribution {
    #[serde(default, alias = "utmSource", skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, alias = "utmMedium", skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, alias = "utmCampaign", skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, alias = "clickId", skip_serializing_if = "Option::is_none")]
    pub click_id: Option<String>,
    #[serde(default, alias = "landingPath", skip_serializing_if = "Option::is_none")]
    pub landing_path: Option<String>,
}

impl Attribution {
    pub fn is_empty(&self) -> bool {
        self.utm_source.is_none()
            && self.utm_medium.is_none()
            && self.utm_campaign.is_none()
            && self.click_id.is_none()
            && self.landing_path.is_none()
    }

    /// Fill every missing field from `other`, keeping values already present
    pub fn fill_from(&mut self, other: &Attribution) {
        fn fill(slot: &mut Option<String>, value: &Option<String>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }
        fill(&mut self.utm_source, &other.utm_source);
        fill(&mut self.utm_medium, &other.utm_medium);
        fill(&mut self.utm_campaign, &other.utm_campaign);
        fill(&mut self.click_id, &other.click_id);
        fill(&mut self.landing_path, &other.landing_path);
    }
}

/// Typed metadata schema accepted on raw events.
///
/// Unknown keys are rejected at decode time so arbitrary payloads cannot
/// leak into the event table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventMetadata {
    #[serde(default, alias = "utmSource", skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, alias = "utmMedium", skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, alias = "utmCampaign", skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, alias = "clickId", skip_serializing_if = "Option::is_none")]
    pub click_id: Option<String>,
    #[serde(default, alias = "landingPath", skip_serializing_if = "Option::is_none")]
    pub landing_path: Option<String>,
    /// Nested attribution block, as sent by the storefront tracker
    #[serde(default, rename = "attribution", skip_serializing_if = "Option::is_none")]
    pub nested_attribution: Option<Attribution>,
    #[serde(default, alias = "crmLeadId", alias = "lead_id", alias = "leadId", skip_serializing_if = "Option::is_none")]
    pub crm_lead_id: Option<String>,
    #[serde(default, alias = "customerEmail", alias = "email", skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default, alias = "customerPhone", alias = "phone", skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(default, alias = "customerEmailHash", skip_serializing_if = "Option::is_none")]
    pub customer_email_hash: Option<String>,
    #[serde(default, alias = "customerPhoneHash", skip_serializing_if = "Option::is_none")]
    pub customer_phone_hash: Option<String>,
    /// Position of the bike in the list it was shown in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    /// Surface that produced the event (catalog, recommendations, search)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, alias = "orderId", skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

impl EventMetadata {
    /// Flat attribution keys win over the nested block
    pub fn effective_attribution(&self) -> Attribution {
        let mut attribution = Attribution {
            utm_source: self.utm_source.clone(),
            utm_medium: self.utm_medium.clone(),
            utm_campaign: self.utm_campaign.clone(),
            click_id: self.click_id.clone(),
            landing_path: self.landing_path.clone(),
        };
        if let Some(nested) = &self.nested_attribution {
            attribution.fill_from(nested);
        }
        attribution
    }
}

/// An accepted, canonicalized event ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub event_type: EventType,
    /// Type string exactly as the client sent it
    pub raw_type: String,
    pub bike_id: Option<BikeId>,
    pub session_id: String,
    pub user_id: Option<UserId>,
    pub person_key: Option<String>,
    pub value: f64,
    pub metadata: EventMetadata,
    pub dwell_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub source: Option<String>,
    pub source_path: Option<String>,
    pub referrer: Option<String>,
    pub event_id: Option<String>,
}

/// Result of writing one event through the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// `(session_id, event_id)` already existed; nothing was written
    Duplicate,
}

// =============================================================================
// Rollups
// =============================================================================

/// Per-bike counter that a single event can bump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BikeCounter {
    Impressions,
    DetailClicks,
    Hovers,
    GallerySwipes,
    Favorites,
    AddToCart,
    Shares,
    ScrollStops,
    Orders,
    Bounces,
}

impl BikeCounter {
    pub(crate) fn column(self) -> &'static str {
        match self {
            BikeCounter::Impressions => "impressions",
            BikeCounter::DetailClicks => "detail_clicks",
            BikeCounter::Hovers => "hovers",
            BikeCounter::GallerySwipes => "gallery_swipes",
            BikeCounter::Favorites => "favorites",
            BikeCounter::AddToCart => "add_to_cart",
            BikeCounter::Shares => "shares",
            BikeCounter::ScrollStops => "scroll_stops",
            BikeCounter::Orders => "orders",
            BikeCounter::Bounces => "bounces",
        }
    }
}

/// Change one event applies to a bike's behavior rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BikeMetricDelta {
    Increment(BikeCounter),
    DwellMs(u64),
}

/// Monotonically non-decreasing behavior counters for one bike
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BikeBehaviorMetrics {
    pub bike_id: BikeId,
    pub impressions: u64,
    pub detail_clicks: u64,
    pub hovers: u64,
    pub gallery_swipes: u64,
    pub favorites: u64,
    pub add_to_cart: u64,
    pub shares: u64,
    pub scroll_stops: u64,
    pub orders: u64,
    pub bounces: u64,
    pub dwell_time_ms_sum: u64,
}

impl BikeBehaviorMetrics {
    pub fn empty(bike_id: BikeId) -> Self {
        Self {
            bike_id,
            ..Self::default()
        }
    }

    /// Average dwell per detail open, 0 when the bike was never opened
    pub fn avg_dwell_ms(&self) -> u64 {
        if self.detail_clicks == 0 {
            0
        } else {
            self.dwell_time_ms_sum / self.detail_clicks
        }
    }
}

/// Funnel stage counted on a session fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    PageView,
    FirstClick,
    CatalogView,
    ProductView,
    AddToCart,
    CheckoutStart,
    CheckoutStep,
    CheckoutValidationError,
    CheckoutSubmitAttempt,
    CheckoutSubmitSuccess,
    CheckoutSubmitFailed,
    FormSeen,
    FormFirstInput,
    FormSubmitAttempt,
    FormValidationError,
    BookingStart,
    BookingSuccess,
    Order,
}

impl FunnelStage {
    pub const ALL: [FunnelStage; 18] = [
        FunnelStage::PageView,
        FunnelStage::FirstClick,
        FunnelStage::CatalogView,
        FunnelStage::ProductView,
        FunnelStage::AddToCart,
        FunnelStage::CheckoutStart,
        FunnelStage::CheckoutStep,
        FunnelStage::CheckoutValidationError,
        FunnelStage::CheckoutSubmitAttempt,
        FunnelStage::CheckoutSubmitSuccess,
        FunnelStage::CheckoutSubmitFailed,
        FunnelStage::FormSeen,
        FunnelStage::FormFirstInput,
        FunnelStage::FormSubmitAttempt,
        FunnelStage::FormValidationError,
        FunnelStage::BookingStart,
        FunnelStage::BookingSuccess,
        FunnelStage::Order,
    ];

    pub(crate) fn column(self) -> &'static str {
        match self {
            FunnelStage::PageView => "page_views",
            FunnelStage::FirstClick => "first_clicks",
            FunnelStage::CatalogView => "catalog_views",
            FunnelStage::ProductView => "product_views",
            FunnelStage::AddToCart => "add_to_cart",
            FunnelStage::CheckoutStart => "checkout_starts",
            FunnelStage::CheckoutStep => "checkout_steps",
            FunnelStage::CheckoutValidationError => "checkout_validation_errors",
            FunnelStage::CheckoutSubmitAttempt => "checkout_submit_attempts",
            FunnelStage::CheckoutSubmitSuccess => "checkout_submit_success",
            FunnelStage::CheckoutSubmitFailed => "checkout_submit_failed",
            FunnelStage::FormSeen => "forms_seen",
            FunnelStage::FormFirstInput => "forms_first_input",
            FunnelStage::FormSubmitAttempt => "form_submit_attempts",
            FunnelStage::FormValidationError => "form_validation_errors",
            FunnelStage::BookingStart => "booking_starts",
            FunnelStage::BookingSuccess => "booking_success",
            FunnelStage::Order => "orders",
        }
    }
}

/// Per-stage counters of one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelCounters(pub BTreeMap<FunnelStage, u64>);

impl FunnelCounters {
    pub fn get(&self, stage: FunnelStage) -> u64 {
        self.0.get(&stage).copied().unwrap_or(0)
    }
}

/// Change one event applies to its session fact row
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFactDelta {
    pub session_id: String,
    pub person_key: Option<String>,
    pub user_id: Option<UserId>,
    pub crm_lead_id: Option<String>,
    pub customer_email_hash: Option<String>,
    pub customer_phone_hash: Option<String>,
    pub seen_at: DateTime<Utc>,
    pub stage: Option<FunnelStage>,
    pub dwell_ms: u64,
    pub source_path: Option<String>,
    pub referrer: Option<String>,
    pub attribution: Attribution,
    pub is_bot: bool,
}

/// Rolled-up facts about one browsing session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFact {
    pub session_id: String,
    pub person_key: Option<String>,
    pub user_id: Option<UserId>,
    pub crm_lead_id: Option<String>,
    pub customer_email_hash: Option<String>,
    pub customer_phone_hash: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub event_count: u64,
    pub counters: FunnelCounters,
    pub dwell_ms_sum: u64,
    pub first_source_path: Option<String>,
    pub last_source_path: Option<String>,
    pub entry_referrer: Option<String>,
    pub attribution: Attribution,
    pub is_bot: bool,
}

// =============================================================================
// Identity
// =============================================================================

/// Kind of touchpoint that can be linked to a person
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityType {
    Session,
    User,
    CrmLead,
    EmailHash,
    PhoneHash,
}

impl IdentityType {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityType::Session => "session",
            IdentityType::User => "user",
            IdentityType::CrmLead => "crm_lead",
            IdentityType::EmailHash => "email_hash",
            IdentityType::PhoneHash => "phone_hash",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "session" => Some(IdentityType::Session),
            "user" => Some(IdentityType::User),
            "crm_lead" => Some(IdentityType::CrmLead),
            "email_hash" => Some(IdentityType::EmailHash),
            "phone_hash" => Some(IdentityType::PhoneHash),
            _ => None,
        }
    }
}

/// Reference fields stored next to an identity node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRefs {
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    pub crm_lead_id: Option<String>,
}

/// One touchpoint linked to a person key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityNode {
    pub identity_type: IdentityType,
    pub identity_value: String,
    pub person_key: String,
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    pub crm_lead_id: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

// =============================================================================
// Profile / Feature store
// =============================================================================

/// Catalog attributes of a bike a person interacted with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BikeSnapshot {
    pub id: BikeId,
    pub brand: String,
    pub discipline: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
}

/// A persisted event of a person joined with the bike it touched
#[derive(Debug, Clone, PartialEq)]
pub struct PersonInteraction {
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub bike: Option<BikeSnapshot>,
}

/// A storefront search with its filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchEvent {
    pub session_id: Option<String>,
    pub user_id: Option<UserId>,
    pub person_key: Option<String>,
    pub query: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Materialized per-person features used by scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStore {
    pub person_key: Option<String>,
    pub discipline_embedding: BTreeMap<String, f64>,
    pub brand_embedding: BTreeMap<String, f64>,
    pub category_embedding: BTreeMap<String, f64>,
    pub weighted_average_price: f64,
    pub budget_cluster: String,
    pub intent_score: f64,
    pub recency_decay: f64,
    pub recency_half_life_hours: f64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl FeatureStore {
    /// Label used when the weighted price is unknown
    pub const UNKNOWN_CLUSTER: &'static str = "unknown";

    pub fn neutral(person_key: Option<String>) -> Self {
        Self {
            person_key,
            discipline_embedding: BTreeMap::new(),
            brand_embedding: BTreeMap::new(),
            category_embedding: BTreeMap::new(),
            weighted_average_price: 0.0,
            budget_cluster: Self::UNKNOWN_CLUSTER.to_string(),
            intent_score: 0.0,
            recency_decay: 1.0,
            recency_half_life_hours: 168.0,
            last_event_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Aggregated behavior profile of one person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub person_key: Option<String>,
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    /// Raw (decayed) interaction weight per discipline
    pub disciplines: BTreeMap<String, f64>,
    pub brands: BTreeMap<String, f64>,
    pub categories: BTreeMap<String, f64>,
    pub price_sum: f64,
    pub price_weight: f64,
    pub weighted_average_price: f64,
    pub intent_score: f64,
    pub interaction_count: usize,
    pub last_event_at: Option<DateTime<Utc>>,
    pub feature_store: FeatureStore,
}

impl Profile {
    /// Zero-affinity profile returned when nothing is known about a subject
    pub fn neutral(user_id: Option<UserId>, session_id: Option<String>) -> Self {
        Self {
            person_key: None,
            user_id,
            session_id,
            disciplines: BTreeMap::new(),
            brands: BTreeMap::new(),
            categories: BTreeMap::new(),
            price_sum: 0.0,
            price_weight: 0.0,
            weighted_average_price: 0.0,
            intent_score: 0.0,
            interaction_count: 0,
            last_event_at: None,
            feature_store: FeatureStore::neutral(None),
        }
    }
}

// =============================================================================
// Experiments
// =============================================================================

/// Experiment definition as stored; variants are parsed by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRow {
    pub experiment_key: String,
    pub name: Option<String>,
    pub variants_json: Option<String>,
    pub enabled: bool,
}

/// Persisted variant assignment of one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub experiment_key: String,
    pub subject_key: String,
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    pub variant: String,
    pub assigned_at: DateTime<Utc>,
}

/// Who a goal event is attributed to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRefs {
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
}

/// Append-only experiment outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalEvent {
    pub experiment_key: String,
    pub variant: String,
    pub metric_name: String,
    pub bike_id: Option<BikeId>,
    pub subject: SubjectRefs,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

/// Assignment count of a variant inside a lookback window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantCount {
    pub variant: String,
    pub count: u64,
}

/// Summed goal value of a (variant, metric) pair inside a lookback window
#[derive(Debug, Clone, PartialEq)]
pub struct GoalTotal {
    pub variant: String,
    pub metric_name: String,
    pub total: f64,
}

// =============================================================================
// Catalog (read-only collaborator)
// =============================================================================

/// A bike listing as seen by retrieval and scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogBike {
    pub id: BikeId,
    pub name: String,
    pub brand: String,
    pub model: Option<String>,
    pub discipline: Option<String>,
    pub category: Option<String>,
    pub price: f64,
    pub rank: f64,
    pub main_image: Option<String>,
    pub images: Vec<String>,
    pub behavior: BikeBehaviorMetrics,
}

impl CatalogBike {
    /// Discipline, falling back to category when the discipline is blank
    pub fn discipline_label(&self) -> &str {
        non_blank(self.discipline.as_deref())
            .or_else(|| non_blank(self.category.as_deref()))
            .unwrap_or("")
    }

    pub fn category_label(&self) -> &str {
        non_blank(self.category.as_deref()).unwrap_or("")
    }

    pub fn brand_label(&self) -> &str {
        self.brand.trim()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Row filter of a catalog retrieval query
#[derive(Debug, Clone, PartialEq)]
pub enum BikeFilter {
    All,
    Disciplines(Vec<String>),
    Brands(Vec<String>),
    PriceBand { min: f64, max: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BikeOrder {
    RankDesc,
    IdAsc,
}

/// One retrieval query against the active catalog
#[derive(Debug, Clone, PartialEq)]
pub struct BikeQuery {
    pub filter: BikeFilter,
    pub order: BikeOrder,
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trips_canonical_names() {
        for event_type in EventType::CANONICAL.iter() {
            assert_eq!(&EventType::from_canonical(event_type.as_str()), event_type);
        }
        assert_eq!(
            EventType::from_canonical("teleport"),
            EventType::Unknown("teleport".to_string())
        );
    }

    #[test]
    fn test_metadata_rejects_unknown_fields() {
        let ok: Result<EventMetadata, _> =
            serde_json::from_str(r#"{"utm_source":"google","attribution":{"click_id":"c1"}}"#);
        let metadata = ok.unwrap();
        let attribution = metadata.effective_attribution();
        assert_eq!(attribution.utm_source.as_deref(), Some("google"));
        assert_eq!(attribution.click_id.as_deref(), Some("c1"));

        let bad: Result<EventMetadata, _> = serde_json::from_str(r#"{"shoe_size":44}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_discipline_label_falls_back_to_category() {
        let bike = CatalogBike {
            id: 1,
            name: "Trek Madone".to_string(),
            brand: " Trek ".to_string(),
            model: None,
            discipline: Some("  ".to_string()),
            category: Some("road".to_string()),
            price: 2100.0,
            rank: 0.9,
            main_image: None,
            images: vec![],
            behavior: BikeBehaviorMetrics::empty(1),
        };
        assert_eq!(bike.discipline_label(), "road");
        assert_eq!(bike.brand_label(), "Trek");
    }

    #[test]
    fn test_avg_dwell_handles_zero_clicks() {
        let mut metrics = BikeBehaviorMetrics::empty(7);
        metrics.dwell_time_ms_sum = 9000;
        assert_eq!(metrics.avg_dwell_ms(), 0);
        metrics.detail_clicks = 3;
        assert_eq!(metrics.avg_dwell_ms(), 3000);
    }
}
