//! Raw event decoding and canonicalization.
//!
//! The storefront tracker sends loosely-typed events. This module folds
//! their type aliases onto [`EventType`], validates the numeric fields and
//! decodes metadata against the typed [`EventMetadata`] schema.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fmt;
use store::{EventMetadata, EventType, NormalizedEvent, UserId};

/// Event as posted by a client, before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default, rename = "type")]
    pub event_type: String,
    #[serde(default, alias = "bike_id")]
    pub bike_id: Option<i64>,
    #[serde(default, alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(default, alias = "user_id")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub ms: Option<f64>,
    #[serde(default, alias = "event_id")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    /// Client clock in epoch milliseconds
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default, alias = "source_path")]
    pub source_path: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Batch-level context shared by every event of one ingestion call
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestContext {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub crm_lead_id: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

impl IngestContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Why an event was quarantined instead of accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingType,
    InvalidBikeId(i64),
    InvalidDwell,
    InvalidValue,
    MissingSession,
    BadMetadata(String),
    Undecodable(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingType => write!(f, "missing event type"),
            RejectReason::InvalidBikeId(id) => write!(f, "invalid bike id {id}"),
            RejectReason::InvalidDwell => write!(f, "dwell ms must be a non-negative number"),
            RejectReason::InvalidValue => write!(f, "value must be finite"),
            RejectReason::MissingSession => write!(f, "no session id on event or context"),
            RejectReason::BadMetadata(reason) => write!(f, "metadata rejected: {reason}"),
            RejectReason::Undecodable(reason) => write!(f, "event could not be decoded: {reason}"),
        }
    }
}

/// Fold a free-form client type onto the canonical vocabulary.
///
/// Matching is case-insensitive and treats `-` and spaces like `_`.
pub fn normalize_event_type(raw: &str) -> EventType {
    let key = raw.trim().to_lowercase().replace(['-', ' '], "_");
    let canonical = match key.as_str() {
        "click" | "detail_click" | "detail_view" | "open" => "detail_open",
        "product_detail" | "pdp_view" => "product_view",
        "view" | "card_view" => "impression",
        "cart_add" | "addtocart" | "add_cart" => "add_to_cart",
        "fav" | "favourite" | "wishlist" | "like" => "favorite",
        "swipe" | "gallery" => "gallery_swipe",
        "scroll" => "scroll_stop",
        "dwell_time" | "time_on_card" => "dwell",
        "pageview" | "page" => "page_view",
        "catalog" | "catalog_open" => "catalog_view",
        "purchase" | "order_created" => "order",
        "checkout" => "checkout_start",
        "booking" => "booking_start",
        "booking_created" => "booking_success",
        other => other,
    };
    EventType::from_canonical(canonical)
}

/// Decode the optional metadata object against the typed schema
pub fn decode_metadata(raw: Option<&serde_json::Value>) -> Result<EventMetadata, RejectReason> {
    match raw {
        None | Some(serde_json::Value::Null) => Ok(EventMetadata::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|err| RejectReason::BadMetadata(err.to_string())),
    }
}

pub(crate) fn clean(value: Option<&str>, max_len: usize) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.chars().take(max_len).collect())
}

/// Validate one raw event and turn it into a [`NormalizedEvent`].
///
/// `person_key` is filled in later by identity resolution.
pub fn normalize_event(raw: &RawEvent, ctx: &IngestContext, now: DateTime<Utc>) -> Result<NormalizedEvent, RejectReason> {
    let raw_type = raw.event_type.trim();
    if raw_type.is_empty() {
        return Err(RejectReason::MissingType);
    }

    let bike_id = match raw.bike_id {
        Some(id) if id <= 0 => return Err(RejectReason::InvalidBikeId(id)),
        other => other,
    };

    let dwell_ms = match raw.ms {
        None => None,
        Some(ms) if !ms.is_finite() || ms < 0.0 => return Err(RejectReason::InvalidDwell),
        Some(ms) => Some(ms.round() as u64),
    };

    let value = match raw.value {
        None => 1.0,
        Some(v) if !v.is_finite() => return Err(RejectReason::InvalidValue),
        Some(v) => v,
    };

    let session_id = clean(raw.session_id.as_deref(), 128)
        .or_else(|| clean(ctx.session_id.as_deref(), 128))
        .ok_or(RejectReason::MissingSession)?;

    let metadata = decode_metadata(raw.metadata.as_ref())?;

    let created_at = raw
        .timestamp
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(now);

    Ok(NormalizedEvent {
        event_type: normalize_event_type(raw_type),
        raw_type: raw_type.to_string(),
        bike_id,
        session_id,
        user_id: raw.user_id.or(ctx.user_id),
        person_key: None,
        value,
        metadata,
        dwell_ms,
        created_at,
        source: clean(ctx.source.as_deref(), 64),
        source_path: clean(raw.source_path.as_deref(), 256).or_else(|| clean(ctx.source_path.as_deref(), 256)),
        referrer: clean(raw.referrer.as_deref(), 512).or_else(|| clean(ctx.referrer.as_deref(), 512)),
        event_id: clean(raw.event_id.as_deref(), 128),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str) -> RawEvent {
        RawEvent {
            event_type: event_type.to_string(),
            bike_id: Some(10),
            ..RawEvent::default()
        }
    }

    #[test]
    fn test_aliases_fold_onto_canonical_types() {
        assert_eq!(normalize_event_type("click"), EventType::DetailOpen);
        assert_eq!(normalize_event_type("Cart-Add"), EventType::AddToCart);
        assert_eq!(normalize_event_type("view"), EventType::Impression);
        assert_eq!(normalize_event_type("checkout_submit_success"), EventType::CheckoutSubmitSuccess);
        assert_eq!(
            normalize_event_type("mystery_event"),
            EventType::Unknown("mystery_event".to_string())
        );
    }

    #[test]
    fn test_session_falls_back_to_context() {
        let ctx = IngestContext::for_session("ctx-session").with_user(5);
        let event = normalize_event(&raw("click"), &ctx, Utc::now()).unwrap();
        assert_eq!(event.session_id, "ctx-session");
        assert_eq!(event.user_id, Some(5));
        assert_eq!(event.value, 1.0);
    }

    #[test]
    fn test_malformed_events_are_rejected() {
        let ctx = IngestContext::for_session("s");
        let now = Utc::now();

        assert_eq!(normalize_event(&raw("  "), &ctx, now), Err(RejectReason::MissingType));

        let mut bad_bike = raw("click");
        bad_bike.bike_id = Some(0);
        assert_eq!(normalize_event(&bad_bike, &ctx, now), Err(RejectReason::InvalidBikeId(0)));

        let mut bad_dwell = raw("dwell");
        bad_dwell.ms = Some(-5.0);
        assert_eq!(normalize_event(&bad_dwell, &ctx, now), Err(RejectReason::InvalidDwell));

        assert_eq!(
            normalize_event(&raw("click"), &IngestContext::default(), now),
            Err(RejectReason::MissingSession)
        );

        let mut bad_meta = raw("click");
        bad_meta.metadata = Some(json!({"unexpected": true}));
        assert!(matches!(
            normalize_event(&bad_meta, &ctx, now),
            Err(RejectReason::BadMetadata(_))
        ));
    }

    #[test]
    fn test_raw_event_decodes_both_casings() {
        let camel: RawEvent =
            serde_json::from_value(json!({"type": "click", "bikeId": 3, "sessionId": "a", "eventId": "e"})).unwrap();
        let snake: RawEvent =
            serde_json::from_value(json!({"type": "click", "bike_id": 3, "session_id": "a", "event_id": "e"})).unwrap();
        assert_eq!(camel.bike_id, snake.bike_id);
        assert_eq!(camel.session_id, snake.session_id);
        assert_eq!(camel.event_id, snake.event_id);
    }

    #[test]
    fn test_timestamp_is_respected() {
        let mut event = raw("impression");
        event.timestamp = Some(1_700_000_000_000);
        let normalized = normalize_event(&event, &IngestContext::for_session("s"), Utc::now()).unwrap();
        assert_eq!(normalized.created_at.timestamp_millis(), 1_700_000_000_000);
    }
}
