//! Rollup deltas derived from a single accepted event.

use store::{BikeCounter, BikeId, BikeMetricDelta, EventType, FunnelStage, NormalizedEvent, SessionFactDelta};

use crate::identity::IdentityTokens;

/// Bike counter bumped by an event type, if any
pub fn bike_counter(event_type: &EventType) -> Option<BikeCounter> {
    match event_type {
        EventType::Impression => Some(BikeCounter::Impressions),
        EventType::DetailOpen | EventType::ProductView => Some(BikeCounter::DetailClicks),
        EventType::Hover => Some(BikeCounter::Hovers),
        EventType::GallerySwipe => Some(BikeCounter::GallerySwipes),
        EventType::Favorite => Some(BikeCounter::Favorites),
        EventType::AddToCart => Some(BikeCounter::AddToCart),
        EventType::Share => Some(BikeCounter::Shares),
        EventType::ScrollStop => Some(BikeCounter::ScrollStops),
        EventType::Order => Some(BikeCounter::Orders),
        EventType::Bounce => Some(BikeCounter::Bounces),
        _ => None,
    }
}

/// Change to the per-bike rollup, or `None` for bike-less and unknown events
pub fn bike_delta(event: &NormalizedEvent) -> Option<(BikeId, BikeMetricDelta)> {
    let bike_id = event.bike_id?;
    if event.event_type == EventType::Dwell {
        return event.dwell_ms.map(|ms| (bike_id, BikeMetricDelta::DwellMs(ms)));
    }
    bike_counter(&event.event_type).map(|counter| (bike_id, BikeMetricDelta::Increment(counter)))
}

/// Funnel stage counted for an event type
pub fn funnel_stage(event_type: &EventType) -> Option<FunnelStage> {
    let stage = match event_type {
        EventType::PageView => FunnelStage::PageView,
        EventType::FirstClick => FunnelStage::FirstClick,
        EventType::CatalogView => FunnelStage::CatalogView,
        EventType::DetailOpen | EventType::ProductView => FunnelStage::ProductView,
        EventType::AddToCart => FunnelStage::AddToCart,
        EventType::CheckoutStart => FunnelStage::CheckoutStart,
        EventType::CheckoutStep => FunnelStage::CheckoutStep,
        EventType::CheckoutValidationError => FunnelStage::CheckoutValidationError,
        EventType::CheckoutSubmitAttempt => FunnelStage::CheckoutSubmitAttempt,
        EventType::CheckoutSubmitSuccess => FunnelStage::CheckoutSubmitSuccess,
        EventType::CheckoutSubmitFailed => FunnelStage::CheckoutSubmitFailed,
        EventType::FormSeen => FunnelStage::FormSeen,
        EventType::FormFirstInput => FunnelStage::FormFirstInput,
        EventType::FormSubmitAttempt => FunnelStage::FormSubmitAttempt,
        EventType::FormValidationError => FunnelStage::FormValidationError,
        EventType::BookingStart => FunnelStage::BookingStart,
        EventType::BookingSuccess => FunnelStage::BookingSuccess,
        EventType::Order => FunnelStage::Order,
        _ => return None,
    };
    Some(stage)
}

/// Change to the session fact row. Unknown event types leave it untouched.
pub fn session_delta(
    event: &NormalizedEvent,
    tokens: &IdentityTokens,
    person_key: Option<&str>,
    is_bot: bool,
) -> Option<SessionFactDelta> {
    if !event.event_type.is_known() {
        return None;
    }
    let dwell_ms = match event.event_type {
        EventType::Dwell => event.dwell_ms.unwrap_or(0),
        _ => 0,
    };
    Some(SessionFactDelta {
        session_id: event.session_id.clone(),
        person_key: person_key.map(str::to_string),
        user_id: event.user_id,
        crm_lead_id: tokens.crm_lead_id.clone(),
        customer_email_hash: tokens.email_hash.clone(),
        customer_phone_hash: tokens.phone_hash.clone(),
        seen_at: event.created_at,
        stage: funnel_stage(&event.event_type),
        dwell_ms,
        source_path: event.source_path.clone(),
        referrer: event.referrer.clone(),
        attribution: event.metadata.effective_attribution(),
        is_bot,
    })
}
