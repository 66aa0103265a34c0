//! Funnel contract checks.
//!
//! Funnel events only feed conversion reporting when they carry the fields
//! their stage needs. Each contract lists required groups; a group is met
//! when any one of its alternative fields is present. Violations never reject
//! an event, they are counted and reported with the batch.

use serde::Serialize;
use store::{EventType, NormalizedEvent};

use crate::events::IngestContext;

pub const CONTRACT_VERSION: &str = "funnel-v2";

/// Stages a purchase is expected to pass through, in order
pub const CRITICAL_PATH: [&str; 6] = [
    "page_view",
    "catalog_view",
    "product_view",
    "add_to_cart",
    "checkout_start",
    "checkout_submit_success",
];

/// A field a contract can require
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractField {
    BikeId,
    DwellMs,
    UserId,
    SourcePath,
    Step,
    Field,
    OrderId,
    Query,
}

impl ContractField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractField::BikeId => "bikeId",
            ContractField::DwellMs => "ms",
            ContractField::UserId => "context.userId",
            ContractField::SourcePath => "sourcePath",
            ContractField::Step => "metadata.step",
            ContractField::Field => "metadata.field",
            ContractField::OrderId => "metadata.orderId",
            ContractField::Query => "metadata.query",
        }
    }

    fn is_present(&self, event: &NormalizedEvent, ctx: &IngestContext) -> bool {
        let text = |value: Option<&String>| value.is_some_and(|v| !v.trim().is_empty());
        match self {
            ContractField::BikeId => event.bike_id.is_some(),
            ContractField::DwellMs => event.dwell_ms.is_some(),
            ContractField::UserId => event.user_id.or(ctx.user_id).is_some(),
            ContractField::SourcePath => text(event.source_path.as_ref()),
            ContractField::Step => text(event.metadata.step.as_ref()),
            ContractField::Field => text(event.metadata.field.as_ref()),
            ContractField::OrderId => text(event.metadata.order_id.as_ref()),
            ContractField::Query => text(event.metadata.query.as_ref()),
        }
    }
}

/// Required field groups of one event type
#[derive(Debug, Clone)]
pub struct EventContract {
    pub event_type: EventType,
    pub stage: &'static str,
    pub required_groups: &'static [&'static [ContractField]],
}

fn registry() -> [EventContract; 11] {
    use ContractField::*;
    [
        EventContract { event_type: EventType::DetailOpen, stage: "product_view", required_groups: &[&[BikeId]] },
        EventContract { event_type: EventType::ProductView, stage: "product_view", required_groups: &[&[BikeId]] },
        EventContract { event_type: EventType::Favorite, stage: "product_view", required_groups: &[&[BikeId]] },
        EventContract { event_type: EventType::Dwell, stage: "product_view", required_groups: &[&[BikeId], &[DwellMs]] },
        EventContract { event_type: EventType::AddToCart, stage: "add_to_cart", required_groups: &[&[BikeId]] },
        EventContract {
            event_type: EventType::CheckoutStart,
            stage: "checkout_start",
            required_groups: &[&[BikeId, SourcePath]],
        },
        EventContract { event_type: EventType::CheckoutStep, stage: "checkout_start", required_groups: &[&[Step]] },
        EventContract {
            event_type: EventType::CheckoutValidationError,
            stage: "checkout_start",
            required_groups: &[&[Field, Step]],
        },
        EventContract {
            event_type: EventType::CheckoutSubmitSuccess,
            stage: "checkout_submit_success",
            required_groups: &[&[OrderId, BikeId]],
        },
        EventContract { event_type: EventType::FormValidationError, stage: "form", required_groups: &[&[Field]] },
        EventContract { event_type: EventType::Order, stage: "order", required_groups: &[&[OrderId], &[BikeId, UserId]] },
    ]
}

/// Contract of an event type, if it has one
pub fn contract_for(event_type: &EventType) -> Option<EventContract> {
    registry().into_iter().find(|contract| contract.event_type == *event_type)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingGroup {
    pub index: usize,
    pub alternatives: Vec<String>,
}

/// Contract coverage of one event type within a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractCoverage {
    pub event_type: String,
    pub stage: String,
    pub total: usize,
    /// Missing groups summed over every event of this type
    pub violations: usize,
    pub missing_groups: Vec<MissingGroup>,
    /// Share of events without violations, in `[0, 100]`, two decimals
    pub coverage_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelContractReport {
    pub version: String,
    pub critical_path: Vec<String>,
    pub checked_events: usize,
    pub violations_total: usize,
    /// One row per contracted event type, in order of first appearance
    pub by_event: Vec<ContractCoverage>,
}

impl FunnelContractReport {
    /// `event_type:violations` for every type with violations
    pub fn compact_violations(&self) -> String {
        self.by_event
            .iter()
            .filter(|row| row.violations > 0)
            .map(|row| format!("{}:{}", row.event_type, row.violations))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn coverage_pct(total: usize, violations: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let pct = (total as f64 - violations as f64) / total as f64 * 100.0;
    ((pct * 100.0).round() / 100.0).clamp(0.0, 100.0)
}

/// Check a batch of accepted events against the contract registry
pub fn validate_funnel_contract<'a>(
    events: impl IntoIterator<Item = &'a NormalizedEvent>,
    ctx: &IngestContext,
) -> FunnelContractReport {
    let mut rows: Vec<ContractCoverage> = Vec::new();

    for event in events {
        let Some(contract) = contract_for(&event.event_type) else {
            continue;
        };
        let position = match rows.iter().position(|row| row.event_type == event.event_type.as_str()) {
            Some(position) => position,
            None => {
                rows.push(ContractCoverage {
                    event_type: event.event_type.as_str().to_string(),
                    stage: contract.stage.to_string(),
                    total: 0,
                    violations: 0,
                    missing_groups: Vec::new(),
                    coverage_pct: 100.0,
                });
                rows.len() - 1
            }
        };
        let row = &mut rows[position];
        row.total += 1;

        for (index, group) in contract.required_groups.iter().enumerate() {
            if group.iter().any(|field| field.is_present(event, ctx)) {
                continue;
            }
            row.violations += 1;
            row.missing_groups.push(MissingGroup {
                index,
                alternatives: group.iter().map(|field| field.as_str().to_string()).collect(),
            });
        }
    }

    for row in &mut rows {
        row.coverage_pct = coverage_pct(row.total, row.violations);
    }

    FunnelContractReport {
        version: CONTRACT_VERSION.to_string(),
        critical_path: CRITICAL_PATH.iter().map(|stage| stage.to_string()).collect(),
        checked_events: rows.iter().map(|row| row.total).sum(),
        violations_total: rows.iter().map(|row| row.violations).sum(),
        by_event: rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{normalize_event, RawEvent};
    use chrono::Utc;
    use serde_json::json;

    fn event(value: serde_json::Value) -> NormalizedEvent {
        let raw: RawEvent = serde_json::from_value(value).unwrap();
        normalize_event(&raw, &IngestContext::for_session("s"), Utc::now()).unwrap()
    }

    #[test]
    fn test_complete_events_have_full_coverage() {
        let ctx = IngestContext::for_session("s");
        let events = vec![
            event(json!({"type": "add_to_cart", "bikeId": 4})),
            event(json!({"type": "dwell", "bikeId": 4, "ms": 1200})),
            event(json!({"type": "checkout_step", "metadata": {"step": "delivery"}})),
            event(json!({"type": "page_view"})),
        ];
        let report = validate_funnel_contract(&events, &ctx);

        assert_eq!(report.checked_events, 3);
        assert_eq!(report.violations_total, 0);
        assert!(report.by_event.iter().all(|row| row.coverage_pct == 100.0));
        assert_eq!(report.critical_path.len(), 6);
        assert_eq!(report.compact_violations(), "");
    }

    #[test]
    fn test_missing_groups_are_counted_per_type() {
        let ctx = IngestContext::for_session("s");
        let events = vec![
            event(json!({"type": "add_to_cart", "bikeId": 4})),
            event(json!({"type": "add_to_cart"})),
            event(json!({"type": "add_to_cart"})),
            event(json!({"type": "dwell"})),
        ];
        let report = validate_funnel_contract(&events, &ctx);

        assert_eq!(report.checked_events, 4);
        assert_eq!(report.violations_total, 4);
        let cart = &report.by_event[0];
        assert_eq!(cart.event_type, "add_to_cart");
        assert_eq!(cart.violations, 2);
        assert_eq!(cart.coverage_pct, 33.33);
        assert_eq!(cart.missing_groups[0].alternatives, vec!["bikeId".to_string()]);

        // Both groups missing on the only dwell event
        let dwell = &report.by_event[1];
        assert_eq!(dwell.violations, 2);
        assert_eq!(dwell.coverage_pct, 0.0);
        assert_eq!(report.compact_violations(), "add_to_cart:2, dwell:2");
    }

    #[test]
    fn test_any_alternative_satisfies_a_group() {
        let ctx = IngestContext::for_session("s").with_user(12);
        let events = vec![
            event(json!({"type": "checkout_validation_error", "metadata": {"field": "zip"}})),
            event(json!({"type": "order", "metadata": {"orderId": "o-1"}})),
        ];
        let report = validate_funnel_contract(&events, &ctx);
        assert_eq!(report.violations_total, 0);
        assert!(contract_for(&EventType::Impression).is_none());
    }
}
