//! Deterministic variant bucketing.

use crate::types::Variant;

/// djb2 over UTF-16 code units, wrapping at 32 bits
pub fn djb2(input: &str) -> u32 {
    input
        .encode_utf16()
        .fold(5381u32, |hash, unit| hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(unit as u32))
}

/// Stable pick of `key:subject` across the cumulative variant weights.
///
/// Returns `control` when the weights sum to zero.
pub fn pick_variant(experiment_key: &str, subject_key: &str, variants: &[Variant]) -> String {
    let total: f64 = variants.iter().map(|v| v.weight.max(0.0)).sum();
    if total <= 0.0 {
        return "control".to_string();
    }

    let bucket = f64::from(djb2(&format!("{experiment_key}:{subject_key}"))) % total;
    let mut cursor = 0.0;
    for variant in variants {
        cursor += variant.weight.max(0.0);
        if bucket < cursor {
            return variant.name.clone();
        }
    }
    variants
        .last()
        .map(|v| v.name.clone())
        .unwrap_or_else(|| "control".to_string())
}
