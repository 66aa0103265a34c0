//! Integer weight plans.
//!
//! A plan always sums to exactly 100, gives every variant at least the
//! minimum weight, and (after [`apply_control_floor`]) gives control at least
//! the control floor. Minimums that cannot all be met are lowered to the
//! largest feasible value first.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::Variant;

/// Integer percentage per variant, in variant order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(into = "BTreeMap<String, u32>")]
pub struct WeightPlan {
    entries: Vec<(String, u32)>,
}

impl WeightPlan {
    fn from_parts(names: Vec<String>, weights: Vec<i64>) -> Self {
        let entries = names
            .into_iter()
            .zip(weights)
            .map(|(name, weight)| (name, weight.clamp(0, 100) as u32))
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> u32 {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, weight)| *weight)
            .unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.entries.iter().map(|(_, weight)| weight).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(name, weight)| (name.as_str(), *weight))
    }

    /// The plan as variants, for weighted drawing
    pub fn as_variants(&self) -> Vec<Variant> {
        self.iter().map(|(name, weight)| Variant::new(name, f64::from(weight))).collect()
    }
}

impl From<WeightPlan> for BTreeMap<String, u32> {
    fn from(plan: WeightPlan) -> Self {
        plan.entries.into_iter().collect()
    }
}

/// Largest minimum weight every one of `count` variants can receive
pub fn feasible_min_weight(min_weight: u32, count: usize) -> u32 {
    if count == 0 {
        return min_weight;
    }
    min_weight.min(100 / count as u32)
}

/// Index of `control`, or the first variant
pub fn control_index(variants: &[Variant]) -> usize {
    variants.iter().position(|v| v.name == "control").unwrap_or(0)
}

/// Raise every weight to its minimum, shave surplus until the sum is at most
/// 100, then give any shortfall to `sink`.
fn repair(weights: &mut [i64], minimums: &[i64], sink: usize) {
    for (weight, minimum) in weights.iter_mut().zip(minimums) {
        if *weight < *minimum {
            *weight = *minimum;
        }
    }
    let mut sum: i64 = weights.iter().sum();
    while sum > 100 {
        let donor = (0..weights.len())
            .filter(|&i| weights[i] > minimums[i])
            .max_by_key(|&i| (weights[i] - minimums[i], i));
        let Some(donor) = donor else { break };
        weights[donor] -= 1;
        sum -= 1;
    }
    if sum < 100 {
        weights[sink] += 100 - sum;
    }
}

/// Scale raw scores to integer percentages with a per-variant minimum.
///
/// Variants below the minimum are lifted to it, taking from the
/// highest-weighted donors first. Rounding drift lands on the last variant.
pub fn normalize_weight_plan(variants: &[Variant], raw_scores: &BTreeMap<String, f64>, min_weight: u32) -> WeightPlan {
    let names: Vec<String> = variants.iter().map(|v| v.name.clone()).collect();
    let n = names.len();
    if n == 0 {
        return WeightPlan::default();
    }
    let min = f64::from(feasible_min_weight(min_weight, n));

    let scores: Vec<f64> = names
        .iter()
        .map(|name| {
            raw_scores
                .get(name)
                .copied()
                .filter(|score| score.is_finite())
                .unwrap_or(0.0)
                .max(0.0001)
        })
        .collect();
    let score_sum: f64 = scores.iter().sum();
    let mut weights: Vec<f64> = scores.iter().map(|score| score / score_sum * 100.0).collect();

    if n > 1 {
        for i in 0..n {
            if weights[i] >= min {
                continue;
            }
            let mut needed = min - weights[i];
            weights[i] = min;

            let mut donors: Vec<usize> = (0..n).filter(|&j| j != i).collect();
            donors.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));
            for donor in donors {
                let transferable = (weights[donor] - min).max(0.0);
                if transferable <= 0.0 {
                    continue;
                }
                let take = transferable.min(needed);
                weights[donor] -= take;
                needed -= take;
                if needed <= 0.0001 {
                    break;
                }
            }
        }
    }

    let total: f64 = weights.iter().sum();
    let mut rounded = vec![0i64; n];
    let mut allocated = 0i64;
    for i in 0..n - 1 {
        let value = ((weights[i] / total) * 100.0).round().max(0.0) as i64;
        rounded[i] = value;
        allocated += value;
    }
    rounded[n - 1] = 100 - allocated;

    let minimums = vec![min as i64; n];
    repair(&mut rounded, &minimums, n - 1);
    WeightPlan::from_parts(names, rounded)
}

/// Guarantee control (or the first variant) at least `control_floor`.
///
/// The other variants share what is left in proportion to their current
/// weights; residual drift is settled on control.
pub fn apply_control_floor(variants: &[Variant], plan: &WeightPlan, control_floor: u32, min_weight: u32) -> WeightPlan {
    let names: Vec<String> = variants.iter().map(|v| v.name.clone()).collect();
    let n = names.len();
    if n == 0 {
        return WeightPlan::default();
    }
    let control = control_index(variants);
    if n == 1 {
        return WeightPlan::from_parts(names, vec![100]);
    }

    let min = feasible_min_weight(min_weight, n);
    let floor = control_floor.min(100u32.saturating_sub(min * (n as u32 - 1)));

    let control_weight = f64::from(plan.get(&names[control]).max(floor));
    let available = (100.0 - control_weight).max(0.0);
    let others: Vec<usize> = (0..n).filter(|&i| i != control).collect();
    let other_sum: f64 = others.iter().map(|&i| f64::from(plan.get(&names[i]))).sum();

    let mut adjusted: BTreeMap<String, f64> = BTreeMap::new();
    adjusted.insert(names[control].clone(), control_weight);
    for &i in &others {
        let share = if other_sum <= 0.0 {
            available / others.len() as f64
        } else {
            f64::from(plan.get(&names[i])) / other_sum * available
        };
        adjusted.insert(names[i].clone(), share);
    }

    let normalized = normalize_weight_plan(variants, &adjusted, min);
    let mut weights: Vec<i64> = normalized.iter().map(|(_, weight)| i64::from(weight)).collect();

    let floor = i64::from(floor);
    let min = i64::from(min);
    if weights[control] < floor {
        let mut remaining = floor - weights[control];
        weights[control] = floor;
        let mut donors = others.clone();
        donors.sort_by(|&a, &b| weights[b].cmp(&weights[a]));
        for donor in donors {
            if remaining <= 0 {
                break;
            }
            let transferable = (weights[donor] - min).max(0);
            let take = transferable.min(remaining);
            weights[donor] -= take;
            remaining -= take;
        }
    }

    let mut minimums = vec![min; n];
    minimums[control] = floor;
    repair(&mut weights, &minimums, control);
    WeightPlan::from_parts(names, weights)
}
