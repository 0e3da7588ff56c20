//! Weighted variant draw.

use paywall_core::types::{Variant, VariantOption};
use rand::Rng;

use crate::error::AssignmentError;

/// Picks a variant with probability `weight / Σweight`.
///
/// Draws `r` from `[0, total)` and returns the first variant whose cumulative
/// weight strictly exceeds `r`. When every weight is zero the pick is uniform.
/// Negative or NaN weights count as zero.
pub fn choose_variant<R: Rng + ?Sized>(
    variants: &[VariantOption],
    rng: &mut R,
) -> Result<Variant, AssignmentError> {
    let Some(first) = variants.first() else {
        return Err(AssignmentError::NoVariantsFound);
    };
    if variants.len() == 1 {
        return Ok(first.to_variant());
    }

    let weights = draw_weights(variants);
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        let index = rng.gen_range(0..variants.len());
        return Ok(variants[index].to_variant());
    }

    let threshold = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (variant, weight) in variants.iter().zip(&weights) {
        cumulative += weight;
        if threshold < cumulative {
            return Ok(variant.to_variant());
        }
    }

    // Float accumulation can land a hair under `total`; the last weighted variant owns that sliver.
    variants
        .iter()
        .zip(&weights)
        .rev()
        .find(|(_, weight)| **weight > 0.0)
        .map(|(variant, _)| variant.to_variant())
        .ok_or(AssignmentError::InvalidState)
}

/// Effective weights, rescaled by the largest one when their sum is not finite.
fn draw_weights(variants: &[VariantOption]) -> Vec<f64> {
    let weights: Vec<f64> = variants.iter().map(|v| effective_weight(v.weight)).collect();
    if weights.iter().sum::<f64>().is_finite() {
        return weights;
    }
    let max = weights.iter().copied().fold(0.0, f64::max);
    if max.is_infinite() {
        weights
            .iter()
            .map(|w| if w.is_infinite() { 1.0 } else { 0.0 })
            .collect()
    } else {
        weights.iter().map(|w| w / max).collect()
    }
}

fn effective_weight(weight: f64) -> f64 {
    if weight.is_nan() {
        0.0
    } else {
        weight.max(0.0)
    }
}
