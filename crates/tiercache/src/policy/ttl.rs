//! Dynamic TTL policies.
//!
//! Callers compute the TTL from the result they are about to cache and pass
//! it through [`SetOptions`](crate::SetOptions) or
//! [`WrapOptions`](crate::WrapOptions); the façade never inspects values.

use std::time::Duration;

/// `base × (0.5 + score/100)`, with `score` clamped to `0..=100`.
///
/// Higher scores are less likely to be recomputed soon, so they live longer:
/// a 6h base yields 3h at score 0 and 9h at score 100.
pub fn score_scaled(base: Duration, score: f64) -> Duration {
    let score = if score.is_finite() { score.clamp(0.0, 100.0) } else { 0.0 };
    base.mul_f64(0.5 + score / 100.0)
}

/// TTL of the first tier whose minimum confidence `confidence` reaches.
///
/// `tiers` are `(min_confidence, ttl)` pairs ordered from the highest
/// threshold down; `fallback` applies below every threshold.
pub fn confidence_tiered(confidence: f64, tiers: &[(f64, Duration)], fallback: Duration) -> Duration {
    tiers
        .iter()
        .find(|(min, _)| confidence >= *min)
        .map(|(_, ttl)| *ttl)
        .unwrap_or(fallback)
}
