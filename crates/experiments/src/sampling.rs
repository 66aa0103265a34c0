//! Gamma and Beta sampling for Thompson Sampling.

use crate::random::RandomSource;
use std::f64::consts::PI;

/// Standard normal via Box-Muller
pub fn random_normal(rng: &dyn RandomSource) -> f64 {
    let mut u = 0.0;
    while u == 0.0 {
        u = rng.next_f64();
    }
    let mut v = 0.0;
    while v == 0.0 {
        v = rng.next_f64();
    }
    (-2.0 * u.ln()).sqrt() * (2.0 * PI * v).cos()
}

/// Gamma(shape, scale) by Marsaglia-Tsang rejection.
///
/// Shapes below 1 are boosted to `shape + 1` and scaled back by `U^(1/shape)`.
pub fn sample_gamma(rng: &dyn RandomSource, shape: f64, scale: f64) -> f64 {
    if !shape.is_finite() || shape <= 0.0 {
        return 0.0;
    }
    if shape < 1.0 {
        let boosted = sample_gamma(rng, shape + 1.0, scale);
        return boosted * rng.next_f64().powf(1.0 / shape);
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        let x = random_normal(rng);
        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }
        let u = rng.next_f64();
        if u < 1.0 - 0.0331 * x.powi(4) {
            return scale * d * v;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return scale * d * v;
        }
    }
}

/// Beta(alpha, beta) as `X / (X + Y)` with `X ~ Gamma(alpha)`, `Y ~ Gamma(beta)`
pub fn sample_beta(rng: &dyn RandomSource, alpha: f64, beta: f64) -> f64 {
    let a = alpha.max(0.0001);
    let b = beta.max(0.0001);
    let x = sample_gamma(rng, a, 1.0);
    let y = sample_gamma(rng, b, 1.0);
    if x + y <= 0.0 {
        return 0.5;
    }
    x / (x + y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn test_beta_samples_stay_in_unit_interval() {
        let rng = SeededRandom::new(11);
        for (alpha, beta) in [(1.0, 1.0), (0.5, 0.5), (40.0, 3.0), (2.0, 90.0)] {
            for _ in 0..200 {
                let sample = sample_beta(&rng, alpha, beta);
                assert!((0.0..=1.0).contains(&sample));
            }
        }
    }

    #[test]
    fn test_beta_mean_tracks_posterior() {
        let rng = SeededRandom::new(3);
        let draws = 4000;
        let mean = (0..draws).map(|_| sample_beta(&rng, 30.0, 10.0)).sum::<f64>() / draws as f64;
        assert!((mean - 0.75).abs() < 0.03, "mean was {mean}");
    }

    #[test]
    fn test_gamma_rejects_invalid_shape() {
        let rng = SeededRandom::new(1);
        assert_eq!(sample_gamma(&rng, 0.0, 1.0), 0.0);
        assert_eq!(sample_gamma(&rng, f64::NAN, 1.0), 0.0);
    }

    #[test]
    fn test_gamma_mean_matches_shape() {
        let rng = SeededRandom::new(5);
        let draws = 4000;
        let mean = (0..draws).map(|_| sample_gamma(&rng, 4.0, 1.0)).sum::<f64>() / draws as f64;
        assert!((mean - 4.0).abs() < 0.2, "mean was {mean}");
    }
}
