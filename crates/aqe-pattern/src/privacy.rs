//! Differential privacy for pattern embeddings.
//!
//! The embedding is clipped to a configured L2 norm, then per-coordinate
//! noise is added: Laplace with scale `sensitivity / ε`, or Gaussian with
//! `σ = sensitivity · √(2·ln(1.25/δ)) / ε`. The caller learns the noised
//! vector, the L2 distance from the original, and the privacy budget the
//! call consumed.

use crate::vector::{euclidean_distance, l2_norm};
use crate::{PatternError, PatternResult};
use aqe_common::RngProvider;
use serde::{Deserialize, Serialize};

/// Noise mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DpMechanism {
    Laplace,
    Gaussian,
}

/// Differential-privacy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpParams {
    /// Privacy budget ε.
    pub epsilon: f64,
    /// Failure probability δ (Gaussian only).
    pub delta: f64,
    pub mechanism: DpMechanism,
    pub sensitivity: f64,
    /// L2 norm the embedding is clipped to before noising.
    pub clip_norm: f64,
}

impl Default for DpParams {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            delta: 1e-5,
            mechanism: DpMechanism::Laplace,
            sensitivity: 1.0,
            clip_norm: 1.0,
        }
    }
}

/// Outcome of one privacy application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpNoiseResult {
    pub noised: Vec<f32>,
    /// L2 distance between the clipped original and the noised vector.
    pub l2_distance: f64,
    /// Privacy budget consumed (ε).
    pub budget_consumed: f64,
}

/// Clip and noise an embedding under the given parameters.
pub fn apply_differential_privacy(
    embedding: &[f32],
    params: &DpParams,
    rng: &dyn RngProvider,
) -> PatternResult<DpNoiseResult> {
    if embedding.is_empty() {
        return Err(PatternError::InvalidEmbedding("empty embedding".to_string()));
    }
    if !(params.epsilon > 0.0) {
        return Err(PatternError::InvalidPrivacyParams(format!(
            "epsilon must be positive, got {}",
            params.epsilon
        )));
    }
    if params.mechanism == DpMechanism::Gaussian && !(params.delta > 0.0 && params.delta < 1.0) {
        return Err(PatternError::InvalidPrivacyParams(format!(
            "delta must be in (0, 1) for the Gaussian mechanism, got {}",
            params.delta
        )));
    }
    if !(params.sensitivity > 0.0) || !(params.clip_norm > 0.0) {
        return Err(PatternError::InvalidPrivacyParams(
            "sensitivity and clip_norm must be positive".to_string(),
        ));
    }

    let clipped = clip_to_norm(embedding, params.clip_norm);

    let noised: Vec<f32> = match params.mechanism {
        DpMechanism::Laplace => {
            let scale = params.sensitivity / params.epsilon;
            clipped
                .iter()
                .map(|&x| x + sample_laplace(rng, scale) as f32)
                .collect()
        }
        DpMechanism::Gaussian => {
            let sigma =
                params.sensitivity * (2.0 * (1.25 / params.delta).ln()).sqrt() / params.epsilon;
            clipped
                .iter()
                .map(|&x| x + sample_gaussian(rng, sigma) as f32)
                .collect()
        }
    };

    let l2_distance = euclidean_distance(&clipped, &noised)
        .map(f64::from)
        .unwrap_or(0.0);

    Ok(DpNoiseResult {
        noised,
        l2_distance,
        budget_consumed: params.epsilon,
    })
}

fn clip_to_norm(v: &[f32], clip_norm: f64) -> Vec<f32> {
    let norm = l2_norm(v) as f64;
    if norm <= clip_norm || norm == 0.0 {
        return v.to_vec();
    }
    let scale = (clip_norm / norm) as f32;
    v.iter().map(|x| x * scale).collect()
}

/// Laplace(0, scale) via inverse CDF.
fn sample_laplace(rng: &dyn RngProvider, scale: f64) -> f64 {
    // u in (-0.5, 0.5]
    let u = rng.next_f64() - 0.5;
    let sign = if u < 0.0 { -1.0 } else { 1.0 };
    -scale * sign * (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE).ln()
}

/// N(0, sigma²) via Box–Muller.
fn sample_gaussian(rng: &dyn RngProvider, sigma: f64) -> f64 {
    let u1 = rng.next_f64().max(f64::MIN_POSITIVE);
    let u2 = rng.next_f64();
    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqe_common::SeededRngProvider;

    #[test]
    fn test_laplace_noise_shape_and_budget() {
        let rng = SeededRngProvider::new(42);
        let params = DpParams::default();

        let result = apply_differential_privacy(&[1.0, 0.0, 0.0, 0.0], &params, &rng).unwrap();
        assert_eq!(result.noised.len(), 4);
        assert_eq!(result.budget_consumed, 1.0);
        assert!(result.l2_distance.is_finite());
        assert!(result.l2_distance > 0.0);
    }

    #[test]
    fn test_laplace_noise_magnitude_matches_theory() {
        // For Laplace(0, b) the expected absolute value per coordinate is
        // exactly b. With b = sensitivity/ε = 1 and 4 coordinates, the mean
        // total absolute noise over many runs converges to 4.
        let rng = SeededRngProvider::new(7);
        let params = DpParams::default();
        let input = [1.0f32, 0.0, 0.0, 0.0];

        let runs = 1_000;
        let mut total_abs_noise = 0.0f64;
        for _ in 0..runs {
            let result = apply_differential_privacy(&input, &params, &rng).unwrap();
            for (noised, original) in result.noised.iter().zip(input.iter()) {
                total_abs_noise += f64::from(noised - original).abs();
            }
        }
        let mean_abs_noise = total_abs_noise / runs as f64;
        let theoretical = 4.0; // D · b
        assert!(
            (mean_abs_noise - theoretical).abs() / theoretical < 0.1,
            "mean absolute noise {mean_abs_noise} deviates more than 10% from {theoretical}"
        );
    }

    #[test]
    fn test_gaussian_mechanism() {
        let rng = SeededRngProvider::new(11);
        let params = DpParams {
            mechanism: DpMechanism::Gaussian,
            ..DpParams::default()
        };

        let result = apply_differential_privacy(&[0.5, 0.5], &params, &rng).unwrap();
        assert_eq!(result.noised.len(), 2);
        assert!(result.l2_distance > 0.0);
    }

    #[test]
    fn test_clipping_bounds_norm() {
        let clipped = clip_to_norm(&[3.0, 4.0], 1.0);
        assert!((l2_norm(&clipped) - 1.0).abs() < 1e-5);

        // already inside the ball: untouched
        let untouched = clip_to_norm(&[0.3, 0.4], 1.0);
        assert_eq!(untouched, vec![0.3, 0.4]);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let rng = SeededRngProvider::new(1);

        let bad_epsilon = DpParams {
            epsilon: 0.0,
            ..DpParams::default()
        };
        assert!(apply_differential_privacy(&[1.0], &bad_epsilon, &rng).is_err());

        let bad_delta = DpParams {
            mechanism: DpMechanism::Gaussian,
            delta: 0.0,
            ..DpParams::default()
        };
        assert!(apply_differential_privacy(&[1.0], &bad_delta, &rng).is_err());

        assert!(apply_differential_privacy(&[], &DpParams::default(), &rng).is_err());
    }

    #[test]
    fn test_laplace_sampler_is_centered() {
        let rng = SeededRngProvider::new(3);
        let mut sum = 0.0;
        let n = 10_000;
        for _ in 0..n {
            sum += sample_laplace(&rng, 1.0);
        }
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.1, "Laplace mean {mean} is not near zero");
    }
}
