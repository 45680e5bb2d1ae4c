//! # Posterior-Predictive Sampler
//!
//! For count families there is no closed-form predictive mean, so the
//! detector (and post-hoc prediction) estimate it empirically: repeated
//! batches of latent-function samples are pushed through the exponential link,
//! the running mean rate parameterizes observation draws from the output
//! family, and the pointwise mean of all sampled trajectories is denoised
//! with a Savitzky-Golay filter before use.

use crate::engine::{EngineError, InferenceEngine};
use crate::family::Family;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::Solve;
use ndarray_linalg::error::LinalgError;
use rand::rngs::StdRng;

/// Outer repetitions of latent-sample batches.
const OUTER_REPS: usize = 20;
/// Latent samples drawn per repetition.
const INNER_SAMPLES: usize = 5;
/// Observation draws per grid point per repetition.
const TRAJECTORY_SIZE: usize = 500;
/// Polynomial degree of the smoothing filter.
const SMOOTH_DEGREE: usize = 3;

/// Empirical predictive summary over an evaluation grid.
#[derive(Debug, Clone)]
pub struct PredictiveSamples {
    /// Smoothed empirical predictive mean, negatives clipped to zero.
    pub mean: Array1<f64>,
    /// Raw sampled trajectories, one row per trajectory. Consumed by
    /// percentile-band computations downstream.
    pub draws: Array2<f64>,
}

/// Monte-Carlo estimate of the posterior predictive mean at `grid`.
///
/// Nuisance parameters are read back from the fitted handle so the draws use
/// the learned dispersion and saturation values.
pub fn posterior_predictive<E: InferenceEngine>(
    engine: &E,
    handle: &E::Handle,
    grid: ArrayView1<'_, f64>,
    family: Family,
    rng: &mut StdRng,
) -> Result<PredictiveSamples, EngineError> {
    let alpha = engine.dispersion(handle);
    let km = engine.saturation(handle);
    let n = grid.len();

    let mut latent_batches: Vec<Array2<f64>> = Vec::with_capacity(OUTER_REPS);
    let mut trajectories: Vec<f64> = Vec::with_capacity(OUTER_REPS * TRAJECTORY_SIZE * n);
    for _ in 0..OUTER_REPS {
        latent_batches.push(engine.sample_latent(handle, grid, INNER_SAMPLES, rng)?);

        // Mean rate over every latent sample accumulated so far.
        let mut rate = Array1::<f64>::zeros(n);
        let mut total = 0usize;
        for batch in &latent_batches {
            for row in batch.rows() {
                rate += &row.mapv(f64::exp);
                total += 1;
            }
        }
        rate /= total as f64;

        let mut batch = vec![0.0; TRAJECTORY_SIZE * n];
        for (j, &mu) in rate.iter().enumerate() {
            let draws = family.sample_counts(mu, alpha, km, TRAJECTORY_SIZE, rng);
            for (t, v) in draws.into_iter().enumerate() {
                batch[t * n + j] = v;
            }
        }
        trajectories.extend_from_slice(&batch);
    }

    let draws = Array2::from_shape_vec((OUTER_REPS * TRAJECTORY_SIZE, n), trajectories)
        .expect("trajectory batches have consistent width");
    let raw_mean = draws
        .mean_axis(Axis(0))
        .expect("at least one trajectory row");

    let window = smoothing_window(n);
    let mean = savgol_filter(raw_mean.view(), window, SMOOTH_DEGREE)?
        .mapv(|v| if v > 0.0 { v } else { 0.0 });

    Ok(PredictiveSamples { mean, draws })
}

/// Window sized to roughly half the grid length, forced odd.
fn smoothing_window(n: usize) -> usize {
    let mut w = n / 2 + 1;
    if w % 2 == 0 {
        w += 1;
    }
    w.min(if n % 2 == 0 { n - 1 } else { n })
}

/// Savitzky-Golay smoothing: a least-squares polynomial fit in a sliding
/// window, with the edge windows anchored inside the signal and the fitted
/// polynomial evaluated at the off-center position (the `interp` edge rule).
pub fn savgol_filter(
    y: ArrayView1<'_, f64>,
    window: usize,
    degree: usize,
) -> Result<Array1<f64>, LinalgError> {
    let n = y.len();
    if window <= degree || window > n {
        return Ok(y.to_owned());
    }
    let half = window / 2;
    let center = (window - 1) as f64 / 2.0;

    let mut out = Array1::zeros(n);
    for i in 0..n {
        let start = i.saturating_sub(half).min(n - window);
        let coeffs = fit_window_polynomial(&y.slice(ndarray::s![start..start + window]), degree, center)?;
        let t = (i - start) as f64 - center;
        let mut value = 0.0;
        let mut power = 1.0;
        for &c in coeffs.iter() {
            value += c * power;
            power *= t;
        }
        out[i] = value;
    }
    Ok(out)
}

/// Least-squares cubic (or lower) fit over one window, offsets centered for
/// conditioning. Returns the polynomial coefficients, constant term first.
fn fit_window_polynomial(
    window_values: &ArrayView1<'_, f64>,
    degree: usize,
    center: f64,
) -> Result<Array1<f64>, LinalgError> {
    let _w = window_values.len();
    let k = degree + 1;
    let mut xtx = Array2::<f64>::zeros((k, k));
    let mut xty = Array1::<f64>::zeros(k);
    for (offset, &v) in window_values.iter().enumerate() {
        let t = offset as f64 - center;
        let mut powers = vec![1.0; k];
        for p in 1..k {
            powers[p] = powers[p - 1] * t;
        }
        for a in 0..k {
            xty[a] += powers[a] * v;
            for b in 0..k {
                xtx[[a, b]] += powers[a] * powers[b];
            }
        }
    }
    xtx.solve(&xty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn smoothing_window_is_odd_and_in_range() {
        assert_eq!(smoothing_window(100), 51);
        assert_eq!(smoothing_window(10), 7);
        for n in 6..200 {
            let w = smoothing_window(n);
            assert_eq!(w % 2, 1);
            assert!(w <= n);
        }
    }

    #[test]
    fn savgol_reproduces_a_cubic_exactly() {
        let x = Array1::linspace(-2.0, 2.0, 41);
        let y = x.mapv(|v| 0.5 * v * v * v - v * v + 2.0 * v - 3.0);
        let smoothed = savgol_filter(y.view(), 11, 3).unwrap();
        for (a, b) in y.iter().zip(smoothed.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn savgol_flattens_noise_on_a_constant_signal() {
        let y = Array1::from_elem(60, 4.0);
        let smoothed = savgol_filter(y.view(), 31, 3).unwrap();
        for &v in smoothed.iter() {
            assert_abs_diff_eq!(v, 4.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn degenerate_window_returns_input() {
        let y = Array1::from(vec![1.0, 2.0, 3.0]);
        let smoothed = savgol_filter(y.view(), 9, 3).unwrap();
        assert_eq!(smoothed, y);
    }
}
