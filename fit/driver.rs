//! # Single-Fit Driver
//!
//! Drives one model variant to a trustworthy fit. The source of truth for the
//! retry policy: decomposition failures and optimizer non-convergence share
//! one counter with a budget of [`MAX_NUMERICAL_RETRIES`]; the predictive-range
//! local-optimum heuristic shares the same counter under the tighter
//! [`MAX_OPTIMA_RETRIES`] gate. Retries restart the loop with randomized
//! hyperparameters (reset initialization) and only run while the lengthscale
//! is being optimized. An exhausted budget degrades to a NaN likelihood; it is
//! never an error, so the caller can move on to the next candidate or feature.

use crate::engine::{EngineError, FitInput, InferenceEngine};
use crate::family::Family;
use crate::hyper::{FitContext, MAX_NUMERICAL_RETRIES, MAX_OPTIMA_RETRIES};
use crate::sampler;
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Number of points in the dense evaluation grid of the detector.
const DETECTOR_GRID: usize = 100;

/// Result of one fit chain: a fitted handle with a finite log-likelihood, or
/// a NaN sentinel after the retry budget ran out.
#[derive(Debug, Clone)]
pub struct FitOutcome<H> {
    pub handle: Option<H>,
    pub log_likelihood: f64,
}

impl<H> FitOutcome<H> {
    fn failed() -> Self {
        Self {
            handle: None,
            log_likelihood: f64::NAN,
        }
    }

    pub fn is_success(&self) -> bool {
        self.log_likelihood.is_finite()
    }
}

/// Fits the variant described by `ctx`, retrying within the shared budget.
///
/// `initial_reset` starts the chain from randomized hyperparameters; the
/// cross-model detector uses it when it refits a suspect pair. Only failures
/// outside the two recoverable engine conditions propagate as errors.
pub fn fit_model<E: InferenceEngine>(
    engine: &E,
    ctx: &mut FitContext,
    initial_reset: bool,
) -> Result<FitOutcome<E::Handle>, EngineError> {
    let mut reset = initial_reset;
    loop {
        let params = ctx.init_hyper_parameters(reset);
        let (kernel, likelihood) = ctx.specs(&params);
        let input = FitInput {
            x: ctx.x.view(),
            y: ctx.y.view(),
            inducing: ctx.inducing.as_ref().map(|z| z.view()),
        };
        log::debug!(
            "fitting variant {}/{} (seed {}, lengthscale {:.4})",
            ctx.variant,
            ctx.model_count,
            ctx.seed_value,
            params.lengthscale
        );

        let report = match engine.fit(&input, &kernel, &likelihood, ctx.optimize) {
            Ok(report) => report,
            Err(EngineError::Decomposition(msg)) => {
                if ctx.count_fix < MAX_NUMERICAL_RETRIES && ctx.optimize_lengthscale {
                    ctx.count_fix += 1;
                    reset = true;
                    log::debug!(
                        "decomposition failed ({msg}); randomized restart {}/{}",
                        ctx.count_fix,
                        MAX_NUMERICAL_RETRIES
                    );
                    continue;
                }
                log::warn!("cannot fit a Gaussian process, decomposition failed: {msg}");
                return Ok(FitOutcome::failed());
            }
            Err(other) => return Err(other),
        };

        if !report.converged {
            if ctx.count_fix < MAX_NUMERICAL_RETRIES && ctx.optimize_lengthscale {
                ctx.count_fix += 1;
                reset = true;
                log::debug!(
                    "optimizer did not converge; randomized restart {}/{}",
                    ctx.count_fix,
                    MAX_NUMERICAL_RETRIES
                );
                continue;
            }
            log::warn!("cannot optimize a Gaussian process, optimization failed");
            return Ok(FitOutcome::failed());
        }

        if ctx.optimize {
            match suspicious_fit(engine, &report.handle, ctx) {
                Ok(false) => {}
                Ok(true) => {
                    ctx.count_fix += 1;
                    reset = true;
                    log::debug!(
                        "posterior-predictive range looks like a local optimum; restart {}/{}",
                        ctx.count_fix,
                        MAX_OPTIMA_RETRIES
                    );
                    continue;
                }
                // A decomposition failure while evaluating the detector gets
                // the same restart treatment as one during fitting.
                Err(EngineError::Decomposition(msg)) => {
                    if ctx.count_fix < MAX_NUMERICAL_RETRIES && ctx.optimize_lengthscale {
                        ctx.count_fix += 1;
                        reset = true;
                        log::debug!(
                            "prediction for the local-optimum check failed ({msg}); randomized restart {}/{}",
                            ctx.count_fix,
                            MAX_NUMERICAL_RETRIES
                        );
                        continue;
                    }
                    log::warn!("cannot fit a Gaussian process, decomposition failed: {msg}");
                    return Ok(FitOutcome::failed());
                }
                Err(other) => return Err(other),
            }
        }

        let log_likelihood = engine.log_marginal_likelihood(&report.handle);
        return Ok(FitOutcome {
            handle: Some(report.handle),
            log_likelihood,
        });
    }
}

/// Predictive-range local-optimum heuristic.
///
/// Compares summary statistics of the observations against the posterior
/// predictive mean over a dense grid. The relative-deviation test (rounded to
/// the nearest integer) is deliberately coarse and is kept exactly as the
/// established behavior, including its sensitivity to very small observed
/// means.
fn suspicious_fit<E: InferenceEngine>(
    engine: &E,
    handle: &E::Handle,
    ctx: &FitContext,
) -> Result<bool, EngineError> {
    if ctx.count_fix >= MAX_OPTIMA_RETRIES || !ctx.optimize_lengthscale {
        return Ok(false);
    }

    let (lo, hi) = ctx.grid_bounds();
    let grid = Array1::linspace(lo, hi, DETECTOR_GRID);
    let predicted = match ctx.family {
        Family::Gaussian => engine.predict(handle, grid.view())?.0,
        _ => {
            let mut rng = StdRng::seed_from_u64(ctx.seed_value);
            sampler::posterior_predictive(engine, handle, grid.view(), ctx.family, &mut rng)?.mean
        }
    };

    let y_mean = ctx.y.mean().unwrap_or(0.0);
    let mean_mean = predicted.mean().unwrap_or(0.0);
    let y_max = ctx.y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean_max = predicted.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let y_min = ctx.y.iter().copied().fold(f64::INFINITY, f64::min).abs();
    let mean_min = predicted.iter().copied().fold(f64::INFINITY, f64::min).abs();

    let range_escapes = mean_max > y_max || mean_min < y_min;
    let level_off = ((mean_mean - y_mean) / y_mean).round().abs() > 0.0 || mean_mean == 0.0;
    Ok(y_mean > 0.0 && range_escapes && level_off)
}
