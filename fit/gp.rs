//! # Default Inference Engine
//!
//! A Gaussian-process regression engine over one covariate dimension. The
//! Gaussian family uses exact inference; count families use a Laplace
//! approximation around the posterior mode (Newton inner loop on a jittered
//! Cholesky). Hyperparameters are optimized in log space with BFGS using
//! central-difference gradients; non-finite costs inside the line search are
//! replaced by a large finite value so the search can back off, while a
//! failure at the anchor evaluations surfaces as a decomposition error the
//! driver knows how to retry.
//!
//! The inducing-point input exists for engines with sparse approximations;
//! this engine performs exact inference and leaves those points to the
//! control loop's evaluation grids.

use crate::engine::{
    EngineError, FitInput, FitReport, InferenceEngine, KernelSpec, LikelihoodSpec,
};
use crate::family::Family;
use crate::hyper::CONSTANT_LENGTHSCALE;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Cholesky, Solve, UPLO};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use wolfe_bfgs::{Bfgs, BfgsSolution};

const NEWTON_MAX_ITERATIONS: usize = 50;
const NEWTON_TOLERANCE: f64 = 1e-8;
const GRADIENT_STEP: f64 = 1e-4;
/// Stand-in cost when an evaluation fails inside the line search.
const GUARD_COST: f64 = 1e10;
const JITTERS: [f64; 6] = [0.0, 1e-10, 1e-8, 1e-6, 1e-4, 1e-2];

/// The default engine. Fields bound the hyperparameter optimizer.
#[derive(Debug, Clone, Copy)]
pub struct GpEngine {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for GpEngine {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-5,
        }
    }
}

/// Fitted kernel, preserved in checkpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FittedKernel {
    Rbf { lengthscale: f64, variance: f64 },
    Constant { variance: f64 },
}

/// A fitted model: training data plus resolved hyperparameters. Posterior
/// quantities are recomputed on demand, which keeps snapshots small and
/// reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpModel {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub kernel: FittedKernel,
    pub family: Family,
    pub alpha: f64,
    pub km: f64,
    /// Gaussian observation-noise variance (unused by count families).
    pub noise: f64,
    pub log_marginal: f64,
}

// Free-parameter layout of the optimization vector, in log space.
struct ParamLayout {
    lengthscale: Option<usize>,
    variance: usize,
    noise: Option<usize>,
    alpha: Option<usize>,
    km: Option<usize>,
    len: usize,
}

impl ParamLayout {
    fn new(kernel: &KernelSpec, likelihood: &LikelihoodSpec) -> Self {
        let mut next = 0usize;
        let mut take = || {
            let idx = next;
            next += 1;
            idx
        };
        let lengthscale = match kernel {
            KernelSpec::Rbf {
                optimize_lengthscale: true,
                ..
            } => Some(take()),
            _ => None,
        };
        let variance = take();
        let noise = matches!(likelihood.family, Family::Gaussian).then(&mut take);
        let free_nuisance = !likelihood.fix_nuisance;
        let alpha = (likelihood.family.has_dispersion() && free_nuisance).then(&mut take);
        let km = (likelihood.family.has_saturation() && free_nuisance).then(&mut take);
        Self {
            lengthscale,
            variance,
            noise,
            alpha,
            km,
            len: next,
        }
    }
}

// Hyperparameters resolved from the optimization vector plus the fixed spec
// values. `lengthscale == None` selects the constant kernel.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    lengthscale: Option<f64>,
    variance: f64,
    noise: f64,
    alpha: f64,
    km: f64,
}

impl Resolved {
    fn from_theta(
        theta: &Array1<f64>,
        layout: &ParamLayout,
        kernel: &KernelSpec,
        likelihood: &LikelihoodSpec,
    ) -> Self {
        let pick = |idx: Option<usize>, fallback: f64| {
            idx.map(|i| theta[i].exp()).unwrap_or(fallback)
        };
        let lengthscale = match kernel {
            KernelSpec::Constant { .. } => None,
            KernelSpec::Rbf { lengthscale, .. } => {
                Some(pick(layout.lengthscale, *lengthscale))
            }
        };
        Resolved {
            lengthscale,
            variance: theta[layout.variance].exp(),
            noise: pick(layout.noise, 1.0),
            alpha: pick(layout.alpha, likelihood.alpha).max(1e-6),
            km: pick(layout.km, likelihood.km).max(0.0),
        }
    }

    fn initial_theta(layout: &ParamLayout, kernel: &KernelSpec, likelihood: &LikelihoodSpec) -> Array1<f64> {
        let mut theta = Array1::zeros(layout.len);
        let log = |v: f64| v.max(1e-6).ln();
        if let (Some(i), KernelSpec::Rbf { lengthscale, .. }) = (layout.lengthscale, kernel) {
            theta[i] = log(*lengthscale);
        }
        let variance = match kernel {
            KernelSpec::Rbf { variance, .. } | KernelSpec::Constant { variance } => *variance,
        };
        theta[layout.variance] = log(variance);
        if let Some(i) = layout.noise {
            theta[i] = log(1.0);
        }
        if let Some(i) = layout.alpha {
            theta[i] = log(likelihood.alpha);
        }
        if let Some(i) = layout.km {
            theta[i] = log(likelihood.km);
        }
        theta
    }
}

// Everything the BFGS cost closure needs, shared by reference with the
// post-optimization fallback path.
struct FitProblem {
    kernel: KernelSpec,
    likelihood: LikelihoodSpec,
    layout: ParamLayout,
    x: Array1<f64>,
    y: Array1<f64>,
    best: Mutex<(f64, Array1<f64>)>,
}

impl FitProblem {
    fn cost(&self, theta: &Array1<f64>) -> f64 {
        let params = Resolved::from_theta(theta, &self.layout, &self.kernel, &self.likelihood);
        match marginal_likelihood(&params, self.likelihood.family, self.x.view(), self.y.view()) {
            Ok(lml) if lml.is_finite() => {
                let cost = -lml;
                let mut guard = self.best.lock().expect("cost closure cannot poison the lock");
                if cost < guard.0 {
                    *guard = (cost, theta.clone());
                }
                cost
            }
            _ => GUARD_COST,
        }
    }
}

fn kernel_value(params: &Resolved, a: f64, b: f64) -> f64 {
    match params.lengthscale {
        None => params.variance,
        Some(ls) => {
            let d = (a - b) / ls;
            params.variance * (-0.5 * d * d).exp()
        }
    }
}

fn kernel_matrix(params: &Resolved, x1: ArrayView1<'_, f64>, x2: ArrayView1<'_, f64>) -> Array2<f64> {
    let mut k = Array2::zeros((x1.len(), x2.len()));
    for (i, &a) in x1.iter().enumerate() {
        for (j, &b) in x2.iter().enumerate() {
            k[[i, j]] = kernel_value(params, a, b);
        }
    }
    k
}

fn jittered_cholesky(a: &Array2<f64>) -> Result<Array2<f64>, String> {
    let mut last = String::new();
    for &jitter in JITTERS.iter() {
        let mut m = a.clone();
        if jitter > 0.0 {
            for i in 0..m.nrows() {
                m[[i, i]] += jitter;
            }
        }
        match m.cholesky(UPLO::Lower) {
            Ok(l) => return Ok(l),
            Err(e) => last = e.to_string(),
        }
    }
    Err(last)
}

fn log_det_from_cholesky(l: &Array2<f64>) -> f64 {
    (0..l.nrows()).map(|i| l[[i, i]].ln()).sum::<f64>() * 2.0
}

// Forward substitution L z = b against a lower-triangular Cholesky factor.
// The diagonal is strictly positive whenever the factorization succeeded.
fn forward_substitute(l: &Array2<f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = b.len();
    let mut z = Array1::zeros(n);
    for i in 0..n {
        let mut s = b[i];
        for j in 0..i {
            s -= l[[i, j]] * z[j];
        }
        z[i] = s / l[[i, i]];
    }
    z
}

// Exact Gaussian log marginal likelihood.
fn gaussian_lml(
    params: &Resolved,
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
) -> Result<f64, String> {
    let n = x.len();
    let mut a = kernel_matrix(params, x, x);
    for i in 0..n {
        a[[i, i]] += params.noise;
    }
    let l = jittered_cholesky(&a)?;
    // y' A^-1 y = |L^-1 y|^2 with A = L L', so the quadratic term and the
    // determinant come from the same (possibly jittered) factor.
    let z = forward_substitute(&l, y);
    let fit_term = z.dot(&z);
    Ok(-0.5 * fit_term - 0.5 * log_det_from_cholesky(&l) - n as f64 / 2.0 * (2.0 * PI).ln())
}

// Posterior mode and Laplace marginal likelihood for count families.
struct LaplaceFit {
    #[allow(dead_code)]
    mode: Array1<f64>,
    grad_at_mode: Array1<f64>,
    curvature: Array1<f64>,
    log_marginal: f64,
}

fn laplace_fit(
    params: &Resolved,
    family: Family,
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
) -> Result<LaplaceFit, String> {
    let n = x.len();
    let k = kernel_matrix(params, x, x);
    let mut f = Array1::<f64>::zeros(n);
    let mut objective = f64::NEG_INFINITY;
    let mut log_det = 0.0;

    for _ in 0..NEWTON_MAX_ITERATIONS {
        let grad = Array1::from_iter(
            y.iter()
                .zip(f.iter())
                .map(|(&yi, &fi)| family.d_log_pmf(yi, fi, params.alpha, params.km)),
        );
        let w = Array1::from_iter(
            y.iter()
                .zip(f.iter())
                .map(|(&yi, &fi)| family.curvature(yi, fi, params.alpha, params.km)),
        );
        let sw = w.mapv(f64::sqrt);

        let mut b = Array2::<f64>::eye(n);
        for i in 0..n {
            for j in 0..n {
                b[[i, j]] += sw[i] * k[[i, j]] * sw[j];
            }
        }
        let l = jittered_cholesky(&b)?;
        log_det = log_det_from_cholesky(&l);

        let rhs = &w * &f + &grad;
        let kb = k.dot(&rhs);
        let inner = b.solve(&(&sw * &kb)).map_err(|e| e.to_string())?;
        let a_vec = &rhs - &(&sw * &inner);
        let f_new = k.dot(&a_vec);

        let log_lik: f64 = y
            .iter()
            .zip(f_new.iter())
            .map(|(&yi, &fi)| family.log_pmf(yi, fi, params.alpha, params.km))
            .sum();
        let objective_new = -0.5 * a_vec.dot(&f_new) + log_lik;
        if !objective_new.is_finite() {
            return Err("non-finite Laplace objective".to_string());
        }

        let change = (objective_new - objective).abs();
        f = f_new;
        objective = objective_new;
        if change < NEWTON_TOLERANCE {
            break;
        }
    }

    let grad_at_mode = Array1::from_iter(
        y.iter()
            .zip(f.iter())
            .map(|(&yi, &fi)| family.d_log_pmf(yi, fi, params.alpha, params.km)),
    );
    let curvature = Array1::from_iter(
        y.iter()
            .zip(f.iter())
            .map(|(&yi, &fi)| family.curvature(yi, fi, params.alpha, params.km)),
    );
    Ok(LaplaceFit {
        mode: f,
        grad_at_mode,
        curvature,
        log_marginal: objective - 0.5 * log_det,
    })
}

fn marginal_likelihood(
    params: &Resolved,
    family: Family,
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
) -> Result<f64, String> {
    match family {
        Family::Gaussian => gaussian_lml(params, x, y),
        _ => laplace_fit(params, family, x, y).map(|fit| fit.log_marginal),
    }
}

impl GpEngine {
    fn resolved_of(&self, model: &GpModel) -> Resolved {
        match model.kernel {
            FittedKernel::Rbf {
                lengthscale,
                variance,
            } => Resolved {
                lengthscale: Some(lengthscale),
                variance,
                noise: model.noise,
                alpha: model.alpha,
                km: model.km,
            },
            FittedKernel::Constant { variance } => Resolved {
                lengthscale: None,
                variance,
                noise: model.noise,
                alpha: model.alpha,
                km: model.km,
            },
        }
    }

    fn build_model(
        &self,
        input: &FitInput<'_>,
        likelihood: &LikelihoodSpec,
        params: &Resolved,
        log_marginal: f64,
    ) -> GpModel {
        GpModel {
            x: input.x.to_vec(),
            y: input.y.to_vec(),
            kernel: match params.lengthscale {
                Some(lengthscale) => FittedKernel::Rbf {
                    lengthscale,
                    variance: params.variance,
                },
                None => FittedKernel::Constant {
                    variance: params.variance,
                },
            },
            family: likelihood.family,
            alpha: params.alpha,
            km: params.km,
            noise: params.noise,
            log_marginal,
        }
    }

    // Posterior mean and per-point variance of the latent function, plus the
    // cross-covariance pieces needed for joint sampling.
    fn latent_posterior(
        &self,
        model: &GpModel,
        grid: ArrayView1<'_, f64>,
    ) -> Result<(Array1<f64>, Array2<f64>), EngineError> {
        let params = self.resolved_of(model);
        let x = Array1::from_vec(model.x.clone());
        let y = Array1::from_vec(model.y.clone());
        let n = x.len();
        let k_star = kernel_matrix(&params, x.view(), grid);
        let k_grid = kernel_matrix(&params, grid, grid);

        // C = K + noise*I (Gaussian) or K + W^-1 (Laplace), and the weight
        // vector the predictive mean projects onto.
        let (c, weights) = match model.family {
            Family::Gaussian => {
                let mut c = kernel_matrix(&params, x.view(), x.view());
                for i in 0..n {
                    c[[i, i]] += params.noise;
                }
                let weights = c.solve(&y)?;
                (c, weights)
            }
            family => {
                let fit = laplace_fit(&params, family, x.view(), y.view())
                    .map_err(EngineError::Decomposition)?;
                let mut c = kernel_matrix(&params, x.view(), x.view());
                for i in 0..n {
                    c[[i, i]] += 1.0 / fit.curvature[i].max(1e-12);
                }
                (c, fit.grad_at_mode)
            }
        };

        let mean = k_star.t().dot(&weights);

        let mut cov = k_grid;
        for j in 0..grid.len() {
            let col = k_star.column(j).to_owned();
            let solved = c.solve(&col)?;
            for i in 0..grid.len() {
                cov[[i, j]] -= k_star.column(i).dot(&solved);
            }
        }
        Ok((mean, cov))
    }
}

impl InferenceEngine for GpEngine {
    type Handle = GpModel;

    fn fit(
        &self,
        input: &FitInput<'_>,
        kernel: &KernelSpec,
        likelihood: &LikelihoodSpec,
        optimize: bool,
    ) -> Result<FitReport<Self::Handle>, EngineError> {
        if input.x.len() != input.y.len() {
            return Err(EngineError::InvalidSpec(format!(
                "covariates ({}) and observations ({}) differ in length",
                input.x.len(),
                input.y.len()
            )));
        }

        let layout = ParamLayout::new(kernel, likelihood);
        let theta0 = Resolved::initial_theta(&layout, kernel, likelihood);
        let family = likelihood.family;
        let x = input.x;
        let y = input.y;

        let initial = Resolved::from_theta(&theta0, &layout, kernel, likelihood);
        let initial_lml = marginal_likelihood(&initial, family, x, y)
            .map_err(EngineError::Decomposition)?;
        if !initial_lml.is_finite() {
            return Err(EngineError::Decomposition(
                "non-finite marginal likelihood at starting hyperparameters".to_string(),
            ));
        }

        if !optimize {
            let model = self.build_model(input, likelihood, &initial, initial_lml);
            return Ok(FitReport {
                handle: model,
                converged: true,
            });
        }

        // Shared state for the cost closure; tracks the best point seen in
        // case the optimizer errors out.
        let problem = Arc::new(FitProblem {
            kernel: *kernel,
            likelihood: *likelihood,
            layout,
            x: x.to_owned(),
            y: y.to_owned(),
            best: Mutex::new((-initial_lml, theta0.clone())),
        });
        let problem_for_closure = Arc::clone(&problem);
        let cost_and_grad = move |theta: &Array1<f64>| -> (f64, Array1<f64>) {
            let cost = problem_for_closure.cost(theta);
            let mut grad = Array1::zeros(theta.len());
            for i in 0..theta.len() {
                let mut hi = theta.clone();
                let mut lo = theta.clone();
                hi[i] += GRADIENT_STEP;
                lo[i] -= GRADIENT_STEP;
                grad[i] = (problem_for_closure.cost(&hi) - problem_for_closure.cost(&lo))
                    / (2.0 * GRADIENT_STEP);
            }
            (cost, grad)
        };

        let solution = Bfgs::new(theta0, cost_and_grad)
            .with_tolerance(self.tolerance)
            .with_max_iterations(self.max_iterations)
            .run();

        let (final_theta, optimizer_ok) = match solution {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) => {
                log::debug!(
                    "BFGS finished in {iterations} iterations with cost {final_value:.6}"
                );
                (final_point, final_value.is_finite() && final_value < GUARD_COST)
            }
            Err(e) => {
                log::debug!("BFGS failed: {e:?}; falling back to best visited point");
                let guard = problem.best.lock().expect("cost closure cannot poison the lock");
                (guard.1.clone(), false)
            }
        };

        let params = Resolved::from_theta(&final_theta, &problem.layout, kernel, likelihood);
        let lml = marginal_likelihood(&params, family, x, y)
            .map_err(EngineError::Decomposition)?;
        let model = self.build_model(input, likelihood, &params, lml);
        Ok(FitReport {
            handle: model,
            converged: optimizer_ok && lml.is_finite(),
        })
    }

    fn log_marginal_likelihood(&self, handle: &Self::Handle) -> f64 {
        handle.log_marginal
    }

    fn predict(
        &self,
        handle: &Self::Handle,
        grid: ArrayView1<'_, f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), EngineError> {
        let (mean, cov) = self.latent_posterior(handle, grid)?;
        let mut variance = Array1::zeros(grid.len());
        for i in 0..grid.len() {
            variance[i] = cov[[i, i]].max(0.0);
            if matches!(handle.family, Family::Gaussian) {
                variance[i] += handle.noise;
            }
        }
        Ok((mean, variance))
    }

    fn sample_latent(
        &self,
        handle: &Self::Handle,
        grid: ArrayView1<'_, f64>,
        n: usize,
        rng: &mut StdRng,
    ) -> Result<Array2<f64>, EngineError> {
        let (mean, cov) = self.latent_posterior(handle, grid)?;
        let l = jittered_cholesky(&cov).map_err(EngineError::Decomposition)?;
        let g = grid.len();
        let mut samples = Array2::zeros((n, g));
        for s in 0..n {
            let z: Array1<f64> = Array1::from_iter((0..g).map(|_| StandardNormal.sample(rng)));
            let draw = &mean + &l.dot(&z);
            samples.row_mut(s).assign(&draw);
        }
        Ok(samples)
    }

    fn lengthscale(&self, handle: &Self::Handle) -> f64 {
        match handle.kernel {
            FittedKernel::Rbf { lengthscale, .. } => lengthscale,
            FittedKernel::Constant { .. } => CONSTANT_LENGTHSCALE,
        }
    }

    fn dispersion(&self, handle: &Self::Handle) -> f64 {
        handle.alpha
    }

    fn saturation(&self, handle: &Self::Handle) -> f64 {
        handle.km
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn poisson_series() -> (Array1<f64>, Array1<f64>) {
        let x: Array1<f64> = Array1::linspace(0.0, 10.0, 20);
        let y = x.mapv(|v| (2.0 + (v / 2.0).sin() * 1.5).round().max(0.0));
        (x, y)
    }

    fn rbf_spec(lengthscale: f64, optimize_lengthscale: bool) -> KernelSpec {
        KernelSpec::Rbf {
            lengthscale,
            variance: 3.0,
            optimize_lengthscale,
        }
    }

    fn likelihood(family: Family) -> LikelihoodSpec {
        LikelihoodSpec {
            family,
            alpha: 5.0,
            km: 35.0,
            fix_nuisance: false,
        }
    }

    #[test]
    fn gaussian_fit_without_optimization_is_finite() {
        let engine = GpEngine::default();
        let x: Array1<f64> = Array1::linspace(0.0, 10.0, 20);
        let y = x.mapv(|v| (v / 3.0).sin());
        let input = FitInput {
            x: x.view(),
            y: y.view(),
            inducing: None,
        };
        let report = engine
            .fit(&input, &rbf_spec(1.0, false), &likelihood(Family::Gaussian), false)
            .unwrap();
        assert!(report.converged);
        assert!(engine.log_marginal_likelihood(&report.handle).is_finite());
    }

    #[test]
    fn gaussian_likelihood_matches_a_direct_dense_evaluation() {
        let x: Array1<f64> = Array1::linspace(0.0, 5.0, 8);
        let y = x.mapv(|v| v.sin());
        let params = Resolved {
            lengthscale: Some(1.5),
            variance: 2.0,
            noise: 0.5,
            alpha: 5.0,
            km: 35.0,
        };
        let lml = gaussian_lml(&params, x.view(), y.view()).unwrap();

        let n = x.len();
        let mut a = kernel_matrix(&params, x.view(), x.view());
        for i in 0..n {
            a[[i, i]] += params.noise;
        }
        let solved = a.solve(&y).unwrap();
        let l = a.cholesky(UPLO::Lower).unwrap();
        let expected = -0.5 * y.dot(&solved)
            - 0.5 * log_det_from_cholesky(&l)
            - n as f64 / 2.0 * (2.0 * PI).ln();
        assert_abs_diff_eq!(lml, expected, epsilon = 1e-8);
    }

    #[test]
    fn degenerate_kernel_still_yields_a_finite_gaussian_likelihood() {
        // Duplicated time points with near-zero noise make the raw covariance
        // singular; both likelihood terms must come from the factor that
        // actually decomposed.
        let x = Array1::from(vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        let y = Array1::from(vec![0.1, 0.1, 0.5, 0.5, 0.9, 0.9]);
        let params = Resolved {
            lengthscale: Some(1.0),
            variance: 1.0,
            noise: 1e-14,
            alpha: 5.0,
            km: 35.0,
        };
        let lml = gaussian_lml(&params, x.view(), y.view()).unwrap();
        assert!(lml.is_finite());
    }

    #[test]
    fn constant_kernel_predicts_a_flat_function() {
        let engine = GpEngine::default();
        let x = Array1::linspace(0.0, 10.0, 25);
        let y = Array1::from_elem(25, 4.0);
        let input = FitInput {
            x: x.view(),
            y: y.view(),
            inducing: None,
        };
        let spec = KernelSpec::Constant { variance: 3.0 };
        let report = engine
            .fit(&input, &spec, &likelihood(Family::Gaussian), true)
            .unwrap();
        let grid = Array1::linspace(0.0, 10.0, 11);
        let (mean, _) = engine.predict(&report.handle, grid.view()).unwrap();
        let first = mean[0];
        for &m in mean.iter() {
            assert_abs_diff_eq!(m, first, epsilon = 1e-6);
        }
        assert_eq!(engine.lengthscale(&report.handle), CONSTANT_LENGTHSCALE);
    }

    #[test]
    fn poisson_laplace_fit_is_finite_and_optimization_improves_it() {
        let engine = GpEngine::default();
        let (x, y) = poisson_series();
        let input = FitInput {
            x: x.view(),
            y: y.view(),
            inducing: None,
        };
        let unoptimized = engine
            .fit(&input, &rbf_spec(2.0, false), &likelihood(Family::Poisson), false)
            .unwrap();
        let optimized = engine
            .fit(&input, &rbf_spec(2.0, true), &likelihood(Family::Poisson), true)
            .unwrap();
        let before = engine.log_marginal_likelihood(&unoptimized.handle);
        let after = engine.log_marginal_likelihood(&optimized.handle);
        assert!(before.is_finite());
        assert!(after.is_finite());
        assert!(after >= before - 1e-6, "optimization regressed: {before} -> {after}");
    }

    #[test]
    fn fixed_nuisance_parameters_survive_optimization() {
        let engine = GpEngine::default();
        let (x, y) = poisson_series();
        let input = FitInput {
            x: x.view(),
            y: y.view(),
            inducing: None,
        };
        let spec = LikelihoodSpec {
            family: Family::NegativeBinomial,
            alpha: 7.25,
            km: 35.0,
            fix_nuisance: true,
        };
        let report = engine
            .fit(&input, &rbf_spec(2.0, true), &spec, true)
            .unwrap();
        assert_abs_diff_eq!(engine.dispersion(&report.handle), 7.25, epsilon = 1e-12);
    }

    #[test]
    fn latent_samples_are_deterministic_under_a_fixed_seed() {
        let engine = GpEngine::default();
        let (x, y) = poisson_series();
        let input = FitInput {
            x: x.view(),
            y: y.view(),
            inducing: None,
        };
        let report = engine
            .fit(&input, &rbf_spec(2.0, false), &likelihood(Family::Poisson), false)
            .unwrap();
        let grid = Array1::linspace(0.0, 10.0, 30);
        let mut rng_a = StdRng::seed_from_u64(3);
        let mut rng_b = StdRng::seed_from_u64(3);
        let a = engine
            .sample_latent(&report.handle, grid.view(), 5, &mut rng_a)
            .unwrap();
        let b = engine
            .sample_latent(&report.handle, grid.view(), 5, &mut rng_b)
            .unwrap();
        assert_eq!(a.shape(), &[5, 30]);
        assert_eq!(a, b);
    }

    #[test]
    fn mismatched_input_lengths_are_an_invalid_spec() {
        let engine = GpEngine::default();
        let x = Array1::linspace(0.0, 1.0, 5);
        let y = Array1::zeros(6);
        let input = FitInput {
            x: x.view(),
            y: y.view(),
            inducing: None,
        };
        let err = engine
            .fit(&input, &rbf_spec(1.0, true), &likelihood(Family::Poisson), true)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));
    }
}
