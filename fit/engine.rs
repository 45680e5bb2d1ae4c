//! # Inference Engine Seam
//!
//! The fitting control loop (driver, grid search, orchestrator) is generic
//! over this trait. The engine owns all numerics: kernel and likelihood
//! evaluation, posterior inference, and hyperparameter optimization. The two
//! recoverable pathologies it can report are modeled structurally so the
//! driver can match on them: a decomposition failure is an `Err` with a
//! dedicated variant, and optimizer non-convergence is a successful return
//! whose report is flagged unconverged. Anything else is fatal to the run.

use crate::family::Family;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Kernel requested for one fit attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelSpec {
    /// Squared-exponential kernel. `optimize_lengthscale` distinguishes the
    /// grid-sweep phase (lengthscale pinned at the candidate) from the final
    /// free-optimization fit.
    Rbf {
        lengthscale: f64,
        variance: f64,
        optimize_lengthscale: bool,
    },
    /// Constant function; the null model of a two-model test.
    Constant { variance: f64 },
}

/// Observation model and nuisance starting values for one fit attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LikelihoodSpec {
    pub family: Family,
    /// Starting dispersion (ignored by families without one).
    pub alpha: f64,
    /// Starting saturation constant (zero-inflated family only).
    pub km: f64,
    /// Hold the nuisance parameters at their starting values instead of
    /// optimizing them. Set when dispersion is carried over from a sibling
    /// dynamic-model fit so the two variants stay comparable.
    pub fix_nuisance: bool,
}

/// Training inputs for one fit attempt.
#[derive(Debug, Clone, Copy)]
pub struct FitInput<'a> {
    /// Covariate vector (time points).
    pub x: ArrayView1<'a, f64>,
    /// One feature's observation vector, same length as `x`.
    pub y: ArrayView1<'a, f64>,
    /// Representative covariate locations for sparse inference, if selected.
    pub inducing: Option<ArrayView1<'a, f64>>,
}

/// Outcome of a fit attempt that did not fail structurally.
#[derive(Debug, Clone)]
pub struct FitReport<H> {
    pub handle: H,
    /// False when the optimizer stopped without satisfying its convergence
    /// criterion; the handle is then untrustworthy and the driver retries or
    /// gives up, never inspects it.
    pub converged: bool,
}

/// Failures the engine can surface.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A matrix decomposition failed during fitting. Recoverable: the driver
    /// restarts from randomized hyperparameters with a bounded budget.
    #[error("matrix decomposition failed during fitting: {0}")]
    Decomposition(String),

    /// Linear-algebra failure outside the guarded fitting path. Fatal.
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    /// The requested kernel/likelihood combination is malformed. Fatal.
    #[error("invalid model specification: {0}")]
    InvalidSpec(String),
}

/// A black-box regression engine the control loop drives to a trustworthy fit.
pub trait InferenceEngine {
    /// Fitted-model handle. Serializable so the checkpoint store can persist
    /// it without knowing the engine's internals.
    type Handle: Clone + Serialize + DeserializeOwned;

    /// Builds a model for the given specs and, when `optimize` is set, drives
    /// its hyperparameters to a local optimum of the marginal likelihood.
    fn fit(
        &self,
        input: &FitInput<'_>,
        kernel: &KernelSpec,
        likelihood: &LikelihoodSpec,
        optimize: bool,
    ) -> Result<FitReport<Self::Handle>, EngineError>;

    /// Log marginal likelihood (or its approximation) of a fitted model.
    fn log_marginal_likelihood(&self, handle: &Self::Handle) -> f64;

    /// Posterior predictive mean and variance at the grid points.
    fn predict(
        &self,
        handle: &Self::Handle,
        grid: ArrayView1<'_, f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), EngineError>;

    /// Draws `n` joint samples of the latent function at the grid points.
    /// Shape: `[n, grid.len()]`.
    fn sample_latent(
        &self,
        handle: &Self::Handle,
        grid: ArrayView1<'_, f64>,
        n: usize,
        rng: &mut StdRng,
    ) -> Result<Array2<f64>, EngineError>;

    /// Fitted kernel lengthscale (the sentinel value for constant kernels).
    fn lengthscale(&self, handle: &Self::Handle) -> f64;

    /// Fitted dispersion, for families that carry one.
    fn dispersion(&self, handle: &Self::Handle) -> f64;

    /// Fitted saturation constant, for the zero-inflated family.
    fn saturation(&self, handle: &Self::Handle) -> f64;
}
