//! Retry-policy and test-sequencing behavior of the fitting control loop,
//! exercised against a scripted engine so every failure mode is reachable.

use chronofit::driver::fit_model;
use chronofit::engine::{
    EngineError, FitInput, FitReport, InferenceEngine, KernelSpec, LikelihoodSpec,
};
use chronofit::family::Family;
use chronofit::hyper::{CONSTANT_LENGTHSCALE, FitContext};
use chronofit::orchestrate::TestKind;
use chronofit::search::{CandidateEnv, fit_candidate};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MockHandle {
    ll: f64,
    lengthscale: f64,
    alpha: f64,
    km: f64,
    /// Constant level the mock reports as its predictive mean.
    predict_level: f64,
}

fn handle(ll: f64, predict_level: f64) -> MockHandle {
    MockHandle {
        ll,
        lengthscale: 1.0,
        alpha: 1.0,
        km: 35.0,
        predict_level,
    }
}

#[derive(Debug, Clone)]
enum Step {
    Decompose,
    Unconverged,
    Ok(MockHandle),
}

struct MockEngine {
    script: RefCell<VecDeque<Step>>,
    /// Every fit call's likelihood spec and optimize flag, in order.
    calls: RefCell<Vec<(KernelSpec, LikelihoodSpec, bool)>>,
}

impl MockEngine {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            script: RefCell::new(steps.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn fit_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl InferenceEngine for MockEngine {
    type Handle = MockHandle;

    fn fit(
        &self,
        _input: &FitInput<'_>,
        kernel: &KernelSpec,
        likelihood: &LikelihoodSpec,
        optimize: bool,
    ) -> Result<FitReport<MockHandle>, EngineError> {
        self.calls.borrow_mut().push((*kernel, *likelihood, optimize));
        match self.script.borrow_mut().pop_front() {
            Some(Step::Decompose) => Err(EngineError::Decomposition("not positive definite".into())),
            Some(Step::Unconverged) => Ok(FitReport {
                handle: MockHandle::default(),
                converged: false,
            }),
            Some(Step::Ok(h)) => Ok(FitReport {
                handle: h,
                converged: true,
            }),
            None => Err(EngineError::InvalidSpec("scripted engine ran dry".into())),
        }
    }

    fn log_marginal_likelihood(&self, handle: &MockHandle) -> f64 {
        handle.ll
    }

    fn predict(
        &self,
        handle: &MockHandle,
        grid: ArrayView1<'_, f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), EngineError> {
        Ok((
            Array1::from_elem(grid.len(), handle.predict_level),
            Array1::ones(grid.len()),
        ))
    }

    fn sample_latent(
        &self,
        handle: &MockHandle,
        grid: ArrayView1<'_, f64>,
        n: usize,
        _rng: &mut StdRng,
    ) -> Result<Array2<f64>, EngineError> {
        // Latent values chosen so exp(f) reproduces the predictive level.
        let f = handle.predict_level.max(1e-9).ln();
        Ok(Array2::from_elem((n, grid.len()), f))
    }

    fn lengthscale(&self, handle: &MockHandle) -> f64 {
        handle.lengthscale
    }

    fn dispersion(&self, handle: &MockHandle) -> f64 {
        handle.alpha
    }

    fn saturation(&self, handle: &MockHandle) -> f64 {
        handle.km
    }
}

/// Observations whose mean the benign predictive level matches, so the
/// range heuristic stays quiet.
fn quiet_context(family: Family, model_count: usize, optimize_lengthscale: bool) -> FitContext {
    FitContext::new(
        Array1::linspace(0.0, 10.0, 12),
        Array1::from_elem(12, 2.0),
        None,
        family,
        model_count,
        5.0,
        optimize_lengthscale,
    )
}

#[test]
fn numerical_failures_retry_with_fresh_seeds_until_success() {
    let engine = MockEngine::new(vec![
        Step::Decompose,
        Step::Decompose,
        Step::Decompose,
        Step::Ok(handle(-5.0, 2.0)),
    ]);
    let mut ctx = quiet_context(Family::Gaussian, 1, true);

    let outcome = fit_model(&engine, &mut ctx, false).unwrap();
    assert_eq!(outcome.log_likelihood, -5.0);
    assert!(outcome.handle.is_some());
    assert_eq!(ctx.count_fix, 3);
    // One seed advance per randomized restart.
    assert_eq!(ctx.seed_value, 3);
    assert_eq!(engine.fit_count(), 4);
}

#[test]
fn exhausted_numerical_budget_degrades_to_nan() {
    let engine = MockEngine::new(vec![Step::Decompose; 11]);
    let mut ctx = quiet_context(Family::Gaussian, 1, true);

    let outcome = fit_model(&engine, &mut ctx, false).unwrap();
    assert!(outcome.log_likelihood.is_nan());
    assert!(outcome.handle.is_none());
    assert_eq!(ctx.count_fix, 10);
    assert_eq!(engine.fit_count(), 11);
}

#[test]
fn optimizer_non_convergence_uses_the_same_restart_budget() {
    let engine = MockEngine::new(vec![
        Step::Unconverged,
        Step::Decompose,
        Step::Ok(handle(-2.0, 2.0)),
    ]);
    let mut ctx = quiet_context(Family::Gaussian, 1, true);

    let outcome = fit_model(&engine, &mut ctx, false).unwrap();
    assert_eq!(outcome.log_likelihood, -2.0);
    assert_eq!(ctx.count_fix, 2);
}

#[test]
fn pinned_lengthscale_mode_never_retries() {
    let engine = MockEngine::new(vec![Step::Decompose]);
    let mut ctx = quiet_context(Family::Gaussian, 1, false);

    let outcome = fit_model(&engine, &mut ctx, false).unwrap();
    assert!(outcome.log_likelihood.is_nan());
    assert_eq!(ctx.count_fix, 0);
    assert_eq!(engine.fit_count(), 1);
}

#[test]
fn out_of_range_predictions_trigger_a_randomized_refit() {
    // First fit predicts far outside the observed range, second is benign.
    let engine = MockEngine::new(vec![
        Step::Ok(handle(-1.0, 50.0)),
        Step::Ok(handle(-4.0, 2.0)),
    ]);
    let mut ctx = quiet_context(Family::Gaussian, 1, true);

    let outcome = fit_model(&engine, &mut ctx, false).unwrap();
    assert_eq!(outcome.log_likelihood, -4.0);
    assert_eq!(ctx.count_fix, 1);
    assert_eq!(engine.fit_count(), 2);
}

#[test]
fn range_heuristic_respects_its_tighter_budget() {
    // Same suspicious handle every time; with the counter at the optima cap
    // the fit is accepted as-is.
    let engine = MockEngine::new(vec![Step::Ok(handle(-1.0, 50.0))]);
    let mut ctx = quiet_context(Family::Gaussian, 1, true);
    ctx.count_fix = 5;

    let outcome = fit_model(&engine, &mut ctx, true).unwrap();
    assert_eq!(outcome.log_likelihood, -1.0);
    assert_eq!(ctx.count_fix, 5);
    assert_eq!(engine.fit_count(), 1);
}

#[test]
fn load_only_mode_skips_optimization_and_checks() {
    let engine = MockEngine::new(vec![Step::Ok(handle(-1.0, 50.0))]);
    let mut ctx = quiet_context(Family::Gaussian, 1, true);
    ctx.optimize = false;

    let outcome = fit_model(&engine, &mut ctx, false).unwrap();
    assert_eq!(outcome.log_likelihood, -1.0);
    let calls = engine.calls.borrow();
    assert!(!calls[0].2, "load-only mode must not request optimization");
}

fn env<'a>(
    engine: &'a MockEngine,
    kind: TestKind,
    family: Family,
    halves: Option<(chronofit::search::Series, chronofit::search::Series)>,
) -> CandidateEnv<'a, MockEngine> {
    CandidateEnv {
        engine,
        kind,
        family,
        feature: "geneA",
        sparse: false,
        series: (
            Array1::linspace(0.0, 10.0, 12),
            Array1::from_elem(12, 2.0),
            None,
        ),
        halves,
        store: None,
    }
}

#[test]
fn one_sample_row_is_dynamic_constant_and_their_difference() {
    let engine = MockEngine::new(vec![
        Step::Ok(handle(-3.0, 2.0)),
        Step::Ok(handle(-5.0, 2.0)),
    ]);
    let env = env(&engine, TestKind::OneSample, Family::Gaussian, None);

    let outcome = fit_candidate(&env, 5.0, false).unwrap();
    assert_eq!(outcome.cells, vec![-3.0, -5.0, 2.0]);

    // The constant variant must have been requested with the sentinel
    // constant kernel.
    let calls = engine.calls.borrow();
    assert!(matches!(calls[0].0, KernelSpec::Rbf { .. }));
    assert!(matches!(calls[1].0, KernelSpec::Constant { .. }));
}

#[test]
fn dynamic_dispersion_is_carried_into_the_constant_fit() {
    let mut dynamic = handle(-3.0, 2.0);
    dynamic.alpha = 7.5;
    let engine = MockEngine::new(vec![Step::Ok(dynamic), Step::Ok(handle(-5.0, 2.0))]);
    let env = env(&engine, TestKind::OneSample, Family::NegativeBinomial, None);

    fit_candidate(&env, 5.0, false).unwrap();

    let calls = engine.calls.borrow();
    assert_eq!(calls.len(), 2);
    let constant_spec = calls[1].1;
    assert_eq!(constant_spec.alpha, 7.5);
    assert!(constant_spec.fix_nuisance);
    // The dynamic fit itself starts from the default dispersion, unfixed.
    assert_eq!(calls[0].1.alpha, 5.0);
    assert!(!calls[0].1.fix_nuisance);
}

#[test]
fn short_lengthscale_with_flat_ratio_refits_both_variants() {
    // Dynamic lengthscale collapses below 10% of the covariate span while
    // the ratio rounds to zero; both variants must be refit from randomized
    // state and the refit pair's likelihoods replace the originals.
    let mut collapsed = handle(-5.0, 2.0);
    collapsed.lengthscale = 0.5;
    let engine = MockEngine::new(vec![
        Step::Ok(collapsed),
        Step::Ok(handle(-5.0, 2.0)),
        Step::Ok(handle(-2.0, 2.0)),
        Step::Ok(handle(-6.0, 2.0)),
    ]);
    let env = env(&engine, TestKind::OneSample, Family::Gaussian, None);

    let outcome = fit_candidate(&env, 5.0, true).unwrap();
    assert_eq!(outcome.cells, vec![-2.0, -6.0, 4.0]);

    let calls = engine.calls.borrow();
    assert_eq!(calls.len(), 4);
    assert!(matches!(calls[2].0, KernelSpec::Rbf { .. }));
    assert!(matches!(calls[3].0, KernelSpec::Constant { .. }));
}

#[test]
fn well_separated_pair_is_accepted_without_a_refit() {
    let engine = MockEngine::new(vec![
        Step::Ok(handle(-3.0, 2.0)),
        Step::Ok(handle(-5.0, 2.0)),
    ]);
    let env = env(&engine, TestKind::OneSample, Family::Gaussian, None);

    // Lengthscale 1.0 sits exactly at 10% of the span and the ratio is
    // positive, so neither divergence arm fires.
    let outcome = fit_candidate(&env, 5.0, true).unwrap();
    assert_eq!(outcome.cells, vec![-3.0, -5.0, 2.0]);
    assert_eq!(engine.fit_count(), 2);
}

#[test]
fn saturation_divergence_refits_a_zero_inflated_pair() {
    // Lengthscale and ratio are benign; only the saturation constants of the
    // two variants drifting more than 50 apart marks the pair as divergent.
    let mut dynamic = handle(-3.0, 2.0);
    dynamic.lengthscale = 3.0;
    dynamic.km = 60.0;
    let mut constant = handle(-5.0, 2.0);
    constant.km = 1.0;
    let mut refit_dynamic = handle(-1.0, 2.0);
    refit_dynamic.lengthscale = 3.0;
    refit_dynamic.km = 30.0;
    let engine = MockEngine::new(vec![
        Step::Ok(dynamic),
        Step::Ok(constant),
        Step::Ok(refit_dynamic),
        Step::Ok(handle(-2.0, 2.0)),
    ]);

    // A zero in the observations keeps the predictive-range heuristic quiet
    // under the heavily gated zero-inflated predictive draws.
    let y = Array1::from_iter((0..12).map(|i| if i % 2 == 0 { 0.0 } else { 4.0 }));
    let env = CandidateEnv {
        engine: &engine,
        kind: TestKind::OneSample,
        family: Family::ZeroInflatedNegativeBinomial,
        feature: "geneA",
        sparse: false,
        series: (Array1::linspace(0.0, 10.0, 12), y, None),
        halves: None,
        store: None,
    };

    let outcome = fit_candidate(&env, 5.0, true).unwrap();
    assert_eq!(outcome.cells, vec![-1.0, -2.0, 1.0]);

    let calls = engine.calls.borrow();
    assert_eq!(calls.len(), 4);
    // The first constant fit starts from the original dynamic saturation,
    // the refit constant from the refit dynamic's value.
    assert_eq!(calls[1].1.km, 60.0);
    assert_eq!(calls[3].1.km, 30.0);
    assert!(calls[3].1.fix_nuisance);
}

#[test]
fn failed_dynamic_fit_poisons_the_whole_row() {
    let engine = MockEngine::new(vec![Step::Decompose]);
    let env = env(&engine, TestKind::OneSample, Family::Gaussian, None);

    let outcome = fit_candidate(&env, 5.0, false).unwrap();
    assert!(outcome.cells.iter().all(|v| v.is_nan()));
    // The constant variant is never attempted.
    assert_eq!(engine.fit_count(), 1);
}

#[test]
fn two_samples_ratio_is_halves_minus_shared() {
    let halves = (
        (
            Array1::linspace(0.0, 5.0, 6),
            Array1::from_elem(6, 2.0),
            None,
        ),
        (
            Array1::linspace(5.0, 10.0, 6),
            Array1::from_elem(6, 2.0),
            None,
        ),
    );
    let engine = MockEngine::new(vec![
        Step::Ok(handle(-10.0, 2.0)),
        Step::Ok(handle(-4.0, 2.0)),
        Step::Ok(handle(-3.0, 2.0)),
    ]);
    let env = env(&engine, TestKind::TwoSamples, Family::Gaussian, Some(halves));

    let outcome = fit_candidate(&env, 5.0, false).unwrap();
    assert_eq!(outcome.cells, vec![-10.0, -4.0, -3.0, 3.0]);
}

#[test]
fn two_samples_nan_in_any_variant_makes_the_ratio_nan() {
    let halves = (
        (
            Array1::linspace(0.0, 5.0, 6),
            Array1::from_elem(6, 2.0),
            None,
        ),
        (
            Array1::linspace(5.0, 10.0, 6),
            Array1::from_elem(6, 2.0),
            None,
        ),
    );
    let engine = MockEngine::new(vec![
        Step::Ok(handle(-10.0, 2.0)),
        Step::Decompose,
        Step::Ok(handle(-3.0, 2.0)),
    ]);
    let env = env(&engine, TestKind::TwoSamples, Family::Gaussian, Some(halves));

    let outcome = fit_candidate(&env, 5.0, false).unwrap();
    assert_eq!(outcome.cells[0], -10.0);
    assert!(outcome.cells[1].is_nan());
    assert_eq!(outcome.cells[2], -3.0);
    assert!(outcome.cells[3].is_nan());
}

#[test]
fn constant_variant_sentinel_reaches_the_engine() {
    let engine = MockEngine::new(vec![
        Step::Ok(handle(-3.0, 2.0)),
        Step::Ok(handle(-5.0, 2.0)),
    ]);
    let env = env(&engine, TestKind::OneSample, Family::Gaussian, None);
    fit_candidate(&env, 5.0, false).unwrap();

    let calls = engine.calls.borrow();
    match calls[1].0 {
        KernelSpec::Constant { variance } => assert_eq!(variance, 3.0),
        other => panic!("expected a constant kernel, got {other:?}"),
    }
    // The sentinel itself never leaks into an RBF spec.
    for (kernel, _, _) in calls.iter() {
        if let KernelSpec::Rbf { lengthscale, .. } = kernel {
            assert_ne!(*lengthscale, CONSTANT_LENGTHSCALE);
        }
    }
}
