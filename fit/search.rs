//! # Candidate Fitting and Grid Selection
//!
//! A candidate is one starting lengthscale, expressed as a percentage of the
//! covariate span. `fit_candidate` drives the full variant sequence of the
//! active test for one candidate and yields one likelihood row; `select_best`
//! picks the winning candidate among the finished rows. The cross-model
//! local-optimum heuristic lives here because it needs both variants of a
//! two-model pair in hand before it can compare them.

use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::driver::{self, FitOutcome};
use crate::engine::{EngineError, InferenceEngine};
use crate::family::Family;
use crate::hyper::FitContext;
use crate::orchestrate::{RunError, TestKind};
use ndarray::Array1;
use std::time::{Duration, Instant};

/// Lengthscale fraction of the span below which a dynamic fit is suspected
/// of having collapsed onto noise.
const SHORT_LENGTHSCALE_FRACTION: f64 = 0.10;

/// Saturation-constant divergence beyond which a zero-inflated pair is
/// suspected of having split onto incompatible optima.
const SATURATION_DIVERGENCE: f64 = 50.0;

/// One series of a two-samples test: covariates, observations, and the
/// inducing points selected for it.
pub type Series = (Array1<f64>, Array1<f64>, Option<Array1<f64>>);

/// Inputs shared by every candidate fit of one feature.
pub struct CandidateEnv<'a, E: InferenceEngine> {
    pub engine: &'a E,
    pub kind: TestKind,
    pub family: Family,
    pub feature: &'a str,
    pub sparse: bool,
    /// Full series (observations already transformed where applicable).
    pub series: Series,
    /// The two half-series, present only for the two-samples test.
    pub halves: Option<(Series, Series)>,
    /// Snapshots are written only for the final optimizing fit.
    pub store: Option<&'a CheckpointStore>,
}

/// One finished candidate: the likelihood row plus fit bookkeeping.
#[derive(Debug, Clone)]
pub struct CandidateOutcome {
    /// Per-model log likelihoods followed by the ratio column, in the order
    /// given by [`TestKind::columns`].
    pub cells: Vec<f64>,
    pub elapsed: Duration,
    /// Final value of the shared retry counter.
    pub retries: u32,
}

impl CandidateOutcome {
    /// A row is usable for selection only when every cell is finite.
    pub fn is_complete(&self) -> bool {
        self.cells.iter().all(|v| v.is_finite())
    }
}

/// Fits every model variant of the active test for one candidate.
///
/// `optimize_lengthscale` is false during the grid sweep (the candidate is
/// held fixed, no retries) and true for the final fit of the winning
/// candidate. A NaN in any variant makes the dependent cells of the row NaN
/// too; only fatal engine errors propagate.
pub fn fit_candidate<E: InferenceEngine>(
    env: &CandidateEnv<'_, E>,
    candidate: f64,
    optimize_lengthscale: bool,
) -> Result<CandidateOutcome, RunError> {
    let start = Instant::now();
    let (x, y, inducing) = env.series.clone();
    let mut ctx = FitContext::new(
        x,
        y,
        inducing,
        env.family,
        env.kind.model_count(),
        candidate,
        optimize_lengthscale,
    );

    let cells = match env.kind {
        TestKind::InferTrajectory => {
            let outcome = fit_variant(env, &mut ctx, 1, false)?;
            vec![outcome.log_likelihood]
        }
        TestKind::OneSample => one_sample_cells(env, &mut ctx)?,
        TestKind::TwoSamples => two_samples_cells(env, &mut ctx)?,
    };

    Ok(CandidateOutcome {
        cells,
        elapsed: start.elapsed(),
        retries: ctx.count_fix,
    })
}

/// Picks the index of the winning candidate row, or `None` when every row has
/// a NaN cell. Single-model tests select on the log likelihood itself,
/// multi-model tests on the likelihood-ratio column.
pub fn select_best(rows: &[CandidateOutcome], kind: TestKind) -> Option<usize> {
    let column = kind.selection_column();
    rows.iter()
        .enumerate()
        .filter(|(_, row)| row.is_complete())
        .max_by(|(_, a), (_, b)| {
            a.cells[column]
                .partial_cmp(&b.cells[column])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(index, _)| index)
}

fn one_sample_cells<E: InferenceEngine>(
    env: &CandidateEnv<'_, E>,
    ctx: &mut FitContext,
) -> Result<Vec<f64>, RunError> {
    let dynamic = fit_variant(env, ctx, 1, false)?;
    let mut ll_dynamic = dynamic.log_likelihood;
    let mut ll_constant = f64::NAN;

    if dynamic.is_success() {
        let ls_dynamic = record_nuisance(env, &dynamic, ctx);
        let constant = fit_variant(env, ctx, 2, false)?;
        ll_constant = constant.log_likelihood;

        if constant.is_success()
            && ctx.optimize_lengthscale
            && divergent_pair(env, ls_dynamic, &dynamic, &constant)
        {
            log::debug!(
                "feature {}: pair looks divergent (lengthscale {:.4}); refitting from randomized state",
                env.feature,
                ls_dynamic
            );
            let refit_dynamic = fit_variant(env, ctx, 1, true)?;
            ll_dynamic = refit_dynamic.log_likelihood;
            if refit_dynamic.is_success() {
                record_nuisance(env, &refit_dynamic, ctx);
                let refit_constant = fit_variant(env, ctx, 2, true)?;
                ll_constant = refit_constant.log_likelihood;
            } else {
                ll_constant = f64::NAN;
            }
        }
    }

    let ratio = if ll_dynamic.is_finite() && ll_constant.is_finite() {
        ll_dynamic - ll_constant
    } else {
        ll_constant = f64::NAN;
        f64::NAN
    };
    Ok(vec![ll_dynamic, ll_constant, ratio])
}

fn two_samples_cells<E: InferenceEngine>(
    env: &CandidateEnv<'_, E>,
    ctx: &mut FitContext,
) -> Result<Vec<f64>, RunError> {
    let shared = fit_variant(env, ctx, 1, false)?;

    let (first, second) = env
        .halves
        .clone()
        .ok_or_else(|| EngineError::InvalidSpec("two-samples test requires half-series".into()))?;

    ctx.set_series(first.0, first.1, first.2);
    let half_one = fit_variant(env, ctx, 2, false)?;

    ctx.set_series(second.0, second.1, second.2);
    let half_two = fit_variant(env, ctx, 3, false)?;

    let (ll_shared, ll_one, ll_two) = (
        shared.log_likelihood,
        half_one.log_likelihood,
        half_two.log_likelihood,
    );
    let ratio = if ll_shared.is_finite() && ll_one.is_finite() && ll_two.is_finite() {
        (ll_one + ll_two) - ll_shared
    } else {
        f64::NAN
    };
    Ok(vec![ll_shared, ll_one, ll_two, ratio])
}

fn fit_variant<E: InferenceEngine>(
    env: &CandidateEnv<'_, E>,
    ctx: &mut FitContext,
    variant: usize,
    reset: bool,
) -> Result<FitOutcome<E::Handle>, RunError> {
    ctx.variant = variant;
    let outcome = driver::fit_model(env.engine, ctx, reset)?;
    if ctx.optimize_lengthscale {
        if let (Some(store), Some(handle)) = (env.store, outcome.handle.as_ref()) {
            let key = CheckpointKey {
                family: env.family,
                sparse: env.sparse,
                paired_series: env.kind.model_count() == 3,
                feature: env.feature,
                variant,
            };
            store.save(&key, handle)?;
        }
    }
    Ok(outcome)
}

/// Copies the dynamic fit's nuisance parameters into the context so the
/// dependent constant fit starts (and stays) at the same values. Returns the
/// fitted lengthscale for the divergence check.
fn record_nuisance<E: InferenceEngine>(
    env: &CandidateEnv<'_, E>,
    dynamic: &FitOutcome<E::Handle>,
    ctx: &mut FitContext,
) -> f64 {
    let Some(handle) = dynamic.handle.as_ref() else {
        return f64::NAN;
    };
    if env.family.has_dispersion() {
        ctx.carried_alpha = Some(env.engine.dispersion(handle));
    }
    if env.family.has_saturation() {
        ctx.carried_km = Some(env.engine.saturation(handle));
    }
    env.engine.lengthscale(handle)
}

/// Cross-model local-optimum heuristic for a fitted dynamic/constant pair.
///
/// Trips when the dynamic lengthscale collapsed well below the covariate span
/// while the likelihood ratio rounds to zero or below, or when the two
/// zero-inflated saturation constants drifted far apart.
fn divergent_pair<E: InferenceEngine>(
    env: &CandidateEnv<'_, E>,
    ls_dynamic: f64,
    dynamic: &FitOutcome<E::Handle>,
    constant: &FitOutcome<E::Handle>,
) -> bool {
    let ratio = dynamic.log_likelihood - constant.log_likelihood;
    let span = crate::hyper::span_of(&env.series.0);
    if ls_dynamic < SHORT_LENGTHSCALE_FRACTION * span && ratio.round() <= 0.0 {
        return true;
    }
    if env.family.has_saturation() {
        if let (Some(h1), Some(h2)) = (dynamic.handle.as_ref(), constant.handle.as_ref()) {
            let km_gap = (env.engine.saturation(h1) - env.engine.saturation(h2)).abs();
            if km_gap > SATURATION_DIVERGENCE {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: Vec<f64>) -> CandidateOutcome {
        CandidateOutcome {
            cells,
            elapsed: Duration::from_millis(1),
            retries: 0,
        }
    }

    #[test]
    fn single_model_selection_uses_the_log_likelihood() {
        let rows = vec![row(vec![-10.0]), row(vec![-3.5]), row(vec![-7.0])];
        assert_eq!(select_best(&rows, TestKind::InferTrajectory), Some(1));
    }

    #[test]
    fn multi_model_selection_uses_the_ratio_column() {
        let rows = vec![
            row(vec![-3.0, -9.0, 6.0]),
            row(vec![-1.0, -2.0, 1.0]),
            row(vec![-4.0, -12.0, 8.0]),
        ];
        assert_eq!(select_best(&rows, TestKind::OneSample), Some(2));
    }

    #[test]
    fn rows_with_nan_cells_never_win() {
        let rows = vec![
            row(vec![-1.0, f64::NAN, f64::NAN]),
            row(vec![-5.0, -6.0, 1.0]),
        ];
        assert_eq!(select_best(&rows, TestKind::OneSample), Some(1));
    }

    #[test]
    fn all_failed_rows_select_nothing() {
        let rows = vec![row(vec![f64::NAN]), row(vec![f64::NAN])];
        assert_eq!(select_best(&rows, TestKind::InferTrajectory), None);
    }
}
