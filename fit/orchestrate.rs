//! # Test Orchestration
//!
//! The per-run driver: walks the feature rows of a dataset, runs the grid
//! sweep and the final optimizing fit for each, and collects one result row
//! per feature in input order. A feature whose fits all failed still yields a
//! row (of NaN cells); only fatal engine or I/O failures abort the run.

use crate::checkpoint::{CheckpointError, CheckpointKey, CheckpointStore};
use crate::data::CountDataset;
use crate::engine::{EngineError, InferenceEngine};
use crate::family::Family;
use crate::hyper::FALLBACK_CANDIDATE;
use crate::sampler;
use crate::search::{self, CandidateEnv, CandidateOutcome, Series};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Statistical test selecting how many model variants are fit per feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    /// Fit the dynamic model only and report its log likelihood.
    InferTrajectory,
    /// Dynamic model against a constant null on the full series.
    OneSample,
    /// Independent fits of the two half-series against one shared fit.
    TwoSamples,
}

impl TestKind {
    pub fn model_count(self) -> usize {
        match self {
            TestKind::InferTrajectory => 1,
            TestKind::OneSample => 2,
            TestKind::TwoSamples => 3,
        }
    }

    /// Result-table column names, likelihoods first, ratio last.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            TestKind::InferTrajectory => &["log_likelihood"],
            TestKind::OneSample => &[
                "dynamic_model_log_likelihood",
                "constant_model_log_likelihood",
                "log_likelihood_ratio",
            ],
            TestKind::TwoSamples => &[
                "shared_model_log_likelihood",
                "model_1_log_likelihood",
                "model_2_log_likelihood",
                "log_likelihood_ratio",
            ],
        }
    }

    /// Cell index the grid selection maximizes.
    pub fn selection_column(self) -> usize {
        match self {
            TestKind::InferTrajectory => 0,
            TestKind::OneSample => 2,
            TestKind::TwoSamples => 3,
        }
    }
}

/// Run-wide options shared by every feature.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub family: Family,
    /// Starting-lengthscale candidates as percentages of the covariate span.
    /// A single-entry grid skips the sweep.
    pub grid: Vec<f64>,
    /// Select inducing points and fit on them.
    pub sparse: bool,
    /// Apply `ln(y + 1)` to Gaussian observations before fitting.
    pub transform: bool,
    /// Directory for model snapshots; `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            family: Family::NegativeBinomial,
            grid: vec![FALLBACK_CANDIDATE],
            sparse: false,
            transform: true,
            checkpoint_dir: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to write results: {0}")]
    IoError(#[from] std::io::Error),
}

/// One feature's result: the likelihood cells of the winning fit.
#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub feature: String,
    pub cells: Vec<f64>,
    pub elapsed: Duration,
    pub retries: u32,
}

/// Per-feature results of one run, in dataset order.
#[derive(Debug, Clone)]
pub struct ResultTable {
    pub kind: TestKind,
    pub rows: Vec<FeatureRow>,
}

impl ResultTable {
    /// Writes the table as TSV: feature name, likelihood columns, wall time
    /// and retry count.
    pub fn write_tsv<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        write!(writer, "feature")?;
        for column in self.kind.columns() {
            write!(writer, "\t{column}")?;
        }
        writeln!(writer, "\telapsed_seconds\tretries")?;
        for row in &self.rows {
            write!(writer, "{}", row.feature)?;
            for cell in &row.cells {
                write!(writer, "\t{cell:.6}")?;
            }
            writeln!(writer, "\t{:.3}\t{}", row.elapsed.as_secs_f64(), row.retries)?;
        }
        Ok(())
    }
}

/// A fitted model read back from the checkpoint store.
#[derive(Debug, Clone)]
pub struct LoadedModel<H> {
    pub feature: String,
    pub variant: usize,
    pub handle: H,
    /// Posterior predictive mean over the requested grid.
    pub predictive_mean: Array1<f64>,
}

/// Runs one statistical test over every feature of a dataset.
pub struct Runner<E: InferenceEngine> {
    engine: E,
    config: RunConfig,
}

impl<E: InferenceEngine> Runner<E> {
    pub fn new(engine: E, config: RunConfig) -> Self {
        Self { engine, config }
    }

    pub fn infer_trajectory(&self, dataset: &CountDataset) -> Result<ResultTable, RunError> {
        self.run(dataset, TestKind::InferTrajectory)
    }

    pub fn one_sample_test(&self, dataset: &CountDataset) -> Result<ResultTable, RunError> {
        self.run(dataset, TestKind::OneSample)
    }

    pub fn two_samples_test(&self, dataset: &CountDataset) -> Result<ResultTable, RunError> {
        self.run(dataset, TestKind::TwoSamples)
    }

    pub fn run(&self, dataset: &CountDataset, kind: TestKind) -> Result<ResultTable, RunError> {
        let store = match &self.config.checkpoint_dir {
            Some(dir) => Some(CheckpointStore::new(dir)?),
            None => None,
        };

        let n_features = dataset.feature_names.len();
        let progress = ProgressBar::new(n_features as u64);
        progress.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        progress.set_message(format!("{} features", self.config.family.name()));

        let mut rows = Vec::with_capacity(n_features);
        for (feature_index, feature) in dataset.feature_names.iter().enumerate() {
            let env = self.candidate_env(dataset, kind, feature_index, feature, store.as_ref());
            let outcome = self.fit_feature(&env)?;
            rows.push(FeatureRow {
                feature: feature.clone(),
                cells: outcome.cells,
                elapsed: outcome.elapsed,
                retries: outcome.retries,
            });
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(ResultTable { kind, rows })
    }

    /// Reads every variant of the listed features back from the checkpoint
    /// store and evaluates its predictive mean over `grid`. Missing or
    /// unreadable snapshots are skipped with a warning.
    pub fn load_models(
        &self,
        kind: TestKind,
        features: &[String],
        grid: ArrayView1<'_, f64>,
    ) -> Result<Vec<LoadedModel<E::Handle>>, RunError> {
        let dir = self.config.checkpoint_dir.as_ref().ok_or_else(|| {
            EngineError::InvalidSpec("loading models requires a checkpoint directory".into())
        })?;
        let store = CheckpointStore::new(dir)?;

        let mut loaded = Vec::new();
        for feature in features {
            for variant in 1..=kind.model_count() {
                let key = CheckpointKey {
                    family: self.config.family,
                    sparse: self.config.sparse,
                    paired_series: kind.model_count() == 3,
                    feature,
                    variant,
                };
                let handle: E::Handle = match store.load(&key) {
                    Ok(handle) => handle,
                    Err(err) => {
                        log::warn!("skipping snapshot {key}: {err}");
                        continue;
                    }
                };
                let predictive_mean = match self.config.family {
                    Family::Gaussian => self.engine.predict(&handle, grid)?.0,
                    _ => {
                        let mut rng = StdRng::seed_from_u64(0);
                        sampler::posterior_predictive(
                            &self.engine,
                            &handle,
                            grid,
                            self.config.family,
                            &mut rng,
                        )?
                        .mean
                    }
                };
                loaded.push(LoadedModel {
                    feature: feature.clone(),
                    variant,
                    handle,
                    predictive_mean,
                });
            }
        }
        Ok(loaded)
    }

    fn fit_feature(&self, env: &CandidateEnv<'_, E>) -> Result<CandidateOutcome, RunError> {
        let candidate = if self.config.grid.len() > 1 {
            let mut sweep = Vec::with_capacity(self.config.grid.len());
            for &candidate in &self.config.grid {
                sweep.push(search::fit_candidate(env, candidate, false)?);
            }
            match search::select_best(&sweep, env.kind) {
                Some(index) => self.config.grid[index],
                None => {
                    log::warn!(
                        "feature {}: every grid candidate failed, falling back to {}",
                        env.feature,
                        FALLBACK_CANDIDATE
                    );
                    FALLBACK_CANDIDATE
                }
            }
        } else {
            self.config.grid.first().copied().unwrap_or(FALLBACK_CANDIDATE)
        };

        search::fit_candidate(env, candidate, true)
    }

    fn candidate_env<'a>(
        &'a self,
        dataset: &CountDataset,
        kind: TestKind,
        feature_index: usize,
        feature: &'a str,
        store: Option<&'a CheckpointStore>,
    ) -> CandidateEnv<'a, E> {
        let y = self.prepare(dataset.counts.row(feature_index).to_owned());
        let series: Series = (dataset.times.clone(), y, dataset.inducing.clone());
        let halves = (kind == TestKind::TwoSamples).then(|| {
            let (first, second) = dataset.feature_halves(feature_index);
            (
                (first.0, self.prepare(first.1), first.2),
                (second.0, self.prepare(second.1), second.2),
            )
        });
        CandidateEnv {
            engine: &self.engine,
            kind,
            family: self.config.family,
            feature,
            sparse: self.config.sparse,
            series,
            halves,
            store,
        }
    }

    /// Gaussian runs model transformed observations; count families use the
    /// raw values.
    fn prepare(&self, y: Array1<f64>) -> Array1<f64> {
        if self.config.family == Family::Gaussian && self.config.transform {
            y.mapv(|v| (v + 1.0).ln())
        } else {
            y
        }
    }
}
