//! # Data Loading and Validation
//!
//! Exclusive entry point for user-provided data. Reads tab-separated count
//! matrices (one row per feature, one column per sample) and time-point
//! tables, validates them against a strict schema, and produces the `ndarray`
//! structures the fitting core consumes. Failures are assumed to be
//! user-input errors and the `DataError` variants are written to be
//! actionable. The covariate/observation dimension check runs before any fit
//! is attempted; a mismatch aborts the run for that dataset.

use ndarray::{Array1, Array2, s};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Fraction of samples used as inducing points in sparse mode (percent).
const INDUCING_PERCENT: usize = 5;
const KMEANS_ITERATIONS: usize = 25;

/// A validated per-feature count dataset ready for fitting.
#[derive(Debug, Clone)]
pub struct CountDataset {
    /// Time points, one per sample.
    pub times: Array1<f64>,
    /// Observation matrix, shape `[n_features, n_samples]`.
    pub counts: Array2<f64>,
    pub feature_names: Vec<String>,
    pub sample_names: Vec<String>,
    /// Representative covariate locations for sparse inference.
    pub inducing: Option<Array1<f64>>,
}

/// All data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error(
        "Dimension 0 of the time vector must equal dimension 1 of the count matrix, but lengths are {times} and {samples}."
    )]
    DimensionMismatch { times: usize, samples: usize },
    #[error("The count matrix has no feature rows.")]
    EmptyDataset,
}

impl CountDataset {
    /// Validates and assembles a dataset. The time-point count must equal the
    /// sample-column count of the observation matrix.
    pub fn new(
        times: Array1<f64>,
        counts: Array2<f64>,
        feature_names: Vec<String>,
        sample_names: Vec<String>,
    ) -> Result<Self, DataError> {
        if times.len() != counts.ncols() {
            return Err(DataError::DimensionMismatch {
                times: times.len(),
                samples: counts.ncols(),
            });
        }
        if counts.nrows() == 0 {
            return Err(DataError::EmptyDataset);
        }
        Ok(Self {
            times,
            counts,
            feature_names,
            sample_names,
            inducing: None,
        })
    }

    /// Enables sparse mode: selects 5% of the sample count (at least one) as
    /// inducing points via 1-D k-means over the time points, sorted.
    pub fn with_inducing_points(mut self) -> Self {
        let m = (INDUCING_PERCENT * self.times.len() / 100).max(1);
        self.inducing = Some(select_inducing_points(&self.times, m));
        self
    }

    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    /// Split point for the two-samples test: the first `n/2` samples form the
    /// first series, the remainder the second.
    pub fn half_split(&self) -> usize {
        self.n_samples() / 2
    }

    /// The two half-series of one feature, for the two-samples test. Inducing
    /// points are re-selected per half when sparse mode is active.
    pub fn feature_halves(
        &self,
        feature_index: usize,
    ) -> (
        (Array1<f64>, Array1<f64>, Option<Array1<f64>>),
        (Array1<f64>, Array1<f64>, Option<Array1<f64>>),
    ) {
        let mid = self.half_split();
        let y = self.counts.row(feature_index);
        let make = |range: std::ops::Range<usize>| {
            let x = self.times.slice(s![range.clone()]).to_owned();
            let inducing = self.inducing.as_ref().map(|_| {
                let m = (INDUCING_PERCENT * x.len() / 100).max(1);
                select_inducing_points(&x, m)
            });
            (x, y.slice(s![range]).to_owned(), inducing)
        };
        (make(0..mid), make(mid..self.n_samples()))
    }
}

/// Loads a dataset from a count matrix TSV (a `feature` name column followed
/// by one numeric column per sample) and a time-point TSV (a numeric `time`
/// column whose row order matches the count matrix's sample columns).
pub fn load_dataset(counts_path: &str, times_path: &str) -> Result<CountDataset, DataError> {
    let counts_df = read_tsv(counts_path)?;
    let times_df = read_tsv(times_path)?;

    let feature_col = "feature";
    if !counts_df.get_column_names().iter().any(|c| c == &feature_col) {
        return Err(DataError::ColumnNotFound(feature_col.to_string()));
    }
    let feature_series = counts_df.column(feature_col)?;
    let mut feature_names = Vec::with_capacity(counts_df.height());
    for i in 0..counts_df.height() {
        let value = feature_series.get(i).unwrap_or(AnyValue::Null);
        feature_names.push(match value {
            AnyValue::Null => (i + 1).to_string(),
            AnyValue::String(text) => text.to_string(),
            AnyValue::StringOwned(text) => text.to_string(),
            other => other.to_string(),
        });
    }

    let sample_names: Vec<String> = counts_df
        .get_column_names()
        .iter()
        .filter(|c| *c != &feature_col)
        .map(|c| c.to_string())
        .collect();

    let n_features = counts_df.height();
    let mut counts = Array2::<f64>::zeros((n_features, sample_names.len()));
    for (j, name) in sample_names.iter().enumerate() {
        let column = extract_numeric_column(&counts_df, name)?;
        for (i, v) in column.into_iter().enumerate() {
            counts[[i, j]] = v;
        }
    }

    if !times_df.get_column_names().iter().any(|c| c == &"time") {
        return Err(DataError::ColumnNotFound("time".to_string()));
    }
    let times = Array1::from_vec(extract_numeric_column(&times_df, "time")?);

    log::info!(
        "Loaded {} features x {} samples from '{}'",
        n_features,
        sample_names.len(),
        counts_path
    );
    CountDataset::new(times, counts, feature_names, sample_names)
}

fn read_tsv(path: &str) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    Ok(df)
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

/// 1-D k-means over the time points. Centers start at evenly spaced order
/// statistics, which already puts them in sorted order; the result is sorted
/// again after the final update.
fn select_inducing_points(x: &Array1<f64>, m: usize) -> Array1<f64> {
    let mut sorted: Vec<f64> = x.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite time points"));
    let mut centers: Vec<f64> = (0..m)
        .map(|i| sorted[i * (sorted.len() - 1) / m.max(1)])
        .collect();

    for _ in 0..KMEANS_ITERATIONS {
        let mut sums = vec![0.0; m];
        let mut counts = vec![0usize; m];
        for &v in sorted.iter() {
            let nearest = centers
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    (v - *a).abs().partial_cmp(&(v - *b).abs()).expect("finite centers")
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            sums[nearest] += v;
            counts[nearest] += 1;
        }
        for i in 0..m {
            if counts[i] > 0 {
                centers[i] = sums[i] / counts[i] as f64;
            }
        }
    }
    centers.sort_by(|a, b| a.partial_cmp(b).expect("finite centers"));
    Array1::from_vec(centers)
}
