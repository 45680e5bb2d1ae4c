//! End-to-end runs of the full pipeline against the bundled GP engine.

use chronofit::data::{CountDataset, DataError};
use chronofit::family::Family;
use chronofit::gp::GpEngine;
use chronofit::orchestrate::{RunConfig, Runner, TestKind};
use ndarray::{Array1, Array2};
use tempfile::tempdir;

/// A single smooth count trajectory over 20 time points.
fn trending_dataset() -> CountDataset {
    let times: Array1<f64> = Array1::linspace(0.0, 10.0, 20);
    let counts: Vec<f64> = times
        .iter()
        .map(|&t| (1.5 + 1.2 * (t / 3.0).sin()).exp().round())
        .collect();
    let counts = Array2::from_shape_vec((1, 20), counts).unwrap();
    CountDataset::new(
        times,
        counts,
        vec!["geneA".to_string()],
        (0..20).map(|i| format!("s{i}")).collect(),
    )
    .unwrap()
}

#[test]
fn one_sample_test_produces_one_finite_row() {
    let dataset = trending_dataset();
    let config = RunConfig {
        family: Family::Poisson,
        grid: vec![0.5, 3.0, 5.0],
        ..RunConfig::default()
    };
    let runner = Runner::new(GpEngine::default(), config);

    let table = runner.one_sample_test(&dataset).unwrap();
    assert_eq!(table.kind, TestKind::OneSample);
    assert_eq!(table.rows.len(), 1);

    let row = &table.rows[0];
    assert_eq!(row.feature, "geneA");
    assert_eq!(row.cells.len(), 3);
    assert!(row.cells[0].is_finite(), "dynamic log likelihood: {:?}", row.cells);
    assert!(row.cells[1].is_finite(), "constant log likelihood: {:?}", row.cells);
    assert!(
        (row.cells[0] - row.cells[1] - row.cells[2]).abs() < 1e-9,
        "ratio must be the difference of the two likelihoods"
    );
}

#[test]
fn grid_sweep_and_final_fit_are_deterministic() {
    let dataset = trending_dataset();
    let config = RunConfig {
        family: Family::Poisson,
        grid: vec![3.0, 10.0],
        ..RunConfig::default()
    };

    let first = Runner::new(GpEngine::default(), config.clone())
        .infer_trajectory(&dataset)
        .unwrap();
    let second = Runner::new(GpEngine::default(), config)
        .infer_trajectory(&dataset)
        .unwrap();

    assert_eq!(first.rows.len(), 1);
    let (a, b) = (&first.rows[0].cells, &second.rows[0].cells);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.to_bits(), y.to_bits(), "runs must replay identically");
    }
}

#[test]
fn mismatched_dimensions_abort_before_any_fit() {
    let times = Array1::linspace(0.0, 10.0, 19);
    let counts = Array2::zeros((1, 20));
    let err = CountDataset::new(times, counts, vec!["geneA".into()], Vec::new()).unwrap_err();
    assert!(matches!(
        err,
        DataError::DimensionMismatch {
            times: 19,
            samples: 20
        }
    ));
}

#[test]
fn winning_fits_round_trip_through_the_checkpoint_store() {
    let dir = tempdir().unwrap();
    let dataset = trending_dataset();
    let config = RunConfig {
        family: Family::Poisson,
        grid: vec![3.0],
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..RunConfig::default()
    };
    let runner = Runner::new(GpEngine::default(), config);

    let table = runner.one_sample_test(&dataset).unwrap();
    assert!(table.rows[0].cells[0].is_finite());

    let grid = Array1::linspace(0.0, 10.0, 30);
    let loaded = runner
        .load_models(TestKind::OneSample, &["geneA".to_string()], grid.view())
        .unwrap();
    assert_eq!(loaded.len(), 2);
    for model in &loaded {
        assert_eq!(model.feature, "geneA");
        assert_eq!(model.predictive_mean.len(), 30);
        assert!(model.predictive_mean.iter().all(|v| v.is_finite() && *v >= 0.0));
    }
}
