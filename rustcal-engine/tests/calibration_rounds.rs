//! Round-level tests: parallel loading, calibration, accessors.
#![allow(clippy::cast_precision_loss)]

use approx::assert_relative_eq;
use rustcal_algorithms::{BinningMode, HistogramConfig};
use rustcal_core::Isotope;
use rustcal_engine::{Calibrator, CalibratorConfig, Error, LoadRequest};
use std::fmt::Write as _;
use std::path::PathBuf;
use tempfile::TempDir;

struct Lcg(u64);

impl Lcg {
    fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn next_gaussian(&mut self, mean: f64, sigma: f64) -> f64 {
        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        mean + sigma * z
    }
}

/// Writes a read-out file with two emission peaks for one channel.
fn write_detector_file(dir: &TempDir, name: &str, channel_id: u32, seed: u64) -> PathBuf {
    let mut rng = Lcg(seed);
    let mut content = String::from("# synthetic read-out\n");
    for _ in 0..8000 {
        let _ = writeln!(content, "CH {channel_id} 0 {:.4}", rng.next_gaussian(300.0, 5.0));
    }
    for _ in 0..6000 {
        let _ = writeln!(content, "CH {channel_id} 0 {:.4}", rng.next_gaussian(604.0, 7.0));
    }
    for _ in 0..3000 {
        let _ = writeln!(content, "CH {channel_id} 0 {:.4}", 1024.0 * rng.next_f64());
    }
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn isotopes() -> Vec<Vec<Isotope>> {
    vec![vec![
        Isotope::new("Cs-137", vec![661.66]),
        Isotope::new("Co-60", vec![1332.49]),
    ]]
}

fn config(workers: usize) -> CalibratorConfig {
    CalibratorConfig {
        histogram: HistogramConfig {
            min: 0.0,
            max: 1024.0,
            mode: BinningMode::FixedBinCount,
            mode_value: 512.0,
        },
        worker_threads: Some(workers),
        ..CalibratorConfig::default()
    }
}

#[test]
fn three_files_four_workers_yield_three_collections() {
    let dir = TempDir::new().unwrap();
    let requests: Vec<LoadRequest> = (0..3)
        .map(|i| {
            let path = write_detector_file(&dir, &format!("det{i}.rcd"), 10 + i, 100 + u64::from(i));
            LoadRequest::new(path, isotopes())
        })
        .collect();

    let mut calibrator = Calibrator::new(config(4));
    assert!(calibrator.load(&requests).unwrap());

    assert_eq!(calibrator.number_of_collections(), 3);
    assert_eq!(calibrator.number_of_groups(), 1);
    for (index, expected_channel) in [(0, 10), (1, 11), (2, 12)] {
        assert_eq!(
            calibrator.collection(index).unwrap().channel_id(),
            expected_channel
        );
    }
    assert!(calibrator.load_outcomes().iter().all(|o| o.error.is_none()));
}

#[test]
fn calibrate_all_is_idempotent_and_saves() {
    let dir = TempDir::new().unwrap();
    let requests = vec![
        LoadRequest::new(write_detector_file(&dir, "a.rcd", 1, 5), isotopes()),
        LoadRequest::new(write_detector_file(&dir, "b.rcd", 2, 6), isotopes()),
    ];

    let mut calibrator = Calibrator::new(config(4));
    assert!(calibrator.load(&requests).unwrap());
    assert!(calibrator.calibrate_all(false).unwrap());

    let first: Vec<Vec<f64>> = (0..2)
        .map(|c| {
            calibrator.calibration(c).unwrap().groups()[0]
                .model()
                .unwrap()
                .coefficients()
                .to_vec()
        })
        .collect();

    // The fitted model maps the synthetic peaks onto the line energies.
    let point = calibrator.calibration_spectral_point(0, 0).unwrap();
    assert_relative_eq!(point.centroid, 300.0, epsilon = 1.0);
    let model = calibrator.calibration(0).unwrap().groups()[0].model().unwrap();
    assert_relative_eq!(model.energy(point.centroid), 661.66, epsilon = 0.5);

    // Unchanged inputs refit to identical coefficients.
    assert!(calibrator.calibrate_all(false).unwrap());
    for (c, coefficients) in first.iter().enumerate() {
        let refit = calibrator.calibration(c).unwrap().groups()[0]
            .model()
            .unwrap()
            .coefficients()
            .to_vec();
        assert_eq!(&refit, coefficients);
    }

    let out = dir.path().join("calibration.ecal");
    calibrator.save(&out).unwrap();
    let content = std::fs::read_to_string(&out).unwrap();
    assert!(content.contains("VERSION 1"));
    assert!(content.contains("CP 0 0 1 gaussian 2"));
    assert!(content.contains("CP 1 0 2 gaussian 2"));
    assert!(content.contains("MD "));
}

#[test]
fn sparse_group_fails_without_stopping_the_round() {
    let dir = TempDir::new().unwrap();
    let good = write_detector_file(&dir, "good.rcd", 1, 77);

    // Too few samples to resolve any peak.
    let mut sparse = String::new();
    for i in 0..20 {
        let _ = writeln!(sparse, "CH 9 0 {}", 400.0 + f64::from(i));
    }
    let sparse_path = dir.path().join("sparse.rcd");
    std::fs::write(&sparse_path, sparse).unwrap();

    let mut calibrator = Calibrator::new(config(2));
    let requests = vec![
        LoadRequest::new(good, isotopes()),
        LoadRequest::new(sparse_path, isotopes()),
    ];
    assert!(calibrator.load(&requests).unwrap());

    // The round reports overall failure but the good collection is done.
    assert!(!calibrator.calibrate_all(false).unwrap());
    assert!(calibrator.calibration(0).unwrap().is_fully_calibrated());
    let failed = calibrator.calibration(1).unwrap();
    assert!(failed.groups()[0].failure().is_some());
    assert!(!failed.is_fully_calibrated());
}

#[test]
fn accessors_distinguish_error_kinds() {
    let dir = TempDir::new().unwrap();
    let path = write_detector_file(&dir, "one.rcd", 3, 13);

    let mut calibrator = Calibrator::new(config(1));
    calibrator.load(&[LoadRequest::new(path, isotopes())]).unwrap();

    // Valid index, not yet calibrated.
    assert!(matches!(
        calibrator.calibration(0),
        Err(Error::Core(rustcal_core::Error::NotYetCalibrated { collection: 0 }))
    ));
    // Invalid index.
    assert!(matches!(
        calibrator.calibration(7),
        Err(Error::Core(rustcal_core::Error::IndexOutOfRange { .. }))
    ));

    assert!(calibrator.calibrate_collection(0, false).unwrap());
    let points = calibrator.number_of_calibration_spectral_points(0).unwrap();
    assert_eq!(points, 2);
    assert!(matches!(
        calibrator.calibration_spectral_point(0, points),
        Err(Error::Core(rustcal_core::Error::IndexOutOfRange { .. }))
    ));
}

#[test]
fn load_failure_is_recorded_per_file() {
    let dir = TempDir::new().unwrap();
    let good = write_detector_file(&dir, "good.rcd", 1, 21);
    let missing = dir.path().join("does-not-exist.rcd");

    let mut calibrator = Calibrator::new(config(2));
    let requests = vec![
        LoadRequest::new(good, isotopes()),
        LoadRequest::new(missing, isotopes()),
    ];
    assert!(!calibrator.load(&requests).unwrap());

    assert_eq!(calibrator.number_of_collections(), 1);
    assert!(calibrator.load_outcomes()[0].error.is_none());
    assert!(calibrator.load_outcomes()[1].error.is_some());
}

#[test]
fn clear_resets_to_unloaded() {
    let dir = TempDir::new().unwrap();
    let path = write_detector_file(&dir, "one.rcd", 3, 55);

    let mut calibrator = Calibrator::new(config(1));
    calibrator.load(&[LoadRequest::new(path, isotopes())]).unwrap();
    calibrator.calibrate_all(false).unwrap();
    assert_eq!(calibrator.number_of_collections(), 1);

    calibrator.clear();
    assert_eq!(calibrator.number_of_collections(), 0);
    assert!(calibrator.load_outcomes().is_empty());
    assert!(matches!(
        calibrator.collection(0),
        Err(Error::Core(rustcal_core::Error::IndexOutOfRange { .. }))
    ));
}
