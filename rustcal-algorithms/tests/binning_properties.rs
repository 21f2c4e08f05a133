//! Property-style checks for the three binning policies.
#![allow(clippy::cast_precision_loss)]

use rustcal_algorithms::{BinningMode, HistogramConfig, SpectrumBuilder};

/// Small deterministic generator so the tests need no RNG dependency.
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
}

fn uniform_samples(count: usize, low: f64, high: f64, seed: u64) -> Vec<f64> {
    let mut rng = Lcg(seed);
    (0..count)
        .map(|_| low + (high - low) * rng.next_f64())
        .collect()
}

#[test]
fn all_modes_conserve_in_range_counts() {
    let mut samples = uniform_samples(5000, 0.0, 1000.0, 7);
    // A few out-of-range samples that must be dropped, not clipped.
    samples.extend_from_slice(&[-5.0, 1000.0, 2500.0]);

    for (mode, value) in [
        (BinningMode::FixedBinCount, 128.0),
        (BinningMode::FixedCountsPerBin, 40.0),
        (BinningMode::BayesianBlocks, 4.0),
    ] {
        let builder = SpectrumBuilder::new(HistogramConfig {
            min: 0.0,
            max: 1000.0,
            mode,
            mode_value: value,
        })
        .unwrap();
        let histogram = builder.build(&samples);
        assert!(
            (histogram.total_count() - 5000.0).abs() < f64::EPSILON,
            "{mode:?} lost or invented samples"
        );
    }
}

#[test]
fn fixed_counts_per_bin_is_balanced() {
    let samples = uniform_samples(1017, 0.0, 1000.0, 11);
    let builder = SpectrumBuilder::new(HistogramConfig {
        min: 0.0,
        max: 1000.0,
        mode: BinningMode::FixedCountsPerBin,
        mode_value: 50.0,
    })
    .unwrap();
    let histogram = builder.build(&samples);

    assert_eq!(histogram.len(), 20);
    for (index, &count) in histogram.counts().iter().enumerate() {
        if index + 1 < histogram.len() {
            assert!((count - 50.0).abs() < f64::EPSILON);
        } else {
            // 19 full bins of 50, remainder 67 in the last.
            assert!((count - 67.0).abs() < f64::EPSILON);
        }
    }
}

#[test]
fn bayesian_blocks_is_sparse_on_uniform_data() {
    let samples = uniform_samples(4000, 0.0, 1000.0, 23);
    let builder = SpectrumBuilder::new(HistogramConfig {
        min: 0.0,
        max: 1000.0,
        mode: BinningMode::BayesianBlocks,
        mode_value: 8.0,
    })
    .unwrap();
    let histogram = builder.build(&samples);
    assert!(
        histogram.len() <= 10,
        "uniform data should need few blocks, got {}",
        histogram.len()
    );
}

#[test]
fn bayesian_blocks_finds_a_rate_change() {
    // Sparse region then a dense region: at least one change point.
    let mut samples = uniform_samples(300, 0.0, 500.0, 31);
    samples.extend(uniform_samples(3000, 500.0, 600.0, 37));
    let builder = SpectrumBuilder::new(HistogramConfig {
        min: 0.0,
        max: 1000.0,
        mode: BinningMode::BayesianBlocks,
        mode_value: 8.0,
    })
    .unwrap();
    let histogram = builder.build(&samples);
    assert!(histogram.len() >= 2);

    // The densest block must sit inside the dense region.
    let densest = (0..histogram.len())
        .max_by(|&a, &b| {
            let rate_a = histogram.counts()[a] / histogram.bin_width(a);
            let rate_b = histogram.counts()[b] / histogram.bin_width(b);
            rate_a.total_cmp(&rate_b)
        })
        .unwrap();
    let center = histogram.bin_center(densest);
    assert!((450.0..650.0).contains(&center), "densest block at {center}");
}
