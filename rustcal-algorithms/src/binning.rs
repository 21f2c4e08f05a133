//! Spectrum construction: raw samples to histogram under a binning policy.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use rayon::slice::ParallelSliceMut;
use rustcal_core::{Error, Histogram, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Policy for converting raw samples into histogram bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BinningMode {
    /// A fixed number of equal-width bins over the configured range.
    FixedBinCount,
    /// Variable-width bins each holding approximately the same number of
    /// samples; the last bin absorbs the remainder.
    FixedCountsPerBin,
    /// Bayesian-blocks segmentation: variable-width bins at the change
    /// points that maximize a fitness function under a complexity prior.
    BayesianBlocks,
}

/// Histogram range and binning configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistogramConfig {
    /// Lower edge of the accepted amplitude range.
    pub min: f64,
    /// Upper edge of the accepted amplitude range.
    pub max: f64,
    /// Binning policy.
    pub mode: BinningMode,
    /// Policy parameter: bin count, counts per bin, or change-point prior.
    pub mode_value: f64,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1000.0,
            mode: BinningMode::FixedBinCount,
            mode_value: 200.0,
        }
    }
}

impl HistogramConfig {
    /// Checks the configuration before any work starts.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `min >= max` or the mode value is not
    /// a positive, usable parameter for the selected mode.
    pub fn validate(&self) -> Result<()> {
        if !(self.min < self.max) {
            return Err(Error::Config(format!(
                "histogram range invalid: min {} >= max {}",
                self.min, self.max
            )));
        }
        if !self.mode_value.is_finite() || self.mode_value <= 0.0 {
            return Err(Error::Config(format!(
                "binning mode value must be positive, got {}",
                self.mode_value
            )));
        }
        if matches!(
            self.mode,
            BinningMode::FixedBinCount | BinningMode::FixedCountsPerBin
        ) && self.mode_value < 1.0
        {
            return Err(Error::Config(format!(
                "binning mode value must be at least 1, got {}",
                self.mode_value
            )));
        }
        Ok(())
    }
}

/// Builds histograms from raw amplitude samples.
///
/// Samples outside `[min, max)` are dropped, not clipped, so the total
/// histogram content equals the number of in-range samples under every
/// mode. An empty (or fully out-of-range) input yields an empty
/// histogram; the caller treats that as insufficient data downstream.
#[derive(Debug, Clone)]
pub struct SpectrumBuilder {
    config: HistogramConfig,
}

impl SpectrumBuilder {
    /// Creates a builder, rejecting an invalid configuration up front so
    /// a calibration round never fails on configuration mid-flight.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `min >= max` or the mode value is
    /// unusable for the selected mode.
    pub fn new(config: HistogramConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &HistogramConfig {
        &self.config
    }

    /// Builds the histogram for one read-out data group. An empty sample
    /// sequence yields an empty histogram, not an error.
    #[must_use]
    pub fn build(&self, samples: &[f64]) -> Histogram {
        match self.config.mode {
            BinningMode::FixedBinCount => self.build_fixed_bin_count(samples),
            BinningMode::FixedCountsPerBin => self.build_fixed_counts_per_bin(samples),
            BinningMode::BayesianBlocks => self.build_bayesian_blocks(samples),
        }
    }

    fn in_range_sorted(&self, samples: &[f64]) -> Vec<f64> {
        let mut kept: Vec<f64> = samples
            .iter()
            .copied()
            .filter(|&s| s >= self.config.min && s < self.config.max)
            .collect();
        kept.par_sort_unstable_by(f64::total_cmp);
        kept
    }

    fn build_fixed_bin_count(&self, samples: &[f64]) -> Histogram {
        let bins = self.config.mode_value.round() as usize;
        let width = (self.config.max - self.config.min) / bins as f64;
        let mut counts = vec![0.0; bins];
        for &s in samples {
            if s >= self.config.min && s < self.config.max {
                let index = (((s - self.config.min) / width) as usize).min(bins - 1);
                counts[index] += 1.0;
            }
        }
        let edges = (0..=bins)
            .map(|i| self.config.min + width * i as f64)
            .collect();
        Histogram::new(edges, counts)
    }

    fn build_fixed_counts_per_bin(&self, samples: &[f64]) -> Histogram {
        let sorted = self.in_range_sorted(samples);
        if sorted.is_empty() {
            return Histogram::empty();
        }
        let target = (self.config.mode_value.round() as usize).max(1);
        let bins = (sorted.len() / target).max(1);

        let mut edges = Vec::with_capacity(bins + 1);
        edges.push(self.config.min);
        for b in 1..bins {
            let boundary = b * target;
            edges.push(0.5 * (sorted[boundary - 1] + sorted[boundary]));
        }
        edges.push(self.config.max);

        let mut counts = vec![target as f64; bins];
        // Last bin absorbs the remainder.
        counts[bins - 1] = (sorted.len() - (bins - 1) * target) as f64;
        Histogram::new(edges, counts)
    }

    /// Bayesian-blocks segmentation for event data (Scargle et al. 2013).
    ///
    /// Dynamic programming over Voronoi cells of the sorted samples; each
    /// block's fitness is `N (ln N - ln T)` and every change point costs
    /// the configured prior. The resulting blocks become the bins.
    fn build_bayesian_blocks(&self, samples: &[f64]) -> Histogram {
        let sorted = self.in_range_sorted(samples);
        if sorted.is_empty() {
            return Histogram::empty();
        }
        let ncp_prior = self.config.mode_value;

        // Collapse duplicates into weighted cells.
        let mut values = Vec::with_capacity(sorted.len());
        let mut weights: Vec<f64> = Vec::with_capacity(sorted.len());
        for &s in &sorted {
            let duplicate = values.last().is_some_and(|&last| s == last);
            if duplicate {
                *weights.last_mut().expect("parallel to values") += 1.0;
            } else {
                values.push(s);
                weights.push(1.0);
            }
        }
        let m = values.len();

        // Cell edges: configured range bounds outside, midpoints inside.
        let mut cell_edges = Vec::with_capacity(m + 1);
        cell_edges.push(self.config.min);
        for k in 1..m {
            cell_edges.push(0.5 * (values[k - 1] + values[k]));
        }
        cell_edges.push(self.config.max);

        let mut prefix = vec![0.0; m + 1];
        for (k, &w) in weights.iter().enumerate() {
            prefix[k + 1] = prefix[k] + w;
        }

        let mut best = vec![0.0_f64; m];
        let mut last_start = vec![0_usize; m];
        for right in 0..m {
            let mut best_fitness = f64::NEG_INFINITY;
            let mut best_left = 0;
            for left in 0..=right {
                let count = prefix[right + 1] - prefix[left];
                let width = cell_edges[right + 1] - cell_edges[left];
                if width <= 0.0 {
                    continue;
                }
                let block = count * (count.ln() - width.ln());
                let prior_term = if left > 0 { best[left - 1] } else { 0.0 };
                let fitness = block - ncp_prior + prior_term;
                if fitness > best_fitness {
                    best_fitness = fitness;
                    best_left = left;
                }
            }
            best[right] = best_fitness;
            last_start[right] = best_left;
        }

        // Backtrack the change points.
        let mut starts = Vec::new();
        let mut right = m;
        while right > 0 {
            let start = last_start[right - 1];
            starts.push(start);
            right = start;
        }
        starts.reverse();

        let mut edges = Vec::with_capacity(starts.len() + 1);
        let mut counts = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(m);
            edges.push(cell_edges[start]);
            counts.push(prefix[end] - prefix[start]);
        }
        edges.push(cell_edges[m]);
        Histogram::new(edges, counts)
    }
}
