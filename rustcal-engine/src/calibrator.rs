//! The calibration facade: owns the stores and drives the Load and
//! Calibrate rounds.

use crate::dispatcher::WorkDispatcher;
use crate::Result;
use rustcal_algorithms::{
    CalibrationCurveFitter, CurveFitConfig, HistogramConfig, PeakFitter, PeakParametrization,
    SpectrumBuilder,
};
use rustcal_core::{
    CalibrationSpectralPoint, CalibrationStore, CollectionCalibration, GroupCalibration,
    Histogram, Isotope, ReadOutCollection, ReadOutDataGroup, ReadOutStore,
};
use rustcal_io::{CalibrationFileWriter, ReadOutFileReader};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use sysinfo::System;

/// Configuration for the calibrator, set before a round and read-only
/// while one runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibratorConfig {
    /// Histogram range and binning policy.
    pub histogram: HistogramConfig,
    /// Peak-shape model family used by the line fits.
    pub parametrization: PeakParametrization,
    /// Calibration curve fit settings.
    pub curve: CurveFitConfig,
    /// Worker threads per round; `None` uses the machine's logical CPU
    /// count.
    pub worker_threads: Option<usize>,
}

impl CalibratorConfig {
    /// Resolves the worker count for the next round.
    #[must_use]
    pub fn resolve_worker_count(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(detected_parallelism)
            .max(1)
    }
}

/// Logical CPU count as reported by the system.
fn detected_parallelism() -> usize {
    let mut system = System::new();
    system.refresh_cpu();
    let cpus = system.cpus().len();
    if cpus == 0 {
        1
    } else {
        cpus
    }
}

/// One input file plus the expected isotopes for each of its groups.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Path of the read-out file.
    pub path: PathBuf,
    /// Expected isotopes, indexed by group.
    pub isotopes: Vec<Vec<Isotope>>,
}

impl LoadRequest {
    /// Creates a request for one file.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P, isotopes: Vec<Vec<Isotope>>) -> Self {
        Self {
            path: path.into(),
            isotopes,
        }
    }
}

/// Per-file outcome of the most recent load round.
#[derive(Debug, Clone)]
pub struct FileLoadOutcome {
    /// Path of the file.
    pub path: PathBuf,
    /// The recorded failure, or `None` if the file loaded cleanly.
    pub error: Option<String>,
}

/// Immutable per-round pipeline: binning, peak fitting, curve fitting.
///
/// Built once per Calibrate round from the validated configuration, then
/// shared read-only by every worker.
struct CalibrationRound {
    builder: SpectrumBuilder,
    peak_fitter: PeakFitter,
    curve_fitter: CalibrationCurveFitter,
}

impl CalibrationRound {
    fn new(config: &CalibratorConfig) -> Result<Self> {
        config.curve.validate()?;
        Ok(Self {
            builder: SpectrumBuilder::new(config.histogram)?,
            peak_fitter: PeakFitter::new(config.parametrization),
            curve_fitter: CalibrationCurveFitter::new(config.curve),
        })
    }

    fn calibrate_collection(&self, collection: &ReadOutCollection) -> CollectionCalibration {
        let groups = collection
            .groups()
            .map(|group| self.calibrate_group(group))
            .collect();
        CollectionCalibration::new(collection.channel_id(), groups)
    }

    fn calibrate_group(&self, group: &ReadOutDataGroup) -> GroupCalibration {
        let histogram = self.builder.build(group.samples());
        let points = match self.peak_fitter.fit(&histogram, group.lines()) {
            Ok(points) => points,
            Err(reason) => {
                return GroupCalibration::Failed {
                    reason,
                    points: Vec::new(),
                }
            }
        };
        match self.curve_fitter.fit(&points) {
            Ok(model) => GroupCalibration::Calibrated { model, points },
            Err(reason) => GroupCalibration::Failed { reason, points },
        }
    }
}

/// The line calibrator facade.
///
/// Load populates the read-out store from input files; Calibrate runs
/// histogram construction, peak fitting, and curve fitting per group,
/// writing outcomes into the calibration store. Both rounds are
/// re-entrant and idempotent, and both distribute their items over a
/// fresh [`WorkDispatcher`] pool that is torn down before they return.
pub struct Calibrator {
    config: CalibratorConfig,
    readout: ReadOutStore,
    calibrations: CalibrationStore,
    load_outcomes: Vec<FileLoadOutcome>,
}

impl Calibrator {
    /// Creates a calibrator with the given configuration.
    #[must_use]
    pub fn new(config: CalibratorConfig) -> Self {
        Self {
            config,
            readout: ReadOutStore::new(),
            calibrations: CalibrationStore::default(),
            load_outcomes: Vec::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CalibratorConfig {
        &self.config
    }

    /// Returns a mutable handle to the configuration. Exclusive access
    /// guarantees no round is running while it changes.
    pub fn config_mut(&mut self) -> &mut CalibratorConfig {
        &mut self.config
    }

    /// Discards all loaded data and derived calibrations.
    pub fn clear(&mut self) {
        self.readout.clear();
        self.calibrations.reset(0);
        self.load_outcomes.clear();
    }

    /// Loads the given files, replacing any previously loaded data and
    /// clearing all prior calibration state.
    ///
    /// Files are parsed in parallel into per-file stores (one disjoint
    /// result slot each) and merged in file order afterwards, so the
    /// collection indexing never depends on worker scheduling. A file
    /// failure is recorded in [`Calibrator::load_outcomes`] and does not
    /// stop the other files.
    ///
    /// Returns `Ok(true)` only if every file loaded cleanly.
    ///
    /// # Errors
    /// Infallible today beyond the per-file reporting; the `Result` is
    /// part of the facade contract shared with Calibrate.
    pub fn load(&mut self, requests: &[LoadRequest]) -> Result<bool> {
        self.clear();
        if requests.is_empty() {
            return Ok(true);
        }

        type FileSlot = Mutex<Option<std::result::Result<ReadOutStore, String>>>;
        let slots: Vec<FileSlot> = requests.iter().map(|_| Mutex::new(None)).collect();

        let dispatcher = WorkDispatcher::new(self.config.resolve_worker_count());
        let flags = dispatcher.run(requests.len(), |index| {
            let request = &requests[index];
            let outcome = ReadOutFileReader::open(&request.path, &request.isotopes)
                .and_then(|reader| reader.read_store())
                .map_err(|e| e.to_string());
            let ok = outcome.is_ok();
            *slots[index]
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
            ok
        });

        for (request, slot) in requests.iter().zip(slots) {
            let outcome = slot
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .unwrap_or_else(|| Err("file was never processed".to_string()));
            let error = match outcome {
                Ok(store) => {
                    self.readout.merge(&store);
                    None
                }
                Err(message) => {
                    log::warn!("failed to load {}: {message}", request.path.display());
                    Some(message)
                }
            };
            self.load_outcomes.push(FileLoadOutcome {
                path: request.path.clone(),
                error,
            });
        }

        self.calibrations.reset(self.readout.number_of_collections());
        log::info!(
            "loaded {} of {} files, {} collections",
            flags.iter().filter(|&&ok| ok).count(),
            requests.len(),
            self.readout.number_of_collections()
        );
        Ok(flags.iter().all(|&ok| ok))
    }

    /// Returns the per-file outcomes of the most recent load round.
    #[must_use]
    pub fn load_outcomes(&self) -> &[FileLoadOutcome] {
        &self.load_outcomes
    }

    /// Calibrates every collection, distributing collection indices over
    /// the worker pool. Returns `Ok(true)` only if every group of every
    /// collection produced a model; partial results stay queryable
    /// either way.
    ///
    /// # Errors
    /// Returns a configuration error before any work starts if the
    /// histogram or curve settings are invalid.
    pub fn calibrate_all(&mut self, show_diagnostics: bool) -> Result<bool> {
        let count = self.readout.number_of_collections();
        self.calibrations.reset(count);
        if count == 0 {
            return Ok(true);
        }
        let round = CalibrationRound::new(&self.config)?;

        let readout = &self.readout;
        let slots: Vec<Mutex<Option<CollectionCalibration>>> =
            (0..count).map(|_| Mutex::new(None)).collect();

        let dispatcher = WorkDispatcher::new(self.config.resolve_worker_count());
        let flags = dispatcher.run(count, |index| {
            let Ok(collection) = readout.collection(index) else {
                return false;
            };
            let outcome = round.calibrate_collection(collection);
            let ok = outcome.is_fully_calibrated();
            *slots[index]
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
            ok
        });

        for (index, slot) in slots.into_iter().enumerate() {
            if let Some(outcome) = slot.into_inner().unwrap_or_else(PoisonError::into_inner) {
                if show_diagnostics {
                    log::info!("{}", collection_report(index, &outcome));
                }
                self.calibrations.set(index, outcome)?;
            }
        }
        Ok(flags.iter().all(|&ok| ok))
    }

    /// Calibrates a single collection in place.
    ///
    /// # Errors
    /// Returns an index error for an invalid collection index or a
    /// configuration error for invalid settings; both are rejected
    /// before any fitting starts.
    pub fn calibrate_collection(
        &mut self,
        collection: usize,
        show_diagnostics: bool,
    ) -> Result<bool> {
        let count = self.readout.number_of_collections();
        let target = self.readout.collection(collection)?;
        let round = CalibrationRound::new(&self.config)?;

        let outcome = round.calibrate_collection(target);
        let ok = outcome.is_fully_calibrated();
        if show_diagnostics {
            log::info!("{}", collection_report(collection, &outcome));
        }
        if self.calibrations.number_of_collections() != count {
            self.calibrations.reset(count);
        }
        self.calibrations.set(collection, outcome)?;
        Ok(ok)
    }

    /// Returns the number of loaded collections.
    #[must_use]
    pub fn number_of_collections(&self) -> usize {
        self.readout.number_of_collections()
    }

    /// Returns the largest group count over all collections.
    #[must_use]
    pub fn number_of_groups(&self) -> usize {
        self.readout.number_of_groups()
    }

    /// Returns the collection at `index`.
    ///
    /// # Errors
    /// Returns an index error for an invalid index.
    pub fn collection(&self, index: usize) -> Result<&ReadOutCollection> {
        Ok(self.readout.collection(index)?)
    }

    /// Returns a mutable handle to the collection at `index`.
    ///
    /// # Errors
    /// Returns an index error for an invalid index.
    pub fn collection_mut(&mut self, index: usize) -> Result<&mut ReadOutCollection> {
        Ok(self.readout.collection_mut(index)?)
    }

    /// Rebuilds the histogram for `(collection, group)` under the current
    /// configuration. Never cached: configuration changes between rounds
    /// must be reflected immediately.
    ///
    /// # Errors
    /// Returns an index error for invalid indices or a configuration
    /// error for invalid histogram settings.
    pub fn histogram(&self, collection: usize, group: usize) -> Result<Histogram> {
        let group = self.readout.collection(collection)?.group(group)?;
        let builder = SpectrumBuilder::new(self.config.histogram)?;
        Ok(builder.build(group.samples()))
    }

    /// Returns the calibration outcome for a collection.
    ///
    /// # Errors
    /// Returns an index error for an invalid index and a
    /// not-yet-calibrated error for a valid index with no outcome yet.
    pub fn calibration(&self, collection: usize) -> Result<&CollectionCalibration> {
        Ok(self.calibrations.collection(collection)?)
    }

    /// Returns the number of fitted spectral points for a collection,
    /// flattened over its groups.
    ///
    /// # Errors
    /// Returns an index error for an invalid index.
    pub fn number_of_calibration_spectral_points(&self, collection: usize) -> Result<usize> {
        Ok(self.calibrations.number_of_spectral_points(collection)?)
    }

    /// Returns spectral point `line` of a collection.
    ///
    /// # Errors
    /// Returns an index error if the collection or line index is out of
    /// range, and a not-yet-calibrated error for a pending collection.
    pub fn calibration_spectral_point(
        &self,
        collection: usize,
        line: usize,
    ) -> Result<&CalibrationSpectralPoint> {
        Ok(self.calibrations.spectral_point(collection, line)?)
    }

    /// Saves all derived calibrations in the energy-calibration format.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = CalibrationFileWriter::create(path)?;
        writer.write_store(&self.calibrations, &self.config.parametrization.to_string())?;
        Ok(())
    }

    /// Formats the per-group diagnostics for a calibrated collection.
    ///
    /// # Errors
    /// Returns an index error for an invalid index and a
    /// not-yet-calibrated error for a pending collection.
    pub fn diagnostics_report(&self, collection: usize) -> Result<String> {
        let outcome = self.calibrations.collection(collection)?;
        Ok(collection_report(collection, outcome))
    }
}

impl fmt::Display for Calibrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "calibrator: {} collections, {} groups",
            self.readout.number_of_collections(),
            self.readout.number_of_groups()
        )?;
        for (index, outcome) in self.calibrations.calibrated() {
            let calibrated = outcome
                .groups()
                .iter()
                .filter(|g| g.is_calibrated())
                .count();
            writeln!(
                f,
                "  collection {index} (channel {}): {calibrated}/{} groups calibrated",
                outcome.channel_id(),
                outcome.groups().len()
            )?;
        }
        Ok(())
    }
}

/// One collection's fit report for diagnostics output.
fn collection_report(index: usize, outcome: &CollectionCalibration) -> String {
    use fmt::Write;

    let mut report = String::new();
    let _ = writeln!(
        report,
        "collection {index} (channel {}):",
        outcome.channel_id()
    );
    for (group, calibration) in outcome.groups().iter().enumerate() {
        match calibration {
            GroupCalibration::Calibrated { model, points } => {
                let _ = writeln!(
                    report,
                    "  group {group}: degree-{} model from {} points",
                    model.degree(),
                    points.len()
                );
                for point in points {
                    let _ = writeln!(
                        report,
                        "    {} {:.2} keV -> channel {:.3} +- {:.3} (fwhm {:.3}, q {:.2})",
                        point.isotope,
                        point.energy_kev,
                        point.centroid,
                        point.centroid_uncertainty,
                        point.fwhm,
                        point.quality
                    );
                }
            }
            GroupCalibration::Failed { reason, .. } => {
                let _ = writeln!(report, "  group {group}: failed ({reason})");
            }
        }
    }
    report
}
