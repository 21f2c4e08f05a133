//! Energy-calibration file writing.
//!
//! The save format is versioned plain text, one block per group:
//!
//! ```text
//! CP <collection> <group> <channel-id> <parametrization> <point-count>
//! PT <isotope> <energy-kev> <centroid> <uncertainty> <fwhm> <quality>
//! MD <coefficients, ascending powers>
//! FA <failure reason>            (failed groups only, instead of MD)
//! ```

use crate::Result;
use rustcal_core::{CalibrationStore, GroupCalibration};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writer for derived energy calibrations.
pub struct CalibrationFileWriter {
    writer: BufWriter<File>,
}

impl CalibrationFileWriter {
    /// Creates a new calibration file, truncating any existing one.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Writes every calibrated collection of the store.
    ///
    /// Failed groups are written with their recorded reason so a
    /// downstream consumer can distinguish "never calibrated" from
    /// "calibration failed". Pending (never calibrated) slots are
    /// skipped entirely.
    ///
    /// # Errors
    /// Returns an error on any underlying write failure.
    pub fn write_store(
        &mut self,
        store: &CalibrationStore,
        parametrization: &str,
    ) -> Result<()> {
        writeln!(self.writer, "# rustcal energy calibration")?;
        writeln!(self.writer, "VERSION 1")?;

        for (collection, outcome) in store.calibrated() {
            for (group, calibration) in outcome.groups().iter().enumerate() {
                writeln!(
                    self.writer,
                    "CP {} {} {} {} {}",
                    collection,
                    group,
                    outcome.channel_id(),
                    parametrization,
                    calibration.points().len()
                )?;
                for point in calibration.points() {
                    writeln!(
                        self.writer,
                        "PT {} {} {} {} {} {}",
                        point.isotope,
                        point.energy_kev,
                        point.centroid,
                        point.centroid_uncertainty,
                        point.fwhm,
                        point.quality
                    )?;
                }
                match calibration {
                    GroupCalibration::Calibrated { model, .. } => {
                        write!(self.writer, "MD")?;
                        for coefficient in model.coefficients() {
                            write!(self.writer, " {coefficient}")?;
                        }
                        writeln!(self.writer)?;
                    }
                    GroupCalibration::Failed { reason, .. } => {
                        writeln!(self.writer, "FA {reason}")?;
                    }
                }
            }
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustcal_core::{
        CalibrationModel, CalibrationSpectralPoint, CollectionCalibration, FitError,
    };
    use tempfile::NamedTempFile;

    fn point() -> CalibrationSpectralPoint {
        CalibrationSpectralPoint {
            isotope: "Cs-137".to_string(),
            energy_kev: 661.66,
            centroid: 330.5,
            centroid_uncertainty: 0.04,
            fwhm: 11.8,
            quality: 1.1,
        }
    }

    #[test]
    fn test_write_calibrated_and_failed_groups() {
        let mut store = CalibrationStore::with_slots(2);
        store
            .set(
                0,
                CollectionCalibration::new(
                    4,
                    vec![
                        GroupCalibration::Calibrated {
                            model: CalibrationModel::new(vec![1.5, 2.0]),
                            points: vec![point()],
                        },
                        GroupCalibration::Failed {
                            reason: FitError::EmptySpectrum,
                            points: Vec::new(),
                        },
                    ],
                ),
            )
            .unwrap();
        // Slot 1 stays pending and must not appear in the output.

        let file = NamedTempFile::new().unwrap();
        let mut writer = CalibrationFileWriter::create(file.path()).unwrap();
        writer.write_store(&store, "gaussian").unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.starts_with("# rustcal energy calibration"));
        assert!(content.contains("CP 0 0 4 gaussian 1"));
        assert!(content.contains("PT Cs-137 661.66 330.5 0.04 11.8 1.1"));
        assert!(content.contains("MD 1.5 2"));
        assert!(content.contains("CP 0 1 4 gaussian 0"));
        assert!(content.contains("FA spectrum has no entries"));
        assert!(!content.contains("CP 1"));
    }
}
