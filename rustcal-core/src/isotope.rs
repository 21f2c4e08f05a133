//! Isotopes and their expected emission lines.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A calibration isotope with one or more emission line energies.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Isotope {
    name: String,
    lines_kev: Vec<f64>,
}

impl Isotope {
    /// Creates an isotope from a name and its line energies in keV.
    ///
    /// The energies are stored in ascending order.
    #[must_use]
    pub fn new<S: Into<String>>(name: S, mut lines_kev: Vec<f64>) -> Self {
        lines_kev.sort_by(|a, b| a.total_cmp(b));
        Self {
            name: name.into(),
            lines_kev,
        }
    }

    /// Looks up a common calibration source by name (case-insensitive,
    /// with or without the mass-number dash, e.g. `Cs137` or `cs-137`).
    ///
    /// Returns `None` for unknown isotopes. Line energies are the strong
    /// lines typically used for detector energy calibration.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let (canonical, lines): (&str, &[f64]) = match key.as_str() {
            "am241" => ("Am-241", &[59.54]),
            "ba133" => ("Ba-133", &[81.00, 302.85, 356.01]),
            "na22" => ("Na-22", &[511.00, 1274.54]),
            "cs137" => ("Cs-137", &[661.66]),
            "co57" => ("Co-57", &[122.06]),
            "co60" => ("Co-60", &[1173.23, 1332.49]),
            "eu152" => ("Eu-152", &[121.78, 344.28, 778.90, 964.08, 1408.01]),
            "k40" => ("K-40", &[1460.82]),
            _ => return None,
        };
        Some(Self::new(canonical, lines.to_vec()))
    }

    /// Returns the isotope name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the line energies in keV, ascending.
    #[must_use]
    pub fn lines_kev(&self) -> &[f64] {
        &self.lines_kev
    }
}

/// One expected emission line: isotope identity plus reference energy.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpectralLine {
    /// Name of the isotope emitting this line.
    pub isotope: String,
    /// Reference energy of the line in keV.
    pub energy_kev: f64,
}

/// Flattens a set of isotopes into their expected lines, ascending in
/// energy. Peak matching relies on this ordering.
#[must_use]
pub fn expected_lines(isotopes: &[Isotope]) -> Vec<SpectralLine> {
    let mut lines: Vec<SpectralLine> = isotopes
        .iter()
        .flat_map(|iso| {
            iso.lines_kev().iter().map(|&energy_kev| SpectralLine {
                isotope: iso.name().to_string(),
                energy_kev,
            })
        })
        .collect();
    lines.sort_by(|a, b| a.energy_kev.total_cmp(&b.energy_kev));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let cs = Isotope::from_name("Cs-137").unwrap();
        assert_eq!(cs.name(), "Cs-137");
        assert_eq!(cs.lines_kev().len(), 1);

        let co = Isotope::from_name("co60").unwrap();
        assert_eq!(co.lines_kev(), &[1173.23, 1332.49]);

        assert!(Isotope::from_name("Xx999").is_none());
    }

    #[test]
    fn test_expected_lines_sorted_across_isotopes() {
        let isotopes = vec![
            Isotope::from_name("Co60").unwrap(),
            Isotope::from_name("Cs137").unwrap(),
        ];
        let lines = expected_lines(&isotopes);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].isotope, "Cs-137");
        assert!(lines.windows(2).all(|w| w[0].energy_kev <= w[1].energy_kev));
    }
}
