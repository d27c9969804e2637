//! Paired lo/hi energy grids and wavelength conversion

use float_cmp::approx_eq;
use ndarray::Array1;
use thiserror::Error;

/// Physical constants in CGS units
pub struct CGS {}

impl CGS {
    /// Planck's constant
    /// Units: 6.62607015e-27 erg⋅s
    pub const PLANCK_CONSTANT: f64 = 6.62607015e-27;

    /// Speed of light in vacuum
    /// Units: 2.99792458e10 cm/s
    pub const SPEED_OF_LIGHT: f64 = 2.99792458e10;

    /// 1 keV in erg
    pub const ERG_PER_KEV: f64 = 1.602176634e-9;

    /// 1 angstrom in cm
    pub const CM_PER_ANGSTROM: f64 = 1e-8;
}

/// h·c expressed in keV·Å, the conversion factor between photon energy
/// in keV and wavelength in angstroms: `wave = HC / energy`.
pub const HC_KEV_ANGSTROM: f64 =
    CGS::PLANCK_CONSTANT * CGS::SPEED_OF_LIGHT / (CGS::ERG_PER_KEV * CGS::CM_PER_ANGSTROM);

/// Tolerance for deciding whether two grids are the same grid.
///
/// Calibration products are traditionally stored at single precision,
/// so grids that agree to within the f32 machine epsilon are treated as
/// equal and the expensive rebinning path is skipped.
pub const GRID_TOL: f64 = f32::EPSILON as f64;

/// Errors that can occur when constructing or combining energy grids
#[derive(Debug, Error)]
pub enum GridError {
    #[error("lo and hi arrays must have the same length, got {lo} and {hi}")]
    LengthMismatch { lo: usize, hi: usize },

    #[error("energy grid must contain at least one bin")]
    Empty,

    #[error("energy bin {index} is not positive with hi > lo: [{lo}, {hi}]")]
    InvalidBin { index: usize, lo: f64, hi: f64 },

    #[error("energy grid bins must be monotonic and non-overlapping (bin {index})")]
    NotMonotonic { index: usize },

    #[error("interval table entry {index} is out of bounds: [{start}, {end}) over {len} values")]
    IntervalOutOfBounds {
        index: usize,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("rebinning requires ascending grids")]
    RebinNotAscending,
}

/// A paired sequence of energy bin edges in keV.
///
/// `lo` and `hi` always co-vary: bin `i` spans `[lo[i], hi[i]]` with
/// `hi[i] > lo[i] > 0`. Bins run monotonically in either direction
/// (ascending for energy-ordered products, descending for
/// wavelength-ordered grating data) and never overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyGrid {
    lo: Array1<f64>,
    hi: Array1<f64>,
}

impl EnergyGrid {
    /// Create a new grid, validating the pairing invariants.
    ///
    /// # Arguments
    ///
    /// * `lo` - Lower bin edges in keV
    /// * `hi` - Upper bin edges in keV
    ///
    /// # Returns
    ///
    /// The validated grid, or a [`GridError`] describing the violation.
    pub fn new(lo: Array1<f64>, hi: Array1<f64>) -> Result<Self, GridError> {
        if lo.len() != hi.len() {
            return Err(GridError::LengthMismatch {
                lo: lo.len(),
                hi: hi.len(),
            });
        }
        if lo.is_empty() {
            return Err(GridError::Empty);
        }

        for (i, (&l, &h)) in lo.iter().zip(hi.iter()).enumerate() {
            if !(l > 0.0 && h > l) || !l.is_finite() || !h.is_finite() {
                return Err(GridError::InvalidBin {
                    index: i,
                    lo: l,
                    hi: h,
                });
            }
        }

        // Monotonic in either direction, no overlapping bins
        let ascending = lo.len() < 2 || lo[1] > lo[0];
        for i in 1..lo.len() {
            let ok = if ascending {
                lo[i] >= hi[i - 1]
            } else {
                hi[i] <= lo[i - 1]
            };
            if !ok {
                return Err(GridError::NotMonotonic { index: i });
            }
        }

        Ok(Self { lo, hi })
    }

    /// Build a grid from plain slices.
    pub fn from_slices(lo: &[f64], hi: &[f64]) -> Result<Self, GridError> {
        Self::new(Array1::from(lo.to_vec()), Array1::from(hi.to_vec()))
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.lo.len()
    }

    /// True when the grid holds no bins (never true for a validated grid).
    pub fn is_empty(&self) -> bool {
        self.lo.is_empty()
    }

    /// Lower bin edges in keV.
    pub fn lo(&self) -> &Array1<f64> {
        &self.lo
    }

    /// Upper bin edges in keV.
    pub fn hi(&self) -> &Array1<f64> {
        &self.hi
    }

    /// True when the bins run from high energy to low energy.
    pub fn is_descending(&self) -> bool {
        self.lo.len() > 1 && self.lo[1] < self.lo[0]
    }

    /// Convert to wavelength edges in angstroms.
    ///
    /// Lower energy means higher wavelength, so the returned pair swaps
    /// roles: `wave_lo = HC / energy_hi` and `wave_hi = HC / energy_lo`.
    pub fn to_wavelength(&self) -> (Array1<f64>, Array1<f64>) {
        energy_to_wavelength(&self.lo, &self.hi)
    }

    /// Select the bins where `keep` is true, preserving order.
    ///
    /// # Arguments
    ///
    /// * `keep` - Mask over bins, same length as the grid
    pub fn select(&self, keep: &[bool]) -> Result<Self, GridError> {
        if keep.len() != self.len() {
            return Err(GridError::LengthMismatch {
                lo: self.len(),
                hi: keep.len(),
            });
        }
        let lo: Vec<f64> = self
            .lo
            .iter()
            .zip(keep)
            .filter(|(_, &k)| k)
            .map(|(&v, _)| v)
            .collect();
        let hi: Vec<f64> = self
            .hi
            .iter()
            .zip(keep)
            .filter(|(_, &k)| k)
            .map(|(&v, _)| v)
            .collect();
        Self::new(Array1::from(lo), Array1::from(hi))
    }
}

/// Convert paired energy edges (keV) to paired wavelength edges (Å).
///
/// The conversion swaps the pairing: the low-wavelength edge comes from
/// the high-energy edge and vice versa. Applying the conversion twice
/// returns the original arrays.
pub fn energy_to_wavelength(lo: &Array1<f64>, hi: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
    let wlo = hi.mapv(|e| HC_KEV_ANGSTROM / e);
    let whi = lo.mapv(|e| HC_KEV_ANGSTROM / e);
    (wlo, whi)
}

/// Elementwise comparison of two value sequences at [`GRID_TOL`].
///
/// Used to decide whether a caller-supplied grid is the dataset's own
/// channel grid, short-circuiting the ad hoc evaluation path.
pub fn values_match(a: &Array1<f64>, b: &Array1<f64>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(&x, &y)| approx_eq!(f64, x, y, epsilon = GRID_TOL * x.abs().max(1.0)))
}

/// Compare two grids edge by edge at [`GRID_TOL`].
pub fn grids_match(a: &EnergyGrid, b: &EnergyGrid) -> bool {
    values_match(a.lo(), b.lo()) && values_match(a.hi(), b.hi())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_hc_constant() {
        // hc in keV A, quoted to the precision used by OGIP tooling
        assert_relative_eq!(HC_KEV_ANGSTROM, 12.39841984, epsilon = 1e-6);
    }

    #[test]
    fn test_wavelength_round_trip() {
        let grid = EnergyGrid::from_slices(&[0.1, 0.2, 0.4], &[0.2, 0.4, 0.8]).unwrap();
        let (wlo, whi) = grid.to_wavelength();

        // Energy ascending becomes wavelength descending
        assert!(wlo[0] > wlo[1]);

        let (elo, ehi) = energy_to_wavelength(&wlo, &whi);
        for i in 0..grid.len() {
            assert_relative_eq!(elo[i], grid.lo()[i], max_relative = 1e-12);
            assert_relative_eq!(ehi[i], grid.hi()[i], max_relative = 1e-12);
        }
    }

    #[test]
    fn test_descending_grid_valid() {
        let grid = EnergyGrid::from_slices(&[0.4, 0.2, 0.1], &[0.8, 0.4, 0.2]).unwrap();
        assert!(grid.is_descending());
    }

    #[test]
    fn test_rejects_overlapping_bins() {
        let result = EnergyGrid::from_slices(&[0.1, 0.15], &[0.2, 0.3]);
        assert!(matches!(result, Err(GridError::NotMonotonic { index: 1 })));
    }

    #[test]
    fn test_rejects_nonpositive_bins() {
        let result = EnergyGrid::from_slices(&[0.0, 0.1], &[0.1, 0.2]);
        assert!(matches!(result, Err(GridError::InvalidBin { index: 0, .. })));
    }

    #[test]
    fn test_values_match_tolerance() {
        let a = array![1.0, 2.0, 3.0];
        let mut b = a.clone();
        b[1] += GRID_TOL / 10.0;
        assert!(values_match(&a, &b));

        b[1] = 2.001;
        assert!(!values_match(&a, &b));

        let short = array![1.0, 2.0];
        assert!(!values_match(&a, &short));
    }

    #[test]
    fn test_select_mask() {
        let grid = EnergyGrid::from_slices(&[0.1, 0.2, 0.4], &[0.2, 0.4, 0.8]).unwrap();
        let sub = grid.select(&[true, false, true]).unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.lo()[1], 0.4);
        assert_eq!(sub.hi()[1], 0.8);
    }
}
