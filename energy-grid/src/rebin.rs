//! Fractional-overlap rebinning between disparate grids

use ndarray::Array1;

use crate::grid::{EnergyGrid, GridError};

/// A recorded instruction to rebin bin-integrated values from one grid
/// onto another.
///
/// Convolution models record one of these during filtering when the
/// dataset's native bin edges are finer than the calibration grid; the
/// instruction is then honored on every evaluation without being
/// recomputed.
#[derive(Debug, Clone)]
pub struct RebinSpec {
    from: EnergyGrid,
    to: EnergyGrid,
}

impl RebinSpec {
    pub fn new(from: EnergyGrid, to: EnergyGrid) -> Self {
        Self { from, to }
    }

    /// The grid the values currently live on.
    pub fn from_grid(&self) -> &EnergyGrid {
        &self.from
    }

    /// The grid the values are redistributed onto.
    pub fn to_grid(&self) -> &EnergyGrid {
        &self.to
    }

    /// Apply the recorded rebinning to `values`.
    pub fn apply(&self, values: &Array1<f64>) -> Result<Array1<f64>, GridError> {
        rebin(values, &self.from, &self.to)
    }
}

/// Redistribute bin-integrated values from one grid onto another.
///
/// Each source bin's value is split among the target bins it overlaps,
/// in proportion to the overlapping fraction of the source bin's width.
/// Total integrated value is conserved wherever the target grid covers
/// the source grid. Both grids must be ascending.
///
/// # Arguments
///
/// * `values` - Bin-integrated values on `from`
/// * `from` - The grid the values live on
/// * `to` - The target grid
///
/// # Returns
///
/// Values redistributed onto `to`, or a [`GridError`] when the grids
/// are descending or `values` does not match `from`.
pub fn rebin(
    values: &Array1<f64>,
    from: &EnergyGrid,
    to: &EnergyGrid,
) -> Result<Array1<f64>, GridError> {
    if values.len() != from.len() {
        return Err(GridError::LengthMismatch {
            lo: values.len(),
            hi: from.len(),
        });
    }
    if from.is_descending() || to.is_descending() {
        return Err(GridError::RebinNotAscending);
    }

    let (flo, fhi) = (from.lo(), from.hi());
    let (tlo, thi) = (to.lo(), to.hi());

    let mut out = Array1::zeros(to.len());
    let mut i = 0; // source cursor

    for j in 0..to.len() {
        // Skip source bins entirely below this target bin
        while i < from.len() && fhi[i] <= tlo[j] {
            i += 1;
        }

        let mut k = i;
        while k < from.len() && flo[k] < thi[j] {
            let overlap = fhi[k].min(thi[j]) - flo[k].max(tlo[j]);
            if overlap > 0.0 {
                out[j] += values[k] * overlap / (fhi[k] - flo[k]);
            }
            k += 1;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_identity_on_same_grid() {
        let grid = EnergyGrid::from_slices(&[1.0, 2.0, 3.0], &[2.0, 3.0, 4.0]).unwrap();
        let values = array![5.0, 7.0, 11.0];
        let out = rebin(&values, &grid, &grid).unwrap();
        for (a, b) in out.iter().zip(values.iter()) {
            assert_relative_eq!(a, b);
        }
    }

    #[test]
    fn test_downsample_sums_bins() {
        let fine = EnergyGrid::from_slices(&[1.0, 1.5, 2.0, 2.5], &[1.5, 2.0, 2.5, 3.0]).unwrap();
        let coarse = EnergyGrid::from_slices(&[1.0, 2.0], &[2.0, 3.0]).unwrap();
        let values = array![1.0, 2.0, 3.0, 4.0];

        let out = rebin(&values, &fine, &coarse).unwrap();
        assert_relative_eq!(out[0], 3.0);
        assert_relative_eq!(out[1], 7.0);
    }

    #[test]
    fn test_split_bin_conserves_total() {
        // One source bin straddling two target bins: split 50/50
        let from = EnergyGrid::from_slices(&[1.0], &[3.0]).unwrap();
        let to = EnergyGrid::from_slices(&[1.0, 2.0], &[2.0, 3.0]).unwrap();
        let values = array![8.0];

        let out = rebin(&values, &from, &to).unwrap();
        assert_relative_eq!(out[0], 4.0);
        assert_relative_eq!(out[1], 4.0);
        assert_relative_eq!(out.sum(), values.sum());
    }

    #[test]
    fn test_misaligned_grids_conserve_total() {
        let from =
            EnergyGrid::from_slices(&[1.0, 1.7, 2.3, 2.9], &[1.7, 2.3, 2.9, 3.6]).unwrap();
        let to = EnergyGrid::from_slices(&[0.5, 2.0, 3.1], &[2.0, 3.1, 4.0]).unwrap();
        let values = array![2.0, 4.0, 1.0, 5.0];

        let out = rebin(&values, &from, &to).unwrap();
        assert_relative_eq!(out.sum(), values.sum(), max_relative = 1e-12);
    }

    #[test]
    fn test_descending_rejected() {
        let desc = EnergyGrid::from_slices(&[2.0, 1.0], &[3.0, 2.0]).unwrap();
        let asc = EnergyGrid::from_slices(&[1.0, 2.0], &[2.0, 3.0]).unwrap();
        let values = array![1.0, 1.0];
        assert!(matches!(
            rebin(&values, &desc, &asc),
            Err(GridError::RebinNotAscending)
        ));
    }
}
