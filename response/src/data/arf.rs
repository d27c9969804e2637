//! Effective-area curves and their filtered views

use std::sync::Arc;

use log::debug;
use ndarray::Array1;

use energy_grid::{EnergyGrid, RebinSpec};

use super::CalibrationError;

/// An effective-area curve: collecting area versus true photon energy.
///
/// The canonical object is immutable and shared between response models
/// with `Arc`; filtering for a fitting session happens on an [`ArfView`].
#[derive(Debug)]
pub struct DataArf {
    name: String,
    grid: EnergyGrid,
    specresp: Array1<f64>,
    exposure: Option<f64>,
    ethresh: Option<f64>,
}

impl DataArf {
    /// Create an effective-area curve.
    ///
    /// # Arguments
    ///
    /// * `name` - Identifier used in diagnostics
    /// * `grid` - Energy bins in keV
    /// * `specresp` - Effective area per bin in cm²
    /// * `exposure` - Optional exposure time in seconds
    /// * `ethresh` - Optional low-energy threshold; bins whose lower
    ///   edge falls below it apply zero area
    pub fn new(
        name: &str,
        grid: EnergyGrid,
        specresp: Array1<f64>,
        exposure: Option<f64>,
        ethresh: Option<f64>,
    ) -> Result<Self, CalibrationError> {
        if specresp.len() != grid.len() {
            return Err(CalibrationError::SpecrespLength {
                name: name.into(),
                expected: grid.len(),
                actual: specresp.len(),
            });
        }

        Ok(Self {
            name: name.into(),
            grid,
            specresp,
            exposure,
            ethresh,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid(&self) -> &EnergyGrid {
        &self.grid
    }

    pub fn specresp(&self) -> &Array1<f64> {
        &self.specresp
    }

    pub fn exposure(&self) -> Option<f64> {
        self.exposure
    }

    pub fn ethresh(&self) -> Option<f64> {
        self.ethresh
    }

    /// Effective area of one bin, honoring the low-energy threshold.
    fn area_at(&self, bin: usize) -> f64 {
        match self.ethresh {
            Some(t) if self.grid.lo()[bin] < t => 0.0,
            _ => self.specresp[bin],
        }
    }
}

/// A session-scoped, mask-carrying view over a shared [`DataArf`].
///
/// The view copies nothing but the mask and the selected grid; the
/// flat area array stays shared and read-only. Masked-out bins
/// contribute zero to the convolution output.
#[derive(Debug, Clone)]
pub struct ArfView {
    arf: Arc<DataArf>,
    mask: Option<Vec<bool>>,
    kept_grid: EnergyGrid,
}

impl ArfView {
    /// An unfiltered view covering every energy bin.
    pub fn all(arf: Arc<DataArf>) -> Self {
        let kept_grid = arf.grid().clone();
        Self {
            arf,
            mask: None,
            kept_grid,
        }
    }

    /// A view masked over energy bins.
    ///
    /// # Arguments
    ///
    /// * `mask` - Keep flags, one per energy bin
    pub fn noticed(arf: Arc<DataArf>, mask: &[bool]) -> Result<Self, CalibrationError> {
        if mask.len() != arf.grid().len() {
            return Err(CalibrationError::MaskLength {
                name: arf.name().into(),
                expected: arf.grid().len(),
                actual: mask.len(),
            });
        }
        if mask.iter().all(|&k| !k) {
            debug!("{}: empty energy filter, keeping all bins", arf.name());
            return Ok(Self::all(arf));
        }

        let kept_grid = arf.grid().select(mask)?;
        debug!(
            "{}: noticed {} of {} energy bins",
            arf.name(),
            kept_grid.len(),
            arf.grid().len()
        );
        Ok(Self {
            arf,
            mask: Some(mask.to_vec()),
            kept_grid,
        })
    }

    pub fn name(&self) -> &str {
        self.arf.name()
    }

    pub fn exposure(&self) -> Option<f64> {
        self.arf.exposure()
    }

    /// The canonical effective-area curve.
    pub fn specresp(&self) -> &Array1<f64> {
        self.arf.specresp()
    }

    /// The grid the source model should be evaluated on: the noticed
    /// bins in their original order.
    pub fn grid(&self) -> &EnergyGrid {
        &self.kept_grid
    }

    /// Length of the canonical, unfiltered grid.
    pub fn full_len(&self) -> usize {
        self.arf.grid().len()
    }

    /// Weight a flux vector by the effective area.
    ///
    /// The flux must live on the view's noticed grid (after the
    /// optional rebinning recorded at filter time). The output spans
    /// the full canonical grid, with masked-out bins set to zero.
    ///
    /// # Arguments
    ///
    /// * `flux` - Source flux on the noticed grid (or the finer grid
    ///   named by `rebin`)
    /// * `rebin` - Optional down-sampling instruction applied first
    pub fn apply(
        &self,
        flux: &Array1<f64>,
        rebin: Option<&RebinSpec>,
    ) -> Result<Array1<f64>, CalibrationError> {
        let flux = match rebin {
            Some(spec) => spec.apply(flux)?,
            None => flux.clone(),
        };

        if flux.len() != self.kept_grid.len() {
            return Err(CalibrationError::FluxLength {
                name: self.arf.name().into(),
                expected: self.kept_grid.len(),
                actual: flux.len(),
            });
        }

        let mut out = Array1::zeros(self.full_len());
        match &self.mask {
            None => {
                for (i, &f) in flux.iter().enumerate() {
                    out[i] = f * self.arf.area_at(i);
                }
            }
            Some(mask) => {
                let mut k = 0;
                for (i, &keep) in mask.iter().enumerate() {
                    if keep {
                        out[i] = flux[k] * self.arf.area_at(i);
                        k += 1;
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn arf4() -> Arc<DataArf> {
        let grid =
            EnergyGrid::from_slices(&[1.0, 2.0, 3.0, 4.0], &[2.0, 3.0, 4.0, 5.0]).unwrap();
        Arc::new(DataArf::new("test-arf", grid, array![10.0, 20.0, 30.0, 40.0], None, None).unwrap())
    }

    #[test]
    fn test_apply_unmasked() {
        let view = ArfView::all(arf4());
        let out = view.apply(&array![1.0, 1.0, 2.0, 0.5], None).unwrap();
        assert_eq!(out, array![10.0, 20.0, 60.0, 20.0]);
    }

    #[test]
    fn test_apply_masked_scatters() {
        let view = ArfView::noticed(arf4(), &[false, true, true, false]).unwrap();
        assert_eq!(view.grid().len(), 2);

        let out = view.apply(&array![1.0, 2.0], None).unwrap();
        assert_eq!(out, array![0.0, 20.0, 60.0, 0.0]);
    }

    #[test]
    fn test_flux_length_checked() {
        let view = ArfView::all(arf4());
        assert!(matches!(
            view.apply(&array![1.0, 2.0], None),
            Err(CalibrationError::FluxLength { .. })
        ));
    }

    #[test]
    fn test_ethresh_zeroes_low_bins() {
        let grid = EnergyGrid::from_slices(&[0.1, 1.0], &[1.0, 2.0]).unwrap();
        let arf = Arc::new(
            DataArf::new("lo-thresh", grid, array![5.0, 5.0], None, Some(0.5)).unwrap(),
        );
        let out = ArfView::all(arf).apply(&array![1.0, 1.0], None).unwrap();
        assert_relative_eq!(out[0], 0.0);
        assert_relative_eq!(out[1], 5.0);
    }

    #[test]
    fn test_rebin_then_weight() {
        let fine = EnergyGrid::from_slices(
            &[1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5],
            &[1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0],
        )
        .unwrap();
        let view = ArfView::all(arf4());
        let spec = RebinSpec::new(fine, view.grid().clone());

        let flux = Array1::ones(8);
        let out = view.apply(&flux, Some(&spec)).unwrap();
        // Two fine bins sum into each ARF bin before weighting
        assert_eq!(out, array![20.0, 40.0, 60.0, 80.0]);
    }
}
