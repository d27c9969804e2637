//! Redistribution matrices in condensed sparse form, and their views

use std::sync::Arc;

use log::debug;
use ndarray::Array1;

use energy_grid::{EnergyGrid, RebinSpec};

use super::CalibrationError;

/// An energy redistribution matrix in the condensed row-grouped sparse
/// form of the OGIP standard.
///
/// For each true-energy bin, `n_grp` declares how many contiguous
/// channel groups receive weight; each group contributes one entry to
/// `f_chan` (starting channel, in the file's numbering) and `n_chan`
/// (run length), and `n_chan` weights to the flat `matrix` array in
/// row-major group order.
#[derive(Debug)]
pub struct DataRmf {
    name: String,
    grid: EnergyGrid,
    detchans: usize,
    n_grp: Vec<usize>,
    f_chan: Vec<usize>,
    n_chan: Vec<usize>,
    matrix: Array1<f64>,
    offset: usize,
    e_min: Option<Array1<f64>>,
    e_max: Option<Array1<f64>>,
}

impl DataRmf {
    /// Create a redistribution matrix, validating the condensed-format
    /// bookkeeping.
    ///
    /// # Arguments
    ///
    /// * `name` - Identifier used in diagnostics
    /// * `grid` - True-energy bins in keV
    /// * `detchans` - Number of detector channels
    /// * `n_grp` - Channel-group count per energy bin
    /// * `f_chan` - Starting channel per group, in the file's numbering
    /// * `n_chan` - Run length per group
    /// * `matrix` - Flat nonzero weights in row-major group order
    /// * `offset` - First channel number, 0 or 1
    /// * `e_min`, `e_max` - Optional EBOUNDS nominal channel energies
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        grid: EnergyGrid,
        detchans: usize,
        n_grp: Vec<usize>,
        f_chan: Vec<usize>,
        n_chan: Vec<usize>,
        matrix: Array1<f64>,
        offset: usize,
        e_min: Option<Array1<f64>>,
        e_max: Option<Array1<f64>>,
    ) -> Result<Self, CalibrationError> {
        if n_grp.len() != grid.len() {
            return Err(CalibrationError::GroupCount {
                name: name.into(),
                expected: grid.len(),
                actual: n_grp.len(),
            });
        }

        let total_groups: usize = n_grp.iter().sum();
        if f_chan.len() != total_groups || n_chan.len() != total_groups {
            return Err(CalibrationError::GroupCount {
                name: name.into(),
                expected: total_groups,
                actual: f_chan.len().min(n_chan.len()),
            });
        }

        let total_weights: usize = n_chan.iter().sum();
        if matrix.len() != total_weights {
            return Err(CalibrationError::MatrixLength {
                name: name.into(),
                expected: total_weights,
                actual: matrix.len(),
            });
        }

        // Every group must land inside the channel range
        let mut cursor = 0;
        for (bin, &groups) in n_grp.iter().enumerate() {
            for g in 0..groups {
                let first = f_chan[cursor + g];
                let run = n_chan[cursor + g];
                if first < offset || first - offset + run > detchans {
                    return Err(CalibrationError::ChannelRange {
                        name: name.into(),
                        bin,
                        first,
                        last: first + run,
                        detchans,
                    });
                }
            }
            cursor += groups;
        }

        for bounds in [&e_min, &e_max].into_iter().flatten() {
            if bounds.len() != detchans {
                return Err(CalibrationError::EboundsLength {
                    name: name.into(),
                    expected: detchans,
                    actual: bounds.len(),
                });
            }
        }

        Ok(Self {
            name: name.into(),
            grid,
            detchans,
            n_grp,
            f_chan,
            n_chan,
            matrix,
            offset,
            e_min,
            e_max,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid(&self) -> &EnergyGrid {
        &self.grid
    }

    pub fn detchans(&self) -> usize {
        self.detchans
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn n_grp(&self) -> &[usize] {
        &self.n_grp
    }

    pub fn f_chan(&self) -> &[usize] {
        &self.f_chan
    }

    pub fn n_chan(&self) -> &[usize] {
        &self.n_chan
    }

    pub fn matrix(&self) -> &Array1<f64> {
        &self.matrix
    }

    pub fn e_bounds(&self) -> Option<(&Array1<f64>, &Array1<f64>)> {
        match (&self.e_min, &self.e_max) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        }
    }

}

/// A session-scoped, mask-carrying view over a shared [`DataRmf`].
///
/// Filtering is derived from the dataset's noticed channels: an energy
/// bin is kept when any of its channel groups overlaps a noticed
/// channel. The condensed arrays stay shared; masked-out rows simply
/// contribute zero when the matrix is applied.
#[derive(Debug, Clone)]
pub struct RmfView {
    rmf: Arc<DataRmf>,
    bin_mask: Option<Vec<bool>>,
    chan_mask: Option<Vec<bool>>,
    kept_grid: EnergyGrid,
}

impl RmfView {
    /// An unfiltered view covering every energy bin and channel.
    pub fn all(rmf: Arc<DataRmf>) -> Self {
        let kept_grid = rmf.grid().clone();
        Self {
            rmf,
            bin_mask: None,
            chan_mask: None,
            kept_grid,
        }
    }

    /// A view filtered to the given noticed channels.
    ///
    /// # Arguments
    ///
    /// * `chan_mask` - Noticed flags, one per detector channel
    pub fn noticed(rmf: Arc<DataRmf>, chan_mask: &[bool]) -> Result<Self, CalibrationError> {
        if chan_mask.len() != rmf.detchans() {
            return Err(CalibrationError::MaskLength {
                name: rmf.name().into(),
                expected: rmf.detchans(),
                actual: chan_mask.len(),
            });
        }

        // Keep an energy bin when any of its groups feeds a noticed channel
        let mut bin_mask = vec![false; rmf.grid().len()];
        let mut grp_cursor = 0;
        for (bin, keep) in bin_mask.iter_mut().enumerate() {
            for g in 0..rmf.n_grp[bin] {
                let first = rmf.f_chan[grp_cursor + g] - rmf.offset;
                let run = rmf.n_chan[grp_cursor + g];
                if chan_mask[first..first + run].iter().any(|&n| n) {
                    *keep = true;
                    break;
                }
            }
            grp_cursor += rmf.n_grp[bin];
        }

        if bin_mask.iter().all(|&k| !k) {
            debug!("{}: empty channel filter, keeping all bins", rmf.name());
            return Ok(Self::all(rmf));
        }

        let kept_grid = rmf.grid().select(&bin_mask)?;
        debug!(
            "{}: noticed {} of {} energy bins for {} noticed channels",
            rmf.name(),
            kept_grid.len(),
            rmf.grid().len(),
            chan_mask.iter().filter(|&&n| n).count()
        );
        Ok(Self {
            rmf,
            bin_mask: Some(bin_mask),
            chan_mask: Some(chan_mask.to_vec()),
            kept_grid,
        })
    }

    pub fn name(&self) -> &str {
        self.rmf.name()
    }

    pub fn detchans(&self) -> usize {
        self.rmf.detchans()
    }

    /// The energy-bin keep mask, when the view is filtered.
    pub fn bin_mask(&self) -> Option<&[bool]> {
        self.bin_mask.as_deref()
    }

    /// The grid the source model should be evaluated on: the kept bins
    /// in their original order.
    pub fn grid(&self) -> &EnergyGrid {
        &self.kept_grid
    }

    /// Apply the sparse matrix to an energy-binned flux vector.
    ///
    /// Accepts flux on either the view's kept grid or the canonical
    /// full grid (masked-out bins contribute zero in both cases) and
    /// produces a channel-binned vector of length `detchans`, with
    /// non-noticed channels zeroed when the view is filtered.
    ///
    /// # Arguments
    ///
    /// * `flux` - Energy-binned source flux
    /// * `rebin` - Optional grid-reconciliation instruction applied
    ///   first
    pub fn apply(
        &self,
        flux: &Array1<f64>,
        rebin: Option<&RebinSpec>,
    ) -> Result<Array1<f64>, CalibrationError> {
        let flux = match rebin {
            Some(spec) => spec.apply(flux)?,
            None => flux.clone(),
        };

        let full = self.rmf.grid().len();
        let kept = self.kept_grid.len();
        let condensed_input = if flux.len() == kept {
            true
        } else if flux.len() == full {
            false
        } else {
            return Err(CalibrationError::FluxLength {
                name: self.rmf.name().into(),
                expected: kept,
                actual: flux.len(),
            });
        };

        let mut out = Array1::zeros(self.rmf.detchans());
        let mut grp_cursor = 0;
        let mut weight_cursor = 0;
        let mut flux_cursor = 0;

        for bin in 0..full {
            let keep = self.bin_mask.as_ref().map_or(true, |m| m[bin]);
            let value = if keep {
                if condensed_input {
                    let v = flux[flux_cursor];
                    flux_cursor += 1;
                    v
                } else {
                    flux[bin]
                }
            } else {
                0.0
            };

            for g in 0..self.rmf.n_grp[bin] {
                let first = self.rmf.f_chan[grp_cursor + g] - self.rmf.offset;
                let run = self.rmf.n_chan[grp_cursor + g];
                if value != 0.0 {
                    for k in 0..run {
                        out[first + k] += value * self.rmf.matrix[weight_cursor + k];
                    }
                }
                weight_cursor += run;
            }
            grp_cursor += self.rmf.n_grp[bin];
        }

        if let Some(chan_mask) = &self.chan_mask {
            for (c, &noticed) in chan_mask.iter().enumerate() {
                if !noticed {
                    out[c] = 0.0;
                }
            }
        }

        Ok(out)
    }
}
