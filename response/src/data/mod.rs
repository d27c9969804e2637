//! In-memory calibration and count data
//!
//! Canonical calibration objects ([`DataArf`], [`DataRmf`]) are
//! immutable and shared between response models via `Arc`; per-session
//! filtering happens on cheap mask-carrying views ([`ArfView`],
//! [`RmfView`]) so the stored calibration is never mutated. The count
//! dataset ([`DataPha`]) carries the mutable noticed-channel state and
//! is shared behind a mutex.

pub mod arf;
pub mod pha;
pub mod rmf;

use ndarray::{Array1, Array2};
use thiserror::Error;

use energy_grid::{EnergyGrid, GridError};

pub use arf::{ArfView, DataArf};
pub use pha::{AnalysisUnit, AreaScal, DataPha, PhaError, ResponsePair, SharedPha};
pub use rmf::{DataRmf, RmfView};

/// Errors raised when constructing or applying calibration objects
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("{name}: effective area length {actual} does not match energy grid length {expected}")]
    SpecrespLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: group arrays hold {actual} entries but N_GRP declares {expected}")]
    GroupCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: matrix holds {actual} elements but group run-lengths sum to {expected}")]
    MatrixLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: group in energy bin {bin} spans channels {first}..{last} outside 0..{detchans}")]
    ChannelRange {
        name: String,
        bin: usize,
        first: usize,
        last: usize,
        detchans: usize,
    },

    #[error("{name}: EBOUNDS length {actual} does not match {expected} channels")]
    EboundsLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: mask length {actual} does not match {expected}")]
    MaskLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: flux length {actual} does not match response grid length {expected}")]
    FluxLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: matrix image is empty")]
    EmptyMatrixImage { name: String },

    #[error("{name}: matrix image has {rows} rows but the energy grid has {expected} bins")]
    MatrixImageShape {
        name: String,
        rows: usize,
        expected: usize,
    },

    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Create an effective-area curve from raw arrays.
///
/// # Arguments
///
/// * `name` - Identifier used in diagnostics
/// * `grid` - Energy bins in keV
/// * `specresp` - Effective area per bin in cm²; a flat unit response
///   is used when `None`
/// * `exposure` - Optional exposure time in seconds
/// * `ethresh` - Optional low-energy threshold; bins below it apply
///   zero area
pub fn create_arf(
    name: &str,
    grid: EnergyGrid,
    specresp: Option<Array1<f64>>,
    exposure: Option<f64>,
    ethresh: Option<f64>,
) -> Result<DataArf, CalibrationError> {
    let specresp = specresp.unwrap_or_else(|| Array1::ones(grid.len()));
    DataArf::new(name, grid, specresp, exposure, ethresh)
}

/// Create an ideal delta-function redistribution matrix.
///
/// Each energy bin maps to exactly one channel with unit weight: bin
/// `i` feeds channel `i + offset` in the file's numbering, so applying
/// the matrix to a flux vector returns that vector unchanged.
///
/// # Arguments
///
/// * `name` - Identifier used in diagnostics
/// * `grid` - Energy bins in keV; the channel count equals the bin count
/// * `offset` - First channel number, 0 or 1
/// * `e_min`, `e_max` - Optional EBOUNDS nominal channel energies
pub fn create_delta_rmf(
    name: &str,
    grid: EnergyGrid,
    offset: usize,
    e_min: Option<Array1<f64>>,
    e_max: Option<Array1<f64>>,
) -> Result<DataRmf, CalibrationError> {
    let nchans = grid.len();
    let n_grp = vec![1usize; nchans];
    let n_chan = vec![1usize; nchans];
    let f_chan: Vec<usize> = (0..nchans).map(|i| i + offset).collect();
    let matrix = Array1::ones(nchans);

    DataRmf::new(name, grid, nchans, n_grp, f_chan, n_chan, matrix, offset, e_min, e_max)
}

/// Create a redistribution matrix from a dense 2-D weight image.
///
/// Rows follow the energy-bin order of `grid`; columns are detector
/// channels. Per-row group boundaries are derived from the contiguous
/// runs of positive weights, and only those weights are stored, in
/// row-major group order. Loading the image from a FITS file is the
/// caller's concern.
///
/// # Arguments
///
/// * `name` - Identifier used in diagnostics
/// * `grid` - Energy bins in keV, one per image row
/// * `image` - Dense weight image, `grid.len()` rows by `detchans`
///   columns
/// * `offset` - First channel number, 0 or 1
/// * `e_min`, `e_max` - Optional EBOUNDS nominal channel energies
pub fn create_matrix_rmf(
    name: &str,
    grid: EnergyGrid,
    image: &Array2<f64>,
    offset: usize,
    e_min: Option<Array1<f64>>,
    e_max: Option<Array1<f64>>,
) -> Result<DataRmf, CalibrationError> {
    let (rows, detchans) = image.dim();
    if rows == 0 || detchans == 0 {
        return Err(CalibrationError::EmptyMatrixImage { name: name.into() });
    }
    if rows != grid.len() {
        return Err(CalibrationError::MatrixImageShape {
            name: name.into(),
            rows,
            expected: grid.len(),
        });
    }

    let mut n_grp = Vec::with_capacity(rows);
    let mut f_chan = Vec::new();
    let mut n_chan = Vec::new();
    let mut matrix = Vec::new();

    for row in image.rows() {
        let mut groups = 0;
        let mut run_start = None;

        for (col, &w) in row.iter().enumerate() {
            match (w > 0.0, run_start) {
                (true, None) => run_start = Some(col),
                (false, Some(start)) => {
                    groups += 1;
                    f_chan.push(start + offset);
                    n_chan.push(col - start);
                    matrix.extend(row.slice(ndarray::s![start..col]).iter());
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            groups += 1;
            f_chan.push(start + offset);
            n_chan.push(row.len() - start);
            matrix.extend(row.slice(ndarray::s![start..]).iter());
        }

        n_grp.push(groups);
    }

    DataRmf::new(
        name,
        grid,
        detchans,
        n_grp,
        f_chan,
        n_chan,
        Array1::from(matrix),
        offset,
        e_min,
        e_max,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn grid3() -> EnergyGrid {
        EnergyGrid::from_slices(&[1.0, 2.0, 3.0], &[2.0, 3.0, 4.0]).unwrap()
    }

    #[test]
    fn test_create_arf_defaults_to_flat() {
        let arf = create_arf("flat", grid3(), None, Some(100.0), None).unwrap();
        assert_eq!(arf.specresp(), &array![1.0, 1.0, 1.0]);
        assert_eq!(arf.exposure(), Some(100.0));
    }

    #[test]
    fn test_create_delta_rmf_groups() {
        let rmf = create_delta_rmf("delta", grid3(), 1, None, None).unwrap();
        assert_eq!(rmf.detchans(), 3);
        assert_eq!(rmf.n_grp(), &[1, 1, 1]);
        assert_eq!(rmf.f_chan(), &[1, 2, 3]);
        assert_eq!(rmf.n_chan(), &[1, 1, 1]);
    }

    #[test]
    fn test_create_matrix_rmf_extracts_runs() {
        // Row 0: one run of two channels; row 1: two runs; row 2: none
        let image = array![
            [0.6, 0.4, 0.0, 0.0],
            [0.3, 0.0, 0.5, 0.2],
            [0.0, 0.0, 0.0, 0.0],
        ];
        let rmf = create_matrix_rmf("img", grid3(), &image, 1, None, None).unwrap();

        assert_eq!(rmf.detchans(), 4);
        assert_eq!(rmf.n_grp(), &[1, 2, 0]);
        assert_eq!(rmf.f_chan(), &[1, 1, 3]);
        assert_eq!(rmf.n_chan(), &[2, 1, 2]);
        assert_eq!(rmf.matrix(), &array![0.6, 0.4, 0.3, 0.5, 0.2]);
    }

    #[test]
    fn test_create_matrix_rmf_rejects_bad_shape() {
        let image = Array2::<f64>::zeros((2, 4));
        assert!(matches!(
            create_matrix_rmf("img", grid3(), &image, 1, None, None),
            Err(CalibrationError::MatrixImageShape { rows: 2, .. })
        ));

        let empty = Array2::<f64>::zeros((0, 0));
        assert!(matches!(
            create_matrix_rmf("img", grid3(), &empty, 1, None, None),
            Err(CalibrationError::EmptyMatrixImage { .. })
        ));
    }
}
