//! Energy grid bookkeeping for X-ray spectral response folding
//!
//! Instrument calibration products (effective-area curves and
//! redistribution matrices) carry their own energy grids, which rarely
//! agree with each other or with the grid a count dataset prefers. This
//! crate provides the grid-level machinery the response models need:
//! the paired lo/hi [`EnergyGrid`] type, energy/wavelength conversion,
//! tolerance-based grid comparison, union-grid compilation for
//! multi-response data, and fractional-overlap rebinning between
//! disparate grids.

pub mod compile;
pub mod grid;
pub mod rebin;

pub use compile::{compile_energy_grid, sum_intervals, CompiledGrid, OverlapTable};
pub use grid::{
    energy_to_wavelength, grids_match, values_match, EnergyGrid, GridError, CGS, GRID_TOL,
    HC_KEV_ANGSTROM,
};
pub use rebin::{rebin, RebinSpec};
