//! Union-grid compilation for multi-response data
//!
//! Dispersed-order datasets carry one response per order, each with its
//! own energy grid. Folding the source model once instead of once per
//! order needs a shared high-resolution grid that is the union of every
//! order's bin edges, plus a table mapping each original bin back to a
//! contiguous run of union bins.

use ndarray::Array1;

use crate::grid::{EnergyGrid, GridError};

/// Index ranges reconstructing one input grid from the union grid.
///
/// Original bin `i` is the sum of union bins `starts[i] .. ends[i]`
/// (start inclusive, end exclusive).
#[derive(Debug, Clone)]
pub struct OverlapTable {
    pub starts: Vec<usize>,
    pub ends: Vec<usize>,
}

/// An ascending union grid and the per-input overlap tables.
#[derive(Debug, Clone)]
pub struct CompiledGrid {
    pub grid: EnergyGrid,
    pub table: Vec<OverlapTable>,
}

/// Merge several energy grids into one ascending union grid.
///
/// Every bin edge of every input appears in the union; each input bin
/// maps to the contiguous run of union bins it spans, recorded in the
/// returned overlap tables in the input's own bin order. Compiling a
/// single gap-free grid returns that grid unchanged with a one-to-one
/// table.
///
/// # Arguments
///
/// * `grids` - The input grids, ascending or descending
///
/// # Returns
///
/// The compiled union grid, or a [`GridError`] if `grids` is empty.
pub fn compile_energy_grid(grids: &[&EnergyGrid]) -> Result<CompiledGrid, GridError> {
    if grids.is_empty() {
        return Err(GridError::Empty);
    }

    let mut edges: Vec<f64> = Vec::new();
    for g in grids {
        edges.extend(g.lo().iter());
        edges.extend(g.hi().iter());
    }
    edges.sort_by(|a, b| a.total_cmp(b));
    edges.dedup();

    let n = edges.len() - 1;
    let lo = Array1::from_iter(edges[..n].iter().copied());
    let hi = Array1::from_iter(edges[1..].iter().copied());
    let grid = EnergyGrid::new(lo, hi)?;

    let table = grids
        .iter()
        .map(|g| {
            let starts = g
                .lo()
                .iter()
                .map(|&l| edges.partition_point(|&e| e < l))
                .collect();
            let ends = g
                .hi()
                .iter()
                .map(|&h| edges.partition_point(|&e| e < h))
                .collect();
            OverlapTable { starts, ends }
        })
        .collect();

    Ok(CompiledGrid { grid, table })
}

/// Sum contiguous runs of a high-resolution value sequence.
///
/// Produces one output value per `[starts[i], ends[i])` range, matching
/// the tables built by [`compile_energy_grid`].
///
/// # Arguments
///
/// * `values` - Per-union-bin values
/// * `table` - Index ranges, start inclusive and end exclusive
pub fn sum_intervals(values: &Array1<f64>, table: &OverlapTable) -> Result<Array1<f64>, GridError> {
    if table.starts.len() != table.ends.len() {
        return Err(GridError::LengthMismatch {
            lo: table.starts.len(),
            hi: table.ends.len(),
        });
    }

    let mut out = Vec::with_capacity(table.starts.len());
    for (i, (&s, &e)) in table.starts.iter().zip(table.ends.iter()).enumerate() {
        if s > e || e > values.len() {
            return Err(GridError::IntervalOutOfBounds {
                index: i,
                start: s,
                end: e,
                len: values.len(),
            });
        }
        out.push(values.slice(ndarray::s![s..e]).sum());
    }
    Ok(Array1::from(out))
}
