//! Response convolution models
//!
//! A folded model wraps one physical source model together with the
//! calibration views needed to convolve it, and presents the callable
//! the fitting layer evaluates: parameters and a channel grid in,
//! predicted per-channel counts out.
//!
//! All folded models share one lifecycle. Construction computes a
//! [`FilterState`] from the canonical calibration; `startup` builds
//! session views masked to the dataset's noticed channels and
//! recomputes the state; `teardown` restores the canonical views.
//! `calc` is pure given the current state.

pub mod multi;
pub mod pileup;
pub mod single;

use ndarray::Array1;
use thiserror::Error;

use energy_grid::{EnergyGrid, GridError, RebinSpec};

use crate::data::{
    AnalysisUnit, AreaScal, ArfView, CalibrationError, DataPha, PhaError, RmfView, SharedPha,
};

pub use multi::MultiResponseSumModel;
pub use pileup::{PileupFold, PileupRmfModel, PileupTransform};
pub use single::{ArfModel, RmfModel, RspModel};

/// Errors raised while building or evaluating folded models
#[derive(Debug, Error)]
pub enum FoldError {
    #[error("dataset {dataset} has no instrument response")]
    NoResponse { dataset: String },

    #[error("dataset {dataset} does not have an associated ARF")]
    PileupNeedsArf { dataset: String },

    #[error("dataset {dataset} does not have an associated RMF")]
    PileupNeedsRmf { dataset: String },

    #[error("dataset {dataset} does not specify an exposure time")]
    PileupNeedsExposure { dataset: String },

    #[error(
        "AREASCAL length {actual} does not match the {response} output \
         length {expected} for dataset {dataset}"
    )]
    AreascalMismatch {
        response: String,
        dataset: String,
        expected: usize,
        actual: usize,
    },

    #[error(
        "noticed-channel mask length {actual} does not match the {response} \
         output length {expected} for dataset {dataset}"
    )]
    MaskMismatch {
        response: String,
        dataset: String,
        expected: usize,
        actual: usize,
    },

    #[error("multi-response orders disagree on channel count: {first} vs {other}")]
    OrderLengthMismatch { first: usize, other: usize },

    #[error("source model {model} failed: {reason}")]
    SourceFailure { model: String, reason: String },

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Pha(#[from] PhaError),

    #[error(transparent)]
    Grid(#[from] GridError),
}

/// The physical source model contract.
///
/// The convolution layer treats the source as an opaque parametrized
/// callable: given a parameter vector and a paired evaluation grid
/// (energy in keV or wavelength in Å, per the dataset's preference), it
/// returns bin-integrated flux. `startup`/`teardown` bracket a fitting
/// session.
pub trait SourceModel {
    fn name(&self) -> &str;

    fn calc(
        &self,
        p: &[f64],
        xlo: &Array1<f64>,
        xhi: &Array1<f64>,
    ) -> Result<Array1<f64>, FoldError>;

    fn startup(&mut self, _cache: bool) -> Result<(), FoldError> {
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), FoldError> {
        Ok(())
    }
}

/// A source model scaled by a constant, used to fold the exposure time
/// into the prediction.
pub struct ScaledModel {
    name: String,
    factor: f64,
    inner: Box<dyn SourceModel>,
}

impl ScaledModel {
    pub fn new(factor: f64, inner: Box<dyn SourceModel>) -> Self {
        let name = format!("({} * {})", factor, inner.name());
        Self {
            name,
            factor,
            inner,
        }
    }
}

impl SourceModel for ScaledModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn calc(
        &self,
        p: &[f64],
        xlo: &Array1<f64>,
        xhi: &Array1<f64>,
    ) -> Result<Array1<f64>, FoldError> {
        Ok(self.inner.calc(p, xlo, xhi)? * self.factor)
    }

    fn startup(&mut self, cache: bool) -> Result<(), FoldError> {
        self.inner.startup(cache)
    }

    fn teardown(&mut self) -> Result<(), FoldError> {
        self.inner.teardown()
    }
}

/// The folded-model contract the fitting layer evaluates.
pub trait FoldedModel {
    /// Diagnostic composition string, e.g. `apply_rmf(apply_arf(src))`.
    fn name(&self) -> &str;

    /// Enter a fitting session: build filtered calibration views from
    /// the dataset's current notice state.
    fn startup(&mut self, cache: bool) -> Result<(), FoldError>;

    /// Leave the session, restoring the canonical calibration. Safe to
    /// call without a prior `startup`.
    fn teardown(&mut self) -> Result<(), FoldError>;

    /// Predict counts for the given channels.
    ///
    /// Single-response models fold over their own grid and ignore the
    /// channel arguments; multi-response and pileup models compare them
    /// against the session channels to detect ad hoc grids.
    fn calc(
        &self,
        p: &[f64],
        channels: &Array1<f64>,
        channels_hi: Option<&Array1<f64>>,
    ) -> Result<Array1<f64>, FoldError>;
}

/// Cached grid state for one folded model.
///
/// Recomputed as a whole by [`recompute_filter`] at every lifecycle
/// transition; never mutated in place.
#[derive(Debug, Clone)]
pub struct FilterState {
    /// Evaluation grid in keV
    pub elo: Array1<f64>,
    pub ehi: Array1<f64>,
    /// Evaluation grid in Å
    pub lo: Array1<f64>,
    pub hi: Array1<f64>,
    /// Which of the two the source model sees
    pub units: AnalysisUnit,
    /// Down-sampling from the dataset's fine bins to the ARF grid
    pub arf_rebin: Option<RebinSpec>,
    /// Grid reconciliation entering the RMF stage
    pub rmf_rebin: Option<RebinSpec>,
}

impl FilterState {
    /// The grid the source model is evaluated on, in the active unit.
    pub fn xgrid(&self) -> (&Array1<f64>, &Array1<f64>) {
        match self.units {
            AnalysisUnit::Energy => (&self.elo, &self.ehi),
            AnalysisUnit::Wavelength => (&self.lo, &self.hi),
        }
    }
}

/// Recompute the cached grid state from the current calibration views.
///
/// The governing grid is the ARF view's when present (the ARF wins
/// ties), otherwise the RMF view's. When the dataset carries fine bin
/// edges of a different length, the model is evaluated there instead
/// and a down-sampling instruction is recorded against the first
/// response stage. When ARF and RMF view grids differ in length, a
/// reconciliation instruction is recorded for the RMF stage.
pub fn recompute_filter(
    arf: Option<&ArfView>,
    rmf: Option<&RmfView>,
    pha: Option<&DataPha>,
) -> Result<FilterState, FoldError> {
    let base = match (arf, rmf) {
        (Some(a), _) => a.grid().clone(),
        (None, Some(r)) => r.grid().clone(),
        (None, None) => {
            return Err(FoldError::NoResponse {
                dataset: pha.map_or("<none>", |p| p.name()).to_string(),
            })
        }
    };

    let mut eval = base.clone();
    let mut arf_rebin = None;
    let mut rmf_rebin = None;

    if let Some((bin_lo, bin_hi)) = pha.and_then(|p| p.bin_edges()) {
        // Native bin edges in angstroms arrive descending; convert to
        // ascending keV for comparison against the response grid
        let fine = if bin_lo.len() > 1 && bin_lo[0] > bin_lo[bin_lo.len() - 1] {
            // The keV/Å conversion is its own inverse
            let (elo, ehi) = energy_grid::energy_to_wavelength(bin_lo, bin_hi);
            EnergyGrid::new(elo, ehi)?
        } else {
            EnergyGrid::new(bin_lo.clone(), bin_hi.clone())?
        };

        if fine.len() != base.len() {
            let spec = RebinSpec::new(fine.clone(), base.clone());
            if arf.is_some() {
                arf_rebin = Some(spec);
            } else {
                rmf_rebin = Some(spec);
            }
            eval = fine;
        }
    }

    if let (Some(a), Some(r)) = (arf, rmf) {
        if a.grid().len() != r.grid().len() {
            rmf_rebin = Some(RebinSpec::new(a.grid().clone(), r.grid().clone()));
        }
    }

    let (lo, hi) = eval.to_wavelength();
    let units = pha.map_or(AnalysisUnit::Energy, |p| p.units());

    Ok(FilterState {
        elo: eval.lo().clone(),
        ehi: eval.hi().clone(),
        lo,
        hi,
        units,
        arf_rebin,
        rmf_rebin,
    })
}

/// Apply the AREASCAL correction after all response math.
///
/// A scalar scales every channel; a per-channel array must match the
/// output length exactly, anything else is a configuration error
/// carrying both the response and dataset names.
pub(crate) fn apply_areascal(
    out: Array1<f64>,
    pha: &DataPha,
    response: &str,
) -> Result<Array1<f64>, FoldError> {
    match pha.areascal() {
        None => Ok(out),
        Some(AreaScal::Scalar(a)) => Ok(out * *a),
        Some(AreaScal::PerChannel(a)) => {
            if a.len() != out.len() {
                return Err(FoldError::AreascalMismatch {
                    response: response.into(),
                    dataset: pha.name().into(),
                    expected: out.len(),
                    actual: a.len(),
                });
            }
            Ok(out * a)
        }
    }
}

/// Reduce a full channel-space vector to the noticed channels.
pub(crate) fn select_noticed(
    out: Array1<f64>,
    mask: &[bool],
    response: &str,
    dataset: &str,
) -> Result<Array1<f64>, FoldError> {
    if mask.iter().all(|&m| m) {
        return Ok(out);
    }
    if mask.len() != out.len() {
        return Err(FoldError::MaskMismatch {
            response: response.into(),
            dataset: dataset.into(),
            expected: out.len(),
            actual: mask.len(),
        });
    }
    let kept: Vec<f64> = out
        .iter()
        .zip(mask)
        .filter(|(_, &m)| m)
        .map(|(&v, _)| v)
        .collect();
    Ok(Array1::from(kept))
}

/// The 1-based channel numbering grid for a detector.
pub fn channel_grid(detchans: usize) -> Array1<f64> {
    Array1::from_iter((1..=detchans).map(|c| c as f64))
}

/// Restores a dataset's noticed-channel mask when dropped.
///
/// Ad hoc grid evaluation narrows the shared mask for one call; this
/// guard guarantees the prior mask comes back on every exit path,
/// including errors raised mid-evaluation.
pub(crate) struct NoticeGuard {
    pha: SharedPha,
    saved: Option<Vec<bool>>,
}

impl NoticeGuard {
    pub(crate) fn new(pha: SharedPha, saved: Vec<bool>) -> Self {
        Self {
            pha,
            saved: Some(saved),
        }
    }
}

impl Drop for NoticeGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            // The saved mask came from this dataset, so the length must
            // still match
            let mut pha = self.pha.lock().unwrap();
            let _ = pha.set_mask(saved);
        }
    }
}
