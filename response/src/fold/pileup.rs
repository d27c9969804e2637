//! Photon pileup handling
//!
//! Pileup is a nonlinear detector effect: two photons arriving within
//! one frame read out as a single event. It acts on the expected count
//! rate after the effective area but before channel redistribution, so
//! the usual fused ARF-RMF chain does not apply. Instead the ARF stage
//! and the pileup kernel are folded into the source side and only the
//! redistribution runs in the channel stage.

use std::sync::Arc;

use log::debug;
use ndarray::Array1;

use energy_grid::values_match;

use crate::data::{ArfView, DataArf, DataRmf, RmfView, SharedPha};

use super::{
    recompute_filter, select_noticed, FilterState, FoldError, FoldedModel, NoticeGuard,
    SourceModel,
};

/// A pileup kernel.
///
/// Receives the ARF-weighted flux on the response energy grid together
/// with the effective-area curve and the exposure, and returns the
/// piled spectrum on the same grid.
pub trait PileupTransform {
    fn name(&self) -> &str;

    fn apply(
        &self,
        p: &[f64],
        xlo: &Array1<f64>,
        xhi: &Array1<f64>,
        specresp: &Array1<f64>,
        exposure: f64,
        flux: &Array1<f64>,
    ) -> Result<Array1<f64>, FoldError>;
}

/// The source-side half of a pileup response: source model, effective
/// area, and pileup kernel composed into one source model.
pub struct PileupFold {
    name: String,
    view: ArfView,
    exposure: f64,
    transform: Box<dyn PileupTransform>,
    model: Box<dyn SourceModel>,
}

impl PileupFold {
    pub fn new(
        arf: Arc<DataArf>,
        exposure: f64,
        transform: Box<dyn PileupTransform>,
        model: Box<dyn SourceModel>,
    ) -> Self {
        let name = format!("{}(apply_arf({}))", transform.name(), model.name());
        Self {
            name,
            view: ArfView::all(arf),
            exposure,
            transform,
            model,
        }
    }
}

impl SourceModel for PileupFold {
    fn name(&self) -> &str {
        &self.name
    }

    fn calc(
        &self,
        p: &[f64],
        xlo: &Array1<f64>,
        xhi: &Array1<f64>,
    ) -> Result<Array1<f64>, FoldError> {
        let src = self.model.calc(p, xlo, xhi)?;
        let weighted = self.view.apply(&src, None)?;
        self.transform
            .apply(p, xlo, xhi, self.view.specresp(), self.exposure, &weighted)
    }

    fn startup(&mut self, cache: bool) -> Result<(), FoldError> {
        self.model.startup(cache)
    }

    fn teardown(&mut self) -> Result<(), FoldError> {
        self.model.teardown()
    }
}

/// Channel redistribution of a piled source spectrum.
///
/// Unlike the linear models this never narrows its calibration views:
/// the pileup kernel needs the full energy range, so the fold always
/// runs over the complete response and the noticed-channel selection
/// happens on the output alone.
pub struct PileupRmfModel {
    name: String,
    view: RmfView,
    pha: SharedPha,
    model: Box<dyn SourceModel>,
    state: FilterState,
    session_channels: Option<Array1<f64>>,
    session: bool,
}

impl PileupRmfModel {
    pub fn new(
        rmf: Arc<DataRmf>,
        pha: SharedPha,
        model: Box<dyn SourceModel>,
    ) -> Result<Self, FoldError> {
        let name = format!("apply_rmf({})", model.name());
        let view = RmfView::all(rmf);
        let state = {
            let guard = pha.lock().unwrap();
            recompute_filter(None, Some(&view), Some(&guard))?
        };
        Ok(Self {
            name,
            view,
            pha,
            model,
            state,
            session_channels: None,
            session: false,
        })
    }
}

impl FoldedModel for PileupRmfModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn startup(&mut self, cache: bool) -> Result<(), FoldError> {
        {
            let mut guard = self.pha.lock().unwrap();
            // Keep the response grid whole during the session
            guard.notice_response(false, None);
            self.state = recompute_filter(None, Some(&self.view), Some(&guard))?;
            self.session_channels = Some(guard.get_noticed_channels());
            debug!("{}: session started over full energy range", self.name);
        }
        self.session = true;
        self.model.startup(cache)
    }

    fn teardown(&mut self) -> Result<(), FoldError> {
        {
            let guard = self.pha.lock().unwrap();
            self.state = recompute_filter(None, Some(&self.view), Some(&guard))?;
        }
        self.session_channels = None;
        self.session = false;
        self.model.teardown()
    }

    fn calc(
        &self,
        p: &[f64],
        channels: &Array1<f64>,
        _channels_hi: Option<&Array1<f64>>,
    ) -> Result<Array1<f64>, FoldError> {
        // The pileup kernel needs the whole energy range regardless of
        // the requested channels
        let (xlo, xhi) = self.state.xgrid();
        let src = self.model.calc(p, xlo, xhi)?;
        let out = self.view.apply(&src, None)?;

        let on_expected_grid = if self.session {
            self.session_channels
                .as_ref()
                .is_some_and(|s| values_match(s, channels))
        } else {
            let guard = self.pha.lock().unwrap();
            values_match(guard.channel(), channels)
        };

        if on_expected_grid {
            if self.session {
                let guard = self.pha.lock().unwrap();
                return select_noticed(out, guard.get_mask(), &self.name, guard.name());
            }
            return Ok(out);
        }

        // Narrow the mask to the requested grid for this call only
        let saved = {
            let mut guard = self.pha.lock().unwrap();
            let saved = guard.get_mask().to_vec();
            guard.notice_response(true, Some(channels));
            saved
        };
        let _restore = NoticeGuard::new(self.pha.clone(), saved);
        let (mask, dataset) = {
            let guard = self.pha.lock().unwrap();
            (guard.get_mask().to_vec(), guard.name().to_string())
        };
        select_noticed(out, &mask, &self.name, &dataset)
    }
}
