//! ARF-only, RMF-only, and combined (RSP) convolution models

use std::sync::Arc;

use log::debug;
use ndarray::Array1;

use crate::data::{ArfView, DataArf, DataRmf, RmfView, SharedPha};

use super::{
    apply_areascal, recompute_filter, select_noticed, FilterState, FoldError, FoldedModel,
    SourceModel,
};

/// Build the session RMF view for the dataset's noticed channels.
pub(crate) fn session_rmf_view(rmf: &Arc<DataRmf>, mask: &[bool]) -> Result<RmfView, FoldError> {
    if mask.len() == rmf.detchans() && mask.iter().any(|&m| !m) {
        Ok(RmfView::noticed(rmf.clone(), mask)?)
    } else {
        Ok(RmfView::all(rmf.clone()))
    }
}

/// Build the session ARF view for an energy-bin mask.
pub(crate) fn session_arf_view(arf: &Arc<DataArf>, mask: Option<&[bool]>) -> Result<ArfView, FoldError> {
    match mask {
        Some(m) if m.len() == arf.grid().len() => Ok(ArfView::noticed(arf.clone(), m)?),
        _ => Ok(ArfView::all(arf.clone())),
    }
}

/// Effective-area convolution of a source model.
///
/// Used alone for gratings-style data where the channel grid is the
/// energy grid itself. When a dataset is attached, its AREASCAL and
/// notice state take part.
pub struct ArfModel {
    name: String,
    arf: Arc<DataArf>,
    view: ArfView,
    pha: Option<SharedPha>,
    model: Box<dyn SourceModel>,
    state: FilterState,
    session: bool,
}

impl ArfModel {
    pub fn new(
        arf: Arc<DataArf>,
        pha: Option<SharedPha>,
        model: Box<dyn SourceModel>,
    ) -> Result<Self, FoldError> {
        let name = format!("apply_arf({})", model.name());
        let view = ArfView::all(arf.clone());
        let state = match &pha {
            Some(pha) => {
                let pha = pha.lock().unwrap();
                recompute_filter(Some(&view), None, Some(&pha))?
            }
            None => recompute_filter(Some(&view), None, None)?,
        };
        Ok(Self {
            name,
            arf,
            view,
            pha,
            model,
            state,
            session: false,
        })
    }

    /// Tear the wrapper apart for fusion into a combined RSP model.
    pub fn into_parts(self) -> (Arc<DataArf>, Option<SharedPha>, Box<dyn SourceModel>) {
        (self.arf, self.pha, self.model)
    }
}

impl FoldedModel for ArfModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn startup(&mut self, cache: bool) -> Result<(), FoldError> {
        if let Some(pha) = &self.pha {
            let guard = pha.lock().unwrap();
            let mask = guard.get_mask();
            // The ARF is only masked when its bins line up with the
            // dataset channels
            self.view = if mask.iter().any(|&m| !m) {
                session_arf_view(&self.arf, Some(mask))?
            } else {
                ArfView::all(self.arf.clone())
            };
            self.state = recompute_filter(Some(&self.view), None, Some(&guard))?;
            self.session = true;
            debug!("{}: session started", self.name);
        }
        self.model.startup(cache)
    }

    fn teardown(&mut self) -> Result<(), FoldError> {
        self.view = ArfView::all(self.arf.clone());
        self.state = match &self.pha {
            Some(pha) => {
                let pha = pha.lock().unwrap();
                recompute_filter(Some(&self.view), None, Some(&pha))?
            }
            None => recompute_filter(Some(&self.view), None, None)?,
        };
        self.session = false;
        self.model.teardown()
    }

    fn calc(
        &self,
        p: &[f64],
        _channels: &Array1<f64>,
        _channels_hi: Option<&Array1<f64>>,
    ) -> Result<Array1<f64>, FoldError> {
        let (xlo, xhi) = self.state.xgrid();
        let src = self.model.calc(p, xlo, xhi)?;
        let out = self.view.apply(&src, self.state.arf_rebin.as_ref())?;

        match &self.pha {
            None => Ok(out),
            Some(pha) => {
                let pha = pha.lock().unwrap();
                let out = apply_areascal(out, &pha, &self.name)?;
                if self.session {
                    select_noticed(out, pha.get_mask(), &self.name, pha.name())
                } else {
                    Ok(out)
                }
            }
        }
    }
}

/// Energy redistribution of a source model without an effective-area
/// stage.
///
/// The source model is always evaluated directly in energy space here;
/// the redistribution produces a channel-binned vector of length
/// `detchans`.
pub struct RmfModel {
    name: String,
    rmf: Arc<DataRmf>,
    view: RmfView,
    pha: Option<SharedPha>,
    model: Box<dyn SourceModel>,
    state: FilterState,
    session: bool,
}

impl RmfModel {
    pub fn new(
        rmf: Arc<DataRmf>,
        pha: Option<SharedPha>,
        model: Box<dyn SourceModel>,
    ) -> Result<Self, FoldError> {
        let name = format!("apply_rmf({})", model.name());
        let view = RmfView::all(rmf.clone());
        let state = match &pha {
            Some(pha) => {
                let pha = pha.lock().unwrap();
                recompute_filter(None, Some(&view), Some(&pha))?
            }
            None => recompute_filter(None, Some(&view), None)?,
        };
        Ok(Self {
            name,
            rmf,
            view,
            pha,
            model,
            state,
            session: false,
        })
    }
}

impl FoldedModel for RmfModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn startup(&mut self, cache: bool) -> Result<(), FoldError> {
        if let Some(pha) = &self.pha {
            let guard = pha.lock().unwrap();
            self.view = session_rmf_view(&self.rmf, guard.get_mask())?;
            self.state = recompute_filter(None, Some(&self.view), Some(&guard))?;
            self.session = true;
            debug!("{}: session started", self.name);
        }
        self.model.startup(cache)
    }

    fn teardown(&mut self) -> Result<(), FoldError> {
        self.view = RmfView::all(self.rmf.clone());
        self.state = match &self.pha {
            Some(pha) => {
                let pha = pha.lock().unwrap();
                recompute_filter(None, Some(&self.view), Some(&pha))?
            }
            None => recompute_filter(None, Some(&self.view), None)?,
        };
        self.session = false;
        self.model.teardown()
    }

    fn calc(
        &self,
        p: &[f64],
        _channels: &Array1<f64>,
        _channels_hi: Option<&Array1<f64>>,
    ) -> Result<Array1<f64>, FoldError> {
        let src = self.model.calc(p, &self.state.elo, &self.state.ehi)?;
        let out = self.view.apply(&src, self.state.rmf_rebin.as_ref())?;

        match &self.pha {
            None => Ok(out),
            Some(pha) => {
                let pha = pha.lock().unwrap();
                let out = apply_areascal(out, &pha, &self.name)?;
                if self.session {
                    select_noticed(out, pha.get_mask(), &self.name, pha.name())
                } else {
                    Ok(out)
                }
            }
        }
    }
}

/// The fused effective-area plus redistribution model.
///
/// Replaces the nested `RMF(ARF(model))` form so the reconciled grid is
/// computed once and the source model is evaluated once. The ARF's grid
/// governs when the two calibration grids differ in length; the
/// difference is reconciled by a recorded rebin entering the RMF stage.
pub struct RspModel {
    name: String,
    arf: Arc<DataArf>,
    rmf: Arc<DataRmf>,
    arf_view: ArfView,
    rmf_view: RmfView,
    pha: Option<SharedPha>,
    model: Box<dyn SourceModel>,
    state: FilterState,
    session: bool,
}

impl RspModel {
    pub fn new(
        arf: Arc<DataArf>,
        rmf: Arc<DataRmf>,
        pha: Option<SharedPha>,
        model: Box<dyn SourceModel>,
    ) -> Result<Self, FoldError> {
        let name = format!("apply_rmf(apply_arf({}))", model.name());
        let arf_view = ArfView::all(arf.clone());
        let rmf_view = RmfView::all(rmf.clone());
        let state = match &pha {
            Some(pha) => {
                let pha = pha.lock().unwrap();
                recompute_filter(Some(&arf_view), Some(&rmf_view), Some(&pha))?
            }
            None => recompute_filter(Some(&arf_view), Some(&rmf_view), None)?,
        };
        Ok(Self {
            name,
            arf,
            rmf,
            arf_view,
            rmf_view,
            pha,
            model,
            state,
            session: false,
        })
    }
}

impl FoldedModel for RspModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn startup(&mut self, cache: bool) -> Result<(), FoldError> {
        if let Some(pha) = &self.pha {
            let guard = pha.lock().unwrap();
            self.rmf_view = session_rmf_view(&self.rmf, guard.get_mask())?;
            // The ARF shares the RMF's energy filter when the grids
            // line up; otherwise the recorded rebin reconciles them
            self.arf_view = if self.arf.grid().len() == self.rmf.grid().len() {
                session_arf_view(&self.arf, self.rmf_view.bin_mask())?
            } else {
                ArfView::all(self.arf.clone())
            };
            self.state =
                recompute_filter(Some(&self.arf_view), Some(&self.rmf_view), Some(&guard))?;
            self.session = true;
            debug!("{}: session started", self.name);
        }
        self.model.startup(cache)
    }

    fn teardown(&mut self) -> Result<(), FoldError> {
        self.arf_view = ArfView::all(self.arf.clone());
        self.rmf_view = RmfView::all(self.rmf.clone());
        self.state = match &self.pha {
            Some(pha) => {
                let pha = pha.lock().unwrap();
                recompute_filter(Some(&self.arf_view), Some(&self.rmf_view), Some(&pha))?
            }
            None => recompute_filter(Some(&self.arf_view), Some(&self.rmf_view), None)?,
        };
        self.session = false;
        self.model.teardown()
    }

    fn calc(
        &self,
        p: &[f64],
        _channels: &Array1<f64>,
        _channels_hi: Option<&Array1<f64>>,
    ) -> Result<Array1<f64>, FoldError> {
        let (xlo, xhi) = self.state.xgrid();
        let src = self.model.calc(p, xlo, xhi)?;
        let src = self.arf_view.apply(&src, self.state.arf_rebin.as_ref())?;
        let out = self.rmf_view.apply(&src, self.state.rmf_rebin.as_ref())?;

        match &self.pha {
            None => Ok(out),
            Some(pha) => {
                let pha = pha.lock().unwrap();
                let out = apply_areascal(out, &pha, &self.name)?;
                if self.session {
                    select_noticed(out, pha.get_mask(), &self.name, pha.name())
                } else {
                    Ok(out)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    use energy_grid::EnergyGrid;

    use crate::data::{create_arf, create_delta_rmf, AreaScal, DataPha};
    use crate::fold::channel_grid;

    struct Flat(f64);

    impl SourceModel for Flat {
        fn name(&self) -> &str {
            "flat"
        }
        fn calc(
            &self,
            _p: &[f64],
            xlo: &Array1<f64>,
            _xhi: &Array1<f64>,
        ) -> Result<Array1<f64>, FoldError> {
            Ok(Array1::from_elem(xlo.len(), self.0))
        }
    }

    fn grid4() -> EnergyGrid {
        EnergyGrid::from_slices(&[1.0, 2.0, 3.0, 4.0], &[2.0, 3.0, 4.0, 5.0]).unwrap()
    }

    #[test]
    fn test_rsp_equals_arf_then_rmf() {
        let arf = Arc::new(
            create_arf("a", grid4(), Some(array![2.0, 4.0, 6.0, 8.0]), None, None).unwrap(),
        );
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());

        let rsp = RspModel::new(arf.clone(), rmf.clone(), None, Box::new(Flat(3.0))).unwrap();
        let fused = rsp.calc(&[], &channel_grid(4), None).unwrap();

        // Two separate passes over the same calibration
        let by_hand = RmfView::all(rmf)
            .apply(
                &ArfView::all(arf)
                    .apply(&Array1::from_elem(4, 3.0), None)
                    .unwrap(),
                None,
            )
            .unwrap();

        for (f, h) in fused.iter().zip(by_hand.iter()) {
            assert_relative_eq!(f, h);
        }
    }

    #[test]
    fn test_areascal_scalar_and_array() {
        let arf = Arc::new(create_arf("a", grid4(), None, None, None).unwrap());
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());

        let mut pha =
            DataPha::new("obs", channel_grid(4), Array1::zeros(4)).unwrap();
        pha.set_areascal(AreaScal::Scalar(0.5));
        let pha = pha.shared();

        let rsp = RspModel::new(arf.clone(), rmf.clone(), Some(pha.clone()), Box::new(Flat(2.0)))
            .unwrap();
        let out = rsp.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![1.0, 1.0, 1.0, 1.0]);

        pha.lock()
            .unwrap()
            .set_areascal(AreaScal::PerChannel(array![1.0, 0.5, 0.25, 1.0]));
        let out = rsp.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![2.0, 1.0, 0.5, 2.0]);

        pha.lock()
            .unwrap()
            .set_areascal(AreaScal::PerChannel(array![1.0, 0.5]));
        assert!(matches!(
            rsp.calc(&[], &channel_grid(4), None),
            Err(FoldError::AreascalMismatch {
                expected: 4,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_session_filters_output() {
        let arf = Arc::new(create_arf("a", grid4(), None, None, None).unwrap());
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());
        let pha = DataPha::new("obs", channel_grid(4), Array1::zeros(4))
            .unwrap()
            .shared();
        pha.lock().unwrap().notice_range(2.0, 3.0);

        let mut rsp =
            RspModel::new(arf, rmf, Some(pha.clone()), Box::new(Flat(1.0))).unwrap();

        // Outside a session the full channel space comes back
        let out = rsp.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out.len(), 4);

        rsp.startup(false).unwrap();
        let out = rsp.calc(&[], &array![2.0, 3.0], None).unwrap();
        assert_eq!(out, array![1.0, 1.0]);

        rsp.teardown().unwrap();
        let out = rsp.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_rmf_model_channel_space() {
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());
        let m = RmfModel::new(rmf, None, Box::new(Flat(5.0))).unwrap();
        let out = m.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![5.0, 5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_arf_model_weights_flux() {
        let arf = Arc::new(
            create_arf("a", grid4(), Some(array![1.0, 2.0, 3.0, 4.0]), None, None).unwrap(),
        );
        let m = ArfModel::new(arf, None, Box::new(Flat(2.0))).unwrap();
        let out = m.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![2.0, 4.0, 6.0, 8.0]);
    }
}
