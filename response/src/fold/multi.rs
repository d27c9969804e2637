//! Summed convolution over several simultaneous responses
//!
//! Gratings observations attach one response per spectral order to a
//! single dataset. The predicted counts are the sum of the source model
//! folded through every order. Evaluating the source once per order is
//! wasteful when the order grids overlap, so a fitting session compiles
//! the grids into one union grid, evaluates the source there, and
//! distributes the result to each order by interval summation.

use ndarray::Array1;

use log::debug;

use energy_grid::{compile_energy_grid, sum_intervals, values_match, CompiledGrid, EnergyGrid};

use crate::data::{AnalysisUnit, ArfView, DataPha, RmfView, SharedPha};

use super::single::{session_arf_view, session_rmf_view};
use super::{
    recompute_filter, select_noticed, FilterState, FoldError, FoldedModel, NoticeGuard,
    SourceModel,
};

/// One spectral order's calibration views and cached grid state.
struct Order {
    arf_view: Option<ArfView>,
    rmf_view: Option<RmfView>,
    state: FilterState,
}

impl Order {
    /// Fold an eval-grid flux through this order's response chain.
    fn fold(&self, flux: &Array1<f64>, dataset: &str) -> Result<Array1<f64>, FoldError> {
        match (&self.arf_view, &self.rmf_view) {
            (Some(arf), Some(rmf)) => {
                let weighted = arf.apply(flux, self.state.arf_rebin.as_ref())?;
                Ok(rmf.apply(&weighted, self.state.rmf_rebin.as_ref())?)
            }
            (Some(arf), None) => Ok(arf.apply(flux, self.state.arf_rebin.as_ref())?),
            (None, Some(rmf)) => Ok(rmf.apply(flux, self.state.rmf_rebin.as_ref())?),
            (None, None) => Err(FoldError::NoResponse {
                dataset: dataset.to_string(),
            }),
        }
    }
}

/// Build the per-order views and grid states from the dataset's current
/// notice state. Canonical views when `noticed` is false.
fn build_orders(pha: &DataPha, noticed: bool) -> Result<Vec<Order>, FoldError> {
    let mask = pha.get_mask();
    let mut orders = Vec::new();

    for id in pha.response_ids() {
        let Some(pair) = pha.get_response(id) else {
            continue;
        };

        let rmf_view = match &pair.rmf {
            Some(rmf) if noticed => Some(session_rmf_view(rmf, mask)?),
            Some(rmf) => Some(RmfView::all(rmf.clone())),
            None => None,
        };

        let arf_view = match &pair.arf {
            Some(arf) if noticed => match &rmf_view {
                Some(rv) if arf.grid().len() == rv.grid().len() => {
                    Some(session_arf_view(arf, rv.bin_mask())?)
                }
                Some(_) => Some(ArfView::all(arf.clone())),
                None => Some(session_arf_view(arf, Some(mask))?),
            },
            Some(arf) => Some(ArfView::all(arf.clone())),
            None => None,
        };

        let state = recompute_filter(arf_view.as_ref(), rmf_view.as_ref(), Some(pha))?;
        orders.push(Order {
            arf_view,
            rmf_view,
            state,
        });
    }

    if orders.is_empty() {
        return Err(FoldError::NoResponse {
            dataset: pha.name().to_string(),
        });
    }
    Ok(orders)
}

/// Sum two folded-order outputs, insisting the orders agree on the
/// channel count.
fn accumulate(
    total: Option<Array1<f64>>,
    next: Array1<f64>,
) -> Result<Option<Array1<f64>>, FoldError> {
    match total {
        None => Ok(Some(next)),
        Some(t) if t.len() == next.len() => Ok(Some(t + next)),
        Some(t) => Err(FoldError::OrderLengthMismatch {
            first: t.len(),
            other: next.len(),
        }),
    }
}

/// A source model folded through every response attached to one dataset
/// and summed over the orders.
pub struct MultiResponseSumModel {
    name: String,
    pha: SharedPha,
    model: Box<dyn SourceModel>,
    orders: Vec<Order>,
    compiled: Option<CompiledGrid>,
    session_channels: Option<Array1<f64>>,
    session: bool,
}

impl MultiResponseSumModel {
    pub fn new(pha: SharedPha, model: Box<dyn SourceModel>) -> Result<Self, FoldError> {
        let orders = {
            let guard = pha.lock().unwrap();
            build_orders(&guard, false)?
        };
        let name = format!("apply_multi_response({})", model.name());
        Ok(Self {
            name,
            pha,
            model,
            orders,
            compiled: None,
            session_channels: None,
            session: false,
        })
    }

    /// Evaluate the source on each order's own grid, fold, and sum.
    fn sum_orders(&self, p: &[f64], orders: &[Order], dataset: &str) -> Result<Array1<f64>, FoldError> {
        let mut total = None;
        for order in orders {
            let (xlo, xhi) = order.state.xgrid();
            let src = self.model.calc(p, xlo, xhi)?;
            let folded = order.fold(&src, dataset)?;
            total = accumulate(total, folded)?;
        }
        total.ok_or_else(|| FoldError::NoResponse {
            dataset: dataset.to_string(),
        })
    }

    /// Evaluate the source once on the compiled union grid and
    /// distribute the flux to each order.
    fn sum_compiled(
        &self,
        p: &[f64],
        compiled: &CompiledGrid,
        dataset: &str,
    ) -> Result<Array1<f64>, FoldError> {
        let units = self
            .orders
            .first()
            .map_or(AnalysisUnit::Energy, |o| o.state.units);
        let src = match units {
            AnalysisUnit::Energy => {
                self.model
                    .calc(p, compiled.grid.lo(), compiled.grid.hi())?
            }
            AnalysisUnit::Wavelength => {
                let (lo, hi) = compiled.grid.to_wavelength();
                self.model.calc(p, &lo, &hi)?
            }
        };

        let mut total = None;
        for (order, table) in self.orders.iter().zip(&compiled.table) {
            let flux = sum_intervals(&src, table)?;
            let folded = order.fold(&flux, dataset)?;
            total = accumulate(total, folded)?;
        }
        total.ok_or_else(|| FoldError::NoResponse {
            dataset: dataset.to_string(),
        })
    }

    /// Evaluate on a grid other than the session channels.
    ///
    /// The dataset's notice mask is narrowed to the requested grid for
    /// the duration of the call and restored on every exit path.
    fn calc_adhoc(&self, p: &[f64], channels: &Array1<f64>) -> Result<Array1<f64>, FoldError> {
        let saved = {
            let mut guard = self.pha.lock().unwrap();
            let saved = guard.get_mask().to_vec();
            guard.notice_response(true, Some(channels));
            saved
        };
        let _restore = NoticeGuard::new(self.pha.clone(), saved);

        let (orders, mask, dataset) = {
            let guard = self.pha.lock().unwrap();
            (
                build_orders(&guard, true)?,
                guard.get_mask().to_vec(),
                guard.name().to_string(),
            )
        };

        let total = self.sum_orders(p, &orders, &dataset)?;
        select_noticed(total, &mask, &self.name, &dataset)
    }
}

impl FoldedModel for MultiResponseSumModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn startup(&mut self, cache: bool) -> Result<(), FoldError> {
        {
            let mut guard = self.pha.lock().unwrap();
            // Every attached order takes part, not just the primary one
            guard.notice_response(true, None);
            self.orders = build_orders(&guard, true)?;

            let grids = self
                .orders
                .iter()
                .map(|o| EnergyGrid::new(o.state.elo.clone(), o.state.ehi.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            let refs: Vec<&EnergyGrid> = grids.iter().collect();
            let compiled = compile_energy_grid(&refs)?;
            debug!(
                "{}: session over {} orders, union grid of {} bins",
                self.name,
                self.orders.len(),
                compiled.grid.len()
            );
            self.compiled = Some(compiled);
            self.session_channels = Some(guard.get_noticed_channels());
        }
        self.session = true;
        self.model.startup(cache)
    }

    fn teardown(&mut self) -> Result<(), FoldError> {
        {
            let guard = self.pha.lock().unwrap();
            self.orders = build_orders(&guard, false)?;
        }
        self.compiled = None;
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
        if !self.session {
            let (on_channel_grid, dataset) = {
                let guard = self.pha.lock().unwrap();
                (
                    values_match(guard.channel(), channels),
                    guard.name().to_string(),
                )
            };
            if on_channel_grid {
                return self.sum_orders(p, &self.orders, &dataset);
            }
            return self.calc_adhoc(p, channels);
        }

        let on_session_grid = self
            .session_channels
            .as_ref()
            .is_some_and(|s| values_match(s, channels));

        if on_session_grid {
            if let Some(compiled) = &self.compiled {
                let (mask, dataset) = {
                    let guard = self.pha.lock().unwrap();
                    (guard.get_mask().to_vec(), guard.name().to_string())
                };
                let total = self.sum_compiled(p, compiled, &dataset)?;
                return select_noticed(total, &mask, &self.name, &dataset);
            }
        }

        self.calc_adhoc(p, channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use ndarray::array;

    use crate::data::{create_arf, create_delta_rmf, DataPha};
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

    fn two_order_pha() -> SharedPha {
        let mut pha = DataPha::new("multi", channel_grid(4), Array1::zeros(4)).unwrap();
        let arf1 = Arc::new(
            create_arf("a1", grid4(), Some(array![1.0, 1.0, 1.0, 1.0]), None, None).unwrap(),
        );
        let arf2 = Arc::new(
            create_arf("a2", grid4(), Some(array![2.0, 2.0, 2.0, 2.0]), None, None).unwrap(),
        );
        let rmf1 = Arc::new(create_delta_rmf("r1", grid4(), 1, None, None).unwrap());
        let rmf2 = Arc::new(create_delta_rmf("r2", grid4(), 1, None, None).unwrap());
        pha.add_response(1, Some(arf1), Some(rmf1)).unwrap();
        pha.add_response(2, Some(arf2), Some(rmf2)).unwrap();
        pha.shared()
    }

    #[test]
    fn test_orders_are_summed() {
        let pha = two_order_pha();
        let m = MultiResponseSumModel::new(pha, Box::new(Flat(1.0))).unwrap();
        let out = m.calc(&[], &channel_grid(4), None).unwrap();
        // order 1 contributes 1.0 per channel, order 2 contributes 2.0
        assert_eq!(out, array![3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_fast_path_matches_slow_path() {
        let pha = two_order_pha();
        let mut m = MultiResponseSumModel::new(pha, Box::new(Flat(1.5))).unwrap();

        let slow = m.calc(&[], &channel_grid(4), None).unwrap();

        m.startup(false).unwrap();
        let fast = m.calc(&[], &channel_grid(4), None).unwrap();
        m.teardown().unwrap();

        assert_eq!(slow.len(), fast.len());
        for (s, f) in slow.iter().zip(fast.iter()) {
            assert_relative_eq!(s, f);
        }
    }

    #[test]
    fn test_adhoc_grid_restores_mask() {
        let pha = two_order_pha();
        let mut m = MultiResponseSumModel::new(pha.clone(), Box::new(Flat(1.0))).unwrap();
        m.startup(false).unwrap();

        let before = pha.lock().unwrap().get_mask().to_vec();
        let out = m.calc(&[], &array![2.0, 3.0], None).unwrap();
        let after = pha.lock().unwrap().get_mask().to_vec();

        assert_eq!(out.len(), 2);
        assert_eq!(before, after);
        m.teardown().unwrap();
    }

    #[test]
    fn test_adhoc_grid_outside_session() {
        let pha = two_order_pha();
        let m = MultiResponseSumModel::new(pha.clone(), Box::new(Flat(1.0))).unwrap();

        let before = pha.lock().unwrap().get_mask().to_vec();
        // A one-off evaluation on an arbitrary grid narrows to those
        // channels even without a surrounding session
        let out = m.calc(&[], &array![2.0, 3.0], None).unwrap();
        let after = pha.lock().unwrap().get_mask().to_vec();

        assert_eq!(out, array![3.0, 3.0]);
        assert_eq!(before, after);
    }

    #[test]
    fn test_no_response_rejected() {
        let pha = DataPha::new("bare", channel_grid(4), Array1::zeros(4))
            .unwrap()
            .shared();
        assert!(matches!(
            MultiResponseSumModel::new(pha, Box::new(Flat(1.0))),
            Err(FoldError::NoResponse { .. })
        ));
    }
}
