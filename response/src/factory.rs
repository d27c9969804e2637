//! Folded-model assembly
//!
//! The fold module exposes the individual convolution models; this one
//! knows how to pick and wire them for a dataset. The factories read
//! the dataset's attached calibration, settle the exposure time, and
//! hand back a ready [`FoldedModel`]. Wrapping an already ARF-folded
//! model in an RMF stage fuses the pair into a single combined model
//! rather than nesting two passes.

use std::sync::Arc;

use log::info;

use crate::data::{DataArf, DataRmf, SharedPha};
use crate::fold::{
    ArfModel, FoldError, FoldedModel, MultiResponseSumModel, PileupFold, PileupRmfModel,
    PileupTransform, RmfModel, RspModel, ScaledModel, SourceModel,
};

/// Fold the exposure time into the source side when one is known.
fn wrap_exposure(exposure: Option<f64>, model: Box<dyn SourceModel>) -> Box<dyn SourceModel> {
    match exposure {
        Some(t) => Box::new(ScaledModel::new(t, model)),
        None => model,
    }
}

/// The dataset exposure wins over the ARF header value.
fn settle_exposure(pha_exposure: Option<f64>, arf: Option<&Arc<DataArf>>) -> Option<f64> {
    pha_exposure.or_else(|| arf.and_then(|a| a.exposure()))
}

/// An effective-area response ready to fold source models.
pub struct ArfResponse {
    arf: Arc<DataArf>,
    pha: Option<SharedPha>,
}

impl ArfResponse {
    pub fn new(arf: Arc<DataArf>, pha: Option<SharedPha>) -> Self {
        Self { arf, pha }
    }

    pub fn arf(&self) -> &Arc<DataArf> {
        &self.arf
    }

    /// Fold a model through the ARF, folding the dataset (or ARF)
    /// exposure into the source first.
    pub fn fold(&self, model: Box<dyn SourceModel>) -> Result<ArfModel, FoldError> {
        let pha_exposure = match &self.pha {
            Some(pha) => pha.lock().unwrap().exposure(),
            None => None,
        };
        let exposure = settle_exposure(pha_exposure, Some(&self.arf));
        let model = wrap_exposure(exposure, model);
        ArfModel::new(self.arf.clone(), self.pha.clone(), model)
    }
}

/// What an RMF response is asked to fold: either a bare source model or
/// an ARF stage that should be fused in.
pub enum FoldInput {
    Plain(Box<dyn SourceModel>),
    ArfWrapped(ArfModel),
}

/// A redistribution response ready to fold source models.
pub struct RmfResponse {
    rmf: Arc<DataRmf>,
    pha: Option<SharedPha>,
}

impl RmfResponse {
    pub fn new(rmf: Arc<DataRmf>, pha: Option<SharedPha>) -> Self {
        Self { rmf, pha }
    }

    pub fn rmf(&self) -> &Arc<DataRmf> {
        &self.rmf
    }

    /// Fold a model through the RMF.
    ///
    /// An ARF-wrapped input is dismantled and fused into one combined
    /// model so the reconciled grid is computed once. The inner model's
    /// dataset wins when both stages carry one. A plain input picks up
    /// the dataset exposure; an ARF-wrapped one already carries its
    /// exposure scale from the ARF stage, so it is never applied twice.
    pub fn fold(&self, input: FoldInput) -> Result<Box<dyn FoldedModel>, FoldError> {
        match input {
            FoldInput::Plain(model) => {
                let pha_exposure = match &self.pha {
                    Some(pha) => pha.lock().unwrap().exposure(),
                    None => None,
                };
                let model = wrap_exposure(pha_exposure, model);
                Ok(Box::new(RmfModel::new(
                    self.rmf.clone(),
                    self.pha.clone(),
                    model,
                )?))
            }
            FoldInput::ArfWrapped(arf_model) => {
                let (arf, inner_pha, model) = arf_model.into_parts();
                let pha = inner_pha.or_else(|| self.pha.clone());
                info!(
                    "fusing apply_arf({}) into a combined response",
                    model.name()
                );
                Ok(Box::new(RspModel::new(
                    arf,
                    self.rmf.clone(),
                    pha,
                    model,
                )?))
            }
        }
    }
}

/// Builds the standard folded model for a dataset's primary response.
pub struct ResponseFactory {
    pha: SharedPha,
}

impl ResponseFactory {
    pub fn new(pha: SharedPha) -> Self {
        Self { pha }
    }

    pub fn fold(&self, model: Box<dyn SourceModel>) -> Result<Box<dyn FoldedModel>, FoldError> {
        // Collect what we need, then release the lock before the model
        // constructors take it again
        let (pair, exposure, dataset) = {
            let guard = self.pha.lock().unwrap();
            let pair = guard.primary_response().cloned();
            (pair, guard.exposure(), guard.name().to_string())
        };

        let Some(pair) = pair else {
            return Err(FoldError::NoResponse { dataset });
        };

        let exposure = settle_exposure(exposure, pair.arf.as_ref());
        let model = wrap_exposure(exposure, model);

        match (pair.arf, pair.rmf) {
            (Some(arf), Some(rmf)) => Ok(Box::new(RspModel::new(
                arf,
                rmf,
                Some(self.pha.clone()),
                model,
            )?)),
            (Some(arf), None) => Ok(Box::new(ArfModel::new(
                arf,
                Some(self.pha.clone()),
                model,
            )?)),
            (None, Some(rmf)) => Ok(Box::new(RmfModel::new(
                rmf,
                Some(self.pha.clone()),
                model,
            )?)),
            (None, None) => Err(FoldError::NoResponse { dataset }),
        }
    }
}

/// Builds the summed folded model for a dataset with several attached
/// responses.
pub struct MultiResponseFactory {
    pha: SharedPha,
}

impl MultiResponseFactory {
    pub fn new(pha: SharedPha) -> Self {
        Self { pha }
    }

    pub fn fold(&self, model: Box<dyn SourceModel>) -> Result<Box<dyn FoldedModel>, FoldError> {
        let exposure = {
            let guard = self.pha.lock().unwrap();
            let first_arf = guard.primary_response().and_then(|p| p.arf.clone());
            settle_exposure(guard.exposure(), first_arf.as_ref())
        };

        // Summing commutes with the exposure scale, so it lives on the
        // source side
        let model = wrap_exposure(exposure, model);
        Ok(Box::new(MultiResponseSumModel::new(
            self.pha.clone(),
            model,
        )?))
    }
}

/// Builds the pileup response chain for a dataset.
///
/// Pileup needs the full calibration: an ARF for the rate entering the
/// detector, an RMF for the channel redistribution, and a known
/// exposure for the per-frame rate. Each missing piece is its own
/// error.
pub struct PileupResponseFactory {
    pha: SharedPha,
}

impl PileupResponseFactory {
    pub fn new(pha: SharedPha) -> Self {
        Self { pha }
    }

    pub fn fold(
        &self,
        kernel: Box<dyn PileupTransform>,
        model: Box<dyn SourceModel>,
    ) -> Result<Box<dyn FoldedModel>, FoldError> {
        let (pair, exposure, dataset) = {
            let guard = self.pha.lock().unwrap();
            let pair = guard.primary_response().cloned();
            (pair, guard.exposure(), guard.name().to_string())
        };

        let Some(pair) = pair else {
            return Err(FoldError::NoResponse { dataset });
        };
        let Some(arf) = pair.arf else {
            return Err(FoldError::PileupNeedsArf { dataset });
        };
        let Some(rmf) = pair.rmf else {
            return Err(FoldError::PileupNeedsRmf { dataset });
        };
        let Some(exposure) = settle_exposure(exposure, Some(&arf)) else {
            return Err(FoldError::PileupNeedsExposure { dataset });
        };

        let fold = PileupFold::new(arf, exposure, kernel, model);
        Ok(Box::new(PileupRmfModel::new(
            rmf,
            self.pha.clone(),
            Box::new(fold),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    use energy_grid::EnergyGrid;

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

    #[test]
    fn test_fusion_produces_combined_name() {
        let arf = Arc::new(create_arf("a", grid4(), None, None, None).unwrap());
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());

        let arf_resp = ArfResponse::new(arf, None);
        let rmf_resp = RmfResponse::new(rmf, None);

        let wrapped = arf_resp.fold(Box::new(Flat(1.0))).unwrap();
        let fused = rmf_resp.fold(FoldInput::ArfWrapped(wrapped)).unwrap();
        assert_eq!(fused.name(), "apply_rmf(apply_arf(flat))");

        let plain = rmf_resp.fold(FoldInput::Plain(Box::new(Flat(1.0)))).unwrap();
        assert_eq!(plain.name(), "apply_rmf(flat)");
    }

    #[test]
    fn test_wrappers_fold_exposure_once() {
        let arf = Arc::new(create_arf("a", grid4(), None, Some(10.0), None).unwrap());
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());

        let arf_resp = ArfResponse::new(arf, None);
        let rmf_resp = RmfResponse::new(rmf.clone(), None);

        // The ARF wrapper picks up the ARF header exposure
        let wrapped = arf_resp.fold(Box::new(Flat(1.0))).unwrap();
        let out = wrapped.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![10.0, 10.0, 10.0, 10.0]);

        // Fusing through the RMF keeps the scale applied exactly once
        let wrapped = arf_resp.fold(Box::new(Flat(1.0))).unwrap();
        let fused = rmf_resp.fold(FoldInput::ArfWrapped(wrapped)).unwrap();
        let out = fused.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![10.0, 10.0, 10.0, 10.0]);

        // A plain RMF fold picks up the dataset exposure
        let mut pha = DataPha::new("obs", channel_grid(4), Array1::zeros(4)).unwrap();
        pha.set_exposure(5.0);
        let rmf_resp = RmfResponse::new(rmf, Some(pha.shared()));
        let plain = rmf_resp.fold(FoldInput::Plain(Box::new(Flat(1.0)))).unwrap();
        let out = plain.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![5.0, 5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_factory_prefers_dataset_exposure() {
        let arf = Arc::new(create_arf("a", grid4(), None, Some(10.0), None).unwrap());
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());

        let mut pha = DataPha::new("obs", channel_grid(4), Array1::zeros(4)).unwrap();
        pha.set_exposure(100.0);
        pha.add_response(1, Some(arf), Some(rmf)).unwrap();
        let pha = pha.shared();

        let folded = ResponseFactory::new(pha).fold(Box::new(Flat(1.0))).unwrap();
        let out = folded.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![100.0, 100.0, 100.0, 100.0]);
    }

    #[test]
    fn test_factory_falls_back_to_arf_exposure() {
        let arf = Arc::new(create_arf("a", grid4(), None, Some(10.0), None).unwrap());
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());

        let mut pha = DataPha::new("obs", channel_grid(4), Array1::zeros(4)).unwrap();
        pha.add_response(1, Some(arf), Some(rmf)).unwrap();
        let pha = pha.shared();

        let folded = ResponseFactory::new(pha).fold(Box::new(Flat(1.0))).unwrap();
        let out = folded.calc(&[], &channel_grid(4), None).unwrap();
        assert_eq!(out, array![10.0, 10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_pileup_factory_demands_full_calibration() {
        let rmf = Arc::new(create_delta_rmf("r", grid4(), 1, None, None).unwrap());

        struct Identity;
        impl PileupTransform for Identity {
            fn name(&self) -> &str {
                "pileup"
            }
            fn apply(
                &self,
                _p: &[f64],
                _xlo: &Array1<f64>,
                _xhi: &Array1<f64>,
                _specresp: &Array1<f64>,
                _exposure: f64,
                flux: &Array1<f64>,
            ) -> Result<Array1<f64>, FoldError> {
                Ok(flux.clone())
            }
        }

        let mut pha = DataPha::new("obs", channel_grid(4), Array1::zeros(4)).unwrap();
        pha.add_response(1, None, Some(rmf.clone())).unwrap();
        let factory = PileupResponseFactory::new(pha.shared());
        assert!(matches!(
            factory.fold(Box::new(Identity), Box::new(Flat(1.0))),
            Err(FoldError::PileupNeedsArf { .. })
        ));

        let arf = Arc::new(create_arf("a", grid4(), None, None, None).unwrap());
        let mut pha = DataPha::new("obs", channel_grid(4), Array1::zeros(4)).unwrap();
        pha.add_response(1, Some(arf.clone()), None).unwrap();
        let factory = PileupResponseFactory::new(pha.shared());
        assert!(matches!(
            factory.fold(Box::new(Identity), Box::new(Flat(1.0))),
            Err(FoldError::PileupNeedsRmf { .. })
        ));

        // No exposure anywhere
        let mut pha = DataPha::new("obs", channel_grid(4), Array1::zeros(4)).unwrap();
        pha.add_response(1, Some(arf), Some(rmf)).unwrap();
        let factory = PileupResponseFactory::new(pha.shared());
        assert!(matches!(
            factory.fold(Box::new(Identity), Box::new(Flat(1.0))),
            Err(FoldError::PileupNeedsExposure { .. })
        ));
    }

    #[test]
    fn test_factory_without_response_fails() {
        let pha = DataPha::new("bare", channel_grid(4), Array1::zeros(4))
            .unwrap()
            .shared();
        assert!(matches!(
            ResponseFactory::new(pha).fold(Box::new(Flat(1.0))),
            Err(FoldError::NoResponse { .. })
        ));
    }
}
