//! X-ray instrument response convolution models
//!
//! An X-ray detector does not observe a source spectrum directly: the
//! spectrum is weighted by the telescope's effective area (the ARF),
//! smeared across detector channels by the energy redistribution matrix
//! (the RMF), and finally scaled by per-channel corrections (AREASCAL).
//! This crate models that forward transformation as composable "folded
//! model" objects: a physical source model goes in, a callable that
//! predicts per-channel counts comes out, ready for a fitting engine to
//! evaluate repeatedly.
//!
//! Calibration products follow the OGIP conventions: the RMF is stored
//! in the condensed row-grouped sparse format, and channel numbering
//! may start at 0 or 1. File parsing is out of scope; the types here
//! are the in-memory representations a loader would produce.

pub mod data;
pub mod expr;
pub mod factory;
pub mod fold;

pub use data::{
    create_arf, create_delta_rmf, create_matrix_rmf, AnalysisUnit, AreaScal, ArfView,
    CalibrationError, DataArf, DataPha, DataRmf, PhaError, ResponsePair, RmfView, SharedPha,
};
pub use expr::{has_response, ModelExpr};
pub use factory::{
    ArfResponse, FoldInput, MultiResponseFactory, PileupResponseFactory, ResponseFactory,
    RmfResponse,
};
pub use fold::{
    channel_grid, ArfModel, FilterState, FoldError, FoldedModel, MultiResponseSumModel,
    PileupFold, PileupRmfModel, PileupTransform, RmfModel, RspModel, ScaledModel, SourceModel,
};
