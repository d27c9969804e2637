//! Count datasets: channels, counts, notice state, attached responses

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::debug;
use ndarray::Array1;
use thiserror::Error;

use super::{DataArf, DataRmf};

/// Errors raised by count-dataset bookkeeping
#[derive(Debug, Error)]
pub enum PhaError {
    #[error("{name}: counts length {actual} does not match {expected} channels")]
    CountsLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: mask length {actual} does not match {expected} channels")]
    MaskLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: bin edge arrays must have the same length, got {lo} and {hi}")]
    BinEdgeLength { name: String, lo: usize, hi: usize },

    #[error("{name}: response {id} carries neither an ARF nor an RMF")]
    EmptyResponse { name: String, id: usize },
}

/// The coordinate the analysis (and the source model) works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisUnit {
    #[default]
    Energy,
    Wavelength,
}

/// AREASCAL correction: a single scalar or one value per channel.
#[derive(Debug, Clone)]
pub enum AreaScal {
    Scalar(f64),
    PerChannel(Array1<f64>),
}

/// One attached response: an ARF, an RMF, or both.
#[derive(Debug, Clone, Default)]
pub struct ResponsePair {
    pub arf: Option<Arc<DataArf>>,
    pub rmf: Option<Arc<DataRmf>>,
}

/// A count dataset shared between response models.
///
/// The mask is the only state that changes during fitting; it is
/// mutated by notice/ignore calls and by scoped ad hoc evaluations,
/// which restore it on every exit path.
pub type SharedPha = Arc<Mutex<DataPha>>;

/// A channel-binned count spectrum with its notice state and attached
/// instrument responses.
#[derive(Debug)]
pub struct DataPha {
    name: String,
    channel: Array1<f64>,
    counts: Array1<f64>,
    exposure: Option<f64>,
    areascal: Option<AreaScal>,
    bin_lo: Option<Array1<f64>>,
    bin_hi: Option<Array1<f64>>,
    units: AnalysisUnit,
    mask: Vec<bool>,
    responses: BTreeMap<usize, ResponsePair>,
}

impl DataPha {
    /// Create a dataset with all channels noticed and no responses.
    ///
    /// # Arguments
    ///
    /// * `name` - Identifier used in diagnostics
    /// * `channel` - Channel numbers, ascending
    /// * `counts` - Observed counts per channel
    pub fn new(name: &str, channel: Array1<f64>, counts: Array1<f64>) -> Result<Self, PhaError> {
        if counts.len() != channel.len() {
            return Err(PhaError::CountsLength {
                name: name.into(),
                expected: channel.len(),
                actual: counts.len(),
            });
        }
        let mask = vec![true; channel.len()];
        Ok(Self {
            name: name.into(),
            channel,
            counts,
            exposure: None,
            areascal: None,
            bin_lo: None,
            bin_hi: None,
            units: AnalysisUnit::Energy,
            mask,
            responses: BTreeMap::new(),
        })
    }

    /// Wrap the dataset for sharing between response models.
    pub fn shared(self) -> SharedPha {
        Arc::new(Mutex::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn channel(&self) -> &Array1<f64> {
        &self.channel
    }

    pub fn counts(&self) -> &Array1<f64> {
        &self.counts
    }

    pub fn exposure(&self) -> Option<f64> {
        self.exposure
    }

    pub fn set_exposure(&mut self, exposure: f64) {
        self.exposure = Some(exposure);
    }

    pub fn areascal(&self) -> Option<&AreaScal> {
        self.areascal.as_ref()
    }

    pub fn set_areascal(&mut self, areascal: AreaScal) {
        self.areascal = Some(areascal);
    }

    pub fn units(&self) -> AnalysisUnit {
        self.units
    }

    pub fn set_units(&mut self, units: AnalysisUnit) {
        self.units = units;
    }

    /// Fine-grained native bin edges, when the dataset carries them.
    ///
    /// Grating data is often stored with bin edges much finer than the
    /// response grid; the convolution layer evaluates the source model
    /// there and rebins down.
    pub fn bin_edges(&self) -> Option<(&Array1<f64>, &Array1<f64>)> {
        match (&self.bin_lo, &self.bin_hi) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        }
    }

    pub fn set_bin_edges(&mut self, lo: Array1<f64>, hi: Array1<f64>) -> Result<(), PhaError> {
        if lo.len() != hi.len() {
            return Err(PhaError::BinEdgeLength {
                name: self.name.clone(),
                lo: lo.len(),
                hi: hi.len(),
            });
        }
        self.bin_lo = Some(lo);
        self.bin_hi = Some(hi);
        Ok(())
    }

    /// Attach a response under the given id (multi-order data carries
    /// several).
    pub fn add_response(
        &mut self,
        id: usize,
        arf: Option<Arc<DataArf>>,
        rmf: Option<Arc<DataRmf>>,
    ) -> Result<(), PhaError> {
        if arf.is_none() && rmf.is_none() {
            return Err(PhaError::EmptyResponse {
                name: self.name.clone(),
                id,
            });
        }
        self.responses.insert(id, ResponsePair { arf, rmf });
        Ok(())
    }

    pub fn response_ids(&self) -> Vec<usize> {
        self.responses.keys().copied().collect()
    }

    pub fn get_response(&self, id: usize) -> Option<&ResponsePair> {
        self.responses.get(&id)
    }

    /// The default response: the lowest id.
    pub fn primary_response(&self) -> Option<&ResponsePair> {
        self.responses.values().next()
    }

    pub fn get_mask(&self) -> &[bool] {
        &self.mask
    }

    /// Replace the noticed-channel mask.
    pub fn set_mask(&mut self, mask: Vec<bool>) -> Result<(), PhaError> {
        if mask.len() != self.channel.len() {
            return Err(PhaError::MaskLength {
                name: self.name.clone(),
                expected: self.channel.len(),
                actual: mask.len(),
            });
        }
        self.mask = mask;
        Ok(())
    }

    /// Notice every channel.
    pub fn notice_all(&mut self) {
        self.mask.fill(true);
    }

    /// Notice only the channels whose numbers fall in `[lo, hi]`.
    pub fn notice_range(&mut self, lo: f64, hi: f64) {
        for (i, &c) in self.channel.iter().enumerate() {
            self.mask[i] = c >= lo && c <= hi;
        }
    }

    /// The currently noticed channel numbers.
    pub fn get_noticed_channels(&self) -> Array1<f64> {
        let noticed: Vec<f64> = self
            .channel
            .iter()
            .zip(&self.mask)
            .filter(|(_, &m)| m)
            .map(|(&c, _)| c)
            .collect();
        Array1::from(noticed)
    }

    /// Adjust response-level noticing.
    ///
    /// With `notice` and a grid, the mask narrows to the channels
    /// nearest each requested grid point (the ad hoc evaluation path;
    /// callers capture and restore the prior mask). With `notice` and
    /// no grid, all attached responses take part (which they always do
    /// here, so only the intent is logged). `notice = false` clears
    /// response-level filtering, likewise structural.
    pub fn notice_response(&mut self, notice: bool, grid: Option<&Array1<f64>>) {
        match (notice, grid) {
            (true, Some(grid)) => {
                if self.channel.is_empty() {
                    return;
                }
                self.mask.fill(false);
                for &x in grid.iter() {
                    let idx = self
                        .channel
                        .iter()
                        .position(|&c| c >= x)
                        .unwrap_or(self.channel.len() - 1);
                    self.mask[idx] = true;
                }
                debug!(
                    "{}: noticed {} channels for ad hoc grid",
                    self.name,
                    self.mask.iter().filter(|&&m| m).count()
                );
            }
            (true, None) => debug!("{}: noticing all responses", self.name),
            (false, _) => debug!("{}: clearing response filter", self.name),
        }
    }
}
