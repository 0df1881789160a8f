//! Region-aware mask generation network.
//!
//! Renders the person wearing the warped garment and predicts the mask used to
//! composite the garment back in.

mod model;

use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::instrument;

use crate::load_checkpoint;

pub use model::{GeneratorOutput, OUTPUT_CHANNELS, level_channels};

#[derive(Debug, Clone)]
pub struct RmgnConfig {
    /// Person stream channels (RGB).
    pub person_nc: usize,
    /// Clothing stream channels (warped RGB plus warped edge).
    pub clothes_nc: usize,
    pub ngf: usize,
    pub levels: usize,
    /// Emit auxiliary quarter and half resolution predictions.
    pub multilevel: bool,
    /// Predict a region mask inside every normalization layer.
    pub predmask: bool,
}

impl Default for RmgnConfig {
    fn default() -> Self {
        Self {
            person_nc: 3,
            clothes_nc: 4,
            ngf: 64,
            levels: 5,
            multilevel: false,
            predmask: true,
        }
    }
}

pub struct RmgnGenerator {
    model: model::Generator,
    device: Device,
}

impl RmgnGenerator {
    pub fn load(path: &Path, config: RmgnConfig, device: Device) -> Result<Self> {
        load_checkpoint(path, &device, move |vb| Self::new(vb, config))
    }

    pub fn new(vb: VarBuilder, config: RmgnConfig) -> Result<Self> {
        let device = vb.device().clone();
        let model = model::Generator::load(
            &vb,
            config.person_nc,
            config.clothes_nc,
            config.ngf,
            config.levels,
            config.multilevel,
            config.predmask,
        )?;
        Ok(Self { model, device })
    }

    #[instrument(level = "debug", skip_all)]
    pub fn forward(&self, person: &Tensor, clothes: &Tensor) -> Result<GeneratorOutput> {
        let person = person.to_device(&self.device)?.to_dtype(DType::F32)?;
        let clothes = clothes.to_device(&self.device)?.to_dtype(DType::F32)?;
        self.model.forward(&person, &clothes)
    }
}
