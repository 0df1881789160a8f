//! Appearance-flow warping module.
//!
//! Estimates a dense flow that carries an in-shop garment onto the pose of a
//! person, refining it coarse to fine over a feature pyramid.

mod model;

use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::instrument;

use crate::{
    load_checkpoint,
    ops::{GridSample, grid_sample},
};

#[derive(Debug, Clone)]
pub struct AfwmConfig {
    /// Channels of the person (condition) input.
    pub input_nc: usize,
    /// Encoder channels per pyramid level, finest first.
    pub filters: Vec<usize>,
    pub fpn_dim: usize,
    pub align_corners: bool,
}

impl Default for AfwmConfig {
    fn default() -> Self {
        Self {
            input_nc: 3,
            filters: vec![64, 128, 256, 256, 256],
            fpn_dim: 256,
            align_corners: false,
        }
    }
}

/// Warped garment and the flow that produced it.
pub struct Warp {
    /// (N, 3, H, W)
    pub cloth: Tensor,
    /// (N, 2, H, W) sampling grid in normalized coordinates.
    pub flow: Tensor,
}

pub struct Afwm {
    model: model::Afwm,
    config: AfwmConfig,
    device: Device,
}

impl Afwm {
    pub fn load(path: &Path, config: AfwmConfig, device: Device) -> Result<Self> {
        load_checkpoint(path, &device, move |vb| Self::new(vb, config))
    }

    pub fn new(vb: VarBuilder, config: AfwmConfig) -> Result<Self> {
        let device = vb.device().clone();
        let model = model::Afwm::load(
            &vb,
            config.input_nc,
            &config.filters,
            config.fpn_dim,
            config.align_corners,
        )?;
        Ok(Self {
            model,
            config,
            device,
        })
    }

    /// Warps `cloth` onto the pose in `person`.
    #[instrument(level = "debug", skip_all)]
    pub fn forward(&self, person: &Tensor, cloth: &Tensor) -> Result<Warp> {
        let person = person.to_device(&self.device)?.to_dtype(DType::F32)?;
        let cloth = cloth.to_device(&self.device)?.to_dtype(DType::F32)?;
        let (cloth, flow) = self.model.forward(&person, &cloth)?;
        Ok(Warp { cloth, flow })
    }

    /// Carries a mask through `flow` with zero padding, so nothing leaks in
    /// from beyond the garment's source frame.
    #[instrument(level = "debug", skip_all)]
    pub fn warp_mask(&self, mask: &Tensor, flow: &Tensor) -> Result<Tensor> {
        warp_with_flow(
            &mask.to_device(&self.device)?,
            flow,
            self.config.align_corners,
        )
    }
}

/// Bilinearly resamples `xs` (N, C, H, W) through an (N, 2, H, W) flow grid
/// with zero padding.
pub fn warp_with_flow(xs: &Tensor, flow: &Tensor, align_corners: bool) -> Result<Tensor> {
    let grid = flow.permute((0, 2, 3, 1))?;
    Ok(grid_sample(xs, &grid, GridSample::zeros(align_corners))?)
}
