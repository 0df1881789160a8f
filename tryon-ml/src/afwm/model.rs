use anyhow::{Result, bail};
use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder, ops};

use crate::ops::{GridSample, apply_offset, correlation, grid_sample, resize_bilinear};

const CORRELATION_RADIUS: usize = 3;
const CORRELATION_CHANNELS: usize = (2 * CORRELATION_RADIUS + 1) * (2 * CORRELATION_RADIUS + 1);
const FLOW_SLOPE: f64 = 0.1;

fn conv2d(
    vb: &VarBuilder,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    bias: bool,
) -> Result<Conv2d> {
    let weight = vb.get(
        (out_channels, in_channels, kernel_size, kernel_size),
        "weight",
    )?;
    let bias = if bias {
        Some(vb.get(out_channels, "bias")?)
    } else {
        None
    };
    Ok(Conv2d::new(
        weight,
        bias,
        Conv2dConfig {
            stride,
            padding: kernel_size / 2,
            dilation: 1,
            groups: 1,
            cudnn_fwd_algo: None,
        },
    ))
}

fn load_batch_norm(vb: &VarBuilder, channels: usize) -> Result<BatchNorm> {
    Ok(BatchNorm::new(
        channels,
        vb.get(channels, "running_mean")?,
        vb.get(channels, "running_var")?,
        vb.get(channels, "weight")?,
        vb.get(channels, "bias")?,
        1e-5,
    )?)
}

/// BN → ReLU → strided conv.
#[derive(Clone)]
struct DownSample {
    bn: BatchNorm,
    conv: Conv2d,
}

impl DownSample {
    fn load(vb: &VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        Ok(Self {
            bn: load_batch_norm(&vb.pp("block.0"), in_channels)?,
            conv: conv2d(&vb.pp("block.2"), in_channels, out_channels, 3, 2, false)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.bn.forward_t(xs, false)?.relu()?;
        self.conv.forward(&xs)
    }
}

#[derive(Clone)]
struct ResBlock {
    bn1: BatchNorm,
    conv1: Conv2d,
    bn2: BatchNorm,
    conv2: Conv2d,
}

impl ResBlock {
    fn load(vb: &VarBuilder, channels: usize) -> Result<Self> {
        Ok(Self {
            bn1: load_batch_norm(&vb.pp("block.0"), channels)?,
            conv1: conv2d(&vb.pp("block.2"), channels, channels, 3, 1, false)?,
            bn2: load_batch_norm(&vb.pp("block.3"), channels)?,
            conv2: conv2d(&vb.pp("block.5"), channels, channels, 3, 1, false)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = self.bn1.forward_t(xs, false)?.relu()?;
        let ys = self.conv1.forward(&ys)?;
        let ys = self.bn2.forward_t(&ys, false)?.relu()?;
        let ys = self.conv2.forward(&ys)?;
        ys + xs
    }
}

#[derive(Clone)]
struct EncoderStage {
    down: DownSample,
    res1: ResBlock,
    res2: ResBlock,
}

/// Strided residual encoder returning one feature map per stage, finest first.
pub struct FeatureEncoder {
    stages: Vec<EncoderStage>,
}

impl FeatureEncoder {
    pub fn load(vb: &VarBuilder, in_channels: usize, filters: &[usize]) -> Result<Self> {
        let mut stages = Vec::with_capacity(filters.len());
        let mut prev = in_channels;
        for (i, &out) in filters.iter().enumerate() {
            let vb = vb.pp(format!("encoders.{i}"));
            stages.push(EncoderStage {
                down: DownSample::load(&vb.pp("0"), prev, out)?,
                res1: ResBlock::load(&vb.pp("1"), out)?,
                res2: ResBlock::load(&vb.pp("2"), out)?,
            });
            prev = out;
        }
        Ok(Self { stages })
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let mut features = Vec::with_capacity(self.stages.len());
        let mut xs = xs.clone();
        for stage in &self.stages {
            xs = stage.down.forward(&xs)?;
            xs = stage.res1.forward(&xs)?;
            xs = stage.res2.forward(&xs)?;
            features.push(xs.clone());
        }
        Ok(features)
    }
}

/// Top-down feature pyramid projecting every level to `fpn_dim` channels.
pub struct RefinePyramid {
    adaptive: Vec<Conv2d>,
    smooth: Vec<Conv2d>,
}

impl RefinePyramid {
    pub fn load(vb: &VarBuilder, filters: &[usize], fpn_dim: usize) -> Result<Self> {
        let adaptive = filters
            .iter()
            .rev()
            .enumerate()
            .map(|(i, &channels)| conv2d(&vb.pp(format!("adaptive.{i}")), channels, fpn_dim, 1, 1, true))
            .collect::<Result<Vec<_>>>()?;
        let smooth = (0..filters.len())
            .map(|i| conv2d(&vb.pp(format!("smooth.{i}")), fpn_dim, fpn_dim, 3, 1, true))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { adaptive, smooth })
    }

    /// Takes encoder features finest first and returns refined features in
    /// the same order.
    pub fn forward(&self, features: &[Tensor]) -> candle_core::Result<Vec<Tensor>> {
        let mut refined = Vec::with_capacity(features.len());
        let mut last: Option<Tensor> = None;
        for (i, feature) in features.iter().rev().enumerate() {
            let mut xs = self.adaptive[i].forward(feature)?;
            if let Some(last) = &last {
                let (_, _, h, w) = last.dims4()?;
                xs = (xs + last.upsample_nearest2d(h * 2, w * 2)?)?;
            }
            xs = self.smooth[i].forward(&xs)?;
            last = Some(xs.clone());
            refined.push(xs);
        }
        refined.reverse();
        Ok(refined)
    }
}

/// Four-layer conv head regressing a two-channel pixel offset.
#[derive(Clone)]
struct FlowHead {
    convs: [Conv2d; 4],
}

impl FlowHead {
    fn load(vb: &VarBuilder, in_channels: usize) -> Result<Self> {
        Ok(Self {
            convs: [
                conv2d(&vb.pp("0"), in_channels, 128, 3, 1, true)?,
                conv2d(&vb.pp("2"), 128, 64, 3, 1, true)?,
                conv2d(&vb.pp("4"), 64, 32, 3, 1, true)?,
                conv2d(&vb.pp("6"), 32, 2, 3, 1, true)?,
            ],
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let [c0, c1, c2, c3] = &self.convs;
        let xs = ops::leaky_relu(&c0.forward(xs)?, FLOW_SLOPE)?;
        let xs = ops::leaky_relu(&c1.forward(&xs)?, FLOW_SLOPE)?;
        let xs = ops::leaky_relu(&c2.forward(&xs)?, FLOW_SLOPE)?;
        c3.forward(&xs)
    }
}

/// Coarse-to-fine appearance flow estimator.
pub struct AFlowNet {
    main: Vec<FlowHead>,
    refine: Vec<FlowHead>,
    sampling: GridSample,
}

impl AFlowNet {
    pub fn load(
        vb: &VarBuilder,
        num_pyramid: usize,
        fpn_dim: usize,
        align_corners: bool,
    ) -> Result<Self> {
        let main = (0..num_pyramid)
            .map(|i| FlowHead::load(&vb.pp(format!("netMain.{i}")), CORRELATION_CHANNELS))
            .collect::<Result<Vec<_>>>()?;
        let refine = (0..num_pyramid)
            .map(|i| FlowHead::load(&vb.pp(format!("netRefine.{i}")), 2 * fpn_dim))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            main,
            refine,
            sampling: GridSample::border(align_corners),
        })
    }

    /// Warps `image` (the full resolution clothing) onto the geometry of the
    /// condition. Pyramids are ordered finest first. Returns the warped image
    /// and the final flow as an (N, 2, H, W) grid.
    pub fn forward(
        &self,
        image: &Tensor,
        warp_pyramid: &[Tensor],
        cond_pyramid: &[Tensor],
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let levels = warp_pyramid.len();
        let mut last_flow: Option<Tensor> = None;
        for i in 0..levels {
            let x_warp = &warp_pyramid[levels - 1 - i];
            let x_cond = &cond_pyramid[levels - 1 - i];

            let x_warp_after = match &last_flow {
                Some(flow) => grid_sample(x_warp, &flow.permute((0, 2, 3, 1))?, self.sampling)?,
                None => x_warp.clone(),
            };
            let cost = ops::leaky_relu(
                &correlation(&x_warp_after, x_cond, CORRELATION_RADIUS)?,
                FLOW_SLOPE,
            )?;
            let grid = apply_offset(&self.main[i].forward(&cost)?)?;
            let flow = match &last_flow {
                Some(last) => grid_sample(last, &grid, self.sampling)?,
                None => grid.permute((0, 3, 1, 2))?.contiguous()?,
            };

            let warped = grid_sample(x_warp, &flow.permute((0, 2, 3, 1))?, self.sampling)?;
            let concat = Tensor::cat(&[&warped, x_cond], 1)?;
            let grid = apply_offset(&self.refine[i].forward(&concat)?)?;
            let flow = grid_sample(&flow, &grid, self.sampling)?;

            let (_, _, h, w) = flow.dims4()?;
            last_flow = Some(resize_bilinear(&flow, h * 2, w * 2)?);
        }

        let Some(flow) = last_flow else {
            candle_core::bail!("flow network has no pyramid levels");
        };
        let warped = grid_sample(image, &flow.permute((0, 2, 3, 1))?, self.sampling)?;
        Ok((warped, flow))
    }
}

pub struct Afwm {
    image_features: FeatureEncoder,
    cond_features: FeatureEncoder,
    image_fpn: RefinePyramid,
    cond_fpn: RefinePyramid,
    aflow_net: AFlowNet,
    levels: usize,
}

impl Afwm {
    pub fn load(
        vb: &VarBuilder,
        input_nc: usize,
        filters: &[usize],
        fpn_dim: usize,
        align_corners: bool,
    ) -> Result<Self> {
        if filters.is_empty() {
            bail!("warping model needs at least one pyramid level");
        }
        Ok(Self {
            image_features: FeatureEncoder::load(&vb.pp("image_features"), 3, filters)?,
            cond_features: FeatureEncoder::load(&vb.pp("cond_features"), input_nc, filters)?,
            image_fpn: RefinePyramid::load(&vb.pp("image_FPN"), filters, fpn_dim)?,
            cond_fpn: RefinePyramid::load(&vb.pp("cond_FPN"), filters, fpn_dim)?,
            aflow_net: AFlowNet::load(&vb.pp("aflow_net"), filters.len(), fpn_dim, align_corners)?,
            levels: filters.len(),
        })
    }

    pub fn forward(&self, cond: &Tensor, image: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, _, h, w) = image.dims4()?;
        let stride = 1 << self.levels;
        if h % stride != 0 || w % stride != 0 {
            bail!("input size {h}x{w} must be divisible by {stride}");
        }
        let (_, _, cond_h, cond_w) = cond.dims4()?;
        if (cond_h, cond_w) != (h, w) {
            bail!(
                "person and clothing sizes differ: {:?} vs {:?}",
                cond.dims(),
                image.dims()
            );
        }

        let cond_pyramid = self.cond_fpn.forward(&self.cond_features.forward(cond)?)?;
        let image_pyramid = self.image_fpn.forward(&self.image_features.forward(image)?)?;
        Ok(self
            .aflow_net
            .forward(image, &image_pyramid, &cond_pyramid)?)
    }
}
