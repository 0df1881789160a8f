use anyhow::{Result, bail};
use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, ops};

use crate::ops::instance_norm;

const ACT_SLOPE: f64 = 0.2;
const NORM_EPS: f64 = 1e-5;
const HIDDEN: usize = 128;
/// Rendered RGB plus one composite mask logit.
pub const OUTPUT_CHANNELS: usize = 4;

fn conv2d(
    vb: &VarBuilder,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
) -> Result<Conv2d> {
    Ok(Conv2d::new(
        vb.get(
            (out_channels, in_channels, kernel_size, kernel_size),
            "weight",
        )?,
        Some(vb.get(out_channels, "bias")?),
        Conv2dConfig {
            stride,
            padding: kernel_size / 2,
            dilation: 1,
            groups: 1,
            cudnn_fwd_algo: None,
        },
    ))
}

fn lrelu(xs: &Tensor) -> candle_core::Result<Tensor> {
    ops::leaky_relu(xs, ACT_SLOPE)
}

/// Channel width at pyramid level `i`.
pub fn level_channels(ngf: usize, level: usize) -> usize {
    ngf * (1 << level.min(3))
}

/// Stem conv followed by one stride-2 stage per level; returns the feature
/// of every stage, finest first.
struct Encoder {
    stem: Conv2d,
    stages: Vec<Conv2d>,
}

impl Encoder {
    fn load(vb: &VarBuilder, in_channels: usize, ngf: usize, levels: usize) -> Result<Self> {
        let stem = conv2d(&vb.pp("stem"), in_channels, ngf, 3, 1)?;
        let mut stages = Vec::with_capacity(levels);
        let mut prev = ngf;
        for level in 0..levels {
            let out = level_channels(ngf, level);
            stages.push(conv2d(&vb.pp(format!("stages.{level}")), prev, out, 3, 2)?);
            prev = out;
        }
        Ok(Self { stem, stages })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let mut xs = lrelu(&self.stem.forward(xs)?)?;
        let mut features = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            xs = lrelu(&instance_norm(&stage.forward(&xs)?, NORM_EPS)?)?;
            features.push(xs.clone());
        }
        Ok(features)
    }
}

/// Affine modulation predicted from one guidance stream.
struct Modulation {
    shared: Conv2d,
    gamma: Conv2d,
    beta: Conv2d,
}

impl Modulation {
    fn load(vb: &VarBuilder, guide_channels: usize, channels: usize) -> Result<Self> {
        Ok(Self {
            shared: conv2d(&vb.pp("shared"), guide_channels, HIDDEN, 3, 1)?,
            gamma: conv2d(&vb.pp("gamma"), HIDDEN, channels, 3, 1)?,
            beta: conv2d(&vb.pp("beta"), HIDDEN, channels, 3, 1)?,
        })
    }

    fn forward(&self, guide: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let hidden = self.shared.forward(guide)?.relu()?;
        Ok((self.gamma.forward(&hidden)?, self.beta.forward(&hidden)?))
    }
}

/// Instance norm whose scale and shift are drawn from the person or the
/// clothing stream according to a predicted region mask.
struct RegionNorm {
    person: Modulation,
    clothes: Modulation,
    mask: Option<Conv2d>,
}

impl RegionNorm {
    fn load(vb: &VarBuilder, channels: usize, guide_channels: usize, predmask: bool) -> Result<Self> {
        let mask = if predmask {
            Some(conv2d(
                &vb.pp("mask"),
                channels + 2 * guide_channels,
                1,
                3,
                1,
            )?)
        } else {
            None
        };
        Ok(Self {
            person: Modulation::load(&vb.pp("person"), guide_channels, channels)?,
            clothes: Modulation::load(&vb.pp("clothes"), guide_channels, channels)?,
            mask,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        person: &Tensor,
        clothes: &Tensor,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let normalized = instance_norm(xs, NORM_EPS)?;
        let (gamma_p, beta_p) = self.person.forward(person)?;
        let (gamma_c, beta_c) = self.clothes.forward(clothes)?;

        let (n, _, h, w) = xs.dims4()?;
        let mask = match &self.mask {
            Some(conv) => ops::sigmoid(&conv.forward(&Tensor::cat(&[xs, person, clothes], 1)?)?)?,
            None => (Tensor::ones((n, 1, h, w), xs.dtype(), xs.device())? * 0.5)?,
        };
        let keep = (1. - &mask)?;

        let gamma = (gamma_c.broadcast_mul(&mask)? + gamma_p.broadcast_mul(&keep)?)?;
        let beta = (beta_c.broadcast_mul(&mask)? + beta_p.broadcast_mul(&keep)?)?;
        let out = ((normalized * (gamma + 1.)?)? + beta)?;
        Ok((out, mask))
    }
}

/// Residual block of two region-normalized convolutions.
struct RmgnBlock {
    norm1: RegionNorm,
    conv1: Conv2d,
    norm2: RegionNorm,
    conv2: Conv2d,
}

impl RmgnBlock {
    fn load(vb: &VarBuilder, channels: usize, predmask: bool) -> Result<Self> {
        Ok(Self {
            norm1: RegionNorm::load(&vb.pp("norm_0"), channels, channels, predmask)?,
            conv1: conv2d(&vb.pp("conv_0"), channels, channels, 3, 1)?,
            norm2: RegionNorm::load(&vb.pp("norm_1"), channels, channels, predmask)?,
            conv2: conv2d(&vb.pp("conv_1"), channels, channels, 3, 1)?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        person: &Tensor,
        clothes: &Tensor,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let (ys, mask) = self.norm1.forward(xs, person, clothes)?;
        let ys = self.conv1.forward(&lrelu(&ys)?)?;
        let (ys, _) = self.norm2.forward(&ys, person, clothes)?;
        let ys = self.conv2.forward(&lrelu(&ys)?)?;
        Ok(((ys + xs)?, mask))
    }
}

/// Raw generator outputs, before any activation.
pub struct GeneratorOutput {
    /// (N, 4, H, W): rendered RGB logits followed by the mask logit.
    pub output: Tensor,
    /// Quarter resolution prediction, present with multilevel supervision.
    pub out_l1: Option<Tensor>,
    /// Half resolution prediction, present with multilevel supervision.
    pub out_l2: Option<Tensor>,
    /// Region masks of every decoder block, deepest first.
    pub masks: Vec<Tensor>,
}

pub struct Generator {
    person_encoder: Encoder,
    clothes_encoder: Encoder,
    fuse: Conv2d,
    blocks: Vec<RmgnBlock>,
    /// `ups[i]` lifts level `i + 1` to level `i`; `ups[levels - 1]` reaches
    /// full resolution.
    ups: Vec<Conv2d>,
    head_l1: Option<Conv2d>,
    head_l2: Option<Conv2d>,
    conv_img: Conv2d,
    levels: usize,
}

impl Generator {
    pub fn load(
        vb: &VarBuilder,
        person_nc: usize,
        clothes_nc: usize,
        ngf: usize,
        levels: usize,
        multilevel: bool,
        predmask: bool,
    ) -> Result<Self> {
        if levels < 2 {
            bail!("generator needs at least two levels, got {levels}");
        }
        let deepest = level_channels(ngf, levels - 1);
        let person_encoder = Encoder::load(&vb.pp("person_encoder"), person_nc, ngf, levels)?;
        let clothes_encoder = Encoder::load(&vb.pp("clothes_encoder"), clothes_nc, ngf, levels)?;
        let fuse = conv2d(&vb.pp("fuse"), 2 * deepest, deepest, 1, 1)?;

        let blocks = (0..levels)
            .map(|level| {
                RmgnBlock::load(
                    &vb.pp(format!("blocks.{level}")),
                    level_channels(ngf, level),
                    predmask,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let ups = (0..levels)
            .map(|level| {
                let target = if level == 0 {
                    ngf
                } else {
                    level_channels(ngf, level - 1)
                };
                conv2d(
                    &vb.pp(format!("ups.{level}")),
                    level_channels(ngf, level),
                    target,
                    3,
                    1,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let (head_l1, head_l2) = if multilevel {
            (
                Some(conv2d(&vb.pp("head_l1"), level_channels(ngf, 1), OUTPUT_CHANNELS, 3, 1)?),
                Some(conv2d(&vb.pp("head_l2"), level_channels(ngf, 0), OUTPUT_CHANNELS, 3, 1)?),
            )
        } else {
            (None, None)
        };
        let conv_img = conv2d(&vb.pp("conv_img"), ngf, OUTPUT_CHANNELS, 3, 1)?;

        Ok(Self {
            person_encoder,
            clothes_encoder,
            fuse,
            blocks,
            ups,
            head_l1,
            head_l2,
            conv_img,
            levels,
        })
    }

    pub fn forward(&self, person: &Tensor, clothes: &Tensor) -> Result<GeneratorOutput> {
        let (_, _, h, w) = person.dims4()?;
        let stride = 1 << self.levels;
        if h % stride != 0 || w % stride != 0 {
            bail!("input size {h}x{w} must be divisible by {stride}");
        }
        let (_, _, clothes_h, clothes_w) = clothes.dims4()?;
        if (clothes_h, clothes_w) != (h, w) {
            bail!(
                "person and clothing streams differ: {:?} vs {:?}",
                person.dims(),
                clothes.dims()
            );
        }

        let person_features = self.person_encoder.forward(person)?;
        let clothes_features = self.clothes_encoder.forward(clothes)?;

        let deepest = self.levels - 1;
        let mut xs = self.fuse.forward(&Tensor::cat(
            &[&person_features[deepest], &clothes_features[deepest]],
            1,
        )?)?;

        let mut masks = Vec::with_capacity(self.levels);
        let mut out_l1 = None;
        let mut out_l2 = None;
        for level in (0..self.levels).rev() {
            let (ys, mask) =
                self.blocks[level].forward(&xs, &person_features[level], &clothes_features[level])?;
            masks.push(mask);
            match level {
                1 => out_l1 = self.head_l1.as_ref().map(|head| head.forward(&ys)).transpose()?,
                0 => out_l2 = self.head_l2.as_ref().map(|head| head.forward(&ys)).transpose()?,
                _ => {}
            }
            let (_, _, level_h, level_w) = ys.dims4()?;
            let up = ys.upsample_nearest2d(level_h * 2, level_w * 2)?;
            xs = lrelu(&self.ups[level].forward(&up)?)?;
        }

        let output = self.conv_img.forward(&xs)?;
        Ok(GeneratorOutput {
            output,
            out_l1,
            out_l2,
            masks,
        })
    }
}
