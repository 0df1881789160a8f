use anyhow::{Result, bail};
use candle_core::Tensor;
use candle_nn::ops;

use crate::rmgn::OUTPUT_CHANNELS;

/// Final try-on and the pieces it was blended from.
pub struct Composite {
    /// tanh-bounded rendered person, (N, 3, H, W) in [-1, 1].
    pub rendered: Tensor,
    /// Blend weight of the warped garment, (N, 1, H, W) in [0, 1].
    pub mask: Tensor,
    /// (N, 3, H, W)
    pub tryon: Tensor,
}

/// Splits raw generator output into rendered person and mask, confines the
/// mask to the warped garment footprint and blends.
pub fn composite(output: &Tensor, warped_cloth: &Tensor, warped_edge: &Tensor) -> Result<Composite> {
    let channels = output.dim(1)?;
    if channels != OUTPUT_CHANNELS {
        bail!("expected {OUTPUT_CHANNELS} generator channels, got {channels}");
    }
    let rendered = output.narrow(1, 0, 3)?.tanh()?;
    let mask = ops::sigmoid(&output.narrow(1, 3, 1)?)?;
    let mask = (mask * warped_edge)?;
    let tryon = blend(warped_cloth, &rendered, &mask)?;
    Ok(Composite {
        rendered,
        mask,
        tryon,
    })
}

/// `foreground * mask + background * (1 - mask)`, broadcasting the mask over
/// channels.
pub fn blend(foreground: &Tensor, background: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if foreground.dims() != background.dims() {
        bail!(
            "blend sources differ: {:?} vs {:?}",
            foreground.dims(),
            background.dims()
        );
    }
    let keep = (1. - mask)?;
    Ok((foreground.broadcast_mul(mask)? + background.broadcast_mul(&keep)?)?)
}
