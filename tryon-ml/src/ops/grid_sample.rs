use candle_core::{DType, Device, Result, Tensor, bail};

/// How samples falling outside the input are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingMode {
    /// Out-of-bounds taps read as zero.
    #[default]
    Zeros,
    /// Coordinates are clamped to the input edge.
    Border,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GridSample {
    pub padding: PaddingMode,
    /// When set, -1 and 1 address the centers of the corner pixels rather
    /// than their outer edges.
    pub align_corners: bool,
}

impl GridSample {
    pub fn zeros(align_corners: bool) -> Self {
        Self {
            padding: PaddingMode::Zeros,
            align_corners,
        }
    }

    pub fn border(align_corners: bool) -> Self {
        Self {
            padding: PaddingMode::Border,
            align_corners,
        }
    }
}

fn unnormalize(coords: &Tensor, size: usize, align_corners: bool) -> Result<Tensor> {
    let size = size as f64;
    if align_corners {
        coords.affine((size - 1.) / 2., (size - 1.) / 2.)
    } else {
        coords.affine(size / 2., (size - 1.) / 2.)
    }
}

/// Bilinearly samples `input` (N, C, H, W) at the normalized locations in
/// `grid` (N, Ho, Wo, 2), where the last axis holds `x` then `y` in [-1, 1].
/// Returns (N, C, Ho, Wo).
pub fn grid_sample(input: &Tensor, grid: &Tensor, options: GridSample) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let (grid_n, out_h, out_w, coords) = grid.dims4()?;
    if grid_n != n || coords != 2 {
        bail!(
            "grid_sample expects a (N, H, W, 2) grid matching input batch {n}, got {:?}",
            grid.dims()
        );
    }
    let dtype = input.dtype();
    let input = input.to_dtype(DType::F32)?;
    let grid = grid.to_dtype(DType::F32)?;

    let mut ix = unnormalize(&grid.narrow(3, 0, 1)?.squeeze(3)?, w, options.align_corners)?;
    let mut iy = unnormalize(&grid.narrow(3, 1, 1)?.squeeze(3)?, h, options.align_corners)?;
    if options.padding == PaddingMode::Border {
        ix = ix.clamp(0f32, (w - 1) as f32)?;
        iy = iy.clamp(0f32, (h - 1) as f32)?;
    }

    let x0 = ix.floor()?;
    let y0 = iy.floor()?;
    let x1 = (&x0 + 1.)?;
    let y1 = (&y0 + 1.)?;
    let wx1 = (&ix - &x0)?;
    let wx0 = (1. - &wx1)?;
    let wy1 = (&iy - &y0)?;
    let wy0 = (1. - &wy1)?;

    let flat = input.contiguous()?.reshape((n, c, h * w))?;
    let taps = out_h * out_w;
    let mut output = Tensor::zeros((n, c, taps), DType::F32, input.device())?;
    for (xs, ys, weight) in [
        (&x0, &y0, (&wx0 * &wy0)?),
        (&x1, &y0, (&wx1 * &wy0)?),
        (&x0, &y1, (&wx0 * &wy1)?),
        (&x1, &y1, (&wx1 * &wy1)?),
    ] {
        let inside = xs
            .ge(0f32)?
            .mul(&xs.le((w - 1) as f32)?)?
            .mul(&ys.ge(0f32)?)?
            .mul(&ys.le((h - 1) as f32)?)?
            .to_dtype(DType::F32)?;
        let weight = (weight * inside)?.reshape((n, 1, taps))?;

        let xs = xs.clamp(0f32, (w - 1) as f32)?;
        let ys = ys.clamp(0f32, (h - 1) as f32)?;
        let index = ((ys * w as f64)? + xs)?
            .to_dtype(DType::U32)?
            .reshape((n, 1, taps))?
            .broadcast_as((n, c, taps))?
            .contiguous()?;
        let values = flat.gather(&index, 2)?;
        output = (output + values.broadcast_mul(&weight)?)?;
    }

    output.reshape((n, c, out_h, out_w))?.to_dtype(dtype)
}

/// Sampling grid (N, H, W, 2) that reproduces the input when passed to
/// [`grid_sample`] with the same `align_corners`.
pub fn identity_grid(
    n: usize,
    h: usize,
    w: usize,
    align_corners: bool,
    device: &Device,
) -> Result<Tensor> {
    let axis = |size: usize| -> Result<Tensor> {
        let coords = Tensor::arange(0f32, size as f32, device)?;
        if align_corners {
            let step = if size > 1 {
                2. / (size - 1) as f64
            } else {
                0.
            };
            coords.affine(step, -1.)
        } else {
            coords.affine(2. / size as f64, 1. / size as f64 - 1.)
        }
    };
    let xs = axis(w)?.reshape((1, 1, w))?.broadcast_as((n, h, w))?;
    let ys = axis(h)?.reshape((1, h, 1))?.broadcast_as((n, h, w))?;
    Tensor::stack(&[&xs, &ys], 3)
}

/// Bilinear resize with half-pixel centers and edge clamping.
pub fn resize_bilinear(input: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let n = input.dim(0)?;
    let grid = identity_grid(n, out_h, out_w, false, input.device())?;
    grid_sample(input, &grid, GridSample::border(false))
}
