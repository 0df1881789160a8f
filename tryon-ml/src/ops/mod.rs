mod correlation;
mod grid_sample;

use candle_core::{D, DType, Result, Tensor};

pub use correlation::correlation;
pub use grid_sample::{GridSample, PaddingMode, grid_sample, identity_grid, resize_bilinear};

/// Hard 0/1 mask: 1 where `xs > threshold`.
pub fn binarize(xs: &Tensor, threshold: f64) -> Result<Tensor> {
    xs.gt(threshold)?.to_dtype(xs.dtype())
}

/// Turns a per-pixel displacement (N, 2, H, W), measured in pixels, into an
/// absolute sampling grid (N, H, W, 2) in normalized coordinates.
pub fn apply_offset(offset: &Tensor) -> Result<Tensor> {
    let (_n, _two, h, w) = offset.dims4()?;
    let device = offset.device();
    let offset = offset.to_dtype(DType::F32)?;
    // degenerate axes of length one collapse to -1
    let normalize = |coords: Tensor, size: usize| coords.affine(2. / (size.max(2) - 1) as f64, -1.);

    let xs = Tensor::arange(0f32, w as f32, device)?.reshape((1, 1, w))?;
    let ys = Tensor::arange(0f32, h as f32, device)?.reshape((1, h, 1))?;
    let xs = normalize(offset.narrow(1, 0, 1)?.squeeze(1)?.broadcast_add(&xs)?, w)?;
    let ys = normalize(offset.narrow(1, 1, 1)?.squeeze(1)?.broadcast_add(&ys)?, h)?;
    Tensor::stack(&[&xs, &ys], 3)
}

/// Parameter-free instance normalization over the spatial axes of (N, C, H, W).
pub fn instance_norm(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let (n, c, h, w) = xs.dims4()?;
    let flat = xs.reshape((n, c, h * w))?;
    let mean = flat.mean_keepdim(D::Minus1)?;
    let centered = flat.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered
        .broadcast_div(&(var + eps)?.sqrt()?)?
        .reshape((n, c, h, w))
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, IndexOp};

    use super::*;

    #[test]
    fn binarize_yields_only_zero_and_one() -> Result<()> {
        let edge = Tensor::new(&[0f32, 0.2, 0.5, 0.51, 0.99, 1.0, 3.0, -1.0], &Device::Cpu)?;
        let mask: Vec<f32> = binarize(&edge, 0.5)?.to_vec1()?;
        assert_eq!(mask, vec![0., 0., 0., 1., 1., 1., 1., 0.]);
        Ok(())
    }

    #[test]
    fn zero_offset_is_identity_grid() -> Result<()> {
        let offset = Tensor::zeros((1, 2, 3, 5), DType::F32, &Device::Cpu)?;
        let grid = apply_offset(&offset)?;
        assert_eq!(grid.dims(), &[1, 3, 5, 2]);
        let xs: Vec<f32> = grid.i((0, 1, .., 0))?.to_vec1()?;
        let ys: Vec<f32> = grid.i((0, .., 2, 1))?.to_vec1()?;
        assert_eq!(xs, vec![-1., -0.5, 0., 0.5, 1.]);
        assert_eq!(ys, vec![-1., 0., 1.]);
        Ok(())
    }

    #[test]
    fn offset_shifts_by_pixels() -> Result<()> {
        let offset = Tensor::cat(
            &[
                Tensor::ones((1, 1, 3, 5), DType::F32, &Device::Cpu)?,
                Tensor::zeros((1, 1, 3, 5), DType::F32, &Device::Cpu)?,
            ],
            1,
        )?;
        let grid = apply_offset(&offset)?;
        let xs: Vec<f32> = grid.i((0, 0, .., 0))?.to_vec1()?;
        assert_eq!(xs, vec![-0.5, 0., 0.5, 1., 1.5]);
        Ok(())
    }

    #[test]
    fn instance_norm_standardizes_each_channel() -> Result<()> {
        let data: Vec<f32> = (0..2 * 3 * 4 * 4).map(|i| (i % 11) as f32 * 3. + 1.).collect();
        let xs = Tensor::from_vec(data, (2, 3, 4, 4), &Device::Cpu)?;
        let normed = instance_norm(&xs, 1e-5)?.reshape((2, 3, 16))?;
        let means: Vec<Vec<f32>> = normed.mean(2)?.to_vec2()?;
        let vars: Vec<Vec<f32>> = normed.sqr()?.mean(2)?.to_vec2()?;
        for (mean, var) in means.iter().flatten().zip(vars.iter().flatten()) {
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.).abs() < 1e-3);
        }
        Ok(())
    }
}
