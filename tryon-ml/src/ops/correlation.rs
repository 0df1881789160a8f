use candle_core::{Result, Tensor, bail};

/// Local cost volume between two feature maps of equal shape (N, C, H, W).
///
/// Output has `(2 * radius + 1)^2` channels; channel `(dy + r) * (2r + 1) + (dx + r)`
/// holds the channel-averaged product `first[y, x] · second[y + dy, x + dx]`,
/// with zeros beyond the border of `second`.
pub fn correlation(first: &Tensor, second: &Tensor, radius: usize) -> Result<Tensor> {
    if first.dims() != second.dims() {
        bail!(
            "correlation inputs must match, got {:?} and {:?}",
            first.dims(),
            second.dims()
        );
    }
    let (_n, _c, h, w) = first.dims4()?;
    let padded = second
        .pad_with_zeros(2, radius, radius)?
        .pad_with_zeros(3, radius, radius)?;

    let span = 2 * radius + 1;
    let mut costs = Vec::with_capacity(span * span);
    for dy in 0..span {
        let rows = padded.narrow(2, dy, h)?;
        for dx in 0..span {
            let shifted = rows.narrow(3, dx, w)?;
            costs.push((first * shifted)?.mean_keepdim(1)?);
        }
    }
    Tensor::cat(&costs, 1)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, IndexOp};

    use super::*;

    #[test]
    fn self_correlation_peaks_at_zero_displacement() -> Result<()> {
        let data: Vec<f32> = (0..2 * 4 * 6 * 5)
            .map(|i| ((i * 7919) % 13) as f32 - 6.)
            .collect();
        let features = Tensor::from_vec(data, (2, 4, 6, 5), &Device::Cpu)?;
        let cost = correlation(&features, &features, 3)?;
        assert_eq!(cost.dims(), &[2, 49, 6, 5]);

        let center = cost.i((.., 24, .., ..))?;
        let energy = features.sqr()?.mean(1)?;
        let diff = (center - &energy)?.abs()?.flatten_all()?.max(0)?;
        assert!(diff.to_scalar::<f32>()? < 1e-5);
        Ok(())
    }

    #[test]
    fn shifted_channel_reads_neighbour() -> Result<()> {
        // single channel, value = column index + 1
        let data: Vec<f32> = (0..3).flat_map(|_| (1..=4).map(|x| x as f32)).collect();
        let features = Tensor::from_vec(data, (1, 1, 3, 4), &Device::Cpu)?;
        let ones = Tensor::ones_like(&features)?;
        let cost = correlation(&ones, &features, 1)?;
        // dy = 0, dx = +1 -> channel 1 * 3 + 2
        let row: Vec<f32> = cost.i((0, 5, 1, ..))?.to_vec1()?;
        assert_eq!(row, vec![2., 3., 4., 0.]);
        Ok(())
    }

    #[test]
    fn mismatched_inputs_are_rejected() -> Result<()> {
        let a = Tensor::zeros((1, 2, 4, 4), candle_core::DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros((1, 3, 4, 4), candle_core::DType::F32, &Device::Cpu)?;
        assert!(correlation(&a, &b, 3).is_err());
        Ok(())
    }
}
