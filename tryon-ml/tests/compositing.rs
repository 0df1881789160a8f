use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tryon_ml::{
    afwm::{Afwm, AfwmConfig},
    composite::composite,
    ops::binarize,
    rmgn::{RmgnConfig, RmgnGenerator},
};

#[test]
fn saturated_mask_returns_warped_cloth_exactly() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let rendered_logits = Tensor::randn(0f32, 2., (1, 3, 8, 6), &device)?;
    let mask_logit = (Tensor::ones((1, 1, 8, 6), DType::F32, &device)? * 100.)?;
    let output = Tensor::cat(&[&rendered_logits, &mask_logit], 1)?;
    let cloth = Tensor::rand(-1f32, 1., (1, 3, 8, 6), &device)?;
    let edge = Tensor::ones((1, 1, 8, 6), DType::F32, &device)?;

    let result = composite(&output, &cloth, &edge)?;
    let tryon: Vec<f32> = result.tryon.flatten_all()?.to_vec1()?;
    let cloth: Vec<f32> = cloth.flatten_all()?.to_vec1()?;
    assert_eq!(tryon, cloth);
    Ok(())
}

#[test]
fn empty_edge_returns_rendered_person() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let output = Tensor::randn(0f32, 2., (2, 4, 8, 6), &device)?;
    let cloth = Tensor::rand(-1f32, 1., (2, 3, 8, 6), &device)?;
    let edge = Tensor::zeros((2, 1, 8, 6), DType::F32, &device)?;

    let result = composite(&output, &cloth, &edge)?;
    let tryon: Vec<f32> = result.tryon.flatten_all()?.to_vec1()?;
    let rendered: Vec<f32> = result.rendered.flatten_all()?.to_vec1()?;
    assert_eq!(tryon, rendered);
    Ok(())
}

#[test]
fn warp_then_generate_with_zero_weights() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let afwm = Afwm::new(
        VarBuilder::zeros(DType::F32, &device),
        AfwmConfig {
            filters: vec![8, 8, 8],
            fpn_dim: 8,
            align_corners: true,
            ..Default::default()
        },
    )?;
    let generator = RmgnGenerator::new(
        VarBuilder::zeros(DType::F32, &device),
        RmgnConfig {
            ngf: 4,
            levels: 3,
            ..Default::default()
        },
    )?;

    let person = Tensor::rand(-1f32, 1., (1, 3, 32, 24), &device)?;
    let edge = binarize(&Tensor::rand(0f32, 1., (1, 1, 32, 24), &device)?, 0.5)?;
    let cloth = Tensor::rand(-1f32, 1., (1, 3, 32, 24), &device)?.broadcast_mul(&edge)?;

    let warp = afwm.forward(&person, &cloth)?;
    let warped_edge = afwm.warp_mask(&edge, &warp.flow)?;
    let clothes = Tensor::cat(&[&warp.cloth, &warped_edge], 1)?;
    let generated = generator.forward(&person, &clothes)?;
    let result = composite(&generated.output, &warp.cloth, &warped_edge)?;

    assert_eq!(result.tryon.dims(), &[1, 3, 32, 24]);
    // zero weights render grey and blend half the warped garment in
    let expected = (warp.cloth.broadcast_mul(&(&warped_edge * 0.5)?))?;
    let diff = (result.tryon - expected)?.abs()?.flatten_all()?.max(0)?;
    assert!(diff.to_scalar::<f32>()? < 1e-5);
    Ok(())
}
