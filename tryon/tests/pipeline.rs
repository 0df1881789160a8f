use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use image::{GenericImageView, GrayImage, Luma, Rgb, RgbImage};
use tryon::{
    TryOn,
    dataset::{Dataset, DatasetError},
    output::OutputDirs,
    run_dataset,
};
use tryon_ml::{
    afwm::{Afwm, AfwmConfig},
    rmgn::{RmgnConfig, RmgnGenerator},
};

const HEIGHT: u32 = 32;
const WIDTH: u32 = 24;

fn write_dataset(root: &Path, pairs: &[(&str, &str)]) -> anyhow::Result<()> {
    for dir in ["test_img", "test_clothes", "test_edge"] {
        std::fs::create_dir_all(root.join(dir))?;
    }
    let mut listing = String::new();
    for (i, (person, cloth)) in pairs.iter().enumerate() {
        let shade = (i as u8).wrapping_mul(100);
        RgbImage::from_fn(48, 64, |x, y| Rgb([shade, (x * 5) as u8, (y * 3) as u8]))
            .save(root.join("test_img").join(person))?;
        RgbImage::from_fn(48, 64, |x, _| Rgb([200, shade, (x * 4) as u8]))
            .save(root.join("test_clothes").join(cloth))?;
        GrayImage::from_fn(48, 64, |x, y| {
            let inside = (12..36).contains(&x) && (16..48).contains(&y);
            Luma([if inside { 255 } else { 0 }])
        })
        .save(root.join("test_edge").join(cloth))?;
        listing.push_str(&format!("{person} {cloth}\n"));
    }
    std::fs::write(root.join("test_pairs.txt"), listing)?;
    Ok(())
}

/// Mean red value inside one `WIDTH`x`HEIGHT` tile whose top-left corner is
/// `(x0, y0)`, skipping a margin where JPEG blurs into the neighbours.
fn tile_red(image: &RgbImage, x0: u32, y0: u32) -> f32 {
    const MARGIN: u32 = 4;
    let mut sum = 0u32;
    let mut count = 0u32;
    for y in y0 + MARGIN..y0 + HEIGHT - MARGIN {
        for x in x0 + MARGIN..x0 + WIDTH - MARGIN {
            sum += image.get_pixel(x, y)[0] as u32;
            count += 1;
        }
    }
    sum as f32 / count as f32
}

fn tiny_tryon() -> anyhow::Result<TryOn> {
    let device = Device::Cpu;
    let warp = Afwm::new(
        VarBuilder::zeros(DType::F32, &device),
        AfwmConfig {
            filters: vec![8, 8, 8],
            fpn_dim: 8,
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
    Ok(TryOn::new(warp, generator, device))
}

#[test]
fn single_sample_batches_write_dataset_names() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let results = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        &[("000001_0.png", "017575_1.png"), ("000002_0.png", "003434_1.png")],
    )?;

    let dataset = Dataset::open(data.path(), Path::new("test_pairs.txt"), HEIGHT, WIDTH)?;
    let dirs = OutputDirs::create(&results.path().join("demo"))?;
    let summary = run_dataset(&tiny_tryon()?, &dataset, 1, &dirs)?;

    assert_eq!(summary.seen, 2);
    assert_eq!(summary.shape, vec![1, 3, HEIGHT as usize, WIDTH as usize]);
    assert!(summary.speed.is_some());

    for name in ["000001_0.png", "000002_0.png"] {
        let tryon = image::open(dirs.tryon.join(name))?;
        assert_eq!(tryon.dimensions(), (WIDTH, HEIGHT));
        let visual = image::open(dirs.visualize.join(name))?;
        assert_eq!(visual.dimensions(), (4 * WIDTH, HEIGHT));
    }
    for name in ["017575_1.png", "003434_1.png"] {
        assert!(dirs.warp.join(name).is_file());
    }
    Ok(())
}

#[test]
fn larger_batches_write_numbered_grids() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let results = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        &[("a.png", "x.png"), ("b.png", "y.png"), ("c.png", "z.png")],
    )?;

    let dataset = Dataset::open(data.path(), Path::new("test_pairs.txt"), HEIGHT, WIDTH)?;
    let dirs = OutputDirs::create(&results.path().join("batched"))?;
    let summary = run_dataset(&tiny_tryon()?, &dataset, 2, &dirs)?;

    assert_eq!(summary.seen, 3);
    // the short tail batch is the last one seen
    assert_eq!(summary.shape[0], 1);

    let first = image::open(dirs.tryon.join("0.jpg"))?;
    assert_eq!(first.dimensions(), (WIDTH + 4, 2 * (HEIGHT + 2) + 2));
    let tail = image::open(dirs.tryon.join("1.jpg"))?;
    assert_eq!(tail.dimensions(), (WIDTH, HEIGHT));
    assert!(dirs.warp.join("0.jpg").is_file());
    assert!(!dirs.tryon.join("a.png").exists());

    // the person panel leads each visualize row; its red channel is the
    // per-sample shade (0, 100, 200), so rows follow the pairs file
    let grid = image::open(dirs.visualize.join("0.jpg"))?.to_rgb8();
    assert_eq!(grid.dimensions(), (4 * WIDTH + 4, 2 * (HEIGHT + 2) + 2));
    let first_row = tile_red(&grid, 2, 2);
    let second_row = tile_red(&grid, 2, HEIGHT + 4);
    assert!(first_row < 20., "first tile red {first_row}");
    assert!((second_row - 100.).abs() < 20., "second tile red {second_row}");

    let tail = image::open(dirs.visualize.join("1.jpg"))?.to_rgb8();
    let tail_red = tile_red(&tail, 0, 0);
    assert!((tail_red - 200.).abs() < 20., "tail tile red {tail_red}");
    Ok(())
}

#[test]
fn missing_image_fails_the_run() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let results = tempfile::tempdir()?;
    write_dataset(data.path(), &[("a.png", "x.png")])?;
    std::fs::remove_file(data.path().join("test_edge").join("x.png"))?;

    let dataset = Dataset::open(data.path(), Path::new("test_pairs.txt"), HEIGHT, WIDTH)?;
    let dirs = OutputDirs::create(results.path())?;
    let err = run_dataset(&tiny_tryon()?, &dataset, 1, &dirs).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::Image { .. })
    ));
    Ok(())
}

#[test]
fn loaded_tensors_are_normalized() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    write_dataset(data.path(), &[("a.png", "x.png")])?;
    let dataset = Dataset::open(data.path(), Path::new("test_pairs.txt"), HEIGHT, WIDTH)?;
    let sample = dataset.get(0)?;

    assert_eq!(sample.image.dims(), &[3, HEIGHT as usize, WIDTH as usize]);
    assert_eq!(sample.edge.dims(), &[1, HEIGHT as usize, WIDTH as usize]);
    let image: Vec<f32> = sample.image.flatten_all()?.to_vec1()?;
    assert!(image.iter().all(|v| (-1. ..=1.).contains(v)));
    // nearest resampling keeps the edge mask binary
    let edge: Vec<f32> = sample.edge.flatten_all()?.to_vec1()?;
    assert!(edge.iter().all(|&v| v == 0. || v == 1.));
    assert!(edge.contains(&1.));
    Ok(())
}
