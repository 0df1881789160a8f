use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage, imageops};

use crate::dataset::Batch;

/// Value range of network images, mapped to black..white when saved.
pub const DISPLAY_RANGE: (f64, f64) = (-1., 1.);
/// Gap between tiles of a multi-image grid.
const GRID_PADDING: u32 = 2;

/// `tryon/`, `warp/` and `visualize/` under one results root.
#[derive(Debug, Clone)]
pub struct OutputDirs {
    pub tryon: PathBuf,
    pub warp: PathBuf,
    pub visualize: PathBuf,
}

impl OutputDirs {
    pub fn create(root: &Path) -> Result<Self> {
        let dirs = Self {
            tryon: root.join("tryon"),
            warp: root.join("warp"),
            visualize: root.join("visualize"),
        };
        for dir in [&dirs.tryon, &dirs.warp, &dirs.visualize] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(dirs)
    }
}

/// File names for batch `index`: the dataset's own names when batches hold a
/// single sample, `{index}.jpg` otherwise. Returns `(person, cloth)`.
pub fn sample_names(batch: &Batch, index: usize, batch_size: usize) -> (String, String) {
    match (batch_size, batch.p_names.first(), batch.c_names.first()) {
        (1, Some(p_name), Some(c_name)) => (p_name.clone(), c_name.clone()),
        _ => {
            let name = format!("{index}.jpg");
            (name.clone(), name)
        }
    }
}

/// Converts (N, C, H, W) or (C, H, W) values in `range` to 8-bit RGB images.
/// Single channel inputs are replicated to gray.
pub fn to_images(xs: &Tensor, range: (f64, f64)) -> Result<Vec<RgbImage>> {
    let xs = match xs.rank() {
        3 => xs.unsqueeze(0)?,
        4 => xs.clone(),
        rank => bail!("expected a 3D or 4D image tensor, got rank {rank}"),
    };
    let (n, c, h, w) = xs.dims4()?;
    let xs = match c {
        1 => xs.repeat((1, 3, 1, 1))?,
        3 => xs,
        _ => bail!("expected 1 or 3 channels, got {c}"),
    };

    let (low, high) = range;
    let scale = 1. / (high - low).max(1e-5);
    let pixels = xs
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .clamp(low as f32, high as f32)?
        .affine(scale, -low * scale)?
        .affine(255., 0.5)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))?
        .contiguous()?;

    (0..n)
        .map(|i| {
            let raw: Vec<u8> = pixels.get(i)?.flatten_all()?.to_vec1()?;
            RgbImage::from_raw(w as u32, h as u32, raw)
                .ok_or_else(|| anyhow::anyhow!("failed to create image buffer from tensor"))
        })
        .collect()
}

/// Stacks images into one column with zero padding around every tile.
/// A single image is returned as is.
pub fn make_grid(images: Vec<RgbImage>) -> Result<RgbImage> {
    let mut images = images.into_iter();
    let Some(first) = images.next() else {
        bail!("cannot build a grid from zero images");
    };
    let rest: Vec<RgbImage> = images.collect();
    if rest.is_empty() {
        return Ok(first);
    }

    let (w, h) = first.dimensions();
    let rows = 1 + rest.len() as u32;
    let mut grid = RgbImage::from_pixel(
        w + 2 * GRID_PADDING,
        rows * (h + GRID_PADDING) + GRID_PADDING,
        Rgb([0, 0, 0]),
    );
    for (row, tile) in std::iter::once(first).chain(rest).enumerate() {
        if tile.dimensions() != (w, h) {
            bail!("grid tiles must share one size");
        }
        let y = GRID_PADDING + row as u32 * (h + GRID_PADDING);
        imageops::replace(&mut grid, &tile, GRID_PADDING as i64, y as i64);
    }
    Ok(grid)
}

/// Writes `xs` to `path` as a one-column grid; the format follows the
/// extension.
pub fn save_image(xs: &Tensor, path: &Path) -> Result<()> {
    let grid = make_grid(to_images(xs, DISPLAY_RANGE)?)?;
    grid.save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}
