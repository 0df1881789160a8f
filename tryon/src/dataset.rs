use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, imageops::FilterType};
use tracing::instrument;

const PERSON_DIR: &str = "test_img";
const CLOTHES_DIR: &str = "test_clothes";
const EDGE_DIR: &str = "test_edge";

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read pairs file {path}")]
    PairsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected `<person> <cloth>`, got {content:?}")]
    MalformedPair {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("failed to open image {path}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no pairs listed in {0}")]
    Empty(PathBuf),

    #[error("sample {index} out of range for {len} pairs")]
    OutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub person: String,
    pub cloth: String,
}

/// Parses one `person cloth` pair per line; blank lines are skipped.
pub fn parse_pairs(text: &str, path: &Path) -> Result<Vec<Pair>> {
    let mut pairs = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (None, _, _) => continue,
            (Some(person), Some(cloth), None) => pairs.push(Pair {
                person: person.to_string(),
                cloth: cloth.to_string(),
            }),
            _ => {
                return Err(DatasetError::MalformedPair {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    content: line.to_string(),
                });
            }
        }
    }
    if pairs.is_empty() {
        return Err(DatasetError::Empty(path.to_path_buf()));
    }
    Ok(pairs)
}

/// One person/garment pair, CHW tensors on the CPU.
pub struct Sample {
    /// (3, H, W) in [-1, 1].
    pub image: Tensor,
    /// (3, H, W) in [-1, 1].
    pub clothes: Tensor,
    /// (1, H, W) in [0, 1].
    pub edge: Tensor,
    pub p_name: String,
    pub c_name: String,
}

/// Samples stacked along a leading batch axis.
pub struct Batch {
    pub image: Tensor,
    pub clothes: Tensor,
    pub edge: Tensor,
    pub p_names: Vec<String>,
    pub c_names: Vec<String>,
}

impl Batch {
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        let mut images = Vec::with_capacity(samples.len());
        let mut clothes = Vec::with_capacity(samples.len());
        let mut edges = Vec::with_capacity(samples.len());
        let mut p_names = Vec::with_capacity(samples.len());
        let mut c_names = Vec::with_capacity(samples.len());
        for sample in samples {
            images.push(sample.image);
            clothes.push(sample.clothes);
            edges.push(sample.edge);
            p_names.push(sample.p_name);
            c_names.push(sample.c_name);
        }
        Ok(Self {
            image: Tensor::stack(&images, 0)?,
            clothes: Tensor::stack(&clothes, 0)?,
            edge: Tensor::stack(&edges, 0)?,
            p_names,
            c_names,
        })
    }

    pub fn len(&self) -> usize {
        self.p_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.p_names.is_empty()
    }
}

pub struct Dataset {
    root: PathBuf,
    pairs: Vec<Pair>,
    height: u32,
    width: u32,
}

impl Dataset {
    pub fn open(root: &Path, pairs_file: &Path, height: u32, width: u32) -> Result<Self> {
        let path = root.join(pairs_file);
        let text = std::fs::read_to_string(&path).map_err(|source| DatasetError::PairsFile {
            path: path.clone(),
            source,
        })?;
        let pairs = parse_pairs(&text, &path)?;
        tracing::info!(pairs = pairs.len(), path = %path.display(), "opened dataset");
        Ok(Self {
            root: root.to_path_buf(),
            pairs,
            height,
            width,
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    #[instrument(level = "debug", skip(self))]
    pub fn get(&self, index: usize) -> Result<Sample> {
        let pair = self.pairs.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.pairs.len(),
        })?;
        let person = self.open_image(PERSON_DIR, &pair.person)?;
        let cloth = self.open_image(CLOTHES_DIR, &pair.cloth)?;
        let edge = self.open_image(EDGE_DIR, &pair.cloth)?;

        Ok(Sample {
            image: self.rgb_tensor(&person)?,
            clothes: self.rgb_tensor(&cloth)?,
            edge: self.edge_tensor(&edge)?,
            p_name: pair.person.clone(),
            c_name: pair.cloth.clone(),
        })
    }

    /// Iterates over consecutive batches in file order; the last may be short.
    pub fn batches(&self, batch_size: usize) -> Batches<'_> {
        Batches {
            dataset: self,
            batch_size: batch_size.max(1),
            next: 0,
        }
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    fn open_image(&self, dir: &str, name: &str) -> Result<DynamicImage> {
        let path = self.root.join(dir).join(name);
        image::open(&path).map_err(|source| DatasetError::Image { path, source })
    }

    fn rgb_tensor(&self, image: &DynamicImage) -> Result<Tensor> {
        let (h, w) = (self.height as usize, self.width as usize);
        let rgb = image
            .resize_exact(self.width, self.height, FilterType::CatmullRom)
            .to_rgb8()
            .into_raw();
        Ok(Tensor::from_vec(rgb, (h, w, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(2. / 255., -1.)?)
    }

    fn edge_tensor(&self, image: &DynamicImage) -> Result<Tensor> {
        let (h, w) = (self.height as usize, self.width as usize);
        let gray = image
            .resize_exact(self.width, self.height, FilterType::Nearest)
            .to_luma8()
            .into_raw();
        Ok(Tensor::from_vec(gray, (1, h, w), &Device::Cpu)?
            .to_dtype(DType::F32)?
            .affine(1. / 255., 0.)?)
    }
}

pub struct Batches<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    next: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.dataset.len() {
            return None;
        }
        let end = (self.next + self.batch_size).min(self.dataset.len());
        let samples = (self.next..end)
            .map(|index| self.dataset.get(index))
            .collect::<Result<Vec<_>>>();
        self.next = end;
        Some(samples.and_then(Batch::collate))
    }
}
