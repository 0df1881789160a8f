use std::path::PathBuf;

use clap::Parser;
use tryon_ml::{afwm::AfwmConfig, rmgn::RmgnConfig};

#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about = "Warp garments onto people and composite try-on images"
)]
pub struct Cli {
    /// Experiment name; results are written to `<results-dir>/<name>`.
    #[arg(long, default_value = "demo")]
    pub name: String,

    /// Dataset root holding `test_img`, `test_clothes` and `test_edge`.
    #[arg(long, value_name = "DIR", default_value = "dataset/VITON_test")]
    pub dataroot: PathBuf,

    /// Pairs file, relative to the dataset root.
    #[arg(long, value_name = "FILE", default_value = "test_pairs.txt")]
    pub test_pairs: PathBuf,

    #[arg(long, value_name = "DIR", default_value = "results")]
    pub results_dir: PathBuf,

    /// Warping model weights (.safetensors or .pth).
    #[arg(long, value_name = "FILE")]
    pub warp_checkpoint: PathBuf,

    /// Generator weights (.safetensors or .pth).
    #[arg(long, value_name = "FILE")]
    pub gen_checkpoint: PathBuf,

    #[arg(long, default_value_t = 1, value_parser = parse_batch_size)]
    pub batch_size: usize,

    /// Accelerator ordinals, comma separated. Only the first one is used.
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub gpu_ids: Vec<usize>,

    #[arg(
        long,
        help = "Force using CPU even if GPU is available",
        default_value_t = false
    )]
    pub cpu: bool,

    /// Treat -1 and 1 as the centers of the corner pixels when sampling.
    #[arg(long, default_value_t = false)]
    pub align_corners: bool,

    #[arg(long, default_value_t = 256)]
    pub fine_height: u32,

    #[arg(long, default_value_t = 192)]
    pub fine_width: u32,

    /// Base channel width of the generator.
    #[arg(long, default_value_t = 64)]
    pub ngf: usize,

    /// The generator checkpoint carries auxiliary multi-scale heads.
    #[arg(long, default_value_t = false)]
    pub multilevel: bool,

    /// The generator checkpoint has no per-layer mask predictors.
    #[arg(long, default_value_t = false)]
    pub no_predmask: bool,
}

fn parse_batch_size(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("batch size must be at least 1".to_string()),
        Ok(size) => Ok(size),
        Err(err) => Err(err.to_string()),
    }
}

impl Cli {
    pub fn ordinal(&self) -> usize {
        self.gpu_ids.first().copied().unwrap_or_default()
    }

    pub fn output_root(&self) -> PathBuf {
        self.results_dir.join(&self.name)
    }

    pub fn afwm_config(&self) -> AfwmConfig {
        AfwmConfig {
            align_corners: self.align_corners,
            ..Default::default()
        }
    }

    pub fn rmgn_config(&self) -> RmgnConfig {
        RmgnConfig {
            ngf: self.ngf,
            multilevel: self.multilevel,
            predmask: !self.no_predmask,
            ..Default::default()
        }
    }
}
