use std::time::Duration;

use anyhow::Result;
use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::instrument;
use tryon_ml::{
    afwm::{Afwm, Warp},
    composite::{Composite, composite},
    device, device_name,
    ops::binarize,
    rmgn::RmgnGenerator,
};

use crate::{
    cli::Cli,
    dataset::{Batch, Dataset},
    output::{OutputDirs, sample_names, save_image},
    profile::{Speed, Stages},
};

const EDGE_THRESHOLD: f64 = 0.5;

/// Garment with its background removed by the binarized edge.
pub struct Prepared {
    pub clothes: Tensor,
    pub edge: Tensor,
}

pub struct Warped {
    pub warp: Warp,
    pub edge: Tensor,
}

pub struct TryOn {
    warp_model: Afwm,
    generator: RmgnGenerator,
    device: Device,
}

impl TryOn {
    pub fn load(cli: &Cli, device: Device) -> Result<Self> {
        let warp_model = Afwm::load(&cli.warp_checkpoint, cli.afwm_config(), device.clone())?;
        let generator = RmgnGenerator::load(&cli.gen_checkpoint, cli.rmgn_config(), device.clone())?;
        Ok(Self::new(warp_model, generator, device))
    }

    pub fn new(warp_model: Afwm, generator: RmgnGenerator, device: Device) -> Self {
        Self {
            warp_model,
            generator,
            device,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    #[instrument(level = "debug", skip_all)]
    pub fn preprocess(&self, batch: &Batch) -> Result<Prepared> {
        let edge = binarize(&batch.edge, EDGE_THRESHOLD)?;
        let clothes = batch.clothes.broadcast_mul(&edge)?;
        Ok(Prepared { clothes, edge })
    }

    #[instrument(level = "debug", skip_all)]
    pub fn warp(&self, person: &Tensor, prepared: &Prepared) -> Result<Warped> {
        let warp = self.warp_model.forward(person, &prepared.clothes)?;
        let edge = self.warp_model.warp_mask(&prepared.edge, &warp.flow)?;
        Ok(Warped { warp, edge })
    }

    #[instrument(level = "debug", skip_all)]
    pub fn generate(&self, person: &Tensor, warped: &Warped) -> Result<Composite> {
        let clothes = Tensor::cat(&[&warped.warp.cloth, &warped.edge], 1)?;
        let person = person.to_device(&self.device)?;
        let generated = self.generator.forward(&person, &clothes)?;
        composite(&generated.output, &warped.warp.cloth, &warped.edge)
    }
}

/// Outcome of a full pass over the dataset.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub seen: usize,
    pub speed: Option<Speed>,
    /// Shape of the last person batch.
    pub shape: Vec<usize>,
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.enable_steady_tick(Duration::from_millis(120));
    if let Ok(style) =
        ProgressStyle::with_template("{msg} [{elapsed_precise}] [{wide_bar}] {pos}/{len} ({eta})")
    {
        pb.set_style(style);
    }
    pb.set_message("try-on");
    pb
}

/// Runs every batch of `dataset` through `tryon` and writes the three image
/// artifacts per batch into `dirs`.
pub fn run_dataset(
    tryon: &TryOn,
    dataset: &Dataset,
    batch_size: usize,
    dirs: &OutputDirs,
) -> Result<RunSummary> {
    let device = tryon.device().clone();
    let mut stages = Stages::default();
    let mut shape = Vec::new();

    let pb = progress_bar(dataset.num_batches(batch_size));
    for (idx, batch) in dataset.batches(batch_size).enumerate() {
        let batch = batch?;
        let prepared = stages.preprocess.time(&device, || tryon.preprocess(&batch))?;
        let warped = stages.warp.time(&device, || tryon.warp(&batch.image, &prepared))?;
        let composite = stages
            .generate
            .time(&device, || tryon.generate(&batch.image, &warped))?;
        stages.record(batch.len());

        let (p_name, c_name) = sample_names(&batch, idx, batch_size);
        save_image(&composite.tryon, &dirs.tryon.join(&p_name))?;
        save_image(&warped.warp.cloth, &dirs.warp.join(&c_name))?;

        let combine = Tensor::cat(
            &[
                &batch.image.to_device(&device)?,
                &prepared.clothes.to_device(&device)?,
                &warped.warp.cloth,
                &composite.tryon,
            ],
            3,
        )?;
        save_image(&combine, &dirs.visualize.join(&p_name))?;

        shape = batch.image.dims().to_vec();
        tracing::debug!(batch = idx, %p_name, %c_name, "saved try-on");
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(RunSummary {
        seen: stages.seen(),
        speed: stages.speed(),
        shape,
    })
}

pub fn run(cli: &Cli) -> Result<()> {
    let device = device(cli.cpu, cli.ordinal())?;
    tracing::info!(device = %device_name(cli.cpu), "selected compute device");

    let dataset = Dataset::open(
        &cli.dataroot,
        &cli.test_pairs,
        cli.fine_height,
        cli.fine_width,
    )?;
    let tryon = TryOn::load(cli, device)?;
    let dirs = OutputDirs::create(&cli.output_root())?;

    let summary = run_dataset(&tryon, &dataset, cli.batch_size, &dirs)?;
    match summary.speed {
        Some(speed) => println!("{}", speed.summary(&summary.shape)),
        None => tracing::warn!("no samples were processed"),
    }
    Ok(())
}
