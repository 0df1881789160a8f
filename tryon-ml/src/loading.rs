use std::path::Path;

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;

/// On-disk layout of a pretrained checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    SafeTensors,
    /// PyTorch pickle, as written by `torch.save(model.state_dict())`.
    Pickle,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("safetensors") => Ok(Self::SafeTensors),
            Some("pth" | "pt" | "ckpt" | "bin") => Ok(Self::Pickle),
            _ => bail!(
                "unsupported checkpoint format: {} (expected .safetensors or .pth)",
                path.display()
            ),
        }
    }
}

fn var_builder<'a>(path: &Path, device: &Device) -> Result<VarBuilder<'a>> {
    if !path.is_file() {
        bail!("checkpoint not found: {}", path.display());
    }
    let vb = match CheckpointFormat::from_path(path)? {
        CheckpointFormat::SafeTensors => unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)?
        },
        CheckpointFormat::Pickle => VarBuilder::from_pth(path, DType::F32, device)?,
    };
    Ok(vb)
}

/// Opens the checkpoint at `path` and hands its weights to `build`.
pub fn load_checkpoint<T, Build, E>(path: &Path, device: &Device, build: Build) -> Result<T>
where
    Build: FnOnce(VarBuilder) -> std::result::Result<T, E>,
    E: Into<anyhow::Error>,
{
    tracing::info!(checkpoint = %path.display(), "loading checkpoint");
    let vb = var_builder(path, device)?;
    build(vb)
        .map_err(Into::into)
        .with_context(|| format!("failed to load weights from {}", path.display()))
}
