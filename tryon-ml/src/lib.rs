mod loading;

pub mod afwm;
pub mod composite;
pub mod ops;
pub mod rmgn;

use anyhow::Result;
use candle_core::{Device, utils::metal_is_available};

pub use loading::{CheckpointFormat, load_checkpoint};

/// Name of the compute device being used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceName {
    Cpu,
    Cuda,
    Metal,
}

impl std::fmt::Display for DeviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceName::Cpu => write!(f, "CPU"),
            DeviceName::Cuda => write!(f, "CUDA"),
            DeviceName::Metal => write!(f, "Metal"),
        }
    }
}

/// Returns the name of the device that would be selected.
pub fn device_name(cpu: bool) -> DeviceName {
    if cpu {
        DeviceName::Cpu
    } else if cuda_is_available() {
        DeviceName::Cuda
    } else if metal_is_available() {
        DeviceName::Metal
    } else {
        DeviceName::Cpu
    }
}

/// Picks the accelerator at `ordinal`, falling back to the CPU.
pub fn device(cpu: bool, ordinal: usize) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(ordinal)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(ordinal)?)
    } else {
        tracing::warn!("CUDA and Metal are not available, using CPU device");
        Ok(Device::Cpu)
    }
}

pub fn cuda_is_available() -> bool {
    (unsafe {
        libloading::Library::new(if cfg!(target_os = "windows") {
            "nvcuda.dll"
        } else {
            "libcuda.so"
        })
        .is_ok()
    }) && cfg!(feature = "cuda")
}
