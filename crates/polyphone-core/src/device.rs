use candle_core::Device;
use tracing::info;
use tracing::warn;

use crate::error::CoreResult;

/// Selects the compute device for this process.
///
/// When the `cuda` feature is enabled and `prefer_gpu` is true, attempts to
/// acquire CUDA device `cuda_device_id` (the local rank in distributed
/// runs). Falls back to CPU on any error.
pub fn select_device(prefer_gpu: bool, #[allow(unused_variables)] cuda_device_id: usize) -> CoreResult<Device> {
    #[cfg(feature = "cuda")]
    if prefer_gpu {
        match Device::new_cuda(cuda_device_id) {
            Ok(dev) => {
                info!(cuda_device_id, "Using CUDA device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "CUDA unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(feature = "metal")]
    if prefer_gpu {
        match Device::new_metal(0) {
            Ok(dev) => {
                info!("Using Metal device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "Metal unavailable, falling back to CPU");
            }
        }
    }

    info!("Using CPU device");
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    if prefer_gpu {
        warn!(
            "GPU requested but the binary was not compiled with GPU support. \
             Rebuild with `--features cuda` (requires the NVIDIA CUDA toolkit)."
        );
    }
    Ok(Device::Cpu)
}

/// Number of accelerator devices visible to this process.
///
/// Tries CUDA ordinals until one fails to initialise. Always `0` without
/// the `cuda` feature.
pub fn device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        let mut n = 0;
        while Device::new_cuda(n).is_ok() {
            n += 1;
        }
        n
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

/// Seed every RNG owned by `device`.
///
/// The CPU backend has no device-level generator; that case is a no-op.
pub fn seed_device(device: &Device, seed: u64) -> CoreResult<()> {
    match device {
        Device::Cpu => Ok(()),
        _ => Ok(device.set_seed(seed)?),
    }
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_device_no_gpu_returns_cpu() {
        let device = select_device(false, 0).unwrap();
        assert!(
            matches!(device, Device::Cpu),
            "prefer_gpu=false must always return CPU"
        );
    }

    #[test]
    fn test_select_device_gpu_false_when_no_cuda_feature() {
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        {
            let device = select_device(true, 0).unwrap();
            assert!(matches!(device, Device::Cpu));
            assert_eq!(device_count(), 0);
        }
    }

    #[test]
    fn test_seed_cpu_is_noop() {
        assert!(seed_device(&Device::Cpu, 42).is_ok());
    }

    #[test]
    fn test_device_name_cpu() {
        assert_eq!(device_name(&Device::Cpu), "CPU");
    }
}
