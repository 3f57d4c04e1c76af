//! Compute device selection for training and evaluation.

use candle_core::Device;

/// Accelerator ordinal used for every trial.
const ACCELERATOR_ORDINAL: usize = 0;

/// Pick the device a trial runs on.
///
/// With `force_cpu` the CPU is returned unconditionally. Otherwise CUDA is
/// tried when built with the `cuda` feature, then Metal with the `metal`
/// feature, and the CPU is the fallback.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        tracing::debug!("CPU requested explicitly");
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(ACCELERATOR_ORDINAL) {
            Ok(device) => return announce(device),
            Err(e) => tracing::warn!(
                backend = "cuda",
                ordinal = ACCELERATOR_ORDINAL,
                error = %e,
                "No usable CUDA device for trials, trying the next backend"
            ),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(ACCELERATOR_ORDINAL) {
            Ok(device) => return announce(device),
            Err(e) => tracing::warn!(
                backend = "metal",
                ordinal = ACCELERATOR_ORDINAL,
                error = %e,
                "Metal device could not be opened, trials will run on the CPU"
            ),
        }
    }

    announce(Device::Cpu)
}

/// Short backend name for logs and reports.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

fn announce(device: Device) -> Device {
    tracing::info!(
        backend = device_label(&device),
        ordinal = ACCELERATOR_ORDINAL,
        "Selected compute device"
    );
    device
}
