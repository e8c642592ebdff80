//! # Device Detection and Management
//!
//! Turns the resolver's abstract `ComputeDevice` into a concrete candle
//! `Device`. Accelerated initialisation tries CUDA first, then Metal; the
//! error is returned instead of silently degrading, so the model manager can
//! record the CPU fallback.

use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info};

/// Device class a model is loaded on.
///
/// Serialised with the same labels `as_str` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComputeDevice {
    /// Any GPU backend candle was built with (CUDA or Metal)
    #[serde(rename = "gpu")]
    Accelerated,
    #[serde(rename = "cpu")]
    Cpu,
}

impl ComputeDevice {
    /// Label reported to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeDevice::Accelerated => "gpu",
            ComputeDevice::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Open a candle device for the requested class.
    ///
    /// The CPU never fails. The accelerated class fails when neither CUDA nor
    /// Metal can be initialised; the message carries both reasons.
    pub fn open(device: ComputeDevice) -> Result<Device, String> {
        match device {
            ComputeDevice::Cpu => Ok(Device::Cpu),
            ComputeDevice::Accelerated => {
                let cuda_err = match Device::new_cuda(0) {
                    Ok(device) => {
                        info!("Opened CUDA device 0");
                        return Ok(device);
                    }
                    Err(e) => e.to_string(),
                };
                debug!("CUDA not available: {}", cuda_err);

                let metal_err = match Device::new_metal(0) {
                    Ok(device) => {
                        info!("Opened Metal device 0");
                        return Ok(device);
                    }
                    Err(e) => e.to_string(),
                };
                debug!("Metal not available: {}", metal_err);

                Err(format!(
                    "no accelerated device could be initialised (cuda: {}; metal: {})",
                    cuda_err, metal_err
                ))
            }
        }
    }

    /// Get device information for logging/debugging
    pub fn get_device_info(device: &Device) -> String {
        match device {
            Device::Cpu => "CPU".to_string(),
            Device::Cuda(_) => "CUDA GPU".to_string(),
            Device::Metal(_) => "Metal GPU (Apple Silicon)".to_string(),
        }
    }

    /// Which backends candle was compiled with. Cheap: does not touch drivers.
    pub fn get_device_summary() -> DeviceSummary {
        DeviceSummary {
            cuda_compiled: candle_core::utils::cuda_is_available(),
            metal_compiled: candle_core::utils::metal_is_available(),
        }
    }
}

/// Compile-time backend availability, reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub cuda_compiled: bool,
    pub metal_compiled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_always_opens() {
        let device = DeviceManager::open(ComputeDevice::Cpu).unwrap();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(DeviceManager::get_device_info(&device), "CPU");
    }

    #[test]
    fn test_labels_match_serialised_form() {
        for device in [ComputeDevice::Accelerated, ComputeDevice::Cpu] {
            assert_eq!(serde_json::to_value(device).unwrap(), device.as_str());
            assert_eq!(device.to_string(), device.as_str());
        }
        assert_eq!(ComputeDevice::Accelerated.as_str(), "gpu");
    }
}
