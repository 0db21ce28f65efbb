//! # Device Detection and Compute Context
//!
//! Selects the compute device (CPU/GPU) and the numeric precision used for
//! model inference. The result is an explicit [`ComputeContext`] value
//! constructed once at process start and passed into each component
//! constructor, so there is no hidden module-level device state and tests
//! can substitute a CPU context freely.
//!
//! Precision follows the device: reduced precision (f16) on accelerated
//! hardware, full f32 on CPU.

use candle_core::{DType, Device};
use tracing::{debug, info};

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// Automatically select the best available device
    Auto,
    /// Force CPU usage
    Cpu,
    /// Force CUDA GPU usage (will fallback to CPU if not available)
    Cuda,
    /// Force Metal GPU usage (will fallback to CPU if not available)
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

impl Default for DevicePreference {
    fn default() -> Self {
        DevicePreference::Auto
    }
}

/// Numeric precision used for model weights and activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeType {
    /// Half precision, used on accelerated hardware.
    Float16,
    /// Full precision, used on general-purpose hardware.
    Float32,
}

impl ComputeType {
    pub fn dtype(&self) -> DType {
        match self {
            ComputeType::Float16 => DType::F16,
            ComputeType::Float32 => DType::F32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::Float16 => "float16",
            ComputeType::Float32 => "float32",
        }
    }
}

/// Device plus precision, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub device: Device,
    pub compute_type: ComputeType,
}

impl ComputeContext {
    /// Resolve the compute context for the given preference.
    ///
    /// GPU preferences fall back to CPU when the backend is unavailable;
    /// precision always follows the device that was actually selected.
    pub fn detect(preference: DevicePreference) -> Self {
        let device = match preference {
            DevicePreference::Auto => Self::detect_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::try_cuda().unwrap_or(Device::Cpu),
            DevicePreference::Metal => Self::try_metal().unwrap_or(Device::Cpu),
        };
        Self::for_device(device)
    }

    /// Build a context for an already-selected device.
    pub fn for_device(device: Device) -> Self {
        let compute_type = if device.is_cpu() {
            ComputeType::Float32
        } else {
            ComputeType::Float16
        };
        Self {
            device,
            compute_type,
        }
    }

    /// A plain CPU context, used by tests and as the universal fallback.
    pub fn cpu() -> Self {
        Self::for_device(Device::Cpu)
    }

    fn detect_best_device() -> Device {
        info!("Detecting best available compute device...");

        if let Some(cuda) = Self::try_cuda() {
            info!("Selected CUDA GPU for ML inference");
            return cuda;
        }

        if let Some(metal) = Self::try_metal() {
            info!("Selected Metal GPU for ML inference");
            return metal;
        }

        info!("Using CPU for ML inference (no GPU acceleration available)");
        Device::Cpu
    }

    fn try_cuda() -> Option<Device> {
        match Device::new_cuda(0) {
            Ok(device) => {
                debug!("CUDA device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("CUDA not available: {}", e);
                None
            }
        }
    }

    fn try_metal() -> Option<Device> {
        match Device::new_metal(0) {
            Ok(device) => {
                debug!("Metal device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("Metal not available: {}", e);
                None
            }
        }
    }

    /// Device name for logging and the health endpoint.
    pub fn device_name(&self) -> &'static str {
        match &self.device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }
}
