//! Accelerator runtime probing with process-wide caching.

use std::fmt;
use std::sync::{Arc, OnceLock};

/// CUDA compute capability (`major.minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputeCapability {
    pub major: i32,
    pub minor: i32,
}

impl ComputeCapability {
    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// SM version as used in kernel names (8.6 -> 86).
    pub fn sm_version(&self) -> u32 {
        (self.major * 10 + self.minor) as u32
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Static description of one accelerator device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ordinal: usize,
    pub name: String,
    pub capability: Option<ComputeCapability>,
}

impl DeviceInfo {
    pub fn new(ordinal: usize, name: impl Into<String>, capability: ComputeCapability) -> Self {
        Self {
            ordinal,
            name: name.into(),
            capability: Some(capability),
        }
    }
}

/// What the dispatcher needs to know about the accelerator runtime.
pub trait AcceleratorRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether any accelerator device can be used at all.
    fn is_available(&self) -> bool;

    fn device_name(&self, ordinal: usize) -> Option<String>;

    /// `None` when the capability cannot be queried.
    fn compute_capability(&self, ordinal: usize) -> Option<ComputeCapability>;
}

/// Runtime backed by a fixed device list.
///
/// Used when no driver is compiled in (empty list) and by hosts that have
/// already enumerated their devices.
#[derive(Debug, Clone, Default)]
pub struct StaticRuntime {
    devices: Vec<DeviceInfo>,
}

impl StaticRuntime {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn single(name: impl Into<String>, capability: ComputeCapability) -> Self {
        Self::new(vec![DeviceInfo::new(0, name, capability)])
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    fn device(&self, ordinal: usize) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.ordinal == ordinal)
    }
}

impl AcceleratorRuntime for StaticRuntime {
    fn name(&self) -> &'static str {
        if self.devices.is_empty() {
            "host-only"
        } else {
            "static"
        }
    }

    fn is_available(&self) -> bool {
        !self.devices.is_empty()
    }

    fn device_name(&self, ordinal: usize) -> Option<String> {
        self.device(ordinal).map(|d| d.name.clone())
    }

    fn compute_capability(&self, ordinal: usize) -> Option<ComputeCapability> {
        self.device(ordinal).and_then(|d| d.capability)
    }
}

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;

#[cfg(feature = "cuda")]
mod cuda {
    use super::{AcceleratorRuntime, ComputeCapability, DeviceInfo, StaticRuntime};
    use cudarc::driver::{sys, CudaContext};

    /// CUDA devices enumerated once through the driver API.
    #[derive(Debug, Clone)]
    pub struct CudaRuntime {
        inner: StaticRuntime,
    }

    impl CudaRuntime {
        /// Enumerate CUDA devices. Returns `None` when the driver library is
        /// missing or reports no devices.
        pub fn probe() -> Option<Self> {
            // cudarc's dynamic loader panics when libcuda cannot be found.
            let devices = std::panic::catch_unwind(enumerate_devices).unwrap_or_else(|_| {
                log::debug!("CUDA driver library not found");
                Vec::new()
            });
            if devices.is_empty() {
                return None;
            }
            Some(Self {
                inner: StaticRuntime::new(devices),
            })
        }
    }

    fn enumerate_devices() -> Vec<DeviceInfo> {
        let count = match CudaContext::device_count() {
            Ok(count) => count.max(0) as usize,
            Err(e) => {
                log::debug!("CUDA not available: {}", e);
                return Vec::new();
            }
        };

        (0..count)
            .filter_map(|ordinal| {
                let ctx = match CudaContext::new(ordinal) {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        log::warn!("Failed to create CUDA context for device {}: {}", ordinal, e);
                        return None;
                    }
                };
                let name = ctx.name().unwrap_or_else(|_| format!("cuda:{ordinal}"));
                let major = ctx.attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR);
                let minor = ctx.attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR);
                let capability = match (major, minor) {
                    (Ok(major), Ok(minor)) => Some(ComputeCapability::new(major, minor)),
                    _ => {
                        log::warn!("Failed to query compute capability of device {}", ordinal);
                        None
                    }
                };
                log::debug!("CUDA device {}: {} (sm {:?})", ordinal, name, capability);
                Some(DeviceInfo {
                    ordinal,
                    name,
                    capability,
                })
            })
            .collect()
    }

    impl AcceleratorRuntime for CudaRuntime {
        fn name(&self) -> &'static str {
            "CUDA"
        }

        fn is_available(&self) -> bool {
            self.inner.is_available()
        }

        fn device_name(&self, ordinal: usize) -> Option<String> {
            self.inner.device_name(ordinal)
        }

        fn compute_capability(&self, ordinal: usize) -> Option<ComputeCapability> {
            self.inner.compute_capability(ordinal)
        }
    }
}

/// Cached detection result.
static DETECTED: OnceLock<Arc<dyn AcceleratorRuntime>> = OnceLock::new();

/// Detect the accelerator runtime for this process.
///
/// Probes once and caches the result; falls back to a host-only runtime when
/// no accelerator driver is usable.
pub fn detect_runtime() -> Arc<dyn AcceleratorRuntime> {
    DETECTED.get_or_init(perform_detection).clone()
}

#[cfg(feature = "cuda")]
fn perform_detection() -> Arc<dyn AcceleratorRuntime> {
    match CudaRuntime::probe() {
        Some(runtime) => {
            log::info!("CUDA runtime detected");
            Arc::new(runtime)
        }
        None => {
            log::info!("No CUDA device available, attention stays on the reference path");
            Arc::new(StaticRuntime::unavailable())
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn perform_detection() -> Arc<dyn AcceleratorRuntime> {
    log::debug!("Built without CUDA support");
    Arc::new(StaticRuntime::unavailable())
}
