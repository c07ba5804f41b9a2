// The seam between the device sampler and the GPU management library.
//
// Everything the sampler needs is behind `GpuQuery`, so that the sampling logic can be tested with
// a fake and so that the vendor binding is in one place.  The NVML implementation is compiled only
// with the `nvml` feature; without it, or when the library can't be loaded, the sampler sees a
// machine with no GPUs and carries on.

use crate::errors::PerfError;

#[cfg(not(feature = "nvml"))]
use tracing::info;
#[cfg(feature = "nvml")]
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuHandle {
    pub index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: u32,
    pub used_memory_bytes: u64,
}

pub trait GpuQuery {
    fn device_count(&self) -> Result<u32, PerfError>;

    fn handle_for(&self, index: u32) -> Result<GpuHandle, PerfError>;

    /// The PCI bus id, stable for the life of the machine.
    fn bus_id(&self, handle: GpuHandle) -> Result<String, PerfError>;

    /// Utilization, percent.
    fn utilization(&self, handle: GpuHandle) -> Result<u32, PerfError>;

    /// Power draw in milliwatts, 0 where the device can't report it.
    fn power_usage_mw(&self, handle: GpuHandle) -> Result<u32, PerfError>;

    /// Processes with a compute context on the device.
    fn running_processes(&self, handle: GpuHandle) -> Result<Vec<GpuProcess>, PerfError>;
}

/// A machine without GPUs.

pub struct NoGpu;

impl GpuQuery for NoGpu {
    fn device_count(&self) -> Result<u32, PerfError> {
        Ok(0)
    }

    fn handle_for(&self, index: u32) -> Result<GpuHandle, PerfError> {
        Err(PerfError::ResourceUnavailable(format!("no GPU {index}")))
    }

    fn bus_id(&self, handle: GpuHandle) -> Result<String, PerfError> {
        Err(PerfError::ResourceUnavailable(format!("no GPU {}", handle.index)))
    }

    fn utilization(&self, handle: GpuHandle) -> Result<u32, PerfError> {
        Err(PerfError::ResourceUnavailable(format!("no GPU {}", handle.index)))
    }

    fn power_usage_mw(&self, _handle: GpuHandle) -> Result<u32, PerfError> {
        Ok(0)
    }

    fn running_processes(&self, _handle: GpuHandle) -> Result<Vec<GpuProcess>, PerfError> {
        Ok(vec![])
    }
}

/// The best backend available on this machine.

pub fn open_gpu_backend() -> Box<dyn GpuQuery> {
    #[cfg(feature = "nvml")]
    {
        match nvml::NvmlGpu::init() {
            Ok(gpu) => return Box::new(gpu),
            Err(e) => warn!("GPU monitoring disabled: {e}"),
        }
    }
    #[cfg(not(feature = "nvml"))]
    info!("Built without NVML support, GPU monitoring disabled");
    Box::new(NoGpu)
}

#[cfg(feature = "nvml")]
mod nvml {
    use super::{GpuHandle, GpuProcess, GpuQuery};
    use crate::errors::PerfError;

    use nvml_wrapper::enums::device::UsedGpuMemory;
    use nvml_wrapper::error::NvmlError;
    use nvml_wrapper::{Device, Nvml};

    pub struct NvmlGpu {
        nvml: Nvml,
    }

    fn unavailable(what: &str, e: NvmlError) -> PerfError {
        PerfError::ResourceUnavailable(format!("NVML {what}: {e}"))
    }

    impl NvmlGpu {
        pub fn init() -> Result<NvmlGpu, PerfError> {
            let nvml = Nvml::init().map_err(|e| unavailable("init", e))?;
            Ok(NvmlGpu { nvml })
        }

        fn device(&self, handle: GpuHandle) -> Result<Device<'_>, PerfError> {
            self.nvml
                .device_by_index(handle.index)
                .map_err(|e| unavailable("device", e))
        }
    }

    impl GpuQuery for NvmlGpu {
        fn device_count(&self) -> Result<u32, PerfError> {
            self.nvml.device_count().map_err(|e| unavailable("device count", e))
        }

        fn handle_for(&self, index: u32) -> Result<GpuHandle, PerfError> {
            let handle = GpuHandle { index };
            self.device(handle)?;
            Ok(handle)
        }

        fn bus_id(&self, handle: GpuHandle) -> Result<String, PerfError> {
            let info = self.device(handle)?.pci_info().map_err(|e| unavailable("pci info", e))?;
            Ok(info.bus_id)
        }

        fn utilization(&self, handle: GpuHandle) -> Result<u32, PerfError> {
            let rates = self
                .device(handle)?
                .utilization_rates()
                .map_err(|e| unavailable("utilization", e))?;
            Ok(rates.gpu)
        }

        fn power_usage_mw(&self, handle: GpuHandle) -> Result<u32, PerfError> {
            match self.device(handle)?.power_usage() {
                Ok(mw) => Ok(mw),
                Err(NvmlError::NotSupported) => Ok(0),
                Err(e) => Err(unavailable("power", e)),
            }
        }

        fn running_processes(&self, handle: GpuHandle) -> Result<Vec<GpuProcess>, PerfError> {
            let procs = self
                .device(handle)?
                .running_compute_processes()
                .map_err(|e| unavailable("processes", e))?;
            Ok(procs
                .into_iter()
                .map(|p| GpuProcess {
                    pid: p.pid,
                    used_memory_bytes: match p.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => bytes,
                        UsedGpuMemory::Unavailable => 0,
                    },
                })
                .collect())
        }
    }
}

#[cfg(test)]
pub(crate) struct FakeDevice {
    pub bus_id: String,
    pub utilization: u32,
    pub power_mw: u32,
    pub processes: Vec<GpuProcess>,
    pub broken: bool,
}

#[cfg(test)]
pub(crate) struct FakeGpu {
    pub devices: Vec<FakeDevice>,
}

#[cfg(test)]
impl FakeGpu {
    fn dev(&self, handle: GpuHandle) -> Result<&FakeDevice, PerfError> {
        match self.devices.get(handle.index as usize) {
            Some(d) if !d.broken => Ok(d),
            _ => Err(PerfError::ResourceUnavailable(format!("fake GPU {}", handle.index))),
        }
    }
}

#[cfg(test)]
impl GpuQuery for FakeGpu {
    fn device_count(&self) -> Result<u32, PerfError> {
        Ok(self.devices.len() as u32)
    }

    fn handle_for(&self, index: u32) -> Result<GpuHandle, PerfError> {
        Ok(GpuHandle { index })
    }

    fn bus_id(&self, handle: GpuHandle) -> Result<String, PerfError> {
        Ok(self.dev(handle)?.bus_id.clone())
    }

    fn utilization(&self, handle: GpuHandle) -> Result<u32, PerfError> {
        Ok(self.dev(handle)?.utilization)
    }

    fn power_usage_mw(&self, handle: GpuHandle) -> Result<u32, PerfError> {
        Ok(self.dev(handle)?.power_mw)
    }

    fn running_processes(&self, handle: GpuHandle) -> Result<Vec<GpuProcess>, PerfError> {
        Ok(self.dev(handle)?.processes.clone())
    }
}

#[test]
fn test_no_gpu() {
    let gpu = NoGpu;
    assert!(gpu.device_count().unwrap() == 0);
    assert!(gpu.handle_for(0).is_err());
    assert!(gpu.power_usage_mw(GpuHandle { index: 0 }).unwrap() == 0);
}
