//! Device-resident allocations.

use tracing::debug;

use crate::current::ScopedOverride;
use crate::device::Device;
use crate::error::{Result, StatusExt};
use crate::memory::{Region, RegionKind};

/// Allocate `bytes` bytes of global memory on `device`.
///
/// Running out of memory and naming an invalid device are reported with
/// distinct statuses; see [`Error::is_out_of_memory`](crate::error::Error::is_out_of_memory).
pub fn allocate(device: &Device, bytes: usize) -> Result<Region> {
    if bytes == 0 {
        return Ok(Region::empty(
            device.clone(),
            device.primary_context()?,
            RegionKind::Device,
        ));
    }
    let scope = ScopedOverride::device(device)?;
    allocate_in(&scope, bytes)
}

/// Allocate on the device made current by `scope`.
pub fn allocate_in(scope: &ScopedOverride, bytes: usize) -> Result<Region> {
    let device = scope.target_device();
    if bytes == 0 {
        return Ok(Region::empty(
            device.clone(),
            scope.target_context(),
            RegionKind::Device,
        ));
    }
    let ptr = device
        .runtime()
        .platform()
        .mem_alloc(bytes)
        .with_context(|| {
            format!(
                "Failed allocating {} bytes of global memory on {}",
                bytes,
                device.id()
            )
        })?;
    debug!(device = device.id().0, ptr = %ptr, bytes, "device memory allocated");
    Ok(Region::from_device_allocation(
        device.clone(),
        scope.target_context(),
        RegionKind::Device,
        ptr,
        bytes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::sim::{self, SimDeviceConfig};

    #[test]
    fn test_out_of_memory_is_reported() {
        let config = SimDeviceConfig::default().with_total_memory(1 << 20);
        let (runtime, _sim) = sim::simulated_runtime_with(vec![config]).unwrap();
        let device = runtime.device(0).unwrap();

        let err = allocate(&device, 2 << 20).unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(!err.is_invalid_device());
    }

    #[test]
    fn test_invalid_device_is_distinct() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let err = runtime.device(3).unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_DEVICE));
        assert!(!err.is_out_of_memory());
    }

    #[test]
    fn test_allocate_in_scope() {
        let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
        let device = runtime.device(1).unwrap();
        let scope = device.scope().unwrap();

        let region = allocate_in(&scope, 128).unwrap();
        assert_eq!(region.device(), &device);
        assert_eq!(region.kind(), RegionKind::Device);
        assert_eq!(region.size(), 128);
    }
}
