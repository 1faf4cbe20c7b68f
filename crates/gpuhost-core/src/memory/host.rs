//! Page-locked host allocations.

use tracing::debug;

use crate::device::Device;
use crate::error::{Result, StatusExt};
use crate::memory::{Region, RegionKind};
use crate::platform::{DevicePtr, HostAllocOptions};

/// Allocate `bytes` bytes of pinned host memory through `device`'s context.
pub fn allocate(device: &Device, bytes: usize, options: HostAllocOptions) -> Result<Region> {
    let context = device.primary_context()?;
    if bytes == 0 {
        return Ok(Region::empty(device.clone(), context, RegionKind::HostPinned));
    }
    let _scope = device.scope()?;
    let host = device
        .runtime()
        .platform()
        .mem_alloc_host(bytes, options)
        .with_context(|| format!("Failed allocating {} bytes of pinned host memory", bytes))?;
    debug!(device = device.id().0, host, bytes, ?options, "pinned host memory allocated");
    Ok(Region::from_host_allocation(
        device.clone(),
        context,
        RegionKind::HostPinned,
        host,
        DevicePtr::NULL,
        bytes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;
    use crate::sim;

    #[test]
    fn test_pinned_region_is_host_accessible() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let mut region = allocate(&device, 16, HostAllocOptions::default()).unwrap();

        unsafe { region.host_slice_mut().unwrap().copy_from_slice(&[9u8; 16]) };
        let mut device_copy = memory::device::allocate(&device, 16).unwrap();
        memory::copy(&mut device_copy, &region, 16).unwrap();

        let mut back = [0u8; 16];
        memory::copy(&mut back[..], &device_copy, 16).unwrap();
        assert_eq!(back, [9u8; 16]);

        drop(region);
        assert_eq!(sim.call_count("mem_free_host"), 1);
    }
}
