//! Host memory mapped into the device address space.

use tracing::{debug, warn};

use crate::device::Device;
use crate::error::{Result, StatusExt};
use crate::memory::{Region, RegionKind};
use crate::platform::HostAllocOptions;

/// Options for mapped allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MappedOptions {
    /// Pinned for every context, not only the allocating one.
    pub portable: bool,
    /// Write-combined host side: fast host writes, slow host reads.
    pub cpu_write_combining: bool,
}

/// Allocate one buffer visible at a host address and at a device address.
pub fn allocate(device: &Device, bytes: usize, options: MappedOptions) -> Result<Region> {
    let context = device.primary_context()?;
    if bytes == 0 {
        return Ok(Region::empty(device.clone(), context, RegionKind::Mapped));
    }
    let _scope = device.scope()?;
    let platform = device.runtime().platform();
    let host = platform
        .mem_alloc_host(
            bytes,
            HostAllocOptions {
                portable: options.portable,
                device_mapped: true,
                write_combined: options.cpu_write_combining,
            },
        )
        .with_context(|| format!("Failed allocating {} bytes of mapped memory", bytes))?;

    let device_ptr = match platform.mem_host_device_pointer(host) {
        Ok(ptr) => ptr,
        Err(status) => {
            if let Err(cleanup) = platform.mem_free_host(host) {
                warn!(
                    device = device.id().0,
                    host,
                    status = %cleanup,
                    "failed freeing host allocation after mapping failed"
                );
            }
            return Err(status).with_context(|| {
                format!("Failed mapping host allocation {:#x} to the device", host)
            });
        }
    };
    debug!(
        device = device.id().0,
        host,
        device_ptr = %device_ptr,
        bytes,
        "mapped memory allocated"
    );
    Ok(Region::from_host_allocation(
        device.clone(),
        context,
        RegionKind::Mapped,
        host,
        device_ptr,
        bytes,
    ))
}
