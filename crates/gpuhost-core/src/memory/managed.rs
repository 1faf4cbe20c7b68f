//! Managed (unified) memory and placement advice.

use tracing::{debug, trace};

use crate::device::Device;
use crate::error::{Result, StatusExt};
use crate::memory::{Region, RegionKind};
use crate::platform::{InitialVisibility, Location, MemoryAdvice};
use crate::stream::Stream;

/// Allocate `bytes` bytes of managed memory on `device`.
pub fn allocate(device: &Device, bytes: usize, visibility: InitialVisibility) -> Result<Region> {
    let context = device.primary_context()?;
    if bytes == 0 {
        return Ok(Region::empty(device.clone(), context, RegionKind::Managed));
    }
    let _scope = device.scope()?;
    let ptr = device
        .runtime()
        .platform()
        .mem_alloc_managed(bytes, visibility)
        .with_context(|| {
            format!(
                "Failed allocating {} bytes of managed memory on {}",
                bytes,
                device.id()
            )
        })?;
    debug!(device = device.id().0, ptr = %ptr, bytes, ?visibility, "managed memory allocated");
    Ok(Region::from_device_allocation(
        device.clone(),
        context,
        RegionKind::Managed,
        ptr,
        bytes,
    ))
}

fn advise(region: &Region, advice: MemoryAdvice, location: Location) -> Result<()> {
    region.require_kind(RegionKind::Managed, "memory advice")?;
    let ptr = region.device_ptr()?;
    if region.is_empty() {
        return Ok(());
    }
    let _scope = region.scope()?;
    trace!(ptr = %ptr, ?advice, ?location, "memory advice");
    region
        .device()
        .runtime()
        .platform()
        .mem_advise(ptr, region.size(), advice, location)
        .with_context(|| format!("Failed applying {:?} to {}", advice, ptr))
}

/// Prefer keeping the region at `location`.
pub fn set_preferred_location(region: &Region, location: Location) -> Result<()> {
    advise(region, MemoryAdvice::SetPreferredLocation, location)
}

/// Forget any preferred location.
pub fn clear_preferred_location(region: &Region) -> Result<()> {
    advise(region, MemoryAdvice::UnsetPreferredLocation, Location::Host)
}

/// The preferred location, if one is set.
pub fn preferred_location(region: &Region) -> Result<Option<Location>> {
    region.require_kind(RegionKind::Managed, "preferred location query")?;
    let ptr = region.device_ptr()?;
    if region.is_empty() {
        return Ok(None);
    }
    region
        .device()
        .runtime()
        .platform()
        .mem_range_preferred_location(ptr, region.size())
        .with_context(|| format!("Failed obtaining the preferred location of {}", ptr))
}

/// `device` will access the region; keep it mapped there.
pub fn advise_expected_access_by(region: &Region, device: &Device) -> Result<()> {
    advise(region, MemoryAdvice::SetAccessedBy, Location::Device(device.id()))
}

/// `device` is no longer expected to access the region.
pub fn advise_no_access_expected_by(region: &Region, device: &Device) -> Result<()> {
    advise(region, MemoryAdvice::UnsetAccessedBy, Location::Device(device.id()))
}

/// Mark the region as mostly read (or undo that).
pub fn advise_read_mostly(region: &Region, read_mostly: bool) -> Result<()> {
    let advice = if read_mostly {
        MemoryAdvice::SetReadMostly
    } else {
        MemoryAdvice::UnsetReadMostly
    };
    advise(region, advice, Location::Host)
}

/// Devices currently advised as accessors of the region.
pub fn accessors(region: &Region) -> Result<Vec<Device>> {
    region.require_kind(RegionKind::Managed, "accessor query")?;
    let ptr = region.device_ptr()?;
    if region.is_empty() {
        return Ok(Vec::new());
    }
    let runtime = region.device().runtime();
    let ids = runtime
        .platform()
        .mem_range_accessed_by(ptr, region.size())
        .with_context(|| format!("Failed obtaining the accessors of {}", ptr))?;
    Ok(ids
        .into_iter()
        .map(|id| Device::new_unchecked(runtime.clone(), id))
        .collect())
}

/// Migrate the region to `destination` in `stream` order.
pub fn prefetch(region: &Region, destination: Location, stream: &Stream) -> Result<()> {
    stream.enqueue().prefetch(region, destination)
}
