//! Device proxy.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::current::ScopedOverride;
use crate::error::{Error, Result, Status, StatusExt};
use crate::event::{Event, EventFlags};
use crate::occupancy::ArchitectureLimits;
use crate::platform::{ContextHandle, DeviceAttribute, DeviceId};
use crate::runtime::Runtime;
use crate::stream::{Stream, StreamConfig};

/// Compute capability as (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputeCapability {
    /// Major revision.
    pub major: u32,
    /// Minor revision.
    pub minor: u32,
}

impl ComputeCapability {
    /// Construct from parts.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Decode the `major * 10 + minor` form used by function attributes.
    pub const fn from_combined(combined: u32) -> Self {
        Self {
            major: combined / 10,
            minor: combined % 10,
        }
    }

    /// Encode as `major * 10 + minor`.
    pub const fn as_combined(self) -> u32 {
        self.major * 10 + self.minor
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Free and total global memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Bytes available for allocation.
    pub free: usize,
    /// Bytes installed.
    pub total: usize,
}

/// Range of valid stream priorities. Lower numbers are higher priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriorityRange {
    /// Lowest priority (numerically greatest).
    pub least: i32,
    /// Highest priority (numerically least).
    pub greatest: i32,
}

impl StreamPriorityRange {
    /// True when the device does not distinguish priorities.
    pub fn is_trivial(&self) -> bool {
        self.least == self.greatest
    }

    /// True when `priority` lies in the range.
    pub fn contains(&self, priority: i32) -> bool {
        priority <= self.least && priority >= self.greatest
    }
}

/// Snapshot of commonly used device properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Device name.
    pub name: String,
    /// Compute capability.
    pub compute_capability: ComputeCapability,
    /// Global memory in bytes.
    pub total_memory: usize,
    /// Number of multiprocessors.
    pub multiprocessor_count: u32,
    /// Maximum threads per block.
    pub max_threads_per_block: u32,
    /// Maximum resident threads per multiprocessor.
    pub max_threads_per_multiprocessor: u32,
    /// Threads per warp.
    pub warp_size: u32,
    /// Shared memory available to one block without opting in.
    pub shared_memory_per_block: usize,
    /// L2 cache in bytes.
    pub l2_cache_size: usize,
    /// Core clock in kHz.
    pub clock_rate_khz: u32,
    /// Managed memory allocations are supported.
    pub managed_memory: bool,
    /// Host and device share one address space.
    pub unified_addressing: bool,
    /// Host memory can be mapped into the device address space.
    pub can_map_host_memory: bool,
}

/// A device of a [`Runtime`].
///
/// Devices own nothing; they are cheap to clone and compare equal when they
/// name the same ordinal of the same runtime.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    runtime: Runtime,
}

impl Device {
    /// Look up a device, failing with an invalid-device status for unknown ordinals.
    pub fn get(runtime: &Runtime, id: DeviceId) -> Result<Self> {
        let count = runtime.device_count()?;
        if id.0 >= count {
            return Err(Error::Platform {
                status: Status::INVALID_DEVICE,
                message: format!("Failed obtaining {}: {} device(s) present", id, count),
            });
        }
        Ok(Self::new_unchecked(runtime.clone(), id))
    }

    pub(crate) fn new_unchecked(runtime: Runtime, id: DeviceId) -> Self {
        Self { id, runtime }
    }

    /// Device ordinal.
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Runtime this device belongs to.
    #[inline]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Primary context, retained on first use.
    pub fn primary_context(&self) -> Result<ContextHandle> {
        self.runtime.primary_context(self.id)
    }

    /// Make this device current for the lifetime of the returned guard.
    pub fn scope(&self) -> Result<ScopedOverride> {
        ScopedOverride::device(self)
    }

    /// Device name.
    pub fn name(&self) -> Result<String> {
        self.runtime
            .platform()
            .device_name(self.id)
            .with_context(|| format!("Failed obtaining the name of {}", self.id))
    }

    /// Integer attribute.
    pub fn attribute(&self, attribute: DeviceAttribute) -> Result<i32> {
        self.runtime
            .platform()
            .device_attribute(self.id, attribute)
            .with_context(|| format!("Failed obtaining attribute {:?} of {}", attribute, self.id))
    }

    fn attribute_u32(&self, attribute: DeviceAttribute) -> Result<u32> {
        Ok(self.attribute(attribute)?.max(0) as u32)
    }

    /// Compute capability.
    pub fn compute_capability(&self) -> Result<ComputeCapability> {
        Ok(ComputeCapability::new(
            self.attribute_u32(DeviceAttribute::ComputeCapabilityMajor)?,
            self.attribute_u32(DeviceAttribute::ComputeCapabilityMinor)?,
        ))
    }

    /// Installed global memory.
    pub fn total_memory(&self) -> Result<usize> {
        self.runtime
            .platform()
            .device_total_memory(self.id)
            .with_context(|| format!("Failed obtaining the memory size of {}", self.id))
    }

    /// Free and total global memory.
    pub fn memory_info(&self) -> Result<MemoryInfo> {
        let _scope = self.scope()?;
        let (free, total) = self
            .runtime
            .platform()
            .memory_info()
            .with_context(|| format!("Failed obtaining memory usage of {}", self.id))?;
        Ok(MemoryInfo { free, total })
    }

    /// True when managed allocations are supported.
    pub fn supports_managed_memory(&self) -> Result<bool> {
        Ok(self.attribute(DeviceAttribute::ManagedMemory)? != 0)
    }

    /// True when host and device may access managed memory concurrently.
    pub fn supports_concurrent_managed_access(&self) -> Result<bool> {
        Ok(self.attribute(DeviceAttribute::ConcurrentManagedAccess)? != 0)
    }

    /// Hardware limits relevant to occupancy.
    pub fn architecture_limits(&self) -> Result<ArchitectureLimits> {
        ArchitectureLimits::from_device(self)
    }

    /// Snapshot of the common properties.
    pub fn properties(&self) -> Result<DeviceProperties> {
        Ok(DeviceProperties {
            name: self.name()?,
            compute_capability: self.compute_capability()?,
            total_memory: self.total_memory()?,
            multiprocessor_count: self.attribute_u32(DeviceAttribute::MultiprocessorCount)?,
            max_threads_per_block: self.attribute_u32(DeviceAttribute::MaxThreadsPerBlock)?,
            max_threads_per_multiprocessor: self
                .attribute_u32(DeviceAttribute::MaxThreadsPerMultiprocessor)?,
            warp_size: self.attribute_u32(DeviceAttribute::WarpSize)?,
            shared_memory_per_block: self.attribute_u32(DeviceAttribute::MaxSharedMemoryPerBlock)?
                as usize,
            l2_cache_size: self.attribute_u32(DeviceAttribute::L2CacheSize)? as usize,
            clock_rate_khz: self.attribute_u32(DeviceAttribute::ClockRateKhz)?,
            managed_memory: self.attribute(DeviceAttribute::ManagedMemory)? != 0,
            unified_addressing: self.attribute(DeviceAttribute::UnifiedAddressing)? != 0,
            can_map_host_memory: self.attribute(DeviceAttribute::CanMapHostMemory)? != 0,
        })
    }

    /// Block until all work on the device completes.
    pub fn synchronize(&self) -> Result<()> {
        let _scope = self.scope()?;
        trace!(device = self.id.0, "synchronizing device");
        self.runtime
            .platform()
            .context_synchronize()
            .with_context(|| format!("Failed synchronizing {}", self.id))
    }

    /// Valid stream priorities.
    pub fn stream_priority_range(&self) -> Result<StreamPriorityRange> {
        let _scope = self.scope()?;
        let (least, greatest) = self
            .runtime
            .platform()
            .stream_priority_range()
            .with_context(|| format!("Failed obtaining stream priority range of {}", self.id))?;
        Ok(StreamPriorityRange { least, greatest })
    }

    /// Non-owning proxy for the implicit default stream.
    pub fn default_stream(&self) -> Result<Stream> {
        Stream::default_of(self)
    }

    /// Create an owning stream.
    pub fn create_stream(&self, config: StreamConfig) -> Result<Stream> {
        Stream::create(self, config)
    }

    /// Create an owning event.
    pub fn create_event(&self, flags: EventFlags) -> Result<Event> {
        Event::create(self, flags)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.runtime.same_as(&other.runtime)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("id", &self.id.0).finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupancy::ArchitectureLimits;
    use crate::sim::{self, SimDeviceConfig};

    #[test]
    fn test_get_rejects_unknown_ordinal() {
        let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
        let err = runtime.device(2).unwrap_err();
        assert!(err.is_invalid_device());
        assert!(runtime.device(1).is_ok());
    }

    #[test]
    fn test_equality_is_per_runtime() {
        let (a, _) = sim::simulated_runtime(1).unwrap();
        let (b, _) = sim::simulated_runtime(1).unwrap();
        assert_eq!(a.device(0).unwrap(), a.device(0).unwrap());
        assert_ne!(a.device(0).unwrap(), b.device(0).unwrap());
    }

    #[test]
    fn test_properties_follow_configuration() {
        let config = SimDeviceConfig::new("sim-hopper", ArchitectureLimits::hopper())
            .with_total_memory(80 << 30);
        let (runtime, _sim) = sim::simulated_runtime_with(vec![config]).unwrap();
        let device = runtime.device(0).unwrap();

        let props = device.properties().unwrap();
        assert_eq!(props.name, "sim-hopper");
        assert_eq!(props.compute_capability, ComputeCapability::new(9, 0));
        assert_eq!(props.multiprocessor_count, 132);
        assert_eq!(props.total_memory, 80 << 30);
        assert!(props.managed_memory);
    }

    #[test]
    fn test_memory_info_tracks_allocations() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let before = device.memory_info().unwrap();

        let _region = crate::memory::device::allocate(&device, 1 << 20).unwrap();
        let after = device.memory_info().unwrap();

        assert_eq!(before.total, after.total);
        assert!(after.free <= before.free - (1 << 20));
    }

    #[test]
    fn test_compute_capability_combined() {
        let cc = ComputeCapability::from_combined(86);
        assert_eq!(cc, ComputeCapability::new(8, 6));
        assert_eq!(cc.as_combined(), 86);
        assert_eq!(cc.to_string(), "8.6");
    }

    #[test]
    fn test_priority_range() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let range = runtime.device(0).unwrap().stream_priority_range().unwrap();
        assert!(range.contains(0));
        assert!(range.contains(range.greatest));
        assert!(!range.contains(range.greatest - 1));
    }
}
