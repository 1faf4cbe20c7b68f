//! The driver contract every backend implements.
//!
//! [`Platform`] is thin: it mirrors the native driver entry points
//! one-to-one, takes and returns opaque handles, and reports failures as raw
//! [`Status`](crate::error::Status) values. Ownership, scoping and affinity checks
//! all live above it in the proxy types.
//!
//! Calls documented as acting "in the current context" use the ambient context
//! of the calling thread. Callers in this crate only reach them while a
//! [`ScopedOverride`](crate::current::ScopedOverride) is active.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PlatformResult;
use crate::launch::{KernelArgs, LaunchConfig};

/// Device ordinal as enumerated by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

raw_handle!(
    /// Opaque context handle.
    ContextHandle
);
raw_handle!(
    /// Opaque stream handle. `StreamHandle::DEFAULT` names the implicit queue
    /// of the current context.
    StreamHandle
);
raw_handle!(
    /// Opaque event handle.
    EventHandle
);
raw_handle!(
    /// Opaque compiled-function handle.
    FunctionHandle
);
raw_handle!(
    /// Address in the unified device address space.
    DevicePtr
);

impl StreamHandle {
    /// The implicit (legacy) default stream of the current context.
    pub const DEFAULT: StreamHandle = StreamHandle(0);
}

impl DevicePtr {
    /// The null device address.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// True for the null address.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

/// Device attributes understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DeviceAttribute {
    MaxThreadsPerBlock,
    MaxBlockDimX,
    MaxBlockDimY,
    MaxBlockDimZ,
    MaxGridDimX,
    MaxGridDimY,
    MaxGridDimZ,
    MaxSharedMemoryPerBlock,
    MaxSharedMemoryPerBlockOptin,
    TotalConstantMemory,
    WarpSize,
    MaxRegistersPerBlock,
    ClockRateKhz,
    MultiprocessorCount,
    MaxThreadsPerMultiprocessor,
    MaxBlocksPerMultiprocessor,
    MaxSharedMemoryPerMultiprocessor,
    MaxRegistersPerMultiprocessor,
    ReservedSharedMemoryPerBlock,
    ComputeCapabilityMajor,
    ComputeCapabilityMinor,
    L2CacheSize,
    ManagedMemory,
    ConcurrentManagedAccess,
    UnifiedAddressing,
    CanMapHostMemory,
    PciBusId,
}

/// Per-function attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionAttribute {
    /// Largest block the function can be launched with.
    MaxThreadsPerBlock,
    /// Statically allocated shared memory, in bytes.
    SharedSizeBytes,
    /// Constant memory, in bytes.
    ConstSizeBytes,
    /// Per-thread local memory, in bytes.
    LocalSizeBytes,
    /// Registers per thread.
    NumRegs,
    /// PTX virtual architecture, as `major * 10 + minor`.
    PtxVersion,
    /// Binary architecture, as `major * 10 + minor`.
    BinaryVersion,
    /// Whether global loads are cached in L1 (`-Xptxas -dlcm=ca`).
    CacheModeCa,
    /// Upper bound on dynamic shared memory per launch. Writable.
    MaxDynamicSharedSizeBytes,
    /// Preferred shared memory carveout, percent of the unified L1/shared pool. Writable.
    PreferredSharedMemoryCarveout,
}

impl FunctionAttribute {
    /// Every attribute, in a stable order.
    pub const ALL: [FunctionAttribute; 10] = [
        FunctionAttribute::MaxThreadsPerBlock,
        FunctionAttribute::SharedSizeBytes,
        FunctionAttribute::ConstSizeBytes,
        FunctionAttribute::LocalSizeBytes,
        FunctionAttribute::NumRegs,
        FunctionAttribute::PtxVersion,
        FunctionAttribute::BinaryVersion,
        FunctionAttribute::CacheModeCa,
        FunctionAttribute::MaxDynamicSharedSizeBytes,
        FunctionAttribute::PreferredSharedMemoryCarveout,
    ];

    /// Human-readable attribute name.
    pub fn name(self) -> &'static str {
        match self {
            FunctionAttribute::MaxThreadsPerBlock => "Maximum number of threads per block",
            FunctionAttribute::SharedSizeBytes => {
                "Statically-allocated shared memory size in bytes"
            }
            FunctionAttribute::ConstSizeBytes => "Required constant memory size in bytes",
            FunctionAttribute::LocalSizeBytes => "Required local memory size in bytes",
            FunctionAttribute::NumRegs => "Number of registers used by each thread",
            FunctionAttribute::PtxVersion => "PTX virtual architecture version",
            FunctionAttribute::BinaryVersion => "Binary architecture version",
            FunctionAttribute::CacheModeCa => "Global loads cached in L1",
            FunctionAttribute::MaxDynamicSharedSizeBytes => {
                "Maximum dynamic shared memory size per block in bytes"
            }
            FunctionAttribute::PreferredSharedMemoryCarveout => {
                "Preferred shared memory carveout percentage"
            }
        }
    }

    /// True for the attributes a launch configuration may change.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            FunctionAttribute::MaxDynamicSharedSizeBytes
                | FunctionAttribute::PreferredSharedMemoryCarveout
        )
    }
}

/// Preferred split between L1 and shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CachePreference {
    /// No preference.
    #[default]
    None,
    /// Larger shared memory.
    PreferShared,
    /// Larger L1 cache.
    PreferL1,
    /// Equal split.
    PreferEqual,
}

/// Shared memory bank width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SharedMemoryBankSize {
    /// Device default.
    #[default]
    Default,
    /// Four-byte banks.
    FourBytes,
    /// Eight-byte banks.
    EightBytes,
}

/// Where a managed range should live or be prefetched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Host memory.
    Host,
    /// Memory of the given device.
    Device(DeviceId),
}

/// Advice applied to a managed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryAdvice {
    /// Data will mostly be read.
    SetReadMostly,
    /// Undo `SetReadMostly`.
    UnsetReadMostly,
    /// Keep pages at the given location when possible.
    SetPreferredLocation,
    /// Forget the preferred location.
    UnsetPreferredLocation,
    /// The given device will access the range.
    SetAccessedBy,
    /// The given device is no longer expected to access the range.
    UnsetAccessedBy,
}

/// Which devices may access a managed allocation right after it is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InitialVisibility {
    /// Every device in the system.
    #[default]
    ToAllDevices,
    /// Only devices with concurrent managed access.
    ToSupportersOnly,
}

/// Flags for page-locked host allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostAllocOptions {
    /// Pinned for every context, not only the current one.
    pub portable: bool,
    /// Mapped into the device address space.
    pub device_mapped: bool,
    /// Write-combined: fast host writes and device reads, slow host reads.
    pub write_combined: bool,
}

/// Event creation flags as passed to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEventFlags {
    /// Host waits yield instead of spinning.
    pub blocking_sync: bool,
    /// Record timestamps.
    pub timing: bool,
    /// Shareable across processes.
    pub interprocess: bool,
}

/// Opaque inter-process event handle bytes.
pub const IPC_HANDLE_SIZE: usize = 64;

/// The driver contract.
///
/// Implementations must be usable from several host threads at once; ambient
/// context state is per thread, as in the native driver.
pub trait Platform: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &str;

    /// Initialise the driver. May be called more than once.
    fn initialize(&self, flags: u32) -> PlatformResult<()>;

    /// Number of devices. Fails with `NO_DEVICE` when none are present.
    fn device_count(&self) -> PlatformResult<u32>;

    /// Device marketing name.
    fn device_name(&self, device: DeviceId) -> PlatformResult<String>;

    /// Integer device attribute.
    fn device_attribute(&self, device: DeviceId, attribute: DeviceAttribute) -> PlatformResult<i32>;

    /// Total global memory.
    fn device_total_memory(&self, device: DeviceId) -> PlatformResult<usize>;

    /// Retain the primary context of `device`.
    fn primary_context_retain(&self, device: DeviceId) -> PlatformResult<ContextHandle>;

    /// Release one reference to the primary context of `device`.
    fn primary_context_release(&self, device: DeviceId) -> PlatformResult<()>;

    /// Device a context belongs to.
    fn context_device(&self, context: ContextHandle) -> PlatformResult<DeviceId>;

    /// Ambient context of the calling thread.
    fn current_context(&self) -> PlatformResult<Option<ContextHandle>>;

    /// Replace the ambient context of the calling thread.
    fn set_current_context(&self, context: Option<ContextHandle>) -> PlatformResult<()>;

    /// Block until all work in the current context completes.
    fn context_synchronize(&self) -> PlatformResult<()>;

    /// Free and total memory of the current context's device.
    fn memory_info(&self) -> PlatformResult<(usize, usize)>;

    /// Create a stream in the current context.
    fn stream_create(
        &self,
        synchronizes_with_default: bool,
        priority: i32,
    ) -> PlatformResult<StreamHandle>;

    /// Destroy a stream. Outstanding work still completes.
    fn stream_destroy(&self, stream: StreamHandle) -> PlatformResult<()>;

    /// Block until the stream is idle.
    fn stream_synchronize(&self, stream: StreamHandle) -> PlatformResult<()>;

    /// True when the stream is idle.
    fn stream_query(&self, stream: StreamHandle) -> PlatformResult<bool>;

    /// Make subsequent work on `stream` wait for the latest record of `event`.
    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> PlatformResult<()>;

    /// Priority the stream was created with.
    fn stream_priority(&self, stream: StreamHandle) -> PlatformResult<i32>;

    /// `(least, greatest)` stream priorities of the current context.
    fn stream_priority_range(&self) -> PlatformResult<(i32, i32)>;

    /// Create an event in the current context.
    fn event_create(&self, flags: RawEventFlags) -> PlatformResult<EventHandle>;

    /// Destroy an event.
    fn event_destroy(&self, event: EventHandle) -> PlatformResult<()>;

    /// Record `event` at the current tail of `stream`.
    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> PlatformResult<()>;

    /// True when the latest record of `event` has been reached, or it was never recorded.
    fn event_query(&self, event: EventHandle) -> PlatformResult<bool>;

    /// Block until the latest record of `event` has been reached.
    fn event_synchronize(&self, event: EventHandle) -> PlatformResult<()>;

    /// Milliseconds between two completed records.
    fn event_elapsed(&self, start: EventHandle, end: EventHandle) -> PlatformResult<f32>;

    /// Export an inter-process handle for an event.
    fn ipc_event_handle(&self, event: EventHandle) -> PlatformResult<[u8; IPC_HANDLE_SIZE]>;

    /// Open an event exported by another process.
    fn ipc_open_event(&self, handle: &[u8; IPC_HANDLE_SIZE]) -> PlatformResult<EventHandle>;

    /// Allocate device memory in the current context.
    fn mem_alloc(&self, bytes: usize) -> PlatformResult<DevicePtr>;

    /// Free device memory.
    fn mem_free(&self, ptr: DevicePtr) -> PlatformResult<()>;

    /// Stream-ordered allocation.
    fn mem_alloc_async(&self, bytes: usize, stream: StreamHandle) -> PlatformResult<DevicePtr>;

    /// Stream-ordered free.
    fn mem_free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> PlatformResult<()>;

    /// Allocate managed memory in the current context.
    fn mem_alloc_managed(
        &self,
        bytes: usize,
        visibility: InitialVisibility,
    ) -> PlatformResult<DevicePtr>;

    /// Allocate page-locked host memory. Returns the host address.
    fn mem_alloc_host(&self, bytes: usize, options: HostAllocOptions) -> PlatformResult<u64>;

    /// Free page-locked host memory.
    fn mem_free_host(&self, host: u64) -> PlatformResult<()>;

    /// Device address of mapped host memory.
    fn mem_host_device_pointer(&self, host: u64) -> PlatformResult<DevicePtr>;

    /// Synchronous copy between any two unified addresses.
    fn memcpy(&self, dst: u64, src: u64, bytes: usize) -> PlatformResult<()>;

    /// Stream-ordered copy.
    fn memcpy_async(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> PlatformResult<()>;

    /// Synchronous byte fill.
    fn memset(&self, dst: u64, value: u8, bytes: usize) -> PlatformResult<()>;

    /// Stream-ordered byte fill.
    fn memset_async(
        &self,
        dst: u64,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> PlatformResult<()>;

    /// Apply advice to a managed range. `location` is ignored by advice kinds that take none.
    fn mem_advise(
        &self,
        ptr: DevicePtr,
        bytes: usize,
        advice: MemoryAdvice,
        location: Location,
    ) -> PlatformResult<()>;

    /// Stream-ordered migration of a managed range.
    fn mem_prefetch_async(
        &self,
        ptr: DevicePtr,
        bytes: usize,
        destination: Location,
        stream: StreamHandle,
    ) -> PlatformResult<()>;

    /// Preferred location of a managed range, if one is set.
    fn mem_range_preferred_location(
        &self,
        ptr: DevicePtr,
        bytes: usize,
    ) -> PlatformResult<Option<Location>>;

    /// Devices advised to access a managed range.
    fn mem_range_accessed_by(&self, ptr: DevicePtr, bytes: usize) -> PlatformResult<Vec<DeviceId>>;

    /// Integer function attribute.
    fn function_attribute(
        &self,
        function: FunctionHandle,
        attribute: FunctionAttribute,
    ) -> PlatformResult<i32>;

    /// Set a writable function attribute, in the current context.
    fn set_function_attribute(
        &self,
        function: FunctionHandle,
        attribute: FunctionAttribute,
        value: i32,
    ) -> PlatformResult<()>;

    /// Set the L1/shared preference of a function, in the current context.
    fn set_function_cache_preference(
        &self,
        function: FunctionHandle,
        preference: CachePreference,
    ) -> PlatformResult<()>;

    /// Set the shared memory bank width of a function, in the current context.
    fn set_function_shared_memory_bank_size(
        &self,
        function: FunctionHandle,
        size: SharedMemoryBankSize,
    ) -> PlatformResult<()>;

    /// Resident blocks per multiprocessor for the given launch shape.
    fn occupancy_max_active_blocks(
        &self,
        function: FunctionHandle,
        block_size: u32,
        dynamic_shared_memory: usize,
        disable_caching_override: bool,
    ) -> PlatformResult<u32>;

    /// Enqueue a kernel launch.
    ///
    /// # Safety
    ///
    /// `args` must match the function's parameter list in count, order and
    /// layout, and any addresses it carries must stay valid until the launch
    /// completes.
    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        args: &KernelArgs,
    ) -> PlatformResult<()>;
}
