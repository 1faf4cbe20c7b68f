//! In-process simulated platform.
//!
//! [`SimPlatform`] implements [`Platform`] on the host: device memory is heap
//! memory at synthetic addresses, kernels are registered closures, and stream
//! work is deferred until something synchronises (or runs immediately in
//! eager mode). It follows the native driver's rules closely enough that
//! context scoping, ownership and ordering bugs surface as the same status
//! codes a real device would return.
//!
//! Every [`Platform`] call is counted by name, and failures can be injected
//! per call name, which makes it the backend of choice for tests:
//!
//! ```
//! use gpuhost_core::sim;
//!
//! let (runtime, sim) = sim::simulated_runtime(2).unwrap();
//! let device = runtime.device(1).unwrap();
//! let _stream = device.create_stream(Default::default()).unwrap();
//! assert_eq!(sim.call_count("stream_create"), 1);
//! ```

mod kernel;
mod memory;
mod queue;

pub use kernel::{SimKernelBody, SimKernelSpec, SimLaunch};

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{PlatformResult, Result, Status};
use crate::launch::{KernelArgs, LaunchConfig};
use crate::occupancy::ArchitectureLimits;
use crate::platform::{
    CachePreference, ContextHandle, DeviceAttribute, DeviceId, DevicePtr, EventHandle,
    FunctionAttribute, FunctionHandle, HostAllocOptions, InitialVisibility, Location,
    MemoryAdvice, Platform, RawEventFlags, SharedMemoryBankSize, StreamHandle, IPC_HANDLE_SIZE,
};
use crate::runtime::Runtime;

use kernel::SimFunction;
use memory::{AllocationKind, MemoryTable};
use queue::{Op, SimEvent, SimStream, StreamKey};

const CONTEXT_BASE: u64 = 0x1000_0000;
const STREAM_TAG: u64 = 0x5700_0000_0000;
const EVENT_TAG: u64 = 0xE700_0000_0000;
const FUNCTION_TAG: u64 = 0xF700_0000_0000;

/// `(least, greatest)` stream priorities.
const PRIORITY_RANGE: (i32, i32) = (0, -5);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Current context per simulated platform instance.
    static CURRENT: RefCell<HashMap<u64, ContextHandle>> = RefCell::new(HashMap::new());
}

/// One simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDeviceConfig {
    /// Reported device name.
    pub name: String,
    /// Hardware limits.
    pub limits: ArchitectureLimits,
    /// Global memory capacity.
    pub total_memory: usize,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self::new("gpuhost simulated device", ArchitectureLimits::default())
    }
}

impl SimDeviceConfig {
    /// A device with `limits` and 16 GiB of memory.
    pub fn new(name: impl Into<String>, limits: ArchitectureLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            total_memory: 16 << 30,
        }
    }

    /// Set the memory capacity.
    #[must_use]
    pub fn with_total_memory(mut self, bytes: usize) -> Self {
        self.total_memory = bytes;
        self
    }

    fn attribute(&self, ordinal: DeviceId, attribute: DeviceAttribute) -> i32 {
        let l = &self.limits;
        let value = match attribute {
            DeviceAttribute::MaxThreadsPerBlock => l.max_threads_per_block as usize,
            DeviceAttribute::MaxBlockDimX | DeviceAttribute::MaxBlockDimY => 1024,
            DeviceAttribute::MaxBlockDimZ => 64,
            DeviceAttribute::MaxGridDimX => i32::MAX as usize,
            DeviceAttribute::MaxGridDimY | DeviceAttribute::MaxGridDimZ => 65535,
            DeviceAttribute::MaxSharedMemoryPerBlock => l.shared_mem_per_block,
            DeviceAttribute::MaxSharedMemoryPerBlockOptin => l.shared_mem_per_block_optin,
            DeviceAttribute::TotalConstantMemory => 64 * 1024,
            DeviceAttribute::WarpSize => l.warp_size as usize,
            DeviceAttribute::MaxRegistersPerBlock => l.max_registers_per_block as usize,
            DeviceAttribute::ClockRateKhz => 1_410_000,
            DeviceAttribute::MultiprocessorCount => l.sm_count as usize,
            DeviceAttribute::MaxThreadsPerMultiprocessor => l.max_threads_per_sm as usize,
            DeviceAttribute::MaxBlocksPerMultiprocessor => l.max_blocks_per_sm as usize,
            DeviceAttribute::MaxSharedMemoryPerMultiprocessor => l.shared_mem_per_sm,
            DeviceAttribute::MaxRegistersPerMultiprocessor => l.registers_per_sm as usize,
            DeviceAttribute::ReservedSharedMemoryPerBlock => l.reserved_shared_mem_per_block,
            DeviceAttribute::ComputeCapabilityMajor => l.compute_capability.major as usize,
            DeviceAttribute::ComputeCapabilityMinor => l.compute_capability.minor as usize,
            DeviceAttribute::L2CacheSize => l.l2_cache_bytes,
            DeviceAttribute::ManagedMemory
            | DeviceAttribute::ConcurrentManagedAccess
            | DeviceAttribute::UnifiedAddressing
            | DeviceAttribute::CanMapHostMemory => 1,
            DeviceAttribute::PciBusId => ordinal.0 as usize + 1,
        };
        i32::try_from(value).unwrap_or(i32::MAX)
    }
}

/// Simulated platform settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Devices, in ordinal order.
    pub devices: Vec<SimDeviceConfig>,
    /// Run stream work at enqueue time instead of deferring it.
    pub eager: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::with_devices(vec![SimDeviceConfig::default()])
    }
}

impl SimConfig {
    /// Deferred execution over `devices`.
    pub fn with_devices(devices: Vec<SimDeviceConfig>) -> Self {
        Self {
            devices,
            eager: false,
        }
    }

    /// Choose eager or deferred execution.
    #[must_use]
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }
}

struct SimDevice {
    config: SimDeviceConfig,
    retains: u32,
}

pub(crate) struct State {
    initialized: bool,
    devices: Vec<SimDevice>,
    pub(crate) memory: MemoryTable,
    pub(crate) streams: HashMap<StreamKey, SimStream>,
    pub(crate) events: HashMap<u64, SimEvent>,
    pub(crate) functions: HashMap<u64, SimFunction>,
    pub(crate) next_seq: u64,
    pub(crate) launches: u64,
    pub(crate) eager: bool,
    next_handle: u64,
}

impl State {
    fn device(&self, id: DeviceId) -> PlatformResult<&SimDevice> {
        self.devices.get(id.0 as usize).ok_or(Status::INVALID_DEVICE)
    }

    fn limits(&self, id: DeviceId) -> PlatformResult<ArchitectureLimits> {
        Ok(self.device(id)?.config.limits)
    }

    fn next_handle(&mut self, tag: u64) -> u64 {
        self.next_handle += 1;
        tag | self.next_handle
    }

    fn context_device(&self, context: ContextHandle) -> PlatformResult<DeviceId> {
        let ordinal = context
            .0
            .checked_sub(CONTEXT_BASE)
            .ok_or(Status::INVALID_CONTEXT)?;
        match self.devices.get(ordinal as usize) {
            Some(device) if device.retains > 0 => Ok(DeviceId(ordinal as u32)),
            _ => Err(Status::INVALID_CONTEXT),
        }
    }

    /// Resolve a stream handle against the current device.
    fn stream_key(&mut self, handle: StreamHandle, device: DeviceId) -> PlatformResult<StreamKey> {
        if handle == StreamHandle::DEFAULT {
            let key = StreamKey::Default(device);
            self.streams
                .entry(key)
                .or_insert_with(|| SimStream::new(device, true, PRIORITY_RANGE.0));
            return Ok(key);
        }
        let key = StreamKey::Created(handle.0);
        match self.streams.get(&key) {
            Some(stream) if stream.device == device => Ok(key),
            _ => Err(Status::INVALID_HANDLE),
        }
    }

    fn function(&self, function: FunctionHandle) -> PlatformResult<&SimFunction> {
        self.functions.get(&function.0).ok_or(Status::INVALID_HANDLE)
    }

    fn event(&self, event: EventHandle) -> PlatformResult<&SimEvent> {
        self.events.get(&event.0).ok_or(Status::INVALID_HANDLE)
    }

    fn enqueue(&mut self, key: StreamKey, op: Op) -> PlatformResult<u64> {
        let seq = self.push(key, op)?;
        self.settle(key, seq);
        Ok(seq)
    }

    fn allocate_device(&mut self, device: DeviceId, bytes: usize) -> PlatformResult<DevicePtr> {
        if bytes == 0 {
            return Err(Status::INVALID_VALUE);
        }
        let capacity = self.device(device)?.config.total_memory;
        if self.memory.device_bytes(device) + bytes > capacity {
            return Err(Status::OUT_OF_MEMORY);
        }
        let address = self
            .memory
            .allocate(device, AllocationKind::Device, bytes, false)?;
        Ok(DevicePtr(address))
    }
}

#[derive(Default)]
struct CallLog {
    counts: HashMap<&'static str, u64>,
    total: u64,
    failures: HashMap<&'static str, Status>,
}

/// Host-side stand-in for a GPU driver.
pub struct SimPlatform {
    id: u64,
    state: Mutex<State>,
    calls: Mutex<CallLog>,
}

impl SimPlatform {
    /// Create a platform. The driver still has to be initialised.
    pub fn new(config: SimConfig) -> Self {
        let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        info!(
            instance = id,
            devices = config.devices.len(),
            eager = config.eager,
            "simulated platform created"
        );
        Self {
            id,
            state: Mutex::new(State {
                initialized: false,
                devices: config
                    .devices
                    .into_iter()
                    .map(|config| SimDevice { config, retains: 0 })
                    .collect(),
                memory: MemoryTable::default(),
                streams: HashMap::new(),
                events: HashMap::new(),
                functions: HashMap::new(),
                next_seq: 0,
                launches: 0,
                eager: config.eager,
                next_handle: 0,
            }),
            calls: Mutex::new(CallLog::default()),
        }
    }

    /// Times the platform method `name` was called.
    pub fn call_count(&self, name: &str) -> u64 {
        self.calls.lock().counts.get(name).copied().unwrap_or(0)
    }

    /// Platform calls of any kind so far.
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().total
    }

    /// Make every later call to `name` fail with `status` until cleared.
    pub fn fail_calls(&self, name: &'static str, status: Status) {
        self.calls.lock().failures.insert(name, status);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.calls.lock().failures.clear();
    }

    /// Kernel launches that have executed.
    pub fn launch_count(&self) -> u64 {
        self.state.lock().launches
    }

    /// Run all deferred work on every stream.
    pub fn run_pending(&self) {
        self.state.lock().drain_all();
    }

    /// Register a host closure as a function of `device`.
    ///
    /// The body runs while the platform is locked and must not call back into it.
    pub fn register_kernel<F>(
        &self,
        device: DeviceId,
        spec: SimKernelSpec,
        body: F,
    ) -> std::result::Result<FunctionHandle, Status>
    where
        F: Fn(&SimLaunch<'_>) -> std::result::Result<(), Status> + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let limits = state.limits(device)?;
        let handle = state.next_handle(FUNCTION_TAG);
        debug!(
            device = device.0,
            name = %spec.name,
            function = handle,
            "simulated kernel registered"
        );
        state.functions.insert(
            handle,
            SimFunction::new(device, spec, Arc::new(body), &limits),
        );
        Ok(FunctionHandle(handle))
    }

    fn enter(&self, name: &'static str) -> PlatformResult<()> {
        let mut calls = self.calls.lock();
        *calls.counts.entry(name).or_insert(0) += 1;
        calls.total += 1;
        match calls.failures.get(name) {
            Some(status) => Err(*status),
            None => Ok(()),
        }
    }

    /// Count the call, then lock the initialised state.
    fn begin(&self, name: &'static str) -> PlatformResult<MutexGuard<'_, State>> {
        self.enter(name)?;
        let state = self.state.lock();
        if !state.initialized {
            return Err(Status::NOT_INITIALIZED);
        }
        Ok(state)
    }

    fn current(&self) -> Option<ContextHandle> {
        CURRENT.with(|current| current.borrow().get(&self.id).copied())
    }

    fn current_device(&self, state: &State) -> PlatformResult<DeviceId> {
        let context = self.current().ok_or(Status::INVALID_CONTEXT)?;
        state.context_device(context)
    }
}

impl fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimPlatform")
            .field("id", &self.id)
            .field("total_calls", &self.total_calls())
            .finish()
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &str {
        "sim"
    }

    fn initialize(&self, flags: u32) -> PlatformResult<()> {
        self.enter("initialize")?;
        if flags != 0 {
            return Err(Status::INVALID_VALUE);
        }
        self.state.lock().initialized = true;
        Ok(())
    }

    fn device_count(&self) -> PlatformResult<u32> {
        let state = self.begin("device_count")?;
        match state.devices.len() {
            0 => Err(Status::NO_DEVICE),
            n => Ok(n as u32),
        }
    }

    fn device_name(&self, device: DeviceId) -> PlatformResult<String> {
        let state = self.begin("device_name")?;
        Ok(state.device(device)?.config.name.clone())
    }

    fn device_attribute(
        &self,
        device: DeviceId,
        attribute: DeviceAttribute,
    ) -> PlatformResult<i32> {
        let state = self.begin("device_attribute")?;
        Ok(state.device(device)?.config.attribute(device, attribute))
    }

    fn device_total_memory(&self, device: DeviceId) -> PlatformResult<usize> {
        let state = self.begin("device_total_memory")?;
        Ok(state.device(device)?.config.total_memory)
    }

    fn primary_context_retain(&self, device: DeviceId) -> PlatformResult<ContextHandle> {
        let mut state = self.begin("primary_context_retain")?;
        let slot = state
            .devices
            .get_mut(device.0 as usize)
            .ok_or(Status::INVALID_DEVICE)?;
        slot.retains += 1;
        Ok(ContextHandle(CONTEXT_BASE + u64::from(device.0)))
    }

    fn primary_context_release(&self, device: DeviceId) -> PlatformResult<()> {
        let mut state = self.begin("primary_context_release")?;
        let slot = state
            .devices
            .get_mut(device.0 as usize)
            .ok_or(Status::INVALID_DEVICE)?;
        if slot.retains == 0 {
            return Err(Status::INVALID_CONTEXT);
        }
        slot.retains -= 1;
        Ok(())
    }

    fn context_device(&self, context: ContextHandle) -> PlatformResult<DeviceId> {
        let state = self.begin("context_device")?;
        state.context_device(context)
    }

    fn current_context(&self) -> PlatformResult<Option<ContextHandle>> {
        let _state = self.begin("current_context")?;
        Ok(self.current())
    }

    fn set_current_context(&self, context: Option<ContextHandle>) -> PlatformResult<()> {
        let state = self.begin("set_current_context")?;
        if let Some(context) = context {
            state.context_device(context)?;
        }
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            match context {
                Some(context) => current.insert(self.id, context),
                None => current.remove(&self.id),
            }
        });
        Ok(())
    }

    fn context_synchronize(&self) -> PlatformResult<()> {
        let mut state = self.begin("context_synchronize")?;
        let device = self.current_device(&state)?;
        state.drain_device(device)
    }

    fn memory_info(&self) -> PlatformResult<(usize, usize)> {
        let state = self.begin("memory_info")?;
        let device = self.current_device(&state)?;
        let total = state.device(device)?.config.total_memory;
        let used = state.memory.device_bytes(device);
        Ok((total.saturating_sub(used), total))
    }

    fn stream_create(
        &self,
        synchronizes_with_default: bool,
        priority: i32,
    ) -> PlatformResult<StreamHandle> {
        let mut state = self.begin("stream_create")?;
        let device = self.current_device(&state)?;
        let (least, greatest) = PRIORITY_RANGE;
        let priority = priority.clamp(greatest, least);
        let handle = state.next_handle(STREAM_TAG);
        state.streams.insert(
            StreamKey::Created(handle),
            SimStream::new(device, synchronizes_with_default, priority),
        );
        Ok(StreamHandle(handle))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> PlatformResult<()> {
        let mut state = self.begin("stream_destroy")?;
        let device = self.current_device(&state)?;
        if stream == StreamHandle::DEFAULT {
            return Err(Status::INVALID_HANDLE);
        }
        let key = state.stream_key(stream, device)?;
        state.drain(key, u64::MAX);
        state.streams.remove(&key);
        Ok(())
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> PlatformResult<()> {
        let mut state = self.begin("stream_synchronize")?;
        let device = self.current_device(&state)?;
        let key = state.stream_key(stream, device)?;
        state.synchronize_stream(key)
    }

    fn stream_query(&self, stream: StreamHandle) -> PlatformResult<bool> {
        let mut state = self.begin("stream_query")?;
        let device = self.current_device(&state)?;
        let key = state.stream_key(stream, device)?;
        let record = state.streams.get_mut(&key).ok_or(Status::INVALID_HANDLE)?;
        match record.take_fault() {
            Some(status) => Err(status),
            None => Ok(record.is_idle()),
        }
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> PlatformResult<()> {
        let mut state = self.begin("stream_wait_event")?;
        let device = self.current_device(&state)?;
        let key = state.stream_key(stream, device)?;
        let recorded = state.event(event)?.recorded;
        if let Some((source, seq)) = recorded {
            state.enqueue(key, Op::Wait { stream: source, seq })?;
        }
        Ok(())
    }

    fn stream_priority(&self, stream: StreamHandle) -> PlatformResult<i32> {
        let mut state = self.begin("stream_priority")?;
        let device = self.current_device(&state)?;
        let key = state.stream_key(stream, device)?;
        state
            .streams
            .get(&key)
            .map(|s| s.priority)
            .ok_or(Status::INVALID_HANDLE)
    }

    fn stream_priority_range(&self) -> PlatformResult<(i32, i32)> {
        let state = self.begin("stream_priority_range")?;
        self.current_device(&state)?;
        Ok(PRIORITY_RANGE)
    }

    fn event_create(&self, flags: RawEventFlags) -> PlatformResult<EventHandle> {
        let mut state = self.begin("event_create")?;
        let device = self.current_device(&state)?;
        if flags.interprocess && flags.timing {
            return Err(Status::INVALID_VALUE);
        }
        let handle = state.next_handle(EVENT_TAG);
        state.events.insert(
            handle,
            SimEvent {
                device,
                flags,
                recorded: None,
                reached_at: None,
            },
        );
        Ok(EventHandle(handle))
    }

    fn event_destroy(&self, event: EventHandle) -> PlatformResult<()> {
        let mut state = self.begin("event_destroy")?;
        state
            .events
            .remove(&event.0)
            .map(|_| ())
            .ok_or(Status::INVALID_HANDLE)
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> PlatformResult<()> {
        let mut state = self.begin("event_record")?;
        let device = self.current_device(&state)?;
        if state.event(event)?.device != device {
            return Err(Status::INVALID_HANDLE);
        }
        let key = state.stream_key(stream, device)?;
        let seq = state.push(key, Op::Record { event: event.0 })?;
        if let Some(record) = state.events.get_mut(&event.0) {
            record.recorded = Some((key, seq));
            record.reached_at = None;
        }
        state.settle(key, seq);
        Ok(())
    }

    fn event_query(&self, event: EventHandle) -> PlatformResult<bool> {
        let state = self.begin("event_query")?;
        let record = state.event(event)?;
        Ok(state.event_reached(record))
    }

    fn event_synchronize(&self, event: EventHandle) -> PlatformResult<()> {
        let mut state = self.begin("event_synchronize")?;
        let recorded = state.event(event)?.recorded;
        if let Some((key, seq)) = recorded {
            state.drain(key, seq);
        }
        Ok(())
    }

    fn event_elapsed(&self, start: EventHandle, end: EventHandle) -> PlatformResult<f32> {
        let state = self.begin("event_elapsed")?;
        let timestamp = |handle| -> PlatformResult<_> {
            let record = state.event(handle)?;
            if !record.flags.timing || record.recorded.is_none() {
                return Err(Status::INVALID_HANDLE);
            }
            record.reached_at.ok_or(Status::NOT_READY)
        };
        let (from, to) = (timestamp(start)?, timestamp(end)?);
        let ms = if to >= from {
            to.duration_since(from).as_secs_f64() * 1000.0
        } else {
            -(from.duration_since(to).as_secs_f64() * 1000.0)
        };
        Ok(ms as f32)
    }

    fn ipc_event_handle(&self, event: EventHandle) -> PlatformResult<[u8; IPC_HANDLE_SIZE]> {
        let state = self.begin("ipc_event_handle")?;
        if !state.event(event)?.flags.interprocess {
            return Err(Status::INVALID_VALUE);
        }
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        bytes[..8].copy_from_slice(&self.id.to_le_bytes());
        bytes[8..16].copy_from_slice(&event.0.to_le_bytes());
        Ok(bytes)
    }

    fn ipc_open_event(&self, handle: &[u8; IPC_HANDLE_SIZE]) -> PlatformResult<EventHandle> {
        let state = self.begin("ipc_open_event")?;
        let word = |range: std::ops::Range<usize>| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&handle[range]);
            u64::from_le_bytes(raw)
        };
        if word(0..8) != self.id {
            return Err(Status::INVALID_VALUE);
        }
        let event = EventHandle(word(8..16));
        match state.event(event) {
            Ok(record) if record.flags.interprocess => Ok(event),
            _ => Err(Status::INVALID_VALUE),
        }
    }

    fn mem_alloc(&self, bytes: usize) -> PlatformResult<DevicePtr> {
        let mut state = self.begin("mem_alloc")?;
        let device = self.current_device(&state)?;
        state.allocate_device(device, bytes)
    }

    fn mem_free(&self, ptr: DevicePtr) -> PlatformResult<()> {
        let mut state = self.begin("mem_free")?;
        self.current_device(&state)?;
        state.memory.free(ptr.0, AllocationKind::Device)
    }

    fn mem_alloc_async(&self, bytes: usize, stream: StreamHandle) -> PlatformResult<DevicePtr> {
        let mut state = self.begin("mem_alloc_async")?;
        let device = self.current_device(&state)?;
        state.stream_key(stream, device)?;
        state.allocate_device(device, bytes)
    }

    fn mem_free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> PlatformResult<()> {
        let mut state = self.begin("mem_free_async")?;
        let device = self.current_device(&state)?;
        let key = state.stream_key(stream, device)?;
        if !state.memory.is_live(ptr.0, AllocationKind::Device) {
            return Err(Status::INVALID_VALUE);
        }
        state.enqueue(key, Op::Free { address: ptr.0 })?;
        Ok(())
    }

    fn mem_alloc_managed(
        &self,
        bytes: usize,
        _visibility: InitialVisibility,
    ) -> PlatformResult<DevicePtr> {
        let mut state = self.begin("mem_alloc_managed")?;
        let device = self.current_device(&state)?;
        if bytes == 0 {
            return Err(Status::INVALID_VALUE);
        }
        let address = state
            .memory
            .allocate(device, AllocationKind::Managed, bytes, false)?;
        Ok(DevicePtr(address))
    }

    fn mem_alloc_host(&self, bytes: usize, options: HostAllocOptions) -> PlatformResult<u64> {
        let mut state = self.begin("mem_alloc_host")?;
        let device = self.current_device(&state)?;
        if bytes == 0 {
            return Err(Status::INVALID_VALUE);
        }
        state
            .memory
            .allocate(device, AllocationKind::Pinned, bytes, options.device_mapped)
    }

    fn mem_free_host(&self, host: u64) -> PlatformResult<()> {
        let mut state = self.begin("mem_free_host")?;
        state.memory.free(host, AllocationKind::Pinned)
    }

    fn mem_host_device_pointer(&self, host: u64) -> PlatformResult<DevicePtr> {
        let state = self.begin("mem_host_device_pointer")?;
        state.memory.device_alias(host).map(DevicePtr)
    }

    fn memcpy(&self, dst: u64, src: u64, bytes: usize) -> PlatformResult<()> {
        let mut state = self.begin("memcpy")?;
        let device = self.current_device(&state)?;
        state.drain_legacy(device);
        state.memory.copy(dst, src, bytes)
    }

    fn memcpy_async(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> PlatformResult<()> {
        let mut state = self.begin("memcpy_async")?;
        let device = self.current_device(&state)?;
        let key = state.stream_key(stream, device)?;
        state.memory.resolve(dst, bytes)?;
        state.memory.resolve(src, bytes)?;
        state.enqueue(key, Op::Copy { dst, src, bytes })?;
        Ok(())
    }

    fn memset(&self, dst: u64, value: u8, bytes: usize) -> PlatformResult<()> {
        let mut state = self.begin("memset")?;
        let device = self.current_device(&state)?;
        state.drain_legacy(device);
        state.memory.fill(dst, value, bytes)
    }

    fn memset_async(
        &self,
        dst: u64,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> PlatformResult<()> {
        let mut state = self.begin("memset_async")?;
        let device = self.current_device(&state)?;
        let key = state.stream_key(stream, device)?;
        state.memory.resolve(dst, bytes)?;
        state.enqueue(key, Op::Fill { dst, value, bytes })?;
        Ok(())
    }

    fn mem_advise(
        &self,
        ptr: DevicePtr,
        bytes: usize,
        advice: MemoryAdvice,
        location: Location,
    ) -> PlatformResult<()> {
        let mut state = self.begin("mem_advise")?;
        if let Location::Device(device) = location {
            state.device(device)?;
        }
        let managed = state.memory.managed_mut(ptr.0, bytes)?;
        match advice {
            MemoryAdvice::SetReadMostly => managed.read_mostly = true,
            MemoryAdvice::UnsetReadMostly => managed.read_mostly = false,
            MemoryAdvice::SetPreferredLocation => managed.preferred = Some(location),
            MemoryAdvice::UnsetPreferredLocation => managed.preferred = None,
            MemoryAdvice::SetAccessedBy | MemoryAdvice::UnsetAccessedBy => {
                let Location::Device(device) = location else {
                    return Err(Status::INVALID_VALUE);
                };
                if advice == MemoryAdvice::SetAccessedBy {
                    managed.accessed_by.insert(device);
                } else {
                    managed.accessed_by.remove(&device);
                }
            }
        }
        Ok(())
    }

    fn mem_prefetch_async(
        &self,
        ptr: DevicePtr,
        bytes: usize,
        destination: Location,
        stream: StreamHandle,
    ) -> PlatformResult<()> {
        let mut state = self.begin("mem_prefetch_async")?;
        let device = self.current_device(&state)?;
        let key = state.stream_key(stream, device)?;
        if let Location::Device(target) = destination {
            state.device(target)?;
        }
        state.memory.managed_mut(ptr.0, bytes)?;
        state.enqueue(
            key,
            Op::Prefetch {
                address: ptr.0,
                bytes,
                destination,
            },
        )?;
        Ok(())
    }

    fn mem_range_preferred_location(
        &self,
        ptr: DevicePtr,
        bytes: usize,
    ) -> PlatformResult<Option<Location>> {
        let mut state = self.begin("mem_range_preferred_location")?;
        Ok(state.memory.managed_mut(ptr.0, bytes)?.preferred)
    }

    fn mem_range_accessed_by(&self, ptr: DevicePtr, bytes: usize) -> PlatformResult<Vec<DeviceId>> {
        let mut state = self.begin("mem_range_accessed_by")?;
        Ok(state
            .memory
            .managed_mut(ptr.0, bytes)?
            .accessed_by
            .iter()
            .copied()
            .collect())
    }

    fn function_attribute(
        &self,
        function: FunctionHandle,
        attribute: FunctionAttribute,
    ) -> PlatformResult<i32> {
        let state = self.begin("function_attribute")?;
        let record = state.function(function)?;
        let limits = state.limits(record.device)?;
        Ok(record.attribute(attribute, &limits))
    }

    fn set_function_attribute(
        &self,
        function: FunctionHandle,
        attribute: FunctionAttribute,
        value: i32,
    ) -> PlatformResult<()> {
        let mut state = self.begin("set_function_attribute")?;
        let device = self.current_device(&state)?;
        let owner = state.function(function)?.device;
        if owner != device {
            return Err(Status::INVALID_CONTEXT);
        }
        let limits = state.limits(owner)?;
        state
            .functions
            .get_mut(&function.0)
            .ok_or(Status::INVALID_HANDLE)?
            .set_attribute(attribute, value, &limits)
    }

    fn set_function_cache_preference(
        &self,
        function: FunctionHandle,
        preference: CachePreference,
    ) -> PlatformResult<()> {
        let mut state = self.begin("set_function_cache_preference")?;
        let device = self.current_device(&state)?;
        let record = state
            .functions
            .get_mut(&function.0)
            .ok_or(Status::INVALID_HANDLE)?;
        if record.device != device {
            return Err(Status::INVALID_CONTEXT);
        }
        record.cache_preference = preference;
        Ok(())
    }

    fn set_function_shared_memory_bank_size(
        &self,
        function: FunctionHandle,
        size: SharedMemoryBankSize,
    ) -> PlatformResult<()> {
        let mut state = self.begin("set_function_shared_memory_bank_size")?;
        let device = self.current_device(&state)?;
        let record = state
            .functions
            .get_mut(&function.0)
            .ok_or(Status::INVALID_HANDLE)?;
        if record.device != device {
            return Err(Status::INVALID_CONTEXT);
        }
        record.bank_size = size;
        Ok(())
    }

    fn occupancy_max_active_blocks(
        &self,
        function: FunctionHandle,
        block_size: u32,
        dynamic_shared_memory: usize,
        _disable_caching_override: bool,
    ) -> PlatformResult<u32> {
        let state = self.begin("occupancy_max_active_blocks")?;
        let device = self.current_device(&state)?;
        let record = state.function(function)?;
        if record.device != device {
            return Err(Status::INVALID_CONTEXT);
        }
        let limits = state.limits(device)?;
        Ok(record.occupancy(block_size, dynamic_shared_memory, &limits))
    }

    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        args: &KernelArgs,
    ) -> PlatformResult<()> {
        let mut state = self.begin("launch_kernel")?;
        let device = self.current_device(&state)?;
        let record = state.function(function)?;
        if record.device != device {
            return Err(Status::INVALID_HANDLE);
        }
        let limits = state.limits(device)?;
        record.check_launch(config, &limits)?;
        let key = state.stream_key(stream, device)?;
        state.enqueue(
            key,
            Op::Launch {
                function: function.0,
                config: *config,
                args: args.clone(),
            },
        )?;
        Ok(())
    }
}

/// A runtime over a fresh simulated platform with `devices` default devices.
pub fn simulated_runtime(devices: usize) -> Result<(Runtime, Arc<SimPlatform>)> {
    simulated_runtime_with(vec![SimDeviceConfig::default(); devices])
}

/// A runtime over a fresh simulated platform with the given devices.
pub fn simulated_runtime_with(
    devices: Vec<SimDeviceConfig>,
) -> Result<(Runtime, Arc<SimPlatform>)> {
    simulated_runtime_with_config(SimConfig::with_devices(devices))
}

/// A runtime over a fresh simulated platform.
pub fn simulated_runtime_with_config(config: SimConfig) -> Result<(Runtime, Arc<SimPlatform>)> {
    let sim = Arc::new(SimPlatform::new(config));
    let runtime = Runtime::with_platform(sim.clone())?;
    Ok((runtime, sim))
}
