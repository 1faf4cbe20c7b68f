//! [`Platform`] over the CUDA driver API.
//!
//! Each method is a direct `cu*` call. Raw CUDA handles are pointers; they
//! travel through the core as their integer address.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::ptr;

use cudarc::driver::sys as cuda_sys;
use cudarc::driver::sys::{
    CUdevice_attribute as DevAttr, CUfunction_attribute as FnAttr, CUresult,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use gpuhost_core::error::{Error, PlatformResult, Result, Status};
use gpuhost_core::launch::{KernelArgs, LaunchConfig};
use gpuhost_core::platform::{
    CachePreference, ContextHandle, DeviceAttribute, DeviceId, DevicePtr, EventHandle,
    FunctionAttribute, FunctionHandle, HostAllocOptions, InitialVisibility, Location,
    MemoryAdvice, Platform, RawEventFlags, SharedMemoryBankSize, StreamHandle, IPC_HANDLE_SIZE,
};

const CU_DEVICE_CPU: cuda_sys::CUdevice = -1;
const CU_DEVICE_INVALID: cuda_sys::CUdevice = -2;

const CU_EVENT_BLOCKING_SYNC: u32 = 0x1;
const CU_EVENT_DISABLE_TIMING: u32 = 0x2;
const CU_EVENT_INTERPROCESS: u32 = 0x4;

const CU_STREAM_NON_BLOCKING: u32 = 0x1;

const CU_MEM_ATTACH_GLOBAL: u32 = 0x1;
const CU_MEM_ATTACH_HOST: u32 = 0x2;

const CU_OCCUPANCY_DISABLE_CACHING_OVERRIDE: u32 = 0x1;

/// Translate a driver result into the core status type.
#[inline]
pub(crate) fn check(result: CUresult) -> PlatformResult<()> {
    if result == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Status(result as i32))
    }
}

/// Map `CUDA_ERROR_NOT_READY` to `false` for the polling calls.
#[inline]
fn poll(result: CUresult) -> PlatformResult<bool> {
    match result {
        CUresult::CUDA_SUCCESS => Ok(true),
        CUresult::CUDA_ERROR_NOT_READY => Ok(false),
        other => Err(Status(other as i32)),
    }
}

fn context_ptr(context: ContextHandle) -> cuda_sys::CUcontext {
    context.0 as usize as cuda_sys::CUcontext
}

fn stream_ptr(stream: StreamHandle) -> cuda_sys::CUstream {
    stream.0 as usize as cuda_sys::CUstream
}

fn event_ptr(event: EventHandle) -> cuda_sys::CUevent {
    event.0 as usize as cuda_sys::CUevent
}

fn function_ptr(function: FunctionHandle) -> cuda_sys::CUfunction {
    function.0 as usize as cuda_sys::CUfunction
}

fn device_attribute(attribute: DeviceAttribute) -> DevAttr {
    match attribute {
        DeviceAttribute::MaxThreadsPerBlock => DevAttr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
        DeviceAttribute::MaxBlockDimX => DevAttr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X,
        DeviceAttribute::MaxBlockDimY => DevAttr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y,
        DeviceAttribute::MaxBlockDimZ => DevAttr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z,
        DeviceAttribute::MaxGridDimX => DevAttr::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X,
        DeviceAttribute::MaxGridDimY => DevAttr::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y,
        DeviceAttribute::MaxGridDimZ => DevAttr::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z,
        DeviceAttribute::MaxSharedMemoryPerBlock => {
            DevAttr::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK
        }
        DeviceAttribute::MaxSharedMemoryPerBlockOptin => {
            DevAttr::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK_OPTIN
        }
        DeviceAttribute::TotalConstantMemory => DevAttr::CU_DEVICE_ATTRIBUTE_TOTAL_CONSTANT_MEMORY,
        DeviceAttribute::WarpSize => DevAttr::CU_DEVICE_ATTRIBUTE_WARP_SIZE,
        DeviceAttribute::MaxRegistersPerBlock => {
            DevAttr::CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_BLOCK
        }
        DeviceAttribute::ClockRateKhz => DevAttr::CU_DEVICE_ATTRIBUTE_CLOCK_RATE,
        DeviceAttribute::MultiprocessorCount => DevAttr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
        DeviceAttribute::MaxThreadsPerMultiprocessor => {
            DevAttr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_MULTIPROCESSOR
        }
        DeviceAttribute::MaxBlocksPerMultiprocessor => {
            DevAttr::CU_DEVICE_ATTRIBUTE_MAX_BLOCKS_PER_MULTIPROCESSOR
        }
        DeviceAttribute::MaxSharedMemoryPerMultiprocessor => {
            DevAttr::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_MULTIPROCESSOR
        }
        DeviceAttribute::MaxRegistersPerMultiprocessor => {
            DevAttr::CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_MULTIPROCESSOR
        }
        DeviceAttribute::ReservedSharedMemoryPerBlock => {
            DevAttr::CU_DEVICE_ATTRIBUTE_RESERVED_SHARED_MEMORY_PER_BLOCK
        }
        DeviceAttribute::ComputeCapabilityMajor => {
            DevAttr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR
        }
        DeviceAttribute::ComputeCapabilityMinor => {
            DevAttr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR
        }
        DeviceAttribute::L2CacheSize => DevAttr::CU_DEVICE_ATTRIBUTE_L2_CACHE_SIZE,
        DeviceAttribute::ManagedMemory => DevAttr::CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY,
        DeviceAttribute::ConcurrentManagedAccess => {
            DevAttr::CU_DEVICE_ATTRIBUTE_CONCURRENT_MANAGED_ACCESS
        }
        DeviceAttribute::UnifiedAddressing => DevAttr::CU_DEVICE_ATTRIBUTE_UNIFIED_ADDRESSING,
        DeviceAttribute::CanMapHostMemory => DevAttr::CU_DEVICE_ATTRIBUTE_CAN_MAP_HOST_MEMORY,
        DeviceAttribute::PciBusId => DevAttr::CU_DEVICE_ATTRIBUTE_PCI_BUS_ID,
    }
}

fn function_attribute(attribute: FunctionAttribute) -> FnAttr {
    match attribute {
        FunctionAttribute::MaxThreadsPerBlock => FnAttr::CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
        FunctionAttribute::SharedSizeBytes => FnAttr::CU_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES,
        FunctionAttribute::ConstSizeBytes => FnAttr::CU_FUNC_ATTRIBUTE_CONST_SIZE_BYTES,
        FunctionAttribute::LocalSizeBytes => FnAttr::CU_FUNC_ATTRIBUTE_LOCAL_SIZE_BYTES,
        FunctionAttribute::NumRegs => FnAttr::CU_FUNC_ATTRIBUTE_NUM_REGS,
        FunctionAttribute::PtxVersion => FnAttr::CU_FUNC_ATTRIBUTE_PTX_VERSION,
        FunctionAttribute::BinaryVersion => FnAttr::CU_FUNC_ATTRIBUTE_BINARY_VERSION,
        FunctionAttribute::CacheModeCa => FnAttr::CU_FUNC_ATTRIBUTE_CACHE_MODE_CA,
        FunctionAttribute::MaxDynamicSharedSizeBytes => {
            FnAttr::CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES
        }
        FunctionAttribute::PreferredSharedMemoryCarveout => {
            FnAttr::CU_FUNC_ATTRIBUTE_PREFERRED_SHARED_MEMORY_CARVEOUT
        }
    }
}

fn location_device(location: Location) -> cuda_sys::CUdevice {
    match location {
        Location::Host => CU_DEVICE_CPU,
        Location::Device(id) => id.0 as cuda_sys::CUdevice,
    }
}

/// CUDA driver platform.
pub struct CudaPlatform {
    /// Device of every primary context handed out, so lookups need no context switch.
    contexts: Mutex<HashMap<u64, DeviceId>>,
}

impl CudaPlatform {
    /// Bind to the installed CUDA driver.
    ///
    /// Fails with `BackendUnavailable` when the driver library cannot be loaded.
    pub fn new() -> Result<Self> {
        let loaded = std::panic::catch_unwind(|| {
            // SAFETY: cuInit has no preconditions; flags must be zero.
            unsafe { cuda_sys::cuInit(0) }
        });
        match loaded {
            Ok(result) => {
                check(result).map_err(|status| {
                    Error::BackendUnavailable(format!(
                        "CUDA driver failed to initialize: {}",
                        status
                    ))
                })?;
            }
            Err(_) => {
                return Err(Error::BackendUnavailable(
                    "CUDA driver library not found".to_string(),
                ))
            }
        }
        info!("CUDA platform loaded");
        Ok(Self {
            contexts: Mutex::new(HashMap::new()),
        })
    }

    fn cu_device(&self, device: DeviceId) -> PlatformResult<cuda_sys::CUdevice> {
        let mut raw: cuda_sys::CUdevice = 0;
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuDeviceGet(&mut raw, device.0 as i32) })?;
        Ok(raw)
    }

    fn range_attribute(
        &self,
        ptr: DevicePtr,
        bytes: usize,
        attribute: cuda_sys::CUmem_range_attribute,
        out: &mut [i32],
    ) -> PlatformResult<()> {
        // SAFETY: `out` is writable for its whole length.
        check(unsafe {
            cuda_sys::cuMemRangeGetAttribute(
                out.as_mut_ptr() as *mut c_void,
                std::mem::size_of_val(out),
                attribute,
                ptr.0,
                bytes,
            )
        })
    }
}

impl std::fmt::Debug for CudaPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaPlatform")
            .field("contexts", &self.contexts.lock().len())
            .finish()
    }
}

impl Platform for CudaPlatform {
    fn name(&self) -> &str {
        "cuda"
    }

    fn initialize(&self, flags: u32) -> PlatformResult<()> {
        // SAFETY: plain driver call.
        check(unsafe { cuda_sys::cuInit(flags) })
    }

    fn device_count(&self) -> PlatformResult<u32> {
        let mut count = 0i32;
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuDeviceGetCount(&mut count) })?;
        if count == 0 {
            return Err(Status(CUresult::CUDA_ERROR_NO_DEVICE as i32));
        }
        Ok(count as u32)
    }

    fn device_name(&self, device: DeviceId) -> PlatformResult<String> {
        let raw = self.cu_device(device)?;
        let mut buffer = [0 as c_char; 256];
        // SAFETY: the driver writes a NUL-terminated string of at most `len` bytes.
        check(unsafe { cuda_sys::cuDeviceGetName(buffer.as_mut_ptr(), buffer.len() as i32, raw) })?;
        // SAFETY: NUL-terminated by the driver.
        let name = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    fn device_attribute(
        &self,
        device: DeviceId,
        attribute: DeviceAttribute,
    ) -> PlatformResult<i32> {
        let raw = self.cu_device(device)?;
        let mut value = 0i32;
        // SAFETY: out-pointer to a local.
        check(unsafe {
            cuda_sys::cuDeviceGetAttribute(&mut value, device_attribute(attribute), raw)
        })?;
        Ok(value)
    }

    fn device_total_memory(&self, device: DeviceId) -> PlatformResult<usize> {
        let raw = self.cu_device(device)?;
        let mut bytes = 0usize;
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuDeviceTotalMem_v2(&mut bytes, raw) })?;
        Ok(bytes)
    }

    fn primary_context_retain(&self, device: DeviceId) -> PlatformResult<ContextHandle> {
        let raw = self.cu_device(device)?;
        let mut context: cuda_sys::CUcontext = ptr::null_mut();
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuDevicePrimaryCtxRetain(&mut context, raw) })?;
        let handle = ContextHandle(context as usize as u64);
        self.contexts.lock().insert(handle.0, device);
        debug!(device = device.0, context = %handle, "CUDA primary context retained");
        Ok(handle)
    }

    fn primary_context_release(&self, device: DeviceId) -> PlatformResult<()> {
        let raw = self.cu_device(device)?;
        // SAFETY: balanced with a previous retain by the core.
        check(unsafe { cuda_sys::cuDevicePrimaryCtxRelease_v2(raw) })
    }

    fn context_device(&self, context: ContextHandle) -> PlatformResult<DeviceId> {
        if let Some(device) = self.contexts.lock().get(&context.0) {
            return Ok(*device);
        }
        let mut raw: cuda_sys::CUdevice = 0;
        // SAFETY: push/pop are balanced; the push fails cleanly on a bad handle.
        unsafe {
            check(cuda_sys::cuCtxPushCurrent_v2(context_ptr(context)))?;
            let queried = check(cuda_sys::cuCtxGetDevice(&mut raw));
            let mut popped: cuda_sys::CUcontext = ptr::null_mut();
            check(cuda_sys::cuCtxPopCurrent_v2(&mut popped))?;
            queried?;
        }
        Ok(DeviceId(raw as u32))
    }

    fn current_context(&self) -> PlatformResult<Option<ContextHandle>> {
        let mut context: cuda_sys::CUcontext = ptr::null_mut();
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuCtxGetCurrent(&mut context) })?;
        Ok((!context.is_null()).then(|| ContextHandle(context as usize as u64)))
    }

    fn set_current_context(&self, context: Option<ContextHandle>) -> PlatformResult<()> {
        let raw = context.map_or(ptr::null_mut(), context_ptr);
        // SAFETY: null unbinds; otherwise the handle came from this platform.
        check(unsafe { cuda_sys::cuCtxSetCurrent(raw) })
    }

    fn context_synchronize(&self) -> PlatformResult<()> {
        // SAFETY: plain driver call.
        check(unsafe { cuda_sys::cuCtxSynchronize() })
    }

    fn memory_info(&self) -> PlatformResult<(usize, usize)> {
        let (mut free, mut total) = (0usize, 0usize);
        // SAFETY: out-pointers to locals.
        check(unsafe { cuda_sys::cuMemGetInfo_v2(&mut free, &mut total) })?;
        Ok((free, total))
    }

    fn stream_create(
        &self,
        synchronizes_with_default: bool,
        priority: i32,
    ) -> PlatformResult<StreamHandle> {
        let flags = if synchronizes_with_default {
            0
        } else {
            CU_STREAM_NON_BLOCKING
        };
        let mut stream: cuda_sys::CUstream = ptr::null_mut();
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuStreamCreateWithPriority(&mut stream, flags, priority) })?;
        Ok(StreamHandle(stream as usize as u64))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> PlatformResult<()> {
        // SAFETY: the core only destroys owned streams, once.
        check(unsafe { cuda_sys::cuStreamDestroy_v2(stream_ptr(stream)) })
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> PlatformResult<()> {
        // SAFETY: plain driver call.
        check(unsafe { cuda_sys::cuStreamSynchronize(stream_ptr(stream)) })
    }

    fn stream_query(&self, stream: StreamHandle) -> PlatformResult<bool> {
        // SAFETY: plain driver call.
        poll(unsafe { cuda_sys::cuStreamQuery(stream_ptr(stream)) })
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> PlatformResult<()> {
        // SAFETY: plain driver call.
        check(unsafe { cuda_sys::cuStreamWaitEvent(stream_ptr(stream), event_ptr(event), 0) })
    }

    fn stream_priority(&self, stream: StreamHandle) -> PlatformResult<i32> {
        let mut priority = 0i32;
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuStreamGetPriority(stream_ptr(stream), &mut priority) })?;
        Ok(priority)
    }

    fn stream_priority_range(&self) -> PlatformResult<(i32, i32)> {
        let (mut least, mut greatest) = (0i32, 0i32);
        // SAFETY: out-pointers to locals.
        check(unsafe { cuda_sys::cuCtxGetStreamPriorityRange(&mut least, &mut greatest) })?;
        Ok((least, greatest))
    }

    fn event_create(&self, flags: RawEventFlags) -> PlatformResult<EventHandle> {
        let mut raw_flags = 0;
        if flags.blocking_sync {
            raw_flags |= CU_EVENT_BLOCKING_SYNC;
        }
        if !flags.timing {
            raw_flags |= CU_EVENT_DISABLE_TIMING;
        }
        if flags.interprocess {
            raw_flags |= CU_EVENT_INTERPROCESS;
        }
        let mut event: cuda_sys::CUevent = ptr::null_mut();
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuEventCreate(&mut event, raw_flags) })?;
        Ok(EventHandle(event as usize as u64))
    }

    fn event_destroy(&self, event: EventHandle) -> PlatformResult<()> {
        // SAFETY: the core only destroys owned events, once.
        check(unsafe { cuda_sys::cuEventDestroy_v2(event_ptr(event)) })
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> PlatformResult<()> {
        // SAFETY: plain driver call.
        check(unsafe { cuda_sys::cuEventRecord(event_ptr(event), stream_ptr(stream)) })
    }

    fn event_query(&self, event: EventHandle) -> PlatformResult<bool> {
        // SAFETY: plain driver call.
        poll(unsafe { cuda_sys::cuEventQuery(event_ptr(event)) })
    }

    fn event_synchronize(&self, event: EventHandle) -> PlatformResult<()> {
        // SAFETY: plain driver call.
        check(unsafe { cuda_sys::cuEventSynchronize(event_ptr(event)) })
    }

    fn event_elapsed(&self, start: EventHandle, end: EventHandle) -> PlatformResult<f32> {
        let mut ms = 0f32;
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuEventElapsedTime(&mut ms, event_ptr(start), event_ptr(end)) })?;
        Ok(ms)
    }

    fn ipc_event_handle(&self, event: EventHandle) -> PlatformResult<[u8; IPC_HANDLE_SIZE]> {
        // SAFETY: the handle is a plain byte array.
        let mut handle: cuda_sys::CUipcEventHandle = unsafe { std::mem::zeroed() };
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuIpcGetEventHandle(&mut handle, event_ptr(event)) })?;
        Ok(handle.reserved.map(|byte| byte as u8))
    }

    fn ipc_open_event(&self, handle: &[u8; IPC_HANDLE_SIZE]) -> PlatformResult<EventHandle> {
        // SAFETY: the handle is a plain byte array.
        let mut raw: cuda_sys::CUipcEventHandle = unsafe { std::mem::zeroed() };
        raw.reserved = handle.map(|byte| byte as c_char);
        let mut event: cuda_sys::CUevent = ptr::null_mut();
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuIpcOpenEventHandle(&mut event, raw) })?;
        Ok(EventHandle(event as usize as u64))
    }

    fn mem_alloc(&self, bytes: usize) -> PlatformResult<DevicePtr> {
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuMemAlloc_v2(&mut ptr, bytes) })?;
        Ok(DevicePtr(ptr))
    }

    fn mem_free(&self, ptr: DevicePtr) -> PlatformResult<()> {
        // SAFETY: the core only frees owned regions, once.
        check(unsafe { cuda_sys::cuMemFree_v2(ptr.0) })
    }

    fn mem_alloc_async(&self, bytes: usize, stream: StreamHandle) -> PlatformResult<DevicePtr> {
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuMemAllocAsync(&mut ptr, bytes, stream_ptr(stream)) })?;
        Ok(DevicePtr(ptr))
    }

    fn mem_free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> PlatformResult<()> {
        // SAFETY: the region was handed over by its owner.
        check(unsafe { cuda_sys::cuMemFreeAsync(ptr.0, stream_ptr(stream)) })
    }

    fn mem_alloc_managed(
        &self,
        bytes: usize,
        visibility: InitialVisibility,
    ) -> PlatformResult<DevicePtr> {
        let flags = match visibility {
            InitialVisibility::ToAllDevices => CU_MEM_ATTACH_GLOBAL,
            InitialVisibility::ToSupportersOnly => CU_MEM_ATTACH_HOST,
        };
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuMemAllocManaged(&mut ptr, bytes, flags) })?;
        Ok(DevicePtr(ptr))
    }

    fn mem_alloc_host(&self, bytes: usize, options: HostAllocOptions) -> PlatformResult<u64> {
        let mut flags = 0;
        if options.portable {
            flags |= cuda_sys::CU_MEMHOSTALLOC_PORTABLE;
        }
        if options.device_mapped {
            flags |= cuda_sys::CU_MEMHOSTALLOC_DEVICEMAP;
        }
        if options.write_combined {
            flags |= cuda_sys::CU_MEMHOSTALLOC_WRITECOMBINED;
        }
        let mut host: *mut c_void = ptr::null_mut();
        // SAFETY: out-pointer to a local.
        check(unsafe { cuda_sys::cuMemHostAlloc(&mut host, bytes, flags) })?;
        Ok(host as usize as u64)
    }

    fn mem_free_host(&self, host: u64) -> PlatformResult<()> {
        // SAFETY: the core only frees owned regions, once.
        check(unsafe { cuda_sys::cuMemFreeHost(host as usize as *mut c_void) })
    }

    fn mem_host_device_pointer(&self, host: u64) -> PlatformResult<DevicePtr> {
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        // SAFETY: flags must be 0.
        check(unsafe {
            cuda_sys::cuMemHostGetDevicePointer_v2(&mut ptr, host as usize as *mut c_void, 0)
        })?;
        Ok(DevicePtr(ptr))
    }

    fn memcpy(&self, dst: u64, src: u64, bytes: usize) -> PlatformResult<()> {
        // SAFETY: unified addressing; callers bounds-check both sides.
        check(unsafe { cuda_sys::cuMemcpy(dst, src, bytes) })
    }

    fn memcpy_async(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> PlatformResult<()> {
        // SAFETY: as for `memcpy`; callers keep both sides alive until completion.
        check(unsafe { cuda_sys::cuMemcpyAsync(dst, src, bytes, stream_ptr(stream)) })
    }

    fn memset(&self, dst: u64, value: u8, bytes: usize) -> PlatformResult<()> {
        // SAFETY: callers bounds-check the destination.
        check(unsafe { cuda_sys::cuMemsetD8_v2(dst, value, bytes) })
    }

    fn memset_async(
        &self,
        dst: u64,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> PlatformResult<()> {
        // SAFETY: as for `memset`.
        check(unsafe { cuda_sys::cuMemsetD8Async(dst, value, bytes, stream_ptr(stream)) })
    }

    fn mem_advise(
        &self,
        ptr: DevicePtr,
        bytes: usize,
        advice: MemoryAdvice,
        location: Location,
    ) -> PlatformResult<()> {
        use cuda_sys::CUmem_advise as Advice;
        let advice = match advice {
            MemoryAdvice::SetReadMostly => Advice::CU_MEM_ADVISE_SET_READ_MOSTLY,
            MemoryAdvice::UnsetReadMostly => Advice::CU_MEM_ADVISE_UNSET_READ_MOSTLY,
            MemoryAdvice::SetPreferredLocation => Advice::CU_MEM_ADVISE_SET_PREFERRED_LOCATION,
            MemoryAdvice::UnsetPreferredLocation => Advice::CU_MEM_ADVISE_UNSET_PREFERRED_LOCATION,
            MemoryAdvice::SetAccessedBy => Advice::CU_MEM_ADVISE_SET_ACCESSED_BY,
            MemoryAdvice::UnsetAccessedBy => Advice::CU_MEM_ADVISE_UNSET_ACCESSED_BY,
        };
        // SAFETY: advisory only.
        check(unsafe { cuda_sys::cuMemAdvise(ptr.0, bytes, advice, location_device(location)) })
    }

    fn mem_prefetch_async(
        &self,
        ptr: DevicePtr,
        bytes: usize,
        destination: Location,
        stream: StreamHandle,
    ) -> PlatformResult<()> {
        // SAFETY: migration of a managed range the caller owns.
        check(unsafe {
            cuda_sys::cuMemPrefetchAsync(
                ptr.0,
                bytes,
                location_device(destination),
                stream_ptr(stream),
            )
        })
    }

    fn mem_range_preferred_location(
        &self,
        ptr: DevicePtr,
        bytes: usize,
    ) -> PlatformResult<Option<Location>> {
        let mut value = [CU_DEVICE_INVALID];
        self.range_attribute(
            ptr,
            bytes,
            cuda_sys::CUmem_range_attribute::CU_MEM_RANGE_ATTRIBUTE_PREFERRED_LOCATION,
            &mut value,
        )?;
        Ok(match value[0] {
            CU_DEVICE_INVALID => None,
            CU_DEVICE_CPU => Some(Location::Host),
            device => Some(Location::Device(DeviceId(device as u32))),
        })
    }

    fn mem_range_accessed_by(&self, ptr: DevicePtr, bytes: usize) -> PlatformResult<Vec<DeviceId>> {
        let count = self.device_count().unwrap_or(0) as usize;
        let mut devices = vec![CU_DEVICE_INVALID; count.max(1)];
        self.range_attribute(
            ptr,
            bytes,
            cuda_sys::CUmem_range_attribute::CU_MEM_RANGE_ATTRIBUTE_ACCESSED_BY,
            &mut devices,
        )?;
        Ok(devices
            .into_iter()
            .take_while(|device| *device != CU_DEVICE_INVALID)
            .filter(|device| *device >= 0)
            .map(|device| DeviceId(device as u32))
            .collect())
    }

    fn function_attribute(
        &self,
        function: FunctionHandle,
        attribute: FunctionAttribute,
    ) -> PlatformResult<i32> {
        let mut value = 0i32;
        // SAFETY: out-pointer to a local.
        check(unsafe {
            cuda_sys::cuFuncGetAttribute(
                &mut value,
                function_attribute(attribute),
                function_ptr(function),
            )
        })?;
        Ok(value)
    }

    fn set_function_attribute(
        &self,
        function: FunctionHandle,
        attribute: FunctionAttribute,
        value: i32,
    ) -> PlatformResult<()> {
        // SAFETY: plain driver call.
        check(unsafe {
            cuda_sys::cuFuncSetAttribute(
                function_ptr(function),
                function_attribute(attribute),
                value,
            )
        })
    }

    fn set_function_cache_preference(
        &self,
        function: FunctionHandle,
        preference: CachePreference,
    ) -> PlatformResult<()> {
        use cuda_sys::CUfunc_cache as Cache;
        let config = match preference {
            CachePreference::None => Cache::CU_FUNC_CACHE_PREFER_NONE,
            CachePreference::PreferShared => Cache::CU_FUNC_CACHE_PREFER_SHARED,
            CachePreference::PreferL1 => Cache::CU_FUNC_CACHE_PREFER_L1,
            CachePreference::PreferEqual => Cache::CU_FUNC_CACHE_PREFER_EQUAL,
        };
        // SAFETY: plain driver call.
        check(unsafe { cuda_sys::cuFuncSetCacheConfig(function_ptr(function), config) })
    }

    fn set_function_shared_memory_bank_size(
        &self,
        function: FunctionHandle,
        size: SharedMemoryBankSize,
    ) -> PlatformResult<()> {
        use cuda_sys::CUsharedconfig as Banks;
        let config = match size {
            SharedMemoryBankSize::Default => Banks::CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE,
            SharedMemoryBankSize::FourBytes => Banks::CU_SHARED_MEM_CONFIG_FOUR_BYTE_BANK_SIZE,
            SharedMemoryBankSize::EightBytes => Banks::CU_SHARED_MEM_CONFIG_EIGHT_BYTE_BANK_SIZE,
        };
        // SAFETY: plain driver call.
        check(unsafe { cuda_sys::cuFuncSetSharedMemConfig(function_ptr(function), config) })
    }

    fn occupancy_max_active_blocks(
        &self,
        function: FunctionHandle,
        block_size: u32,
        dynamic_shared_memory: usize,
        disable_caching_override: bool,
    ) -> PlatformResult<u32> {
        let flags = if disable_caching_override {
            CU_OCCUPANCY_DISABLE_CACHING_OVERRIDE
        } else {
            0
        };
        let mut blocks = 0i32;
        // SAFETY: out-pointer to a local.
        check(unsafe {
            cuda_sys::cuOccupancyMaxActiveBlocksPerMultiprocessorWithFlags(
                &mut blocks,
                function_ptr(function),
                block_size as i32,
                dynamic_shared_memory,
                flags,
            )
        })?;
        Ok(blocks.max(0) as u32)
    }

    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        args: &KernelArgs,
    ) -> PlatformResult<()> {
        let mut params = args.as_param_ptrs();
        check(cuda_sys::cuLaunchKernel(
            function_ptr(function),
            config.grid.x,
            config.grid.y,
            config.grid.z,
            config.block.x,
            config.block.y,
            config.block.z,
            config.dynamic_shared_memory,
            stream_ptr(stream),
            params.as_mut_ptr(),
            ptr::null_mut(),
        ))
    }
}
