//! Stream-ordered operations.

use tracing::trace;

use crate::error::{AffinityOperation, Error, Result, StatusExt};
use crate::event::{Event, EventFlags};
use crate::launch::{self, KernelArgs, LaunchConfig, Launchable};
use crate::memory::{Region, RegionKind};
use crate::platform::Location;
use crate::stream::Stream;

/// Operations appended to the tail of a stream.
///
/// None of these block the host thread. Results are observable after the
/// stream is synchronized or after an event recorded behind them is reached.
///
/// Every region, event and kernel handed to these operations must belong to
/// the stream's device. Peer transfers between devices go through the
/// synchronous [`memory::copy`](crate::memory::copy).
#[derive(Debug, Clone, Copy)]
pub struct Enqueue<'a> {
    stream: &'a Stream,
}

impl<'a> Enqueue<'a> {
    pub(crate) fn new(stream: &'a Stream) -> Self {
        Self { stream }
    }

    fn check_same_device(&self, region: &Region) -> Result<()> {
        if region.device() != self.stream.device() {
            return Err(Error::DeviceMismatch {
                operation: AffinityOperation::StreamMemoryOperation,
                expected: self.stream.device().id(),
                actual: region.device().id(),
            });
        }
        Ok(())
    }

    /// Copy `bytes` bytes between two regions of the stream's device.
    pub fn copy(&self, dst: &mut Region, src: &Region, bytes: usize) -> Result<()> {
        self.check_same_device(dst)?;
        self.check_same_device(src)?;
        let dst_addr = dst.address()?;
        let src_addr = src.address()?;
        check_len(bytes, dst.size(), src.size())?;
        // SAFETY: both addresses come from live regions at least `bytes` long.
        unsafe { self.copy_raw(dst_addr, src_addr, bytes) }
    }

    /// Copy host memory into a region.
    ///
    /// # Safety
    ///
    /// `src` must stay alive and unmodified until the copy completes.
    pub unsafe fn copy_from_host(&self, dst: &mut Region, src: &[u8]) -> Result<()> {
        self.check_same_device(dst)?;
        let dst_addr = dst.address()?;
        check_len(src.len(), dst.size(), src.len())?;
        self.copy_raw(dst_addr, src.as_ptr() as u64, src.len())
    }

    /// Copy a region into host memory.
    ///
    /// # Safety
    ///
    /// `dst` must stay alive and must not be accessed until the copy completes.
    pub unsafe fn copy_to_host(&self, dst: &mut [u8], src: &Region) -> Result<()> {
        self.check_same_device(src)?;
        let src_addr = src.address()?;
        check_len(dst.len(), dst.len(), src.size())?;
        self.copy_raw(dst.as_mut_ptr() as u64, src_addr, dst.len())
    }

    unsafe fn copy_raw(&self, dst: u64, src: u64, bytes: usize) -> Result<()> {
        let handle = self.stream.handle()?;
        if bytes == 0 {
            return Ok(());
        }
        let _scope = self.stream.scope()?;
        trace!(stream = %handle, dst, src, bytes, "enqueue copy");
        self.stream
            .device()
            .runtime()
            .platform()
            .memcpy_async(dst, src, bytes, handle)
            .with_context(|| {
                format!("Failed scheduling a copy of {} bytes on stream {}", bytes, handle)
            })
    }

    /// Fill the first `bytes` bytes of a region with `value`.
    pub fn set(&self, dst: &mut Region, value: u8, bytes: usize) -> Result<()> {
        self.check_same_device(dst)?;
        let addr = dst.address()?;
        let handle = self.stream.handle()?;
        check_len(bytes, dst.size(), bytes)?;
        if bytes == 0 {
            return Ok(());
        }
        let _scope = self.stream.scope()?;
        trace!(stream = %handle, addr, value, bytes, "enqueue set");
        self.stream
            .device()
            .runtime()
            .platform()
            .memset_async(addr, value, bytes, handle)
            .with_context(|| {
                format!("Failed scheduling a memset of {} bytes on stream {}", bytes, handle)
            })
    }

    /// Zero the first `bytes` bytes of a region.
    pub fn zero(&self, dst: &mut Region, bytes: usize) -> Result<()> {
        self.set(dst, 0, bytes)
    }

    /// Launch a kernel or raw function.
    ///
    /// # Safety
    ///
    /// See [`launch::enqueue_launch`].
    pub unsafe fn kernel_launch<L>(
        &self,
        function: &L,
        config: LaunchConfig,
        args: &KernelArgs,
    ) -> Result<()>
    where
        L: Launchable + ?Sized,
    {
        launch::enqueue_launch(function, self.stream, config, args)
    }

    /// Create an event on the stream's device and record it here.
    pub fn event(&self, flags: EventFlags) -> Result<Event> {
        let event = Event::create(self.stream.device(), flags)?;
        self.record(&event)?;
        Ok(event)
    }

    /// Record `event` at the current tail of the stream, re-arming it.
    pub fn record(&self, event: &Event) -> Result<()> {
        if event.device() != self.stream.device() {
            return Err(Error::DeviceMismatch {
                operation: AffinityOperation::EventRecord,
                expected: self.stream.device().id(),
                actual: event.device().id(),
            });
        }
        let stream = self.stream.handle()?;
        let raw = event.handle()?;
        let _scope = self.stream.scope()?;
        trace!(stream = %stream, event = %raw, "enqueue event record");
        self.stream
            .device()
            .runtime()
            .platform()
            .event_record(raw, stream)
            .with_context(|| format!("Failed recording event {} on stream {}", raw, stream))
    }

    /// Hold back later work on this stream until `event` is reached.
    pub fn wait(&self, event: &Event) -> Result<()> {
        if event.device() != self.stream.device() {
            return Err(Error::CrossDeviceDependency {
                event_device: event.device().id(),
                stream_device: self.stream.device().id(),
            });
        }
        let stream = self.stream.handle()?;
        let raw = event.handle()?;
        let _scope = self.stream.scope()?;
        trace!(stream = %stream, event = %raw, "enqueue event wait");
        self.stream
            .device()
            .runtime()
            .platform()
            .stream_wait_event(stream, raw)
            .with_context(|| format!("Failed making stream {} wait on event {}", stream, raw))
    }

    /// Stream-ordered allocation of device memory.
    pub fn allocate(&self, bytes: usize) -> Result<Region> {
        let handle = self.stream.handle()?;
        let device = self.stream.device();
        if bytes == 0 {
            return Ok(Region::empty(device.clone(), self.stream.context(), RegionKind::Device));
        }
        let _scope = self.stream.scope()?;
        let ptr = device
            .runtime()
            .platform()
            .mem_alloc_async(bytes, handle)
            .with_context(|| {
                format!("Failed scheduling allocation of {} bytes on stream {}", bytes, handle)
            })?;
        trace!(stream = %handle, ptr = %ptr, bytes, "enqueue allocation");
        Ok(Region::from_device_allocation(
            device.clone(),
            self.stream.context(),
            RegionKind::Device,
            ptr,
            bytes,
        ))
    }

    /// Stream-ordered free of a device region.
    ///
    /// The region gives up its allocation only once the free is scheduled.
    /// If scheduling fails, the region is dropped on return and frees its
    /// memory synchronously.
    pub fn free(&self, mut region: Region) -> Result<()> {
        if region.kind() != RegionKind::Device {
            return Err(Error::invalid_argument(format!(
                "only device regions can be freed in stream order, got {:?}",
                region.kind()
            )));
        }
        self.check_same_device(&region)?;
        let handle = self.stream.handle()?;
        let ptr = region.device_ptr()?;
        if !region.ownership().is_owned() || region.is_empty() {
            return Ok(());
        }
        let scope = self.stream.scope()?;
        trace!(stream = %handle, ptr = %ptr, "enqueue free");
        self.stream
            .device()
            .runtime()
            .platform()
            .mem_free_async(ptr, handle)
            .with_context(|| format!("Failed scheduling free of {} on stream {}", ptr, handle))?;
        drop(scope);
        region.relinquish()?;
        Ok(())
    }

    /// Migrate a managed region to `destination` in stream order.
    pub fn prefetch(&self, region: &Region, destination: Location) -> Result<()> {
        if region.kind() != RegionKind::Managed {
            return Err(Error::invalid_argument(format!(
                "prefetch requires a managed region, got {:?}",
                region.kind()
            )));
        }
        self.check_same_device(region)?;
        let ptr = region.device_ptr()?;
        let handle = self.stream.handle()?;
        if region.size() == 0 {
            return Ok(());
        }
        let _scope = self.stream.scope()?;
        trace!(stream = %handle, ptr = %ptr, ?destination, "enqueue prefetch");
        self.stream
            .device()
            .runtime()
            .platform()
            .mem_prefetch_async(ptr, region.size(), destination, handle)
            .with_context(|| {
                format!("Failed scheduling prefetch of {} on stream {}", ptr, handle)
            })
    }
}

fn check_len(bytes: usize, dst_len: usize, src_len: usize) -> Result<()> {
    if bytes > dst_len || bytes > src_len {
        return Err(Error::invalid_argument(format!(
            "{} bytes requested but destination holds {} and source holds {}",
            bytes, dst_len, src_len
        )));
    }
    Ok(())
}
