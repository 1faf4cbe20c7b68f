//! Memory regions and copies.
//!
//! A [`Region`] is an owning (or borrowed) proxy for one allocation. Its
//! [`RegionKind`] fixes where the memory lives and which operations apply:
//! prefetch and placement advice need `Managed`, host views need a
//! host-accessible kind.
//!
//! The free functions [`copy`], [`set`] and [`zero`] are synchronous: they
//! return once the operation has completed and make the right context current
//! themselves. Stream-ordered variants live on
//! [`Enqueue`](crate::stream::Enqueue).

pub mod device;
pub mod host;
pub mod managed;
pub mod mapped;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, trace};

use crate::current::ScopedOverride;
use crate::device::Device;
use crate::error::{Error, Result, StatusExt};
use crate::handle::{Ownership, Slot};
use crate::launch::KernelParam;
use crate::platform::{ContextHandle, DevicePtr};

/// Where a region's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Device global memory.
    Device,
    /// Page-locked host memory.
    HostPinned,
    /// Unified memory that migrates between host and devices.
    Managed,
    /// Page-locked host memory also mapped into the device address space.
    Mapped,
}

impl RegionKind {
    /// True when the host may dereference the region's memory.
    pub fn is_host_accessible(self) -> bool {
        !matches!(self, RegionKind::Device)
    }

    fn frees_as_host(self) -> bool {
        matches!(self, RegionKind::HostPinned | RegionKind::Mapped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Addresses {
    device: DevicePtr,
    host: u64,
}

impl fmt::Display for Addresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#x}", self.device, self.host)
    }
}

/// A contiguous allocation.
pub struct Region {
    device: Device,
    context: ContextHandle,
    kind: RegionKind,
    size: usize,
    slot: Slot<Addresses>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Region {
    fn new(
        device: Device,
        context: ContextHandle,
        kind: RegionKind,
        addresses: Addresses,
        size: usize,
        ownership: Ownership,
    ) -> Self {
        Self {
            device,
            context,
            kind,
            size,
            slot: Slot::new(addresses, ownership, "memory region"),
            _not_sync: PhantomData,
        }
    }

    /// A zero-byte owning region; releasing it makes no platform call.
    pub(crate) fn empty(device: Device, context: ContextHandle, kind: RegionKind) -> Self {
        let addresses = Addresses {
            device: DevicePtr::NULL,
            host: 0,
        };
        Self::new(device, context, kind, addresses, 0, Ownership::Owned)
    }

    pub(crate) fn from_device_allocation(
        device: Device,
        context: ContextHandle,
        kind: RegionKind,
        ptr: DevicePtr,
        size: usize,
    ) -> Self {
        let host = if kind == RegionKind::Managed { ptr.0 } else { 0 };
        Self::new(
            device,
            context,
            kind,
            Addresses { device: ptr, host },
            size,
            Ownership::Owned,
        )
    }

    pub(crate) fn from_host_allocation(
        device: Device,
        context: ContextHandle,
        kind: RegionKind,
        host: u64,
        device_ptr: DevicePtr,
        size: usize,
    ) -> Self {
        Self::new(
            device,
            context,
            kind,
            Addresses {
                device: device_ptr,
                host,
            },
            size,
            Ownership::Owned,
        )
    }

    /// Wrap device memory allocated elsewhere.
    pub fn wrap_device(
        device: &Device,
        ptr: DevicePtr,
        size: usize,
        ownership: Ownership,
    ) -> Result<Self> {
        let context = device.primary_context()?;
        let addresses = Addresses { device: ptr, host: 0 };
        Ok(Self::new(device.clone(), context, RegionKind::Device, addresses, size, ownership))
    }

    /// Device the allocation was made on.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Location kind.
    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// True for zero-byte regions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether dropping this proxy frees the memory.
    pub fn ownership(&self) -> Ownership {
        self.slot.ownership()
    }

    /// False once the proxy was released, taken from or relinquished.
    pub fn is_valid(&self) -> bool {
        self.slot.is_live()
    }

    /// Address usable by device code and by copies.
    pub fn device_ptr(&self) -> Result<DevicePtr> {
        let addresses = self.slot.get()?;
        if self.kind == RegionKind::HostPinned && addresses.device == DevicePtr::NULL {
            return Ok(DevicePtr(addresses.host));
        }
        Ok(addresses.device)
    }

    /// Address usable by the host. Fails for device-resident regions.
    pub fn host_ptr(&self) -> Result<*mut u8> {
        let addresses = self.slot.get()?;
        if !self.kind.is_host_accessible() {
            return Err(Error::invalid_argument(
                "device-resident regions have no host address",
            ));
        }
        Ok(addresses.host as usize as *mut u8)
    }

    /// Host view of the region.
    ///
    /// # Safety
    ///
    /// No device work may write the region while the slice is alive.
    pub unsafe fn host_slice(&self) -> Result<&[u8]> {
        let ptr = self.host_ptr()?;
        if self.size == 0 {
            return Ok(&[]);
        }
        Ok(std::slice::from_raw_parts(ptr, self.size))
    }

    /// Mutable host view of the region.
    ///
    /// # Safety
    ///
    /// No device work may access the region while the slice is alive.
    pub unsafe fn host_slice_mut(&mut self) -> Result<&mut [u8]> {
        let ptr = self.host_ptr()?;
        if self.size == 0 {
            return Ok(&mut []);
        }
        Ok(std::slice::from_raw_parts_mut(ptr, self.size))
    }

    /// Address used for copies and fills.
    pub(crate) fn address(&self) -> Result<u64> {
        let addresses = self.slot.get()?;
        Ok(match self.kind {
            RegionKind::HostPinned => addresses.host,
            _ => addresses.device.0,
        })
    }

    pub(crate) fn scope(&self) -> Result<ScopedOverride> {
        ScopedOverride::context(&self.device, self.context)
    }

    /// Fail unless the region is of `kind`.
    pub(crate) fn require_kind(&self, kind: RegionKind, operation: &str) -> Result<()> {
        if self.kind != kind {
            return Err(Error::invalid_argument(format!(
                "{} requires a {:?} region, got {:?}",
                operation, kind, self.kind
            )));
        }
        Ok(())
    }

    /// Give up the allocation, returning its device address and size.
    pub(crate) fn relinquish(&mut self) -> Result<(DevicePtr, usize)> {
        let addresses = self.slot.relinquish()?;
        Ok((addresses.device, self.size))
    }

    /// Move the allocation (and ownership) into a new proxy, leaving this one released.
    #[must_use]
    pub fn take(&mut self) -> Region {
        Self {
            device: self.device.clone(),
            context: self.context,
            kind: self.kind,
            size: self.size,
            slot: self.slot.take(),
            _not_sync: PhantomData,
        }
    }

    /// Free the memory now, reporting failures.
    pub fn release(&mut self) -> Result<()> {
        let (device, context, kind, size) = (&self.device, self.context, self.kind, self.size);
        self.slot
            .release_with(|addresses| free(device, context, kind, size, addresses))
    }

    /// Give up ownership and return the device address.
    pub fn into_raw(mut self) -> Result<DevicePtr> {
        Ok(self.relinquish()?.0)
    }
}

fn free(
    device: &Device,
    context: ContextHandle,
    kind: RegionKind,
    size: usize,
    addresses: Addresses,
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let _scope = ScopedOverride::context(device, context)?;
    let platform = device.runtime().platform();
    if kind.frees_as_host() {
        platform
            .mem_free_host(addresses.host)
            .with_context(|| format!("Failed freeing host allocation at {:#x}", addresses.host))?;
    } else {
        platform
            .mem_free(addresses.device)
            .with_context(|| format!("Failed freeing {} on {}", addresses.device, device.id()))?;
    }
    debug!(device = device.id().0, ?kind, size, "memory region freed");
    Ok(())
}

impl Drop for Region {
    fn drop(&mut self) {
        let (device, context, kind, size) = (&self.device, self.context, self.kind, self.size);
        self.slot.drop_with(device.runtime(), |addresses| {
            free(device, context, kind, size, addresses)
        });
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("device", &self.device.id().0)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("addresses", &self.slot)
            .finish()
    }
}

/// Something with a unified address that copies can read or write.
pub trait Addressable {
    /// Address to read from.
    fn address(&self) -> Result<u64>;

    /// Address to write to.
    fn address_mut(&mut self) -> Result<u64> {
        self.address()
    }

    /// Number of addressable bytes.
    fn byte_len(&self) -> usize;

    /// Device and context a copy touching this memory should run under.
    fn placement(&self) -> Option<(&Device, ContextHandle)> {
        None
    }
}

impl Addressable for Region {
    fn address(&self) -> Result<u64> {
        Region::address(self)
    }

    fn byte_len(&self) -> usize {
        self.size
    }

    fn placement(&self) -> Option<(&Device, ContextHandle)> {
        Some((&self.device, self.context))
    }
}

impl<T: KernelParam> Addressable for [T] {
    fn address(&self) -> Result<u64> {
        Ok(self.as_ptr() as u64)
    }

    fn address_mut(&mut self) -> Result<u64> {
        Ok(self.as_mut_ptr() as u64)
    }

    fn byte_len(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

impl<T: KernelParam> Addressable for Vec<T> {
    fn address(&self) -> Result<u64> {
        self.as_slice().address()
    }

    fn address_mut(&mut self) -> Result<u64> {
        self.as_mut_slice().address_mut()
    }

    fn byte_len(&self) -> usize {
        self.as_slice().byte_len()
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

/// Copy `bytes` bytes from `src` to `dst`, blocking until done.
pub fn copy<D, S>(dst: &mut D, src: &S, bytes: usize) -> Result<()>
where
    D: Addressable + ?Sized,
    S: Addressable + ?Sized,
{
    let dst_addr = dst.address_mut()?;
    let src_addr = src.address()?;
    check_len(bytes, dst.byte_len(), src.byte_len())?;
    if bytes == 0 {
        return Ok(());
    }

    let Some((device, context)) = dst.placement().or_else(|| src.placement()) else {
        // SAFETY: both sides are host buffers at least `bytes` long, and `dst`
        // is exclusively borrowed.
        unsafe {
            std::ptr::copy(src_addr as usize as *const u8, dst_addr as usize as *mut u8, bytes);
        }
        return Ok(());
    };

    let _scope = ScopedOverride::context(device, context)?;
    trace!(dst = dst_addr, src = src_addr, bytes, "synchronous copy");
    device
        .runtime()
        .platform()
        .memcpy(dst_addr, src_addr, bytes)
        .with_context(|| {
            format!(
                "Failed copying {} bytes from {:#x} to {:#x}",
                bytes, src_addr, dst_addr
            )
        })
}

/// Fill the first `bytes` bytes of `dst` with `value`, blocking until done.
pub fn set<D>(dst: &mut D, value: u8, bytes: usize) -> Result<()>
where
    D: Addressable + ?Sized,
{
    let addr = dst.address_mut()?;
    check_len(bytes, dst.byte_len(), bytes)?;
    if bytes == 0 {
        return Ok(());
    }

    let Some((device, context)) = dst.placement() else {
        // SAFETY: `dst` is an exclusively borrowed host buffer of at least `bytes` bytes.
        unsafe { std::ptr::write_bytes(addr as usize as *mut u8, value, bytes) };
        return Ok(());
    };

    let _scope = ScopedOverride::context(device, context)?;
    trace!(dst = addr, value, bytes, "synchronous memset");
    device
        .runtime()
        .platform()
        .memset(addr, value, bytes)
        .with_context(|| format!("Failed setting {} bytes at {:#x}", bytes, addr))
}

/// Zero the first `bytes` bytes of `dst`, blocking until done.
pub fn zero<D>(dst: &mut D, bytes: usize) -> Result<()>
where
    D: Addressable + ?Sized,
{
    set(dst, 0, bytes)
}
