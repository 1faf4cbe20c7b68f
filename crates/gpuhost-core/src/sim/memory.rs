//! Host-backed allocation table for the simulated platform.
//!
//! Device allocations live at synthetic addresses starting at
//! [`DEVICE_BASE`]; pinned and managed allocations use the address of their
//! real host backing so the host can dereference them. Any address below the
//! synthetic range that does not belong to a tracked allocation is treated as
//! ordinary host memory.

use std::alloc::{self, Layout};
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

use crate::error::{PlatformResult, Status};
use crate::platform::{DeviceId, Location};

/// First synthetic device address.
pub(crate) const DEVICE_BASE: u64 = 0xD000_0000_0000_0000;

const ALIGNMENT: usize = 256;

/// Zero-initialised heap block freed on drop.
struct Backing {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain bytes owned exclusively by the table.
unsafe impl Send for Backing {}

impl Backing {
    fn new(bytes: usize) -> PlatformResult<Self> {
        let layout =
            Layout::from_size_align(bytes.max(1), ALIGNMENT).map_err(|_| Status::INVALID_VALUE)?;
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Status::OUT_OF_MEMORY)?;
        Ok(Self { ptr, layout })
    }

    fn address(&self) -> u64 {
        self.ptr.as_ptr() as usize as u64
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        // SAFETY: allocated in `Backing::new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocationKind {
    Device,
    Pinned,
    Managed,
}

/// Placement state of a managed allocation.
#[derive(Debug, Default)]
pub(crate) struct ManagedState {
    pub(crate) preferred: Option<Location>,
    pub(crate) accessed_by: BTreeSet<DeviceId>,
    pub(crate) read_mostly: bool,
    pub(crate) resident: Option<Location>,
}

struct Allocation {
    backing: Backing,
    size: usize,
    kind: AllocationKind,
    device: DeviceId,
    mapped_alias: Option<u64>,
    managed: Option<ManagedState>,
}

enum Entry {
    Owned(Allocation),
    /// Device-side alias of a mapped pinned allocation keyed by its host address.
    Alias { host: u64, size: usize },
}

impl Entry {
    fn size(&self) -> usize {
        match self {
            Entry::Owned(allocation) => allocation.size,
            Entry::Alias { size, .. } => *size,
        }
    }
}

/// Every live allocation of one simulated platform.
pub(crate) struct MemoryTable {
    entries: BTreeMap<u64, Entry>,
    next_device_address: u64,
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_device_address: DEVICE_BASE,
        }
    }
}

impl MemoryTable {
    fn reserve_device_range(&mut self, bytes: usize) -> u64 {
        let address = self.next_device_address;
        let span = (bytes.max(1).div_ceil(ALIGNMENT) * ALIGNMENT) as u64;
        self.next_device_address += span;
        address
    }

    /// Bytes of device memory currently allocated on `device`.
    pub(crate) fn device_bytes(&self, device: DeviceId) -> usize {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Owned(a) if a.device == device && a.kind == AllocationKind::Device => {
                    Some(a.size)
                }
                _ => None,
            })
            .sum()
    }

    pub(crate) fn allocate(
        &mut self,
        device: DeviceId,
        kind: AllocationKind,
        bytes: usize,
        mapped: bool,
    ) -> PlatformResult<u64> {
        let backing = Backing::new(bytes)?;
        let host = backing.address();
        let key = match kind {
            AllocationKind::Device => self.reserve_device_range(bytes),
            AllocationKind::Pinned | AllocationKind::Managed => host,
        };
        let mapped_alias = if mapped && kind == AllocationKind::Pinned {
            let alias = self.reserve_device_range(bytes);
            self.entries.insert(alias, Entry::Alias { host, size: bytes });
            Some(alias)
        } else {
            None
        };
        let managed = (kind == AllocationKind::Managed).then(ManagedState::default);
        self.entries.insert(
            key,
            Entry::Owned(Allocation {
                backing,
                size: bytes,
                kind,
                device,
                mapped_alias,
                managed,
            }),
        );
        Ok(key)
    }

    /// Remove the allocation starting exactly at `address`, if it has `kind`.
    pub(crate) fn free(&mut self, address: u64, kind: AllocationKind) -> PlatformResult<()> {
        match self.entries.get(&address) {
            Some(Entry::Owned(allocation)) if allocation.kind == kind => {}
            _ => return Err(Status::INVALID_VALUE),
        }
        if let Some(Entry::Owned(allocation)) = self.entries.remove(&address) {
            if let Some(alias) = allocation.mapped_alias {
                self.entries.remove(&alias);
            }
        }
        Ok(())
    }

    /// Device alias of the mapped allocation containing `host`.
    pub(crate) fn device_alias(&self, host: u64) -> PlatformResult<u64> {
        let (base, entry) = self.containing(host).ok_or(Status::INVALID_VALUE)?;
        match entry {
            Entry::Owned(Allocation {
                mapped_alias: Some(alias),
                ..
            }) => Ok(alias + (host - base)),
            _ => Err(Status::INVALID_VALUE),
        }
    }

    fn containing(&self, address: u64) -> Option<(u64, &Entry)> {
        let (base, entry) = self.entries.range(..=address).next_back()?;
        let end = base + entry.size().max(1) as u64;
        (address < end).then_some((*base, entry))
    }

    /// Host pointer for `bytes` bytes at `address`.
    pub(crate) fn resolve(&self, address: u64, bytes: usize) -> PlatformResult<*mut u8> {
        let Some((base, entry)) = self.containing(address) else {
            if address >= DEVICE_BASE || address == 0 {
                return Err(Status::INVALID_VALUE);
            }
            return Ok(address as usize as *mut u8);
        };
        let offset = address - base;
        if offset + bytes as u64 > entry.size() as u64 {
            return Err(Status::INVALID_VALUE);
        }
        let start = match entry {
            Entry::Owned(allocation) => allocation.backing.address(),
            Entry::Alias { host, .. } => *host,
        };
        Ok((start + offset) as usize as *mut u8)
    }

    pub(crate) fn copy(&self, dst: u64, src: u64, bytes: usize) -> PlatformResult<()> {
        let to = self.resolve(dst, bytes)?;
        let from = self.resolve(src, bytes)?;
        // SAFETY: both ranges were bounds-checked against their allocations,
        // or are host memory the caller vouched for.
        unsafe { std::ptr::copy(from, to, bytes) };
        Ok(())
    }

    pub(crate) fn fill(&self, dst: u64, value: u8, bytes: usize) -> PlatformResult<()> {
        let to = self.resolve(dst, bytes)?;
        // SAFETY: as in `copy`.
        unsafe { std::ptr::write_bytes(to, value, bytes) };
        Ok(())
    }

    /// Placement state of the managed allocation covering `[address, address + bytes)`.
    pub(crate) fn managed_mut(
        &mut self,
        address: u64,
        bytes: usize,
    ) -> PlatformResult<&mut ManagedState> {
        let (base, size) = match self.containing(address) {
            Some((base, entry)) => (base, entry.size()),
            None => return Err(Status::INVALID_VALUE),
        };
        if address - base + bytes as u64 > size as u64 {
            return Err(Status::INVALID_VALUE);
        }
        match self.entries.get_mut(&base) {
            Some(Entry::Owned(Allocation {
                managed: Some(state),
                ..
            })) => Ok(state),
            _ => Err(Status::INVALID_VALUE),
        }
    }

    pub(crate) fn is_live(&self, address: u64, kind: AllocationKind) -> bool {
        matches!(self.entries.get(&address), Some(Entry::Owned(a)) if a.kind == kind)
    }
}
