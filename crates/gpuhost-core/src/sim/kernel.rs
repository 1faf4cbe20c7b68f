//! Host closures standing in for compiled device functions.

use std::fmt;
use std::sync::Arc;

use crate::error::{PlatformResult, Status};
use crate::launch::{KernelArgs, KernelParam, LaunchConfig};
use crate::occupancy::{ArchitectureLimits, BlockUsage};
use crate::platform::{
    CachePreference, DeviceId, DevicePtr, FunctionAttribute, SharedMemoryBankSize,
};
use crate::sim::memory::MemoryTable;

/// Body run when a simulated launch executes.
pub type SimKernelBody = dyn Fn(&SimLaunch<'_>) -> Result<(), Status> + Send + Sync;

/// Static resource usage of a simulated function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimKernelSpec {
    /// Name shown in diagnostics.
    pub name: String,
    /// Registers per thread.
    pub registers: u32,
    /// Static shared memory per block.
    pub static_shared_memory: usize,
    /// Constant memory.
    pub const_memory: usize,
    /// Local memory per thread.
    pub local_memory: usize,
    /// `__launch_bounds__`-style cap on the block size, if any.
    pub max_threads_per_block: Option<u32>,
    /// PTX version as `major * 10 + minor`.
    pub ptx_version: u32,
    /// Binary version as `major * 10 + minor`.
    pub binary_version: u32,
}

impl SimKernelSpec {
    /// A function using no registers or shared memory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registers: 0,
            static_shared_memory: 0,
            const_memory: 0,
            local_memory: 0,
            max_threads_per_block: None,
            ptx_version: 80,
            binary_version: 80,
        }
    }

    /// Set registers per thread.
    #[must_use]
    pub fn with_registers(mut self, registers: u32) -> Self {
        self.registers = registers;
        self
    }

    /// Set static shared memory per block.
    #[must_use]
    pub fn with_static_shared_memory(mut self, bytes: usize) -> Self {
        self.static_shared_memory = bytes;
        self
    }

    /// Cap the block size.
    #[must_use]
    pub fn with_max_threads_per_block(mut self, threads: u32) -> Self {
        self.max_threads_per_block = Some(threads);
        self
    }

    /// Set the PTX and binary versions.
    #[must_use]
    pub fn with_versions(mut self, ptx: u32, binary: u32) -> Self {
        self.ptx_version = ptx;
        self.binary_version = binary;
        self
    }
}

/// What a simulated kernel body sees while it runs.
pub struct SimLaunch<'a> {
    pub(crate) config: &'a LaunchConfig,
    pub(crate) args: &'a KernelArgs,
    pub(crate) memory: &'a MemoryTable,
}

impl SimLaunch<'_> {
    /// Launch shape.
    pub fn config(&self) -> &LaunchConfig {
        self.config
    }

    /// Total threads in the grid.
    pub fn threads(&self) -> u64 {
        self.config.total_threads()
    }

    /// Argument `index`, which must have the size of `T`.
    pub fn arg<T: KernelParam>(&self, index: usize) -> Result<T, Status> {
        self.args.get(index).ok_or(Status::INVALID_VALUE)
    }

    /// Read `count` values starting at `ptr`.
    pub fn read<T: KernelParam>(&self, ptr: DevicePtr, count: usize) -> Result<Vec<T>, Status> {
        let bytes = count * std::mem::size_of::<T>();
        let from = self.memory.resolve(ptr.0, bytes)?;
        Ok((0..count)
            .map(|i| {
                // SAFETY: `resolve` checked `count` elements fit; reads are unaligned-safe.
                unsafe { std::ptr::read_unaligned((from as *const T).add(i)) }
            })
            .collect())
    }

    /// Write `values` starting at `ptr`.
    pub fn write<T: KernelParam>(&self, ptr: DevicePtr, values: &[T]) -> Result<(), Status> {
        let bytes = std::mem::size_of_val(values);
        let to = self.memory.resolve(ptr.0, bytes)?;
        // SAFETY: `resolve` checked the destination range.
        unsafe { std::ptr::copy_nonoverlapping(values.as_ptr() as *const u8, to, bytes) };
        Ok(())
    }
}

/// A registered function and its mutable per-function settings.
pub(crate) struct SimFunction {
    pub(crate) device: DeviceId,
    pub(crate) spec: SimKernelSpec,
    pub(crate) body: Arc<SimKernelBody>,
    pub(crate) max_dynamic_shared_memory: i32,
    pub(crate) carveout: i32,
    pub(crate) cache_preference: CachePreference,
    pub(crate) bank_size: SharedMemoryBankSize,
}

impl SimFunction {
    pub(crate) fn new(
        device: DeviceId,
        spec: SimKernelSpec,
        body: Arc<SimKernelBody>,
        limits: &ArchitectureLimits,
    ) -> Self {
        let max_dynamic = limits
            .shared_mem_per_block
            .saturating_sub(spec.static_shared_memory) as i32;
        Self {
            device,
            spec,
            body,
            max_dynamic_shared_memory: max_dynamic,
            carveout: -1,
            cache_preference: CachePreference::None,
            bank_size: SharedMemoryBankSize::Default,
        }
    }

    pub(crate) fn max_threads_per_block(&self, limits: &ArchitectureLimits) -> u32 {
        let by_registers = limits.max_threads_for_registers(self.spec.registers);
        match self.spec.max_threads_per_block {
            Some(cap) => by_registers.min(cap),
            None => by_registers,
        }
    }

    pub(crate) fn attribute(
        &self,
        attribute: FunctionAttribute,
        limits: &ArchitectureLimits,
    ) -> i32 {
        match attribute {
            FunctionAttribute::MaxThreadsPerBlock => self.max_threads_per_block(limits) as i32,
            FunctionAttribute::SharedSizeBytes => self.spec.static_shared_memory as i32,
            FunctionAttribute::ConstSizeBytes => self.spec.const_memory as i32,
            FunctionAttribute::LocalSizeBytes => self.spec.local_memory as i32,
            FunctionAttribute::NumRegs => self.spec.registers as i32,
            FunctionAttribute::PtxVersion => self.spec.ptx_version as i32,
            FunctionAttribute::BinaryVersion => self.spec.binary_version as i32,
            FunctionAttribute::CacheModeCa => 0,
            FunctionAttribute::MaxDynamicSharedSizeBytes => self.max_dynamic_shared_memory,
            FunctionAttribute::PreferredSharedMemoryCarveout => self.carveout,
        }
    }

    pub(crate) fn set_attribute(
        &mut self,
        attribute: FunctionAttribute,
        value: i32,
        limits: &ArchitectureLimits,
    ) -> PlatformResult<()> {
        match attribute {
            FunctionAttribute::MaxDynamicSharedSizeBytes => {
                let ceiling = limits
                    .shared_mem_per_block_optin
                    .saturating_sub(self.spec.static_shared_memory);
                if value < 0 || value as usize > ceiling {
                    return Err(Status::INVALID_VALUE);
                }
                self.max_dynamic_shared_memory = value;
            }
            FunctionAttribute::PreferredSharedMemoryCarveout => {
                if !(-1..=100).contains(&value) {
                    return Err(Status::INVALID_VALUE);
                }
                self.carveout = value;
            }
            _ => return Err(Status::INVALID_VALUE),
        }
        Ok(())
    }

    pub(crate) fn occupancy(
        &self,
        block_size: u32,
        dynamic_shared_memory: usize,
        limits: &ArchitectureLimits,
    ) -> u32 {
        if block_size > self.max_threads_per_block(limits) {
            return 0;
        }
        limits.active_blocks_per_sm(&BlockUsage {
            block_size,
            registers_per_thread: self.spec.registers,
            static_shared_memory: self.spec.static_shared_memory,
            dynamic_shared_memory,
        })
    }

    /// Launch-time shape checks.
    pub(crate) fn check_launch(
        &self,
        config: &LaunchConfig,
        limits: &ArchitectureLimits,
    ) -> PlatformResult<()> {
        if !config.grid.is_valid() || !config.block.is_valid() {
            return Err(Status::INVALID_VALUE);
        }
        if config.block_size() > u64::from(self.max_threads_per_block(limits)) {
            return Err(Status::INVALID_VALUE);
        }
        if i64::from(config.dynamic_shared_memory) > i64::from(self.max_dynamic_shared_memory) {
            return Err(Status::INVALID_VALUE);
        }
        Ok(())
    }
}

impl fmt::Debug for SimFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimFunction")
            .field("device", &self.device)
            .field("spec", &self.spec)
            .field("carveout", &self.carveout)
            .finish()
    }
}
