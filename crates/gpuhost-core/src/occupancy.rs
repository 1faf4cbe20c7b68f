//! Per-multiprocessor resource limits and the resident-block calculator.
//!
//! The calculator answers "how many blocks of this shape fit on one
//! multiprocessor at once": the minimum over the warp, block, register and
//! shared memory limits.

use serde::{Deserialize, Serialize};

use crate::device::{ComputeCapability, Device};
use crate::error::Result;
use crate::platform::DeviceAttribute;

/// Register allocation granularity, in registers per warp.
const REGISTER_ALLOCATION_UNIT: u32 = 256;

/// Hardware limits of one GPU class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureLimits {
    /// Compute capability.
    pub compute_capability: ComputeCapability,
    /// Number of streaming multiprocessors.
    pub sm_count: u32,
    /// Threads per warp.
    pub warp_size: u32,
    /// Maximum threads per block.
    pub max_threads_per_block: u32,
    /// Maximum resident threads per SM.
    pub max_threads_per_sm: u32,
    /// Maximum resident blocks per SM.
    pub max_blocks_per_sm: u32,
    /// 32-bit registers per SM.
    pub registers_per_sm: u32,
    /// Registers available to one block.
    pub max_registers_per_block: u32,
    /// Shared memory per SM in bytes.
    pub shared_mem_per_sm: usize,
    /// Shared memory one block may use without opting in.
    pub shared_mem_per_block: usize,
    /// Shared memory one block may use after opting in.
    pub shared_mem_per_block_optin: usize,
    /// Shared memory the system reserves per resident block.
    pub reserved_shared_mem_per_block: usize,
    /// L2 cache size in bytes.
    pub l2_cache_bytes: usize,
}

impl Default for ArchitectureLimits {
    fn default() -> Self {
        // Default to Ampere-class GPU
        Self::ampere()
    }
}

impl ArchitectureLimits {
    /// Volta (V100).
    #[must_use]
    pub fn volta() -> Self {
        Self {
            compute_capability: ComputeCapability::new(7, 0),
            sm_count: 80,
            warp_size: 32,
            max_threads_per_block: 1024,
            max_threads_per_sm: 2048,
            max_blocks_per_sm: 32,
            registers_per_sm: 65536,
            max_registers_per_block: 65536,
            shared_mem_per_sm: 96 * 1024,
            shared_mem_per_block: 48 * 1024,
            shared_mem_per_block_optin: 96 * 1024,
            reserved_shared_mem_per_block: 0,
            l2_cache_bytes: 6 * 1024 * 1024,
        }
    }

    /// Ampere (A100).
    #[must_use]
    pub fn ampere() -> Self {
        Self {
            compute_capability: ComputeCapability::new(8, 0),
            sm_count: 84,
            warp_size: 32,
            max_threads_per_block: 1024,
            max_threads_per_sm: 2048,
            max_blocks_per_sm: 32,
            registers_per_sm: 65536,
            max_registers_per_block: 65536,
            shared_mem_per_sm: 164 * 1024,
            shared_mem_per_block: 48 * 1024,
            shared_mem_per_block_optin: 163 * 1024,
            reserved_shared_mem_per_block: 1024,
            l2_cache_bytes: 40 * 1024 * 1024,
        }
    }

    /// Ada Lovelace.
    #[must_use]
    pub fn ada() -> Self {
        Self {
            compute_capability: ComputeCapability::new(8, 9),
            sm_count: 128,
            warp_size: 32,
            max_threads_per_block: 1024,
            max_threads_per_sm: 1536,
            max_blocks_per_sm: 24,
            registers_per_sm: 65536,
            max_registers_per_block: 65536,
            shared_mem_per_sm: 100 * 1024,
            shared_mem_per_block: 48 * 1024,
            shared_mem_per_block_optin: 99 * 1024,
            reserved_shared_mem_per_block: 1024,
            l2_cache_bytes: 72 * 1024 * 1024,
        }
    }

    /// Hopper (H100).
    #[must_use]
    pub fn hopper() -> Self {
        Self {
            compute_capability: ComputeCapability::new(9, 0),
            sm_count: 132,
            warp_size: 32,
            max_threads_per_block: 1024,
            max_threads_per_sm: 2048,
            max_blocks_per_sm: 32,
            registers_per_sm: 65536,
            max_registers_per_block: 65536,
            shared_mem_per_sm: 228 * 1024,
            shared_mem_per_block: 48 * 1024,
            shared_mem_per_block_optin: 227 * 1024,
            reserved_shared_mem_per_block: 1024,
            l2_cache_bytes: 50 * 1024 * 1024,
        }
    }

    /// Read the limits of a real device.
    pub fn from_device(device: &Device) -> Result<Self> {
        let get = |attribute| -> Result<u32> { Ok(device.attribute(attribute)?.max(0) as u32) };
        Ok(Self {
            compute_capability: device.compute_capability()?,
            sm_count: get(DeviceAttribute::MultiprocessorCount)?,
            warp_size: get(DeviceAttribute::WarpSize)?,
            max_threads_per_block: get(DeviceAttribute::MaxThreadsPerBlock)?,
            max_threads_per_sm: get(DeviceAttribute::MaxThreadsPerMultiprocessor)?,
            max_blocks_per_sm: get(DeviceAttribute::MaxBlocksPerMultiprocessor)?,
            registers_per_sm: get(DeviceAttribute::MaxRegistersPerMultiprocessor)?,
            max_registers_per_block: get(DeviceAttribute::MaxRegistersPerBlock)?,
            shared_mem_per_sm: get(DeviceAttribute::MaxSharedMemoryPerMultiprocessor)? as usize,
            shared_mem_per_block: get(DeviceAttribute::MaxSharedMemoryPerBlock)? as usize,
            shared_mem_per_block_optin: get(DeviceAttribute::MaxSharedMemoryPerBlockOptin)?
                as usize,
            reserved_shared_mem_per_block: get(DeviceAttribute::ReservedSharedMemoryPerBlock)?
                as usize,
            l2_cache_bytes: get(DeviceAttribute::L2CacheSize)? as usize,
        })
    }

    /// Returns total GPU threads available.
    #[must_use]
    pub fn total_threads(&self) -> u32 {
        self.sm_count * self.max_threads_per_sm
    }

    /// Largest block a function using `registers_per_thread` registers can launch with.
    #[must_use]
    pub fn max_threads_for_registers(&self, registers_per_thread: u32) -> u32 {
        if registers_per_thread == 0 {
            return self.max_threads_per_block;
        }
        let per_warp = round_up(registers_per_thread * self.warp_size, REGISTER_ALLOCATION_UNIT);
        let warps = self.max_registers_per_block / per_warp;
        (warps * self.warp_size).min(self.max_threads_per_block)
    }

    /// Blocks of the given shape that can be resident on one SM at once.
    #[must_use]
    pub fn active_blocks_per_sm(&self, usage: &BlockUsage) -> u32 {
        if usage.block_size == 0 || usage.block_size > self.max_threads_per_block {
            return 0;
        }
        let warps_per_block = usage.block_size.div_ceil(self.warp_size);
        let by_warps = (self.max_threads_per_sm / self.warp_size) / warps_per_block;

        let by_registers = if usage.registers_per_thread == 0 {
            u32::MAX
        } else {
            let per_warp =
                round_up(usage.registers_per_thread * self.warp_size, REGISTER_ALLOCATION_UNIT);
            let per_block = per_warp * warps_per_block;
            if per_block > self.max_registers_per_block {
                return 0;
            }
            self.registers_per_sm / per_block
        };

        let requested = usage.static_shared_memory + usage.dynamic_shared_memory;
        if requested > self.shared_mem_per_block_optin {
            return 0;
        }
        let per_block = requested + self.reserved_shared_mem_per_block;
        let by_shared = if per_block == 0 {
            u32::MAX
        } else {
            (self.shared_mem_per_sm / per_block) as u32
        };

        self.max_blocks_per_sm
            .min(by_warps)
            .min(by_registers)
            .min(by_shared)
    }
}

/// Resources one block of a launch consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockUsage {
    /// Threads per block.
    pub block_size: u32,
    /// Registers per thread.
    pub registers_per_thread: u32,
    /// Static shared memory per block.
    pub static_shared_memory: usize,
    /// Dynamic shared memory per block.
    pub dynamic_shared_memory: usize,
}

fn round_up(value: u32, unit: u32) -> u32 {
    value.div_ceil(unit) * unit
}
